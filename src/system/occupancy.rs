//! 2D occupancy grid export.
//!
//! MapPoints inside a height band around the ground plane mark cells as
//! occupied; rays from each KeyFrame center to the points it observes clear
//! the cells they cross. Rows run along the second ground axis, columns
//! along the first.

use nalgebra::{DMatrix, Vector3};
use tracing::debug;

use crate::atlas::map::Map;
use crate::config::OccupancyConfig;

pub const OCC_FREE: i16 = 0;
pub const OCC_OCCUPIED: i16 = 100;
pub const OCC_UNKNOWN: i16 = -1;

/// Ground coordinates `(a, b)` and height of a world point.
///
/// Visual maps have y pointing down; once the IMU is initialized the world
/// is gravity aligned with z up.
fn ground(p: &Vector3<f64>, z_up: bool) -> (f64, f64, f64) {
    if z_up {
        (p.x, p.y, p.z)
    } else {
        (p.x, p.z, -p.y)
    }
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    min_a: f64,
    min_b: f64,
    resolution: f64,
    margin: i64,
    rows: usize,
    cols: usize,
}

impl Layout {
    fn fit(coords: &[(f64, f64)], config: &OccupancyConfig) -> Option<Self> {
        let (first, rest) = coords.split_first()?;
        let (mut min_a, mut max_a, mut min_b, mut max_b) = (first.0, first.0, first.1, first.1);
        for (a, b) in rest {
            min_a = min_a.min(*a);
            max_a = max_a.max(*a);
            min_b = min_b.min(*b);
            max_b = max_b.max(*b);
        }

        let cap = config.max_cells_per_side.max(1);
        let margin = config.margin_cells.min(cap.saturating_sub(1) / 2);
        let usable = (cap - 2 * margin).max(1);
        let extent = (max_a - min_a).max(max_b - min_b);
        let mut resolution = config.resolution;
        if usable > 1 && extent / resolution >= (usable - 1) as f64 {
            resolution = extent / (usable - 1) as f64 * (1.0 + 1e-9);
            debug!("[Occupancy] Grid capped at {cap} cells, resolution {resolution:.3}");
        }

        let span = |extent: f64| ((extent / resolution).floor() as usize + 1).min(usable) + 2 * margin;
        Some(Self {
            min_a,
            min_b,
            resolution,
            margin: margin as i64,
            rows: span(max_b - min_b),
            cols: span(max_a - min_a),
        })
    }

    /// (row, col) of a ground coordinate.
    fn cell(&self, a: f64, b: f64) -> (i64, i64) {
        let index = |v: f64, min: f64, len: usize| {
            (((v - min) / self.resolution).floor() as i64 + self.margin).clamp(0, len as i64 - 1)
        };
        (index(b, self.min_b, self.rows), index(a, self.min_a, self.cols))
    }
}

/// Clear every cell on the segment `from -> to`, excluding `to`.
fn trace_free(grid: &mut DMatrix<i16>, from: (i64, i64), to: (i64, i64)) {
    let (mut r, mut c) = from;
    let dr = (to.0 - r).abs();
    let dc = -(to.1 - c).abs();
    let sr = if r < to.0 { 1 } else { -1 };
    let sc = if c < to.1 { 1 } else { -1 };
    let mut err = dr + dc;
    while (r, c) != to {
        grid[(r as usize, c as usize)] = OCC_FREE;
        let e2 = 2 * err;
        if e2 >= dc {
            err += dc;
            r += sr;
        }
        if e2 <= dr {
            err += dr;
            c += sc;
        }
    }
}

/// Occupancy grid of `map`. An empty map gives a single unknown cell.
pub fn occupancy_grid(map: &Map, config: &OccupancyConfig) -> DMatrix<i16> {
    let z_up = map.is_imu_initialized();

    let points: Vec<_> = map
        .map_points()
        .filter(|mp| !mp.is_bad)
        .filter_map(|mp| {
            let (a, b, h) = ground(&mp.position, z_up);
            (h >= config.min_height && h <= config.max_height).then_some((mp, a, b))
        })
        .collect();
    let centers: Vec<_> = map
        .keyframes()
        .filter(|kf| !kf.is_bad)
        .map(|kf| {
            let (a, b, _) = ground(&kf.camera_center(), z_up);
            (kf.id, a, b)
        })
        .collect();

    let coords: Vec<(f64, f64)> = points
        .iter()
        .map(|(_, a, b)| (*a, *b))
        .chain(centers.iter().map(|(_, a, b)| (*a, *b)))
        .collect();
    let Some(layout) = Layout::fit(&coords, config) else {
        return DMatrix::from_element(1, 1, OCC_UNKNOWN);
    };

    let mut grid = DMatrix::from_element(layout.rows, layout.cols, OCC_UNKNOWN);
    let mut hits = DMatrix::<u32>::zeros(layout.rows, layout.cols);
    for (mp, a, b) in &points {
        let target = layout.cell(*a, *b);
        hits[(target.0 as usize, target.1 as usize)] += 1;
        for (kf_id, ka, kb) in &centers {
            if mp.observations.contains_key(kf_id) {
                trace_free(&mut grid, layout.cell(*ka, *kb), target);
            }
        }
    }
    for (_, a, b) in &centers {
        let (r, c) = layout.cell(*a, *b);
        grid[(r as usize, c as usize)] = OCC_FREE;
    }

    let threshold = config.occupied_min_points.max(1);
    let mut occupied = 0;
    for (cell, count) in grid.iter_mut().zip(hits.iter()) {
        if *count >= threshold {
            *cell = OCC_OCCUPIED;
            occupied += 1;
        }
    }
    debug!(
        "[Occupancy] {}x{} grid from {} points, {} occupied cells",
        layout.rows,
        layout.cols,
        points.len(),
        occupied
    );
    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::{IdAllocator, MapId};
    use crate::system::test_support::SyntheticScene;
    use std::sync::Arc;

    fn config() -> OccupancyConfig {
        OccupancyConfig {
            occupied_min_points: 1,
            ..OccupancyConfig::default()
        }
    }

    #[test]
    fn test_empty_map_is_one_unknown_cell() {
        let map = Map::new(MapId::new(0), Arc::new(IdAllocator::default()));
        let grid = occupancy_grid(&map, &config());
        assert_eq!(grid.shape(), (1, 1));
        assert_eq!(grid[(0, 0)], OCC_UNKNOWN);
    }

    #[test]
    fn test_scene_has_free_space_in_front_of_camera() {
        let scene = SyntheticScene::new(61, 300);
        let (map, kfs) = scene.build_map(&[0.0, 0.1]);
        let grid = occupancy_grid(&map, &config());

        assert!(grid.iter().any(|c| *c == OCC_OCCUPIED));
        assert!(grid.iter().any(|c| *c == OCC_FREE));
        assert!(grid.iter().any(|c| *c == OCC_UNKNOWN));

        // Cameras sit at z = 0 looking down +z: the cell of the first center
        // and the cells just ahead of it are clear.
        let center = map.get_keyframe(kfs[0]).unwrap().camera_center();
        let coords: Vec<(f64, f64)> = map
            .map_points()
            .map(|mp| ground(&mp.position, false))
            .filter(|(_, _, h)| *h >= -0.5 && *h <= 0.5)
            .map(|(a, b, _)| (a, b))
            .chain(kfs.iter().map(|id| {
                let c = map.get_keyframe(*id).unwrap().camera_center();
                (c.x, c.z)
            }))
            .collect();
        let layout = Layout::fit(&coords, &config()).unwrap();
        let (r, c) = layout.cell(center.x, center.z);
        assert_eq!(grid[(r as usize, c as usize)], OCC_FREE);
        let ahead = r as usize + 5;
        assert!((c - 3..=c + 3).any(|col| grid[(ahead, col as usize)] == OCC_FREE));
    }

    #[test]
    fn test_large_extent_is_capped() {
        let scene = SyntheticScene::new(62, 200);
        let (map, _) = scene.build_map(&[0.0]);
        let config = OccupancyConfig {
            resolution: 0.001,
            max_cells_per_side: 100,
            ..config()
        };
        let grid = occupancy_grid(&map, &config);
        assert!(grid.nrows() <= 100 && grid.ncols() <= 100);
    }

    #[test]
    fn test_ray_clears_straight_line() {
        let mut grid = DMatrix::from_element(5, 5, OCC_UNKNOWN);
        trace_free(&mut grid, (0, 0), (4, 4));
        for i in 0..4 {
            assert_eq!(grid[(i, i)], OCC_FREE);
        }
        assert_eq!(grid[(4, 4)], OCC_UNKNOWN);
        assert_eq!(grid[(0, 4)], OCC_UNKNOWN);
    }
}
