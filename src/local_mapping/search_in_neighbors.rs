//! Map point fusion between covisible keyframes.
//!
//! Fuses duplicate map points between the current keyframe and its
//! neighborhood:
//! 1. Collect first- and second-order covisibles (plus the temporal chain for
//!    inertial maps)
//! 2. Project the current keyframe's points into every neighbor
//! 3. Project the neighbors' points into the current keyframe
//! 4. Refresh descriptors, normals and covisibility

use std::collections::HashSet;

use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::features::ScalePyramid;
use crate::geometry::CameraModel;
use crate::tracking::matcher::OrbMatcher;

/// Second-order covisibles taken per first-order neighbor.
const SECOND_ORDER_NEIGHBORS: usize = 5;
/// Inertial maps walk the temporal chain until this many neighbors are found.
const MIN_NEIGHBORS_INERTIAL: usize = 20;

#[derive(Debug, Clone)]
pub struct FuseParams {
    pub neighbors: usize,
    /// Projection search radius, in pixels at level 0.
    pub radius: f64,
    pub inertial: bool,
}

/// Statistics of one fusion pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseResult {
    pub neighbors: usize,
    pub fused: usize,
}

/// Neighbor keyframes for fusion, excluding `kf_id` itself.
pub fn collect_neighbors(map: &Map, kf_id: KeyFrameId, params: &FuseParams) -> Vec<KeyFrameId> {
    let Some(kf) = map.get_keyframe(kf_id) else {
        return Vec::new();
    };
    let first = kf.get_best_covisibles(params.neighbors);
    let mut seen: HashSet<KeyFrameId> = first.iter().copied().collect();
    seen.insert(kf_id);
    let mut neighbors = first.clone();

    for id in &first {
        let Some(n) = map.get_keyframe(*id) else {
            continue;
        };
        for second in n.get_best_covisibles(SECOND_ORDER_NEIGHBORS) {
            if seen.insert(second) {
                neighbors.push(second);
            }
        }
    }

    if params.inertial {
        let mut prev = kf.prev_kf;
        while let Some(id) = prev {
            if neighbors.len() >= MIN_NEIGHBORS_INERTIAL {
                break;
            }
            if seen.insert(id) {
                neighbors.push(id);
            }
            prev = map.get_keyframe(id).and_then(|k| k.prev_kf);
        }
    }
    neighbors
}

/// Fuse the current keyframe's points with its neighborhood.
pub fn search_in_neighbors(
    map: &mut Map,
    kf_id: KeyFrameId,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
    params: &FuseParams,
) -> FuseResult {
    let neighbors = collect_neighbors(map, kf_id, params);
    let mut result = FuseResult {
        neighbors: neighbors.len(),
        fused: 0,
    };
    if neighbors.is_empty() {
        return result;
    }
    let matcher = OrbMatcher::new(0.6, true);

    let mut own: Vec<MapPointId> = map.get_map_points_from_keyframes(&[kf_id]).into_iter().collect();
    own.sort();
    for n in &neighbors {
        result.fused += matcher.fuse(map, *n, &own, params.radius, camera, pyramid);
    }

    let own_set: HashSet<MapPointId> = map.get_map_points_from_keyframes(&[kf_id]);
    let mut candidates: Vec<MapPointId> = map
        .get_map_points_from_keyframes(&neighbors)
        .into_iter()
        .filter(|id| !own_set.contains(id))
        .collect();
    candidates.sort();
    result.fused += matcher.fuse(map, kf_id, &candidates, params.radius, camera, pyramid);

    for mp_id in map.get_map_points_from_keyframes(&[kf_id]) {
        map.update_map_point(mp_id, pyramid);
    }
    map.update_connections(kf_id);

    debug!(
        "[LocalMapping] KeyFrame {}: fused {} points across {} neighbors",
        kf_id, result.fused, result.neighbors
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::test_support::SyntheticScene;

    fn params() -> FuseParams {
        FuseParams {
            neighbors: 10,
            radius: 3.0,
            inertial: false,
        }
    }

    #[test]
    fn test_duplicate_points_are_merged() {
        let scene = SyntheticScene::new(31, 200);
        let (mut map, kfs) = scene.build_map(&[0.0, 0.3, 0.6]);

        // Give the newest KeyFrame its own copy of every point it sees.
        let last = kfs[2];
        let associations: Vec<(usize, MapPointId)> =
            map.get_keyframe(last).unwrap().get_map_point_indices().collect();
        for (idx, mp) in &associations {
            let (position, descriptor) = {
                let p = map.get_map_point(*mp).unwrap();
                (p.position, p.descriptor)
            };
            map.disassociate(last, *idx);
            let copy = map.create_map_point(position, descriptor, last);
            map.associate(last, *idx, copy);
            map.update_map_point(copy, &scene.pyramid);
        }
        let before = map.num_map_points();

        let result = search_in_neighbors(&mut map, last, &scene.camera, &scene.pyramid, &params());
        assert!(result.fused > associations.len() / 2);
        assert!(map.num_map_points() < before);

        // Surviving points of the newest KeyFrame are shared with a neighbor.
        let shared = map
            .get_keyframe(last)
            .unwrap()
            .get_map_point_indices()
            .filter(|(_, id)| map.get_map_point(*id).is_some_and(|mp| mp.num_observations() > 1))
            .count();
        assert!(shared > associations.len() / 2);
    }

    #[test]
    fn test_neighbors_exclude_the_keyframe() {
        let scene = SyntheticScene::new(32, 200);
        let (map, kfs) = scene.build_map(&[0.0, 0.3, 0.6, 0.9]);
        let neighbors = collect_neighbors(&map, kfs[3], &params());
        assert!(!neighbors.contains(&kfs[3]));
        assert_eq!(neighbors.len(), 3);
    }
}
