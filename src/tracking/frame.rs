//! Tracking `Frame` representation.
//!
//! A `Frame` is what the Tracker operates on: undistorted features with
//! optional stereo/depth measurements, a Bag-of-Words vector computed on
//! demand, temporary associations to `MapPoint`s and, for inertial modes, the
//! preintegrated IMU delta since the previous frame.
//!
//! [`FrameFeatures`] is the immutable feature payload shared with KeyFrames.

use nalgebra::Vector3;

use crate::atlas::map::{KeyFrameId, MapPoint, MapPointId};
use crate::features::{Descriptor, Features, KeyPoint, ScalePyramid};
use crate::geometry::{CameraModel, SE3};
use crate::imu::{ImuBias, Preintegrated};
use crate::vocabulary::{BowVector, FeatureVector, OrbVocabulary, FEATURE_VECTOR_LEVELS_UP};

/// Spatial grid for O(k) feature lookup in a radius.
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    /// Row-major: `cells[row * GRID_COLS + col]`.
    cells: Vec<Vec<usize>>,
    grid_element_width_inv: f64,
    grid_element_height_inv: f64,
    min_x: f64,
    min_y: f64,
}

impl FeatureGrid {
    pub const GRID_COLS: usize = 64;
    pub const GRID_ROWS: usize = 48;

    /// Index undistorted keypoints over `(min_x, max_x, min_y, max_y)`.
    pub fn new(keypoints: &[KeyPoint], bounds: (f64, f64, f64, f64)) -> Self {
        let (min_x, max_x, min_y, max_y) = bounds;
        let grid_element_width_inv = Self::GRID_COLS as f64 / (max_x - min_x).max(1.0);
        let grid_element_height_inv = Self::GRID_ROWS as f64 / (max_y - min_y).max(1.0);

        let mut cells = vec![Vec::new(); Self::GRID_COLS * Self::GRID_ROWS];
        for (idx, kp) in keypoints.iter().enumerate() {
            let cx = ((kp.x - min_x) * grid_element_width_inv).floor();
            let cy = ((kp.y - min_y) * grid_element_height_inv).floor();
            // Keypoints that undistort outside the image are not indexed.
            if cx < 0.0 || cy < 0.0 || cx >= Self::GRID_COLS as f64 || cy >= Self::GRID_ROWS as f64 {
                continue;
            }
            cells[cy as usize * Self::GRID_COLS + cx as usize].push(idx);
        }

        Self {
            cells,
            grid_element_width_inv,
            grid_element_height_inv,
            min_x,
            min_y,
        }
    }

    /// Candidate indices in the cells touched by the square around `(x, y)`.
    fn candidates(&self, x: f64, y: f64, r: f64) -> impl Iterator<Item = usize> + '_ {
        let col = |v: f64| ((v - self.min_x) * self.grid_element_width_inv).floor();
        let row = |v: f64| ((v - self.min_y) * self.grid_element_height_inv).floor();
        let c0 = col(x - r).max(0.0) as usize;
        let c1 = col(x + r).min(Self::GRID_COLS as f64 - 1.0);
        let r0 = row(y - r).max(0.0) as usize;
        let r1 = row(y + r).min(Self::GRID_ROWS as f64 - 1.0);
        let (c1, r1) = if c1 < 0.0 || r1 < 0.0 {
            (0, 0)
        } else {
            (c1 as usize + 1, r1 as usize + 1)
        };
        let (c0, r0) = (c0.min(c1), r0.min(r1));
        (r0..r1).flat_map(move |row| (c0..c1).flat_map(move |c| self.cells[row * Self::GRID_COLS + c].iter().copied()))
    }
}

/// Features of one image after undistortion and depth association.
#[derive(Debug, Clone)]
pub struct FrameFeatures {
    /// Raw keypoints as detected.
    pub keypoints: Vec<KeyPoint>,
    /// Undistorted keypoints; all geometry uses these.
    pub keypoints_un: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// Right-image horizontal coordinate (real or virtual) per keypoint.
    pub u_right: Vec<Option<f64>>,
    pub depth: Vec<Option<f64>>,
    pub grid: FeatureGrid,
}

impl FrameFeatures {
    /// Undistort and grid-index extracted features. No depth yet.
    pub fn new(features: Features, camera: &CameraModel) -> Self {
        let Features {
            keypoints,
            descriptors,
        } = features;
        let keypoints_un: Vec<KeyPoint> = keypoints
            .iter()
            .map(|kp| {
                let (x, y) = camera.undistort_point(kp.x, kp.y);
                KeyPoint { x, y, ..*kp }
            })
            .collect();
        let grid = FeatureGrid::new(&keypoints_un, camera.undistorted_bounds());
        let n = keypoints.len();
        Self {
            keypoints,
            keypoints_un,
            descriptors,
            u_right: vec![None; n],
            depth: vec![None; n],
            grid,
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints_un.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints_un.is_empty()
    }

    /// Indices of undistorted keypoints within `r` pixels of `(x, y)`,
    /// optionally restricted to an inclusive octave range.
    pub fn features_in_area(
        &self,
        x: f64,
        y: f64,
        r: f64,
        min_level: Option<u32>,
        max_level: Option<u32>,
    ) -> Vec<usize> {
        let r2 = r * r;
        self.grid
            .candidates(x, y, r)
            .filter(|&i| {
                let kp = &self.keypoints_un[i];
                if min_level.is_some_and(|l| kp.octave < l) || max_level.is_some_and(|l| kp.octave > l) {
                    return false;
                }
                let (dx, dy) = (kp.x - x, kp.y - y);
                dx * dx + dy * dy <= r2
            })
            .collect()
    }

    /// Back-project a keypoint with depth into the world frame.
    pub fn unproject_stereo(&self, idx: usize, camera: &CameraModel, pose_wc: &SE3) -> Option<Vector3<f64>> {
        let z = self.depth.get(idx).copied().flatten()?;
        if z <= 0.0 {
            return None;
        }
        let kp = &self.keypoints_un[idx];
        let pc = camera.unproject(kp.x, kp.y) * z;
        Some(pose_wc.transform_point(&pc))
    }

    pub fn has_depth(&self, idx: usize) -> bool {
        self.depth.get(idx).copied().flatten().is_some_and(|d| d > 0.0)
    }
}

/// Where a map point lands in a frame, from [`Frame::is_in_frustum`].
#[derive(Debug, Clone, Copy)]
pub struct ProjectionInfo {
    pub u: f64,
    pub v: f64,
    pub u_right: Option<f64>,
    pub level: u32,
    pub view_cos: f64,
}

/// A frame being tracked (not yet a KeyFrame).
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    /// Seconds.
    pub timestamp: f64,
    pub features: FrameFeatures,
    /// Temporary MapPoint associations: `map_points[i] = Some(mp)` if feature i is matched.
    pub map_points: Vec<Option<MapPointId>>,
    pub outliers: Vec<bool>,
    pub bow_vector: Option<BowVector>,
    pub feature_vector: Option<FeatureVector>,
    /// Camera-to-world pose once estimated.
    pub pose: Option<SE3>,
    /// IMU delta since the previous frame.
    pub preintegrated_frame: Option<Preintegrated>,
    /// IMU delta since the last KeyFrame.
    pub preintegrated_keyframe: Option<Preintegrated>,
    pub imu_bias: ImuBias,
    /// Body velocity in the world frame (inertial modes).
    pub velocity: Option<Vector3<f64>>,
    pub reference_kf: Option<KeyFrameId>,
}

impl Frame {
    pub fn new(id: u64, timestamp: f64, features: FrameFeatures) -> Self {
        let n = features.len();
        Self {
            id,
            timestamp,
            features,
            map_points: vec![None; n],
            outliers: vec![false; n],
            bow_vector: None,
            feature_vector: None,
            pose: None,
            preintegrated_frame: None,
            preintegrated_keyframe: None,
            imu_bias: ImuBias::zero(),
            velocity: None,
            reference_kf: None,
        }
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn compute_bow(&mut self, vocabulary: &OrbVocabulary) {
        if self.bow_vector.is_none() {
            let (bow, fv) = vocabulary.transform(&self.features.descriptors, FEATURE_VECTOR_LEVELS_UP);
            self.bow_vector = Some(bow);
            self.feature_vector = Some(fv);
        }
    }

    pub fn pose_cw(&self) -> Option<SE3> {
        self.pose.map(|p| p.inverse())
    }

    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose.map(|p| p.translation)
    }

    pub fn clear_matches(&mut self) {
        self.map_points.iter_mut().for_each(|m| *m = None);
        self.outliers.iter_mut().for_each(|o| *o = false);
    }

    /// Matched features that survived pose optimization.
    pub fn num_tracked(&self) -> usize {
        self.map_points
            .iter()
            .zip(&self.outliers)
            .filter(|(m, o)| m.is_some() && !**o)
            .count()
    }

    /// Project a map point and check that this frame could observe it:
    /// in front of the camera, inside the image, within the scale-invariance
    /// distance range and within `view_cos_limit` of its mean viewing direction.
    pub fn is_in_frustum(
        &self,
        mp: &MapPoint,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
        view_cos_limit: f64,
    ) -> Option<ProjectionInfo> {
        let pose = self.pose?;
        let pc = pose.inverse().transform_point(&mp.position);
        if pc.z <= 0.0 {
            return None;
        }
        let uv = camera.project(&pc);
        let (min_x, max_x, min_y, max_y) = camera.undistorted_bounds();
        if uv.x < min_x || uv.x >= max_x || uv.y < min_y || uv.y >= max_y {
            return None;
        }
        let po = mp.position - pose.translation;
        let dist = po.norm();
        if dist < 0.8 * mp.min_distance || dist > 1.2 * mp.max_distance {
            return None;
        }
        let view_cos = po.dot(&mp.normal) / dist;
        if view_cos < view_cos_limit {
            return None;
        }
        Some(ProjectionInfo {
            u: uv.x,
            v: uv.y,
            u_right: (camera.bf > 0.0).then(|| camera.project_right_u(&pc)),
            level: pyramid.predict_level(mp.max_distance, dist),
            view_cos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features_at(points: &[(f64, f64, u32)]) -> Features {
        Features {
            keypoints: points.iter().map(|&(x, y, o)| KeyPoint::new(x, y, o)).collect(),
            descriptors: vec![[0u8; 32]; points.len()],
        }
    }

    #[test]
    fn test_features_in_area() {
        let camera = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480);
        let ff = FrameFeatures::new(
            features_at(&[(100.0, 100.0, 0), (104.0, 103.0, 1), (300.0, 300.0, 0), (639.0, 479.0, 2)]),
            &camera,
        );
        let mut near = ff.features_in_area(101.0, 101.0, 5.0, None, None);
        near.sort();
        assert_eq!(near, vec![0, 1]);
        assert_eq!(ff.features_in_area(101.0, 101.0, 5.0, Some(1), None), vec![1]);
        assert_eq!(ff.features_in_area(101.0, 101.0, 5.0, None, Some(0)), vec![0]);
        assert_eq!(ff.features_in_area(639.0, 479.0, 1.0, None, None), vec![3]);
        assert!(ff.features_in_area(-50.0, -50.0, 3.0, None, None).is_empty());
    }

    #[test]
    fn test_unproject_stereo() {
        let camera = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480);
        let mut ff = FrameFeatures::new(features_at(&[(320.0, 240.0, 0), (400.0, 240.0, 0)]), &camera);
        ff.depth[1] = Some(2.0);
        assert!(ff.unproject_stereo(0, &camera, &SE3::identity()).is_none());
        let p = ff.unproject_stereo(1, &camera, &SE3::identity()).unwrap();
        assert!((p - Vector3::new(0.4, 0.0, 2.0)).norm() < 1e-12);
    }
}
