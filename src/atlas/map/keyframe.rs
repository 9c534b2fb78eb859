//! KeyFrame - A selected frame with map structure relationships.
//!
//! KeyFrames are the core nodes of the SLAM graph. They contain:
//! - Sensor data (features, stereo depth, IMU preintegration)
//! - Pose estimate (SE3 transform)
//! - Graph relationships (covisibility, spanning tree, loop and merge edges)
//!
//! The covisibility graph connects KeyFrames that share MapPoint observations,
//! while the spanning tree provides a minimal connected structure for
//! optimization during loop closure.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::geometry::{CameraModel, SE3};
use crate::imu::{ImuBias, ImuCalib, NavState, Preintegrated};
use crate::tracking::frame::{Frame, FrameFeatures};
use crate::vocabulary::{BowVector, FeatureVector};

use super::types::{KeyFrameId, MapId, MapPointId};

#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    pub map_id: MapId,

    /// Seconds.
    pub timestamp: f64,

    /// Pose: transform from camera to world (T_wc).
    pub pose: SE3,

    /// Body velocity in world frame (m/s).
    pub velocity: Vector3<f64>,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    pub features: FrameFeatures,

    pub bow_vector: Option<BowVector>,

    /// Feature indices grouped by vocabulary node, for guided matching.
    pub feature_vector: Option<FeatureVector>,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// map_point_ids[i] = Some(mp_id) if feature i is associated with MapPoint mp_id.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // IMU Data
    // ─────────────────────────────────────────────────────────────────────────
    /// Preintegrated IMU measurements from the previous KeyFrame to this one.
    pub imu_preintegrated: Option<Preintegrated>,

    pub imu_bias: ImuBias,

    // ─────────────────────────────────────────────────────────────────────────
    // Temporal Links
    // ─────────────────────────────────────────────────────────────────────────
    pub prev_kf: Option<KeyFrameId>,
    pub next_kf: Option<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Connected KeyFrame -> number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    /// Covisibles sorted by weight, best first. Rebuilt on every change.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree and Essential Graph
    // ─────────────────────────────────────────────────────────────────────────
    pub parent_id: Option<KeyFrameId>,
    pub children_ids: HashSet<KeyFrameId>,
    pub loop_edges: HashSet<KeyFrameId>,
    pub merge_edges: HashSet<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────
    pub is_bad: bool,

    /// Set by loop closing while the KeyFrame takes part in a correction.
    pub not_erase: bool,
}

impl KeyFrame {
    /// Snapshot a tracked frame. The frame must carry an estimated pose.
    pub fn from_frame(id: KeyFrameId, map_id: MapId, frame: &Frame) -> Self {
        let mut kf = Self::new(id, map_id, frame.timestamp, frame.pose.unwrap_or_default(), frame.features.clone());
        kf.bow_vector = frame.bow_vector.clone();
        kf.feature_vector = frame.feature_vector.clone();
        kf.imu_preintegrated = frame.preintegrated_keyframe.clone();
        kf.imu_bias = frame.imu_bias;
        kf.velocity = frame.velocity.unwrap_or_else(Vector3::zeros);
        kf
    }

    pub fn new(id: KeyFrameId, map_id: MapId, timestamp: f64, pose: SE3, features: FrameFeatures) -> Self {
        let n = features.len();
        Self {
            id,
            map_id,
            timestamp,
            pose,
            velocity: Vector3::zeros(),
            features,
            bow_vector: None,
            feature_vector: None,
            map_point_ids: vec![None; n],
            imu_preintegrated: None,
            imu_bias: ImuBias::zero(),
            prev_kf: None,
            next_kf: None,
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            parent_id: None,
            children_ids: HashSet::new(),
            loop_edges: HashSet::new(),
            merge_edges: HashSet::new(),
            is_bad: false,
            not_erase: false,
        }
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// World-to-camera transform.
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    /// Body state for inertial prediction.
    pub fn nav_state(&self, calib: &ImuCalib) -> NavState {
        let t_wb = self.pose.compose(&calib.t_cb);
        NavState {
            r_wb: t_wb.rotation_matrix(),
            p_wb: t_wb.translation,
            v_wb: self.velocity,
        }
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Returns the previous MapPoint ID if there was one.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    /// Drop every association to `mp_id`.
    pub fn erase_map_point_id(&mut self, mp_id: MapPointId) {
        for slot in self.map_point_ids.iter_mut() {
            if *slot == Some(mp_id) {
                *slot = None;
            }
        }
    }

    pub fn get_map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    /// Is feature `idx` a stereo/RGB-D observation?
    pub fn is_stereo_observation(&self, idx: usize) -> bool {
        self.features.u_right.get(idx).copied().flatten().is_some()
    }

    /// Median depth of the associated points, for scene scale checks.
    pub fn compute_scene_median_depth(&self, positions: impl Iterator<Item = Vector3<f64>>) -> Option<f64> {
        let t_cw = self.pose_cw();
        let mut depths: Vec<f64> = positions.map(|p| t_cw.transform_point(&p).z).collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(f64::total_cmp);
        Some(depths[(depths.len() - 1) / 2])
    }

    /// Projects a world point and checks it lands in the image in front of the camera.
    pub fn is_in_image(&self, point_world: &Vector3<f64>, camera: &CameraModel) -> bool {
        let pc = self.pose_cw().transform_point(point_world);
        camera.project_checked(&pc).is_some()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
        self.rebuild_ordered_covisibles();
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.rebuild_ordered_covisibles();
        }
    }

    /// Replace all connections at once.
    pub fn set_covisibility(&mut self, weights: HashMap<KeyFrameId, usize>) {
        self.covisibility_weights = weights;
        self.covisibility_weights.remove(&self.id);
        self.rebuild_ordered_covisibles();
    }

    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// All covisibles, best first.
    pub fn get_covisibles(&self) -> Vec<KeyFrameId> {
        self.ordered_covisibles.iter().map(|(id, _)| *id).collect()
    }

    pub fn get_best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles.iter().take(n).map(|(id, _)| *id).collect()
    }

    pub fn get_covisibles_above_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    fn rebuild_ordered_covisibles(&mut self) {
        self.ordered_covisibles = self.covisibility_weights.iter().map(|(id, w)| (*id, *w)).collect();
        // Ties break on id so iteration order is deterministic.
        self.ordered_covisibles.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("map_id", &self.map_id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.num_features())
            .field("num_map_points", &self.num_map_points())
            .field("covisibles", &self.covisibility_weights.len())
            .field("parent", &self.parent_id)
            .field("num_children", &self.children_ids.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Features, KeyPoint};

    fn create_keyframe_with_features(id: u64, num_features: usize) -> KeyFrame {
        let camera = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480);
        let features = Features {
            keypoints: (0..num_features).map(|i| KeyPoint::new(10.0 + i as f64, 20.0, 0)).collect(),
            descriptors: vec![[0; 32]; num_features],
        };
        KeyFrame::new(
            KeyFrameId::new(id),
            MapId::new(0),
            id as f64,
            SE3::identity(),
            FrameFeatures::new(features, &camera),
        )
    }

    #[test]
    fn test_map_point_association() {
        let mut kf = create_keyframe_with_features(1, 10);

        kf.set_map_point(3, MapPointId::new(100));
        assert_eq!(kf.get_map_point(3), Some(MapPointId::new(100)));
        assert_eq!(kf.get_map_point(4), None);
        assert_eq!(kf.num_map_points(), 1);

        let prev = kf.set_map_point(3, MapPointId::new(200));
        assert_eq!(prev, Some(MapPointId::new(100)));

        assert_eq!(kf.erase_map_point(3), Some(MapPointId::new(200)));
        assert_eq!(kf.get_map_point(3), None);
        assert_eq!(kf.set_map_point(99, MapPointId::new(1)), None);
    }

    #[test]
    fn test_covisibility_graph() {
        let mut kf = create_keyframe_with_features(1, 0);

        kf.add_covisibility(KeyFrameId::new(2), 50);
        kf.add_covisibility(KeyFrameId::new(3), 100);
        kf.add_covisibility(KeyFrameId::new(4), 25);

        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(2)), 50);
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(5)), 0);

        let best = kf.get_best_covisibles(2);
        assert_eq!(best, vec![KeyFrameId::new(3), KeyFrameId::new(2)]);
        assert_eq!(kf.get_covisibles_above_weight(30).len(), 2);

        kf.erase_covisibility(KeyFrameId::new(3));
        assert_eq!(kf.get_best_covisibles(1), vec![KeyFrameId::new(2)]);
    }

    #[test]
    fn test_covisibility_no_self_connection() {
        let mut kf = create_keyframe_with_features(1, 0);
        kf.add_covisibility(KeyFrameId::new(1), 100);
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(1)), 0);
    }

    #[test]
    fn test_scene_median_depth() {
        let kf = create_keyframe_with_features(1, 0);
        let pts = [1.0, 4.0, 2.0].map(|z| Vector3::new(0.0, 0.0, z));
        assert_eq!(kf.compute_scene_median_depth(pts.into_iter()), Some(2.0));
    }
}
