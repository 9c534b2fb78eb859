//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! Each MapPoint tracks which KeyFrames observe it, maintains quality metrics
//! for culling decisions, and stores the viewing geometry used to predict
//! where and at which pyramid level it can be matched again.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::features::{hamming_distance, Descriptor, ScalePyramid};

use super::types::{KeyFrameId, MapPointId};

#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative descriptor: the observation with the least median
    /// Hamming distance to the others.
    pub descriptor: Descriptor,

    /// observation[kf_id] = feature_idx means keyframe kf_id sees this point at feature_idx.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Observation count where stereo/RGB-D observations count twice.
    pub num_obs: usize,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Scale-invariance distance range.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Times the point was predicted visible in a tracked frame.
    pub visible_count: u32,

    /// Times the point was matched in a tracked frame.
    pub found_count: u32,

    /// KeyFrame whose pose anchors corrections of this point.
    pub reference_kf: KeyFrameId,

    /// KeyFrame that created this MapPoint.
    pub first_kf_id: KeyFrameId,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(id: MapPointId, position: Vector3<f64>, descriptor: Descriptor, first_kf_id: KeyFrameId) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            num_obs: 0,
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 1,
            found_count: 1,
            reference_kf: first_kf_id,
            first_kf_id,
            is_bad: false,
        }
    }

    /// Returns false if the KeyFrame already observes this point.
    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize, stereo: bool) -> bool {
        if self.observations.contains_key(&kf_id) {
            return false;
        }
        self.observations.insert(kf_id, feature_idx);
        self.num_obs += if stereo { 2 } else { 1 };
        true
    }

    pub fn erase_observation(&mut self, kf_id: KeyFrameId, stereo: bool) -> Option<usize> {
        let idx = self.observations.remove(&kf_id)?;
        self.num_obs = self.num_obs.saturating_sub(if stereo { 2 } else { 1 });
        if self.reference_kf == kf_id {
            if let Some(&other) = self.observations.keys().min() {
                self.reference_kf = other;
            }
        }
        Some(idx)
    }

    pub fn num_observations(&self) -> usize {
        self.num_obs
    }

    pub fn is_observed_by(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    /// Returns 1.0 if never visible, so new points are not penalized.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    /// A point is bad if it is flagged, poorly tracked, or too weakly observed.
    pub fn should_cull(&self, min_found_ratio: f64, min_observations: usize) -> bool {
        self.is_bad || self.found_ratio() < min_found_ratio || self.num_observations() < min_observations
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    /// Recompute the mean normal and the scale-invariance range.
    ///
    /// `observer_centers` are the camera centers of all observing KeyFrames;
    /// `reference` is the reference KeyFrame's center and the octave at which
    /// it sees the point.
    pub fn update_normal_and_depth(
        &mut self,
        observer_centers: impl Iterator<Item = Vector3<f64>>,
        reference: (Vector3<f64>, u32),
        pyramid: &ScalePyramid,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut n = 0;
        for center in observer_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                n += 1;
            }
        }
        if n == 0 {
            return;
        }
        let norm = normal_sum.norm();
        if norm > 1e-10 {
            self.normal = normal_sum / norm;
        }

        let (ref_center, level) = reference;
        let dist = (self.position - ref_center).norm();
        let top = pyramid.scale(pyramid.n_levels.saturating_sub(1));
        self.max_distance = dist * pyramid.scale(level);
        self.min_distance = self.max_distance / top;
    }

    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }

    pub fn predict_level(&self, distance: f64, pyramid: &ScalePyramid) -> u32 {
        pyramid.predict_level(self.max_distance, distance)
    }

    /// Pick the descriptor with the least median distance to the others.
    pub fn compute_distinctive_descriptor(&mut self, descriptors: &[Descriptor]) {
        if descriptors.is_empty() {
            return;
        }
        let n = descriptors.len();
        let mut best = (u32::MAX, 0usize);
        for i in 0..n {
            let mut dists: Vec<u32> = (0..n).map(|j| hamming_distance(&descriptors[i], &descriptors[j])).collect();
            dists.sort_unstable();
            let median = dists[(n - 1) / 2];
            if median < best.0 {
                best = (median, i);
            }
        }
        self.descriptor = descriptors[best.1];
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("visible_count", &self.visible_count)
            .field("found_count", &self.found_count)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
