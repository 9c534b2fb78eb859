//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map is an arena holding one connected reconstruction:
//! - KeyFrames with their poses and features
//! - MapPoints (3D landmarks) with their observations
//! - Covisibility, spanning-tree, loop and merge edges, stored as id pairs
//!
//! It provides methods for:
//! - Adding/removing KeyFrames and MapPoints
//! - Creating bidirectional associations (KF <-> MP)
//! - Rebuilding covisibility connections and the spanning tree
//! - Culling KeyFrames while keeping the trajectory log complete
//! - Similarity transforms and absorbing another map (merging)

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::{Matrix3, Vector3};
use tracing::debug;

use crate::features::{Descriptor, ScalePyramid};
use crate::geometry::{Sim3, SE3};
use crate::imu::{ImuBias, InertialStage};
use crate::tracking::frame::Frame;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{IdAllocator, KeyFrameId, MapId, MapPointId};

/// Minimum shared points for a covisibility edge.
pub const COVISIBILITY_MIN_WEIGHT: usize = 15;

/// A timestamped camera pose (camera to world).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StampedPose {
    pub timestamp: f64,
    pub pose: SE3,
}

/// Counts reported by `SlamSystem::active_map_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapStats {
    pub map_id: MapId,
    pub keyframes: usize,
    pub map_points: usize,
    pub inertial_stage: InertialStage,
}

pub struct Map {
    id: MapId,
    ids: Arc<IdAllocator>,

    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,

    /// First KeyFrame; never culled and fixed in global optimizations.
    origin_kf: Option<KeyFrameId>,

    /// Tail of the temporal chain.
    last_keyframe_id: Option<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Inertial State
    // ─────────────────────────────────────────────────────────────────────────
    inertial_stage: InertialStage,
    /// Rotation applied to align the map with gravity at inertial init.
    r_wg: Matrix3<f64>,
    /// Latest bias estimate for the map.
    pub imu_bias: ImuBias,
    /// Bumped whenever the map moves as a whole (inertial init, loop, merge).
    big_change: u32,
    first_timestamp: Option<f64>,

    // ─────────────────────────────────────────────────────────────────────────
    // Trajectory Log
    // ─────────────────────────────────────────────────────────────────────────
    /// Every KeyFrame ever inserted, append-only.
    trajectory: Vec<(f64, KeyFrameId)>,
    /// Culled KeyFrame -> (parent, T_parent_kf).
    culled: HashMap<KeyFrameId, (KeyFrameId, SE3)>,
    /// MapPoint replaced during fusion -> its replacement.
    replaced: HashMap<MapPointId, MapPointId>,
}

impl Map {
    pub fn new(id: MapId, ids: Arc<IdAllocator>) -> Self {
        Self {
            id,
            ids,
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            origin_kf: None,
            last_keyframe_id: None,
            inertial_stage: InertialStage::Uninitialized,
            r_wg: Matrix3::identity(),
            imu_bias: ImuBias::zero(),
            big_change: 0,
            first_timestamp: None,
            trajectory: Vec::new(),
            culled: HashMap::new(),
            replaced: HashMap::new(),
        }
    }

    pub fn id(&self) -> MapId {
        self.id
    }

    pub fn stats(&self) -> MapStats {
        MapStats {
            map_id: self.id,
            keyframes: self.keyframes.len(),
            map_points: self.map_points.len(),
            inertial_stage: self.inertial_stage,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inertial State
    // ─────────────────────────────────────────────────────────────────────────

    pub fn inertial_stage(&self) -> InertialStage {
        self.inertial_stage
    }

    pub fn set_inertial_stage(&mut self, stage: InertialStage) {
        self.inertial_stage = stage;
    }

    pub fn is_imu_initialized(&self) -> bool {
        self.inertial_stage.is_initialized()
    }

    pub fn gravity_rotation(&self) -> Matrix3<f64> {
        self.r_wg
    }

    pub fn big_change(&self) -> u32 {
        self.big_change
    }

    pub fn bump_big_change(&mut self) {
        self.big_change += 1;
    }

    /// Seconds between the first and the latest KeyFrame.
    pub fn age(&self) -> f64 {
        let last = self
            .last_keyframe_id
            .and_then(|id| self.keyframes.get(&id))
            .map(|kf| kf.timestamp);
        match (self.first_timestamp, last) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshot a tracked frame as a new KeyFrame and link it into the
    /// temporal chain. Associations are not copied; use [`Map::associate`].
    pub fn create_keyframe(&mut self, frame: &Frame) -> KeyFrameId {
        let id = self.ids.keyframe();
        let mut kf = KeyFrame::from_frame(id, self.id, frame);
        if let Some(prev_id) = self.last_keyframe_id {
            kf.prev_kf = Some(prev_id);
            if let Some(prev) = self.keyframes.get_mut(&prev_id) {
                prev.next_kf = Some(id);
            }
        }
        if self.origin_kf.is_none() {
            self.origin_kf = Some(id);
        }
        self.first_timestamp.get_or_insert(kf.timestamp);
        self.trajectory.push((kf.timestamp, id));
        self.keyframes.insert(id, kf);
        self.last_keyframe_id = Some(id);
        id
    }

    pub fn origin_keyframe(&self) -> Option<KeyFrameId> {
        self.origin_kf
    }

    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.last_keyframe_id
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn contains_keyframe(&self, id: KeyFrameId) -> bool {
        self.keyframes.contains_key(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn keyframes_mut(&mut self) -> impl Iterator<Item = &mut KeyFrame> {
        self.keyframes.values_mut()
    }

    /// Ids sorted ascending, which is insertion order within one map.
    pub fn keyframe_ids(&self) -> Vec<KeyFrameId> {
        let mut ids: Vec<KeyFrameId> = self.keyframes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// KeyFrames sorted by timestamp, oldest first.
    pub fn keyframes_temporal_order(&self) -> Vec<&KeyFrame> {
        let mut kfs: Vec<&KeyFrame> = self.keyframes.values().collect();
        kfs.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        kfs
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_map_point(&mut self, position: Vector3<f64>, descriptor: Descriptor, ref_kf: KeyFrameId) -> MapPointId {
        let id = self.ids.map_point();
        self.map_points.insert(id, MapPoint::new(id, position, descriptor, ref_kf));
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// Follow fusion replacements to the live point, if any.
    pub fn resolve_map_point(&self, mut id: MapPointId) -> Option<MapPointId> {
        for _ in 0..32 {
            if self.map_points.contains_key(&id) {
                return Some(id);
            }
            id = *self.replaced.get(&id)?;
        }
        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF <-> MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Link a KeyFrame feature and a MapPoint in both directions.
    ///
    /// Returns false if either side is missing or the point is already
    /// observed by this KeyFrame.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return false;
        };
        if feature_idx >= kf.num_features() {
            return false;
        }
        let stereo = kf.is_stereo_observation(feature_idx);
        let previous = kf.get_map_point(feature_idx);
        let Some(mp) = self.map_points.get_mut(&mp_id) else {
            return false;
        };
        if !mp.add_observation(kf_id, feature_idx, stereo) {
            return false;
        }
        if let Some(prev) = previous.filter(|p| *p != mp_id) {
            if let Some(prev_mp) = self.map_points.get_mut(&prev) {
                prev_mp.erase_observation(kf_id, stereo);
            }
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }
        true
    }

    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let kf = self.keyframes.get_mut(&kf_id)?;
        let stereo = kf.is_stereo_observation(feature_idx);
        let mp_id = kf.erase_map_point(feature_idx)?;
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.erase_observation(kf_id, stereo);
        }
        Some(mp_id)
    }

    /// Remove a MapPoint and every KeyFrame reference to it.
    pub fn erase_map_point(&mut self, mp_id: MapPointId) -> Option<MapPoint> {
        let mp = self.map_points.remove(&mp_id)?;
        for (kf_id, idx) in &mp.observations {
            if let Some(kf) = self.keyframes.get_mut(kf_id) {
                if kf.get_map_point(*idx) == Some(mp_id) {
                    kf.erase_map_point(*idx);
                }
            }
        }
        Some(mp)
    }

    /// Move all observations of `old` onto `new` and delete `old`.
    pub fn replace_map_point(&mut self, old: MapPointId, new: MapPointId) {
        if old == new || !self.map_points.contains_key(&new) {
            return;
        }
        let Some(old_mp) = self.map_points.remove(&old) else {
            return;
        };
        for (kf_id, idx) in &old_mp.observations {
            let Some(kf) = self.keyframes.get_mut(kf_id) else {
                continue;
            };
            let stereo = kf.is_stereo_observation(*idx);
            let already = self.map_points.get(&new).is_some_and(|mp| mp.is_observed_by(*kf_id));
            if already {
                kf.erase_map_point(*idx);
            } else {
                kf.set_map_point(*idx, new);
                if let Some(mp) = self.map_points.get_mut(&new) {
                    mp.add_observation(*kf_id, *idx, stereo);
                }
            }
        }
        if let Some(mp) = self.map_points.get_mut(&new) {
            mp.increase_visible(old_mp.visible_count);
            mp.increase_found(old_mp.found_count);
        }
        self.replaced.insert(old, new);
    }

    /// Recompute normal, distance range and representative descriptor.
    pub fn update_map_point(&mut self, mp_id: MapPointId, pyramid: &ScalePyramid) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let mut centers = Vec::with_capacity(mp.observations.len());
        let mut descriptors = Vec::with_capacity(mp.observations.len());
        let mut reference = None;
        for (kf_id, idx) in &mp.observations {
            let Some(kf) = self.keyframes.get(kf_id) else {
                continue;
            };
            centers.push(kf.camera_center());
            if let Some(d) = kf.features.descriptors.get(*idx) {
                descriptors.push(*d);
            }
            if *kf_id == mp.reference_kf {
                reference = Some((kf.camera_center(), kf.features.keypoints_un[*idx].octave));
            }
        }
        let reference = reference.or_else(|| {
            let (kf_id, idx) = mp.observations.iter().min_by_key(|(k, _)| **k)?;
            let kf = self.keyframes.get(kf_id)?;
            Some((kf.camera_center(), kf.features.keypoints_un[*idx].octave))
        });
        if let (Some(mp), Some(reference)) = (self.map_points.get_mut(&mp_id), reference) {
            mp.update_normal_and_depth(centers.into_iter(), reference, pyramid);
            mp.compute_distinctive_descriptor(&descriptors);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Graph Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Rebuild covisibility edges of a KeyFrame from shared observations.
    ///
    /// Edges need at least [`COVISIBILITY_MIN_WEIGHT`] shared points; with none
    /// above it, the single best KeyFrame is connected. A KeyFrame without a
    /// spanning-tree parent is attached to its best covisible.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        let mut counts: HashMap<KeyFrameId, usize> = HashMap::new();
        for (_, mp_id) in kf.get_map_point_indices() {
            if let Some(mp) = self.map_points.get(&mp_id) {
                for other in mp.observations.keys() {
                    if *other != kf_id && self.keyframes.contains_key(other) {
                        *counts.entry(*other).or_insert(0) += 1;
                    }
                }
            }
        }
        if counts.is_empty() {
            return;
        }

        let mut weights: HashMap<KeyFrameId, usize> = counts
            .iter()
            .filter(|(_, w)| **w >= COVISIBILITY_MIN_WEIGHT)
            .map(|(k, w)| (*k, *w))
            .collect();
        let best = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(k, w)| (*k, *w));
        if weights.is_empty() {
            if let Some((k, w)) = best {
                weights.insert(k, w);
            }
        }

        for (other, w) in &weights {
            if let Some(o) = self.keyframes.get_mut(other) {
                o.add_covisibility(kf_id, *w);
            }
        }
        let is_origin = self.origin_kf == Some(kf_id);
        let needs_parent = self.keyframes.get(&kf_id).is_some_and(|k| k.parent_id.is_none()) && !is_origin;
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_covisibility(weights);
        }
        if needs_parent {
            if let Some((parent, _)) = best {
                self.set_parent(kf_id, parent);
            }
        }
    }

    /// Re-link a KeyFrame under a new spanning-tree parent.
    pub fn set_parent(&mut self, kf_id: KeyFrameId, parent: KeyFrameId) {
        if kf_id == parent {
            return;
        }
        let old = self.keyframes.get(&kf_id).and_then(|k| k.parent_id);
        if let Some(old) = old {
            if let Some(o) = self.keyframes.get_mut(&old) {
                o.erase_child(kf_id);
            }
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_parent(parent);
        }
        if let Some(p) = self.keyframes.get_mut(&parent) {
            p.add_child(kf_id);
        }
    }

    /// Make `new_root` the root of its spanning tree by reversing the
    /// parent links on the path to the old root.
    pub fn reroot_spanning_tree(&mut self, new_root: KeyFrameId) {
        let mut path = vec![new_root];
        let mut current = new_root;
        while let Some(parent) = self.keyframes.get(&current).and_then(|k| k.parent_id) {
            if path.contains(&parent) {
                break;
            }
            path.push(parent);
            current = parent;
        }
        for pair in path.windows(2) {
            let (child, parent) = (pair[0], pair[1]);
            if let Some(p) = self.keyframes.get_mut(&parent) {
                p.erase_child(child);
                p.parent_id = None;
            }
            if let Some(c) = self.keyframes.get_mut(&child) {
                c.parent_id = None;
                c.add_child(parent);
            }
            if let Some(p) = self.keyframes.get_mut(&parent) {
                p.set_parent(child);
            }
        }
        if let Some(root) = self.keyframes.get_mut(&new_root) {
            root.parent_id = None;
        }
    }

    pub fn add_loop_edge(&mut self, a: KeyFrameId, b: KeyFrameId) {
        if let Some(k) = self.keyframes.get_mut(&a) {
            k.loop_edges.insert(b);
            k.not_erase = true;
        }
        if let Some(k) = self.keyframes.get_mut(&b) {
            k.loop_edges.insert(a);
            k.not_erase = true;
        }
    }

    pub fn add_merge_edge(&mut self, a: KeyFrameId, b: KeyFrameId) {
        if let Some(k) = self.keyframes.get_mut(&a) {
            k.merge_edges.insert(b);
            k.not_erase = true;
        }
        if let Some(k) = self.keyframes.get_mut(&b) {
            k.merge_edges.insert(a);
            k.not_erase = true;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Culling
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove a redundant KeyFrame.
    ///
    /// The origin and `not_erase` KeyFrames are never removed. Children are
    /// re-parented to the most covisible KeyFrame already in the tree, the
    /// IMU preintegration is folded into the successor and the trajectory log
    /// keeps the KeyFrame as a pose relative to its parent.
    pub fn cull_keyframe(&mut self, kf_id: KeyFrameId) -> Option<KeyFrame> {
        if self.origin_kf == Some(kf_id) {
            return None;
        }
        let kf = self.keyframes.get(&kf_id)?;
        if kf.not_erase {
            return None;
        }
        let parent = kf.parent_id?;
        let covisibles = kf.get_covisibles();
        let associations: Vec<(usize, MapPointId)> = kf.get_map_point_indices().collect();
        let mut children: Vec<KeyFrameId> = kf.children_ids.iter().copied().collect();
        children.sort();

        for other in covisibles {
            if let Some(o) = self.keyframes.get_mut(&other) {
                o.erase_covisibility(kf_id);
            }
        }
        for (idx, mp_id) in associations {
            let stereo = self.keyframes.get(&kf_id).is_some_and(|k| k.is_stereo_observation(idx));
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.erase_observation(kf_id, stereo);
            }
        }

        // Greedy re-parenting: each round attaches the child with the
        // strongest covisibility link to a KeyFrame already in the tree.
        let mut candidates: HashSet<KeyFrameId> = HashSet::from([parent]);
        while !children.is_empty() {
            let mut best: Option<(KeyFrameId, KeyFrameId, usize)> = None;
            for child in &children {
                let Some(c) = self.keyframes.get(child) else {
                    continue;
                };
                for (other, w) in c.covisibility_weights() {
                    if candidates.contains(other) && best.map_or(true, |b| *w > b.2) {
                        best = Some((*child, *other, *w));
                    }
                }
            }
            match best {
                Some((child, new_parent, _)) => {
                    self.set_parent(child, new_parent);
                    candidates.insert(child);
                    children.retain(|c| *c != child);
                }
                None => break,
            }
        }
        for child in children {
            self.set_parent(child, parent);
        }
        if let Some(p) = self.keyframes.get_mut(&parent) {
            p.erase_child(kf_id);
        }

        let mut removed = self.keyframes.remove(&kf_id)?;
        removed.set_bad();
        if let Some(p) = self.keyframes.get(&parent) {
            let t_parent_kf = p.pose_cw().compose(&removed.pose);
            self.culled.insert(kf_id, (parent, t_parent_kf));
        }

        if let Some(prev) = removed.prev_kf.and_then(|id| self.keyframes.get_mut(&id)) {
            prev.next_kf = removed.next_kf;
        }
        if let Some(next) = removed.next_kf.and_then(|id| self.keyframes.get_mut(&id)) {
            next.prev_kf = removed.prev_kf;
            if let (Some(prev_pre), Some(pre)) = (removed.imu_preintegrated.as_ref(), next.imu_preintegrated.as_mut()) {
                pre.merge_previous(prev_pre);
            }
        }
        if self.last_keyframe_id == Some(kf_id) {
            self.last_keyframe_id = removed.prev_kf;
        }
        debug!("[Map] Culled {} (parent {})", kf_id, parent);
        Some(removed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Whole-map transforms
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply `p' = s R p + t` to every KeyFrame and MapPoint.
    ///
    /// Camera orientations rotate with the map; velocities rotate and scale.
    pub fn transform(&mut self, s: &Sim3) {
        for kf in self.keyframes.values_mut() {
            kf.pose = SE3::new(s.rotation * kf.pose.rotation, s.transform_point(&kf.pose.translation));
            kf.velocity = s.scale * (s.rotation * kf.velocity);
        }
        for mp in self.map_points.values_mut() {
            mp.position = s.transform_point(&mp.position);
            mp.normal = s.rotation * mp.normal;
            mp.min_distance *= s.scale;
            mp.max_distance *= s.scale;
        }
        for (_, rel) in self.culled.values_mut() {
            rel.translation *= s.scale;
        }
    }

    /// Align the map with gravity and fix its scale after inertial init.
    pub fn apply_inertial_alignment(&mut self, r_gw: &Matrix3<f64>, scale: f64) {
        let rotation = SE3::from_rt(r_gw, Vector3::zeros()).rotation;
        self.transform(&Sim3::new(rotation, Vector3::zeros(), scale));
        self.r_wg = r_gw.transpose() * self.r_wg;
    }

    /// Copy of the given KeyFrames and every MapPoint they observe.
    ///
    /// Observations and links to KeyFrames outside the set are kept as ids;
    /// lookups of those simply miss. Used to verify loop and merge
    /// candidates without holding the Atlas lock.
    pub fn snapshot(&self, kf_ids: &[KeyFrameId]) -> Map {
        let mut copy = Map::new(self.id, self.ids.clone());
        for id in kf_ids {
            let Some(kf) = self.keyframes.get(id) else {
                continue;
            };
            for (_, mp_id) in kf.get_map_point_indices() {
                if let Some(mp) = self.map_points.get(&mp_id) {
                    copy.map_points.entry(mp_id).or_insert_with(|| mp.clone());
                }
            }
            copy.keyframes.insert(*id, kf.clone());
        }
        copy.origin_kf = self.origin_kf.filter(|id| copy.keyframes.contains_key(id));
        copy.inertial_stage = self.inertial_stage;
        copy
    }

    /// Move every KeyFrame and MapPoint of `other` into this map.
    pub fn absorb(&mut self, other: Map) {
        let Map {
            keyframes,
            map_points,
            trajectory,
            culled,
            replaced,
            ..
        } = other;
        for (id, mut kf) in keyframes {
            kf.map_id = self.id;
            self.keyframes.insert(id, kf);
        }
        self.map_points.extend(map_points);
        self.trajectory.extend(trajectory);
        self.trajectory.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        self.culled.extend(culled);
        self.replaced.extend(replaced);
        if let Some(first) = self.trajectory.first() {
            self.first_timestamp = Some(first.0);
        }
        self.bump_big_change();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Best `n` covisibles of a KeyFrame.
    pub fn get_local_keyframes(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        self.keyframes
            .get(&kf_id)
            .map(|kf| kf.get_best_covisibles(n))
            .unwrap_or_default()
    }

    pub fn get_map_points_from_keyframes(&self, kf_ids: &[KeyFrameId]) -> HashSet<MapPointId> {
        kf_ids
            .iter()
            .filter_map(|id| self.keyframes.get(id))
            .flat_map(|kf| kf.get_map_point_indices().map(|(_, mp)| mp))
            .filter(|mp| self.map_points.contains_key(mp))
            .collect()
    }

    /// World pose of a live or culled KeyFrame.
    pub fn resolve_keyframe_pose(&self, mut kf_id: KeyFrameId) -> Option<SE3> {
        let mut chain = SE3::identity();
        for _ in 0..self.trajectory.len() + 1 {
            if let Some(kf) = self.keyframes.get(&kf_id) {
                return Some(kf.pose.compose(&chain));
            }
            let (parent, rel) = self.culled.get(&kf_id)?;
            chain = rel.compose(&chain);
            kf_id = *parent;
        }
        None
    }

    /// Poses of every KeyFrame ever inserted, ordered by timestamp.
    pub fn trajectory(&self) -> Vec<StampedPose> {
        self.trajectory
            .iter()
            .filter_map(|(ts, id)| {
                self.resolve_keyframe_pose(*id).map(|pose| StampedPose {
                    timestamp: *ts,
                    pose,
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("id", &self.id)
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("inertial_stage", &self.inertial_stage)
            .finish()
    }
}
