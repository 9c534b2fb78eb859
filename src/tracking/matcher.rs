//! Descriptor matching between frames, KeyFrames and map points.
//!
//! Every search follows the same pattern: restrict candidates geometrically
//! (projection window, vocabulary node or epipolar line), pick the closest
//! descriptor, then reject ambiguous matches with a ratio test and, where
//! keypoint orientations are meaningful, a rotation-consistency histogram.

use std::collections::HashSet;

use nalgebra::{Matrix3, Vector3};

use crate::atlas::map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
use crate::features::{hamming_distance, Descriptor, KeyPoint, ScalePyramid};
use crate::geometry::{so3, CameraModel, Sim3, SE3};
use crate::optimizer::{CHI2_MONO, CHI2_STEREO};
use crate::tracking::frame::{Frame, FrameFeatures, ProjectionInfo};
use crate::vocabulary::FeatureVector;

/// ORB-SLAM3 matching thresholds
pub const TH_HIGH: u32 = 100; // Max descriptor distance for acceptance
pub const TH_LOW: u32 = 50; // Stricter threshold
pub const NN_RATIO: f64 = 0.75; // Ratio test threshold (best/second_best)

const HISTO_LENGTH: usize = 30;
/// χ² (1 dof, 95%) for the distance to an epipolar line.
const CHI2_EPIPOLAR: f64 = 3.84;

// ─────────────────────────────────────────────────────────────────────────────
// Rotation consistency
// ─────────────────────────────────────────────────────────────────────────────

/// Histogram of keypoint orientation differences.
///
/// Correct matches share one dominant rotation; matches outside the three
/// strongest bins are discarded.
struct RotationHistogram {
    bins: Vec<Vec<usize>>,
}

impl RotationHistogram {
    fn new() -> Self {
        Self {
            bins: vec![Vec::new(); HISTO_LENGTH],
        }
    }

    fn add(&mut self, kp1: &KeyPoint, kp2: &KeyPoint, item: usize) {
        let mut rot = (kp1.angle - kp2.angle).to_degrees();
        if rot < 0.0 {
            rot += 360.0;
        }
        let bin = ((rot / 360.0 * HISTO_LENGTH as f64).round() as usize) % HISTO_LENGTH;
        self.bins[bin].push(item);
    }

    /// Items outside the three dominant bins.
    fn outliers(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..HISTO_LENGTH).collect();
        order.sort_by(|a, b| self.bins[*b].len().cmp(&self.bins[*a].len()));
        let max = self.bins[order[0]].len();
        let keep: Vec<usize> = order
            .into_iter()
            .take(3)
            .filter(|b| !self.bins[*b].is_empty() && self.bins[*b].len() as f64 >= 0.1 * max as f64)
            .collect();
        self.bins
            .iter()
            .enumerate()
            .filter(|(b, _)| !keep.contains(b))
            .flat_map(|(_, items)| items.iter().copied())
            .collect()
    }
}

/// Best and second-best descriptor distance over a candidate set.
#[derive(Debug, Clone, Copy)]
struct BestTwo {
    best: u32,
    best_idx: Option<usize>,
    best_level: u32,
    second: u32,
    second_level: u32,
}

impl BestTwo {
    fn new() -> Self {
        Self {
            best: u32::MAX,
            best_idx: None,
            best_level: 0,
            second: u32::MAX,
            second_level: 0,
        }
    }

    fn offer(&mut self, dist: u32, idx: usize, level: u32) {
        if dist < self.best {
            self.second = self.best;
            self.second_level = self.best_level;
            self.best = dist;
            self.best_idx = Some(idx);
            self.best_level = level;
        } else if dist < self.second {
            self.second = dist;
            self.second_level = level;
        }
    }

    fn passes_ratio(&self, ratio: f64) -> bool {
        (self.best as f64) < ratio * self.second as f64
    }
}

/// Live, good map point.
fn good_point(map: &Map, id: MapPointId) -> Option<&MapPoint> {
    map.get_map_point(id).filter(|mp| !mp.is_bad)
}

/// Rigid camera pose equivalent to a similarity `S_cw`.
fn rigid_from_sim3(s_cw: &Sim3) -> SE3 {
    s_cw.to_se3_unscaled()
}

/// A map point projected into a frame, ready for [`OrbMatcher::search_by_projection`].
#[derive(Debug, Clone, Copy)]
pub struct ProjectionCandidate {
    pub mp_id: MapPointId,
    pub descriptor: Descriptor,
    pub info: ProjectionInfo,
}

impl ProjectionCandidate {
    /// Every good point of `ids` that falls inside the frame's view.
    pub fn collect(
        frame: &Frame,
        map: &Map,
        ids: impl IntoIterator<Item = MapPointId>,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
        view_cos_limit: f64,
    ) -> Vec<Self> {
        ids.into_iter()
            .filter_map(|id| {
                let mp = good_point(map, id)?;
                let info = frame.is_in_frustum(mp, camera, pyramid, view_cos_limit)?;
                Some(Self {
                    mp_id: id,
                    descriptor: mp.descriptor,
                    info,
                })
            })
            .collect()
    }
}

/// Matcher configured with a ratio-test threshold and orientation check.
#[derive(Debug, Clone, Copy)]
pub struct OrbMatcher {
    nn_ratio: f64,
    check_orientation: bool,
}

impl OrbMatcher {
    pub fn new(nn_ratio: f64, check_orientation: bool) -> Self {
        Self {
            nn_ratio,
            check_orientation,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Projection searches (tracking)
    // ─────────────────────────────────────────────────────────────────────────

    /// Match local map points projected into the frame.
    ///
    /// The window grows when the point is seen obliquely and with the
    /// predicted scale. Already matched features are skipped.
    pub fn search_by_projection(
        &self,
        frame: &mut Frame,
        candidates: &[ProjectionCandidate],
        th: f64,
        pyramid: &ScalePyramid,
    ) -> usize {
        let mut matches = 0;
        for cand in candidates {
            let info = &cand.info;
            let view_factor = if info.view_cos > 0.998 { 2.5 } else { 4.0 };
            let radius = th * view_factor * pyramid.scale(info.level);
            let indices = frame.features.features_in_area(
                info.u,
                info.v,
                radius,
                Some(info.level.saturating_sub(1)),
                Some(info.level),
            );
            let mut best = BestTwo::new();
            for idx in indices {
                if frame.map_points[idx].is_some() {
                    continue;
                }
                if let (Some(ur), Some(pr)) = (frame.features.u_right[idx], info.u_right) {
                    if (pr - ur).abs() > radius {
                        continue;
                    }
                }
                let d = hamming_distance(&cand.descriptor, &frame.features.descriptors[idx]);
                best.offer(d, idx, frame.features.keypoints_un[idx].octave);
            }
            let Some(idx) = best.best_idx else {
                continue;
            };
            if best.best > TH_HIGH {
                continue;
            }
            if best.best_level == best.second_level && !best.passes_ratio(self.nn_ratio) {
                continue;
            }
            frame.map_points[idx] = Some(cand.mp_id);
            frame.outliers[idx] = false;
            matches += 1;
        }
        matches
    }

    /// Project the previous frame's tracked points into the current frame,
    /// whose pose holds the motion prediction.
    pub fn search_by_projection_last_frame(
        &self,
        current: &mut Frame,
        last: &Frame,
        map: &Map,
        th: f64,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
        monocular: bool,
    ) -> usize {
        let (Some(pose_cw), Some(last_pose_cw)) = (current.pose_cw(), last.pose_cw()) else {
            return 0;
        };
        // Current camera center in the last camera frame tells the direction
        // of motion along the optical axis.
        let t_lc = last_pose_cw.transform_point(&pose_cw.inverse().translation);
        let forward = !monocular && t_lc.z > camera.baseline;
        let backward = !monocular && -t_lc.z > camera.baseline;

        let mut histogram = RotationHistogram::new();
        let mut matched = Vec::new();
        for (i, mp_slot) in last.map_points.iter().enumerate() {
            let Some(mp_id) = mp_slot.and_then(|id| map.resolve_map_point(id)) else {
                continue;
            };
            if last.outliers[i] {
                continue;
            }
            let Some(mp) = good_point(map, mp_id) else {
                continue;
            };
            let pc = pose_cw.transform_point(&mp.position);
            let Some(uv) = camera.project_checked(&pc) else {
                continue;
            };
            let last_octave = last.features.keypoints_un[i].octave;
            let radius = th * pyramid.scale(last_octave);
            let (min_level, max_level) = if forward {
                (Some(last_octave), None)
            } else if backward {
                (None, Some(last_octave))
            } else {
                (Some(last_octave.saturating_sub(1)), Some(last_octave + 1))
            };
            let indices = current.features.features_in_area(uv.x, uv.y, radius, min_level, max_level);
            let u_right = (camera.bf > 0.0).then(|| camera.project_right_u(&pc));
            let mut best = BestTwo::new();
            for idx in indices {
                if current.map_points[idx].is_some() {
                    continue;
                }
                if let (Some(ur), Some(pr)) = (current.features.u_right[idx], u_right) {
                    if (pr - ur).abs() > radius {
                        continue;
                    }
                }
                let d = hamming_distance(&mp.descriptor, &current.features.descriptors[idx]);
                best.offer(d, idx, 0);
            }
            if let Some(idx) = best.best_idx.filter(|_| best.best <= TH_HIGH) {
                current.map_points[idx] = Some(mp_id);
                current.outliers[idx] = false;
                histogram.add(&last.features.keypoints_un[i], &current.features.keypoints_un[idx], idx);
                matched.push(idx);
            }
        }

        let mut n = matched.len();
        if self.check_orientation {
            for idx in histogram.outliers() {
                current.map_points[idx] = None;
                n -= 1;
            }
        }
        n
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Vocabulary searches
    // ─────────────────────────────────────────────────────────────────────────

    /// Match a KeyFrame's map points to frame features sharing vocabulary
    /// nodes. Used by reference-KeyFrame tracking and relocalization.
    pub fn search_by_bow_frame(&self, kf: &KeyFrame, frame: &mut Frame, map: &Map) -> usize {
        let (Some(kf_fv), Some(frame_fv)) = (kf.feature_vector.as_ref(), frame.feature_vector.clone()) else {
            return 0;
        };
        let mut histogram = RotationHistogram::new();
        let mut assigned = Vec::new();
        for (node, kf_indices) in kf_fv {
            let Some(frame_indices) = frame_fv.get(node) else {
                continue;
            };
            for &ikf in kf_indices {
                let Some(mp_id) = kf.get_map_point(ikf).and_then(|id| map.resolve_map_point(id)) else {
                    continue;
                };
                if good_point(map, mp_id).is_none() {
                    continue;
                }
                let d_kf = &kf.features.descriptors[ikf];
                let mut best = BestTwo::new();
                for &if_ in frame_indices {
                    if frame.map_points[if_].is_some() {
                        continue;
                    }
                    best.offer(hamming_distance(d_kf, &frame.features.descriptors[if_]), if_, 0);
                }
                let Some(if_) = best.best_idx else {
                    continue;
                };
                if best.best <= TH_LOW && best.passes_ratio(self.nn_ratio) {
                    frame.map_points[if_] = Some(mp_id);
                    frame.outliers[if_] = false;
                    histogram.add(&kf.features.keypoints_un[ikf], &frame.features.keypoints_un[if_], if_);
                    assigned.push(if_);
                }
            }
        }
        let mut n = assigned.len();
        if self.check_orientation {
            for idx in histogram.outliers() {
                frame.map_points[idx] = None;
                n -= 1;
            }
        }
        n
    }

    /// Match map points of two KeyFrames through their feature vectors.
    ///
    /// Returns, for each feature of `kf1`, the matched map point of `kf2`.
    pub fn search_by_bow_keyframes(&self, kf1: &KeyFrame, kf2: &KeyFrame, map: &Map) -> Vec<Option<MapPointId>> {
        let mut matches12 = vec![None; kf1.num_features()];
        let (Some(fv1), Some(fv2)) = (kf1.feature_vector.as_ref(), kf2.feature_vector.as_ref()) else {
            return matches12;
        };
        let mut taken2 = vec![false; kf2.num_features()];
        let mut histogram = RotationHistogram::new();
        for (node, indices1) in fv1 {
            let Some(indices2) = fv2.get(node) else {
                continue;
            };
            for &i1 in indices1 {
                if kf1.get_map_point(i1).and_then(|id| good_point(map, id)).is_none() {
                    continue;
                }
                let d1 = &kf1.features.descriptors[i1];
                let mut best = BestTwo::new();
                for &i2 in indices2 {
                    if taken2[i2] {
                        continue;
                    }
                    if kf2.get_map_point(i2).and_then(|id| good_point(map, id)).is_none() {
                        continue;
                    }
                    best.offer(hamming_distance(d1, &kf2.features.descriptors[i2]), i2, 0);
                }
                let Some(i2) = best.best_idx else {
                    continue;
                };
                if best.best < TH_LOW && best.passes_ratio(self.nn_ratio) {
                    matches12[i1] = kf2.get_map_point(i2);
                    taken2[i2] = true;
                    histogram.add(&kf1.features.keypoints_un[i1], &kf2.features.keypoints_un[i2], i1);
                }
            }
        }
        if self.check_orientation {
            for i1 in histogram.outliers() {
                matches12[i1] = None;
            }
        }
        matches12
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map initialization
    // ─────────────────────────────────────────────────────────────────────────

    /// Windowed matching of finest-level features between the two
    /// initialization frames.
    ///
    /// `prev_matched` holds, per feature of `f1`, where it was last matched;
    /// it is updated with the new positions. Returns `matches12` and the count.
    pub fn search_for_initialization(
        &self,
        f1: &FrameFeatures,
        f2: &FrameFeatures,
        prev_matched: &mut [(f64, f64)],
        window: f64,
    ) -> (Vec<Option<usize>>, usize) {
        let mut matches12: Vec<Option<usize>> = vec![None; f1.len()];
        let mut matches21: Vec<Option<usize>> = vec![None; f2.len()];
        let mut best_dists = vec![u32::MAX; f2.len()];
        let mut histogram = RotationHistogram::new();
        let mut n = 0usize;

        for i1 in 0..f1.len() {
            let kp1 = &f1.keypoints_un[i1];
            if kp1.octave > 0 {
                continue;
            }
            let (px, py) = prev_matched[i1];
            let indices = f2.features_in_area(px, py, window, Some(0), Some(0));
            let mut best = BestTwo::new();
            for i2 in indices {
                let d = hamming_distance(&f1.descriptors[i1], &f2.descriptors[i2]);
                if best_dists[i2] <= d {
                    continue;
                }
                best.offer(d, i2, 0);
            }
            let Some(i2) = best.best_idx else {
                continue;
            };
            if best.best > TH_LOW || !best.passes_ratio(self.nn_ratio) {
                continue;
            }
            if let Some(old) = matches21[i2] {
                matches12[old] = None;
                n -= 1;
            }
            matches12[i1] = Some(i2);
            matches21[i2] = Some(i1);
            best_dists[i2] = best.best;
            histogram.add(kp1, &f2.keypoints_un[i2], i1);
            n += 1;
        }

        if self.check_orientation {
            for i1 in histogram.outliers() {
                if matches12[i1].take().is_some() {
                    n -= 1;
                }
            }
        }
        for (i1, m) in matches12.iter().enumerate() {
            if let Some(i2) = m {
                let kp = &f2.keypoints_un[*i2];
                prev_matched[i1] = (kp.x, kp.y);
            }
        }
        (matches12, n)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Triangulation
    // ─────────────────────────────────────────────────────────────────────────

    /// Match unassociated features of two KeyFrames that satisfy the
    /// epipolar constraint. Returns `(idx1, idx2)` pairs.
    pub fn search_for_triangulation(
        &self,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
        only_stereo: bool,
    ) -> Vec<(usize, usize)> {
        let (Some(fv1), Some(fv2)) = (kf1.feature_vector.as_ref(), kf2.feature_vector.as_ref()) else {
            return Vec::new();
        };
        let f21 = fundamental(kf1, kf2, camera);

        // Epipole: center of kf1 in kf2.
        let c1_in_2 = kf2.pose_cw().transform_point(&kf1.camera_center());
        let epipole = (c1_in_2.z > 0.0).then(|| camera.project(&c1_in_2));

        self.match_feature_vectors(kf1, kf2, fv1, fv2, |i1, i2, best: &mut BestTwo| {
            if kf1.get_map_point(i1).is_some() || kf2.get_map_point(i2).is_some() {
                return;
            }
            let stereo1 = kf1.features.has_depth(i1);
            let stereo2 = kf2.features.has_depth(i2);
            if only_stereo && !(stereo1 || stereo2) {
                return;
            }
            let kp1 = &kf1.features.keypoints_un[i1];
            let kp2 = &kf2.features.keypoints_un[i2];
            let d = hamming_distance(&kf1.features.descriptors[i1], &kf2.features.descriptors[i2]);
            if d > TH_LOW || d > best.best {
                return;
            }
            if !stereo1 && !stereo2 {
                if let Some(e) = epipole {
                    let (dx, dy) = (e.x - kp2.x, e.y - kp2.y);
                    if dx * dx + dy * dy < 100.0 * pyramid.scale(kp2.octave) {
                        return;
                    }
                }
            }
            if check_dist_epipolar_line(kp1, kp2, &f21, pyramid) {
                best.offer(d, i2, kp2.octave);
            }
        })
    }

    /// Shared driver for node-restricted KeyFrame-to-KeyFrame matching.
    fn match_feature_vectors(
        &self,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        fv1: &FeatureVector,
        fv2: &FeatureVector,
        mut consider: impl FnMut(usize, usize, &mut BestTwo),
    ) -> Vec<(usize, usize)> {
        let mut taken2 = vec![false; kf2.num_features()];
        let mut pairs: Vec<Option<usize>> = vec![None; kf1.num_features()];
        let mut histogram = RotationHistogram::new();
        for (node, indices1) in fv1 {
            let Some(indices2) = fv2.get(node) else {
                continue;
            };
            for &i1 in indices1 {
                let mut best = BestTwo::new();
                best.best = TH_LOW;
                for &i2 in indices2 {
                    if !taken2[i2] {
                        consider(i1, i2, &mut best);
                    }
                }
                if let Some(i2) = best.best_idx {
                    taken2[i2] = true;
                    pairs[i1] = Some(i2);
                    histogram.add(&kf1.features.keypoints_un[i1], &kf2.features.keypoints_un[i2], i1);
                }
            }
        }
        if self.check_orientation {
            for i1 in histogram.outliers() {
                pairs[i1] = None;
            }
        }
        pairs
            .into_iter()
            .enumerate()
            .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fusion
    // ─────────────────────────────────────────────────────────────────────────

    /// Project map points into a KeyFrame and fuse duplicates.
    ///
    /// A matched feature without a point gets the observation; a matched
    /// feature with another point keeps whichever of the two is observed more.
    pub fn fuse(
        &self,
        map: &mut Map,
        kf_id: KeyFrameId,
        mp_ids: &[MapPointId],
        th: f64,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
    ) -> usize {
        let Some(pose_cw) = map.get_keyframe(kf_id).map(|kf| kf.pose_cw()) else {
            return 0;
        };
        let mut fused = 0;
        for &mp_id in mp_ids {
            let Some(mp_id) = map.resolve_map_point(mp_id) else {
                continue;
            };
            let Some(idx) = self.fuse_candidate(map, kf_id, mp_id, &pose_cw, th, camera, pyramid, true) else {
                continue;
            };
            let existing = map.get_keyframe(kf_id).and_then(|kf| kf.get_map_point(idx));
            match existing {
                Some(other) if other == mp_id => {}
                Some(other) => {
                    let obs = |id| map.get_map_point(id).map_or(0, |mp| mp.num_observations());
                    if obs(other) > obs(mp_id) {
                        map.replace_map_point(mp_id, other);
                    } else {
                        map.replace_map_point(other, mp_id);
                    }
                    fused += 1;
                }
                None => {
                    if map.associate(kf_id, idx, mp_id) {
                        fused += 1;
                    }
                }
            }
        }
        fused
    }

    /// Fuse loop-side points into a KeyFrame corrected by `s_cw`.
    ///
    /// Duplicates are replaced by the loop point, which carries the
    /// older and more consistent position.
    pub fn fuse_sim3(
        &self,
        map: &mut Map,
        kf_id: KeyFrameId,
        s_cw: &Sim3,
        mp_ids: &[MapPointId],
        th: f64,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
    ) -> usize {
        let pose_cw = rigid_from_sim3(s_cw);
        let mut fused = 0;
        for &mp_id in mp_ids {
            let Some(mp_id) = map.resolve_map_point(mp_id) else {
                continue;
            };
            let Some(idx) = self.fuse_candidate(map, kf_id, mp_id, &pose_cw, th, camera, pyramid, false) else {
                continue;
            };
            match map.get_keyframe(kf_id).and_then(|kf| kf.get_map_point(idx)) {
                Some(other) if other == mp_id => {}
                Some(other) => {
                    map.replace_map_point(other, mp_id);
                    fused += 1;
                }
                None => {
                    if map.associate(kf_id, idx, mp_id) {
                        fused += 1;
                    }
                }
            }
        }
        fused
    }

    /// Best feature of `kf_id` for `mp_id` seen from `pose_cw`.
    #[allow(clippy::too_many_arguments)]
    fn fuse_candidate(
        &self,
        map: &Map,
        kf_id: KeyFrameId,
        mp_id: MapPointId,
        pose_cw: &SE3,
        th: f64,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
        check_reprojection: bool,
    ) -> Option<usize> {
        let kf = map.get_keyframe(kf_id)?;
        let mp = good_point(map, mp_id)?;
        if mp.is_observed_by(kf_id) {
            return None;
        }
        let pc = pose_cw.transform_point(&mp.position);
        let uv = camera.project_checked(&pc)?;
        let center = pose_cw.inverse().translation;
        let po = mp.position - center;
        let dist = po.norm();
        if dist < 0.8 * mp.min_distance || dist > 1.2 * mp.max_distance {
            return None;
        }
        if po.dot(&mp.normal) < 0.5 * dist {
            return None;
        }
        let level = mp.predict_level(dist, pyramid);
        let radius = th * pyramid.scale(level);
        let u_right = (camera.bf > 0.0).then(|| camera.project_right_u(&pc));

        let mut best = BestTwo::new();
        for idx in kf.features.features_in_area(uv.x, uv.y, radius, None, None) {
            let kp = &kf.features.keypoints_un[idx];
            if kp.octave + 1 < level || kp.octave > level {
                continue;
            }
            if check_reprojection {
                let (ex, ey) = (uv.x - kp.x, uv.y - kp.y);
                let inv_sigma2 = pyramid.inv_sigma2(kp.octave);
                let (chi2, threshold) = match (kf.features.u_right[idx], u_right) {
                    (Some(ur), Some(pr)) => {
                        let er = pr - ur;
                        ((ex * ex + ey * ey + er * er) * inv_sigma2, CHI2_STEREO)
                    }
                    _ => ((ex * ex + ey * ey) * inv_sigma2, CHI2_MONO),
                };
                if chi2 > threshold {
                    continue;
                }
            }
            best.offer(hamming_distance(&mp.descriptor, &kf.features.descriptors[idx]), idx, kp.octave);
        }
        best.best_idx.filter(|_| best.best <= TH_LOW)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Similarity searches (loop closing)
    // ─────────────────────────────────────────────────────────────────────────

    /// Project `mp_ids` into `kf` through `s_cw` and fill unmatched slots of
    /// `matched` (indexed by `kf` features).
    #[allow(clippy::too_many_arguments)]
    pub fn search_by_projection_sim3(
        &self,
        kf: &KeyFrame,
        s_cw: &Sim3,
        mp_ids: &[MapPointId],
        matched: &mut [Option<MapPointId>],
        th: f64,
        map: &Map,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
    ) -> usize {
        let pose_cw = rigid_from_sim3(s_cw);
        let center = pose_cw.inverse().translation;
        let already: HashSet<MapPointId> = matched.iter().flatten().copied().collect();
        let mut n = 0;
        for &mp_id in mp_ids {
            if already.contains(&mp_id) {
                continue;
            }
            let Some(mp) = good_point(map, mp_id) else {
                continue;
            };
            let pc = pose_cw.transform_point(&mp.position);
            let Some(uv) = camera.project_checked(&pc) else {
                continue;
            };
            let po = mp.position - center;
            let dist = po.norm();
            if dist < 0.8 * mp.min_distance || dist > 1.2 * mp.max_distance || po.dot(&mp.normal) < 0.5 * dist {
                continue;
            }
            let level = mp.predict_level(dist, pyramid);
            let radius = th * pyramid.scale(level);
            let mut best = BestTwo::new();
            for idx in kf.features.features_in_area(uv.x, uv.y, radius, None, None) {
                if matched[idx].is_some() {
                    continue;
                }
                let kp = &kf.features.keypoints_un[idx];
                if kp.octave + 1 < level || kp.octave > level {
                    continue;
                }
                best.offer(hamming_distance(&mp.descriptor, &kf.features.descriptors[idx]), idx, kp.octave);
            }
            if let Some(idx) = best.best_idx.filter(|_| best.best <= TH_LOW) {
                matched[idx] = Some(mp_id);
                n += 1;
            }
        }
        n
    }

    /// Find more matches between two KeyFrames related by `s12`.
    ///
    /// Points of each KeyFrame are projected into the other; only mutual
    /// matches are added to `matches12` (indexed by `kf1` features).
    #[allow(clippy::too_many_arguments)]
    pub fn search_by_sim3(
        &self,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        map: &Map,
        matches12: &mut [Option<MapPointId>],
        s12: &Sim3,
        th: f64,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
    ) -> usize {
        let t1w = kf1.pose_cw();
        let t2w = kf2.pose_cw();
        let s21 = s12.inverse();

        let already_in_1: HashSet<MapPointId> = matches12.iter().flatten().copied().collect();

        // kf1 points -> kf2 features.
        let mut match1: Vec<Option<usize>> = vec![None; kf1.num_features()];
        for (i1, mp_id) in kf1.get_map_point_indices() {
            if matches12[i1].is_some() {
                continue;
            }
            let Some(mp) = good_point(map, mp_id) else {
                continue;
            };
            let p1 = t1w.transform_point(&mp.position);
            let p2 = s21.transform_point(&p1);
            match1[i1] = self.project_and_match(&p2, &mp.descriptor, mp, kf2, th, camera, pyramid);
        }

        // kf2 points -> kf1 features.
        let mut match2: Vec<Option<usize>> = vec![None; kf2.num_features()];
        for (i2, mp_id) in kf2.get_map_point_indices() {
            if already_in_1.contains(&mp_id) {
                continue;
            }
            let Some(mp) = good_point(map, mp_id) else {
                continue;
            };
            let p2 = t2w.transform_point(&mp.position);
            let p1 = s12.transform_point(&p2);
            match2[i2] = self.project_and_match(&p1, &mp.descriptor, mp, kf1, th, camera, pyramid);
        }

        let mut found = 0;
        for (i1, m) in match1.iter().enumerate() {
            let Some(i2) = m else {
                continue;
            };
            if match2[*i2] == Some(i1) {
                if let Some(mp2) = kf2.get_map_point(*i2) {
                    matches12[i1] = Some(mp2);
                    found += 1;
                }
            }
        }
        found
    }

    #[allow(clippy::too_many_arguments)]
    fn project_and_match(
        &self,
        pc: &Vector3<f64>,
        descriptor: &Descriptor,
        mp: &MapPoint,
        target: &KeyFrame,
        th: f64,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
    ) -> Option<usize> {
        let uv = camera.project_checked(pc)?;
        let dist = pc.norm();
        if dist < 0.8 * mp.min_distance || dist > 1.2 * mp.max_distance {
            return None;
        }
        let level = mp.predict_level(dist, pyramid);
        let radius = th * pyramid.scale(level);
        let mut best = BestTwo::new();
        for idx in target.features.features_in_area(uv.x, uv.y, radius, None, None) {
            let kp = &target.features.keypoints_un[idx];
            if kp.octave + 1 < level || kp.octave > level {
                continue;
            }
            best.offer(hamming_distance(descriptor, &target.features.descriptors[idx]), idx, kp.octave);
        }
        best.best_idx.filter(|_| best.best <= TH_HIGH)
    }
}

impl Default for OrbMatcher {
    fn default() -> Self {
        Self::new(NN_RATIO, true)
    }
}

/// Fundamental matrix `F21`: a pixel of `kf1` maps to its epipolar line in `kf2`.
fn fundamental(kf1: &KeyFrame, kf2: &KeyFrame, camera: &CameraModel) -> Matrix3<f64> {
    let t1w = kf1.pose_cw();
    let t2w = kf2.pose_cw();
    let r21 = t2w.rotation_matrix() * t1w.rotation_matrix().transpose();
    let t21 = t2w.translation - r21 * t1w.translation;
    #[rustfmt::skip]
    let k_inv = Matrix3::new(
        camera.inv_fx, 0.0, -camera.cx * camera.inv_fx,
        0.0, camera.inv_fy, -camera.cy * camera.inv_fy,
        0.0, 0.0, 1.0,
    );
    k_inv.transpose() * so3::skew(&t21) * r21 * k_inv
}

fn check_dist_epipolar_line(kp1: &KeyPoint, kp2: &KeyPoint, f21: &Matrix3<f64>, pyramid: &ScalePyramid) -> bool {
    let l = f21 * Vector3::new(kp1.x, kp1.y, 1.0);
    let num = l.x * kp2.x + l.y * kp2.y + l.z;
    let den = l.x * l.x + l.y * l.y;
    if den < 1e-12 {
        return false;
    }
    num * num / den < CHI2_EPIPOLAR * pyramid.sigma2(kp2.octave)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::test_support::SyntheticScene;

    #[test]
    fn test_search_for_initialization_finds_true_matches() {
        let scene = SyntheticScene::new(3, 300);
        let (f1, ids1) = scene.stereo_features(&SyntheticScene::pose_at(0.0));
        let (f2, ids2) = scene.stereo_features(&SyntheticScene::pose_at(0.1));
        let mut prev: Vec<(f64, f64)> = f1.keypoints_un.iter().map(|kp| (kp.x, kp.y)).collect();
        let (matches, n) = OrbMatcher::new(0.9, true).search_for_initialization(&f1, &f2, &mut prev, 100.0);
        assert!(n > 100);
        for (i1, m) in matches.iter().enumerate() {
            if let Some(i2) = m {
                assert_eq!(ids1[i1], ids2[*i2]);
            }
        }
    }

    #[test]
    fn test_search_by_bow_frame_matches_keyframe_points() {
        let scene = SyntheticScene::new(5, 200);
        let (map, kfs) = scene.build_map(&[0.0, 0.2]);
        let kf = map.get_keyframe(kfs[1]).unwrap();
        let (mut frame, ids) = scene.frame_at(10, 1.0, 0.25);
        let n = OrbMatcher::new(0.75, true).search_by_bow_frame(kf, &mut frame, &map);
        assert!(n > 50);
        for (i, mp) in frame.map_points.iter().enumerate() {
            if let Some(mp) = mp {
                let p = map.get_map_point(*mp).unwrap().position;
                assert!((p - scene.points[ids[i]]).norm() < 1e-9);
            }
        }
    }

    #[test]
    fn test_search_by_projection_last_frame() {
        let scene = SyntheticScene::new(7, 200);
        let (map, kfs) = scene.build_map(&[0.0]);
        let kf = map.get_keyframe(kfs[0]).unwrap();
        let (mut last, _) = scene.frame_at(1, 0.1, 0.0);
        last.map_points = kf.map_point_ids.clone();
        let (mut current, ids) = scene.frame_at(2, 0.2, 0.05);
        current.pose = Some(SyntheticScene::pose_at(0.04));
        let n = OrbMatcher::new(0.9, true).search_by_projection_last_frame(
            &mut current,
            &last,
            &map,
            7.0,
            &scene.camera,
            &scene.pyramid,
            false,
        );
        assert!(n > 100);
        let wrong = current
            .map_points
            .iter()
            .enumerate()
            .filter_map(|(i, mp)| mp.map(|mp| (i, mp)))
            .filter(|(i, mp)| (map.get_map_point(*mp).unwrap().position - scene.points[ids[*i]]).norm() > 1e-9)
            .count();
        assert_eq!(wrong, 0);
    }

    #[test]
    fn test_search_for_triangulation_respects_epipolar_geometry() {
        let scene = SyntheticScene::new(9, 200);
        let (mut map, kfs) = scene.build_map(&[0.0, 0.3]);
        // Drop associations so features become triangulation candidates.
        for kf in &kfs {
            let n = map.get_keyframe(*kf).unwrap().num_features();
            for idx in 0..n {
                map.disassociate(*kf, idx);
            }
        }
        let kf1 = map.get_keyframe(kfs[0]).unwrap();
        let kf2 = map.get_keyframe(kfs[1]).unwrap();
        let pairs = OrbMatcher::new(0.6, false).search_for_triangulation(kf1, kf2, &scene.camera, &scene.pyramid, false);
        assert!(pairs.len() > 100);
        let d1 = &kf1.features.descriptors;
        let d2 = &kf2.features.descriptors;
        assert!(pairs.iter().all(|(a, b)| d1[*a] == d2[*b]));
    }

    #[test]
    fn test_fuse_replaces_duplicate_point() {
        let scene = SyntheticScene::new(11, 150);
        let (mut map, kfs) = scene.build_map(&[0.0, 0.2]);
        let (idx, original) = map
            .get_keyframe(kfs[0])
            .unwrap()
            .get_map_point_indices()
            .find(|(_, mp)| map.get_map_point(*mp).unwrap().is_observed_by(kfs[1]))
            .unwrap();
        let position = map.get_map_point(original).unwrap().position;
        let descriptor = map.get_map_point(original).unwrap().descriptor;

        // A duplicate observed only by the second KeyFrame.
        let kf1_idx = map.get_map_point(original).unwrap().observations[&kfs[1]];
        map.disassociate(kfs[1], kf1_idx);
        let duplicate = map.create_map_point(position, descriptor, kfs[1]);
        map.associate(kfs[1], kf1_idx, duplicate);
        map.update_map_point(duplicate, &scene.pyramid);

        let fused = OrbMatcher::default().fuse(&mut map, kfs[0], &[duplicate], 3.0, &scene.camera, &scene.pyramid);
        assert_eq!(fused, 1);
        let survivor = map.get_keyframe(kfs[0]).unwrap().get_map_point(idx).unwrap();
        assert_eq!(map.get_keyframe(kfs[1]).unwrap().get_map_point(kf1_idx), Some(survivor));
        assert_eq!(map.get_map_point(survivor).unwrap().observations.len(), 2);
    }

    #[test]
    fn test_rotation_histogram_drops_minority() {
        let mut h = RotationHistogram::new();
        let a = KeyPoint::new(0.0, 0.0, 0);
        let mut b = KeyPoint::new(0.0, 0.0, 0);
        for i in 0..20 {
            h.add(&a, &b, i);
        }
        b.angle = 1.0;
        for i in 20..40 {
            h.add(&a, &b, i);
        }
        let mut c = b;
        c.angle = 2.0;
        h.add(&a, &c, 40);
        c.angle = 3.0;
        h.add(&a, &c, 41);
        // The two singletons fall below a tenth of the dominant bins.
        let mut outliers = h.outliers();
        outliers.sort();
        assert_eq!(outliers, vec![40, 41]);
    }
}
