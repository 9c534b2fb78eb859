//! New MapPoints from matches between a KeyFrame and its neighbors.
//!
//! Candidates are computed against a read-only map and inserted afterwards
//! in one pass, so a batch abandoned halfway leaves nothing behind:
//! 1. For each neighbor with enough baseline, match unassociated features
//!    along epipolar lines (grouped by vocabulary node)
//! 2. Triangulate with DLT, or take the stereo point when its parallax is larger
//! 3. Check depth, reprojection error in both views and scale consistency

use std::collections::HashSet;

use nalgebra::Vector3;
use tracing::debug;

use crate::atlas::map::{KeyFrame, KeyFrameId, Map, MapPointId};
use crate::features::{Descriptor, ScalePyramid};
use crate::geometry::triangulation::triangulate_dlt;
use crate::geometry::{CameraModel, SE3};
use crate::optimizer::{CHI2_MONO, CHI2_STEREO};
use crate::tracking::matcher::OrbMatcher;

/// Slack on the octave ratio when checking distance consistency.
const SCALE_RATIO_FACTOR: f64 = 1.5;
/// Monocular pairs need this much baseline relative to the neighbor's median depth.
const MIN_BASELINE_DEPTH_RATIO: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct TriangulationParams {
    pub neighbors: usize,
    /// Rays closer than this (cosine) are not triangulated without depth.
    pub min_parallax_cos: f64,
    pub monocular: bool,
    pub inertial: bool,
}

/// A validated point waiting to be inserted.
#[derive(Debug, Clone)]
pub struct NewPoint {
    pub position: Vector3<f64>,
    pub descriptor: Descriptor,
    pub feature_idx: usize,
    pub neighbor: KeyFrameId,
    pub neighbor_idx: usize,
}

/// Neighbors used for triangulation: best covisibles, topped up with the
/// temporal predecessors in inertial maps.
fn neighbor_keyframes(map: &Map, kf_id: KeyFrameId, n: usize, inertial: bool) -> Vec<KeyFrameId> {
    let mut neighbors = map.get_local_keyframes(kf_id, n);
    if inertial {
        let mut prev = map.get_keyframe(kf_id).and_then(|kf| kf.prev_kf);
        let mut steps = 0;
        while let Some(id) = prev {
            if neighbors.len() >= n || steps >= n {
                break;
            }
            if !neighbors.contains(&id) {
                neighbors.push(id);
            }
            prev = map.get_keyframe(id).and_then(|kf| kf.prev_kf);
            steps += 1;
        }
    }
    neighbors
}

/// Cosine of the parallax a stereo observation provides on its own.
fn stereo_parallax_cos(kf: &KeyFrame, idx: usize, camera: &CameraModel) -> Option<f64> {
    let depth = kf.features.depth.get(idx).copied().flatten()?;
    (depth > 0.0).then(|| (2.0 * (camera.baseline / 2.0).atan2(depth)).cos())
}

/// Compute candidate points between `kf_id` and its neighbors.
///
/// Returns `None` when `should_stop` fired.
pub fn collect_new_points(
    map: &Map,
    kf_id: KeyFrameId,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
    params: &TriangulationParams,
    should_stop: &dyn Fn() -> bool,
) -> Option<Vec<NewPoint>> {
    let Some(kf1) = map.get_keyframe(kf_id) else {
        return Some(Vec::new());
    };
    let matcher = OrbMatcher::new(0.6, false);
    let center1 = kf1.camera_center();
    let t1_cw = kf1.pose_cw();
    let mut used: HashSet<usize> = HashSet::new();
    let mut points = Vec::new();

    for neighbor_id in neighbor_keyframes(map, kf_id, params.neighbors, params.inertial) {
        if should_stop() {
            return None;
        }
        let Some(kf2) = map.get_keyframe(neighbor_id) else {
            continue;
        };
        let center2 = kf2.camera_center();
        let baseline = (center2 - center1).norm();
        if params.monocular {
            let positions = kf2
                .get_map_point_indices()
                .filter_map(|(_, id)| map.get_map_point(id).map(|mp| mp.position));
            let Some(median_depth) = kf2.compute_scene_median_depth(positions) else {
                continue;
            };
            if baseline / median_depth < MIN_BASELINE_DEPTH_RATIO {
                continue;
            }
        } else if baseline < camera.baseline {
            continue;
        }

        let t2_cw = kf2.pose_cw();
        let matches = matcher.search_for_triangulation(kf1, kf2, camera, pyramid, false);
        for (idx1, idx2) in matches {
            if used.contains(&idx1) {
                continue;
            }
            let kp1 = &kf1.features.keypoints_un[idx1];
            let kp2 = &kf2.features.keypoints_un[idx2];
            let xn1 = camera.unproject(kp1.x, kp1.y);
            let xn2 = camera.unproject(kp2.x, kp2.y);

            let ray1 = kf1.pose.rotation * xn1;
            let ray2 = kf2.pose.rotation * xn2;
            let cos_rays = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());

            let stereo_cos1 = stereo_parallax_cos(kf1, idx1, camera);
            let stereo_cos2 = stereo_parallax_cos(kf2, idx2, camera);
            let cos_stereo = stereo_cos1.unwrap_or(2.0).min(stereo_cos2.unwrap_or(2.0));

            let has_stereo = stereo_cos1.is_some() || stereo_cos2.is_some();
            let position = if cos_rays < cos_stereo
                && cos_rays > 0.0
                && (has_stereo || cos_rays < params.min_parallax_cos)
            {
                triangulate_dlt(&xn1, &xn2, &t1_cw, &t2_cw)
            } else if stereo_cos1.is_some() && stereo_cos1.unwrap_or(2.0) <= stereo_cos2.unwrap_or(2.0) {
                kf1.features.unproject_stereo(idx1, camera, &kf1.pose)
            } else if stereo_cos2.is_some() {
                kf2.features.unproject_stereo(idx2, camera, &kf2.pose)
            } else {
                None
            };
            let Some(position) = position else {
                continue;
            };

            if !is_consistent(&position, kf1, idx1, &t1_cw, camera, pyramid)
                || !is_consistent(&position, kf2, idx2, &t2_cw, camera, pyramid)
            {
                continue;
            }

            let dist1 = (position - center1).norm();
            let dist2 = (position - center2).norm();
            if dist1 < 1e-9 || dist2 < 1e-9 {
                continue;
            }
            let ratio_dist = dist2 / dist1;
            let ratio_octave = pyramid.scale(kp1.octave) / pyramid.scale(kp2.octave);
            let slack = SCALE_RATIO_FACTOR * pyramid.scale_factor;
            if ratio_dist * slack < ratio_octave || ratio_dist > ratio_octave * slack {
                continue;
            }

            used.insert(idx1);
            points.push(NewPoint {
                position,
                descriptor: kf1.features.descriptors[idx1],
                feature_idx: idx1,
                neighbor: neighbor_id,
                neighbor_idx: idx2,
            });
        }
    }
    Some(points)
}

/// Positive depth and reprojection χ² within bounds.
fn is_consistent(
    position: &Vector3<f64>,
    kf: &KeyFrame,
    idx: usize,
    t_cw: &SE3,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
) -> bool {
    let pc = t_cw.transform_point(position);
    if pc.z <= 0.0 {
        return false;
    }
    let kp = &kf.features.keypoints_un[idx];
    let uv = camera.project(&pc);
    let mut err2 = (uv.x - kp.x).powi(2) + (uv.y - kp.y).powi(2);
    let threshold = match kf.features.u_right.get(idx).copied().flatten() {
        Some(ur) => {
            err2 += (camera.project_right_u(&pc) - ur).powi(2);
            CHI2_STEREO
        }
        None => CHI2_MONO,
    };
    err2 * pyramid.inv_sigma2(kp.octave) <= threshold
}

/// Insert collected points. Features that got associated in the meantime
/// and neighbors that disappeared are skipped. Returns the inserted ids.
pub fn insert_new_points(
    map: &mut Map,
    kf_id: KeyFrameId,
    points: &[NewPoint],
    pyramid: &ScalePyramid,
) -> Vec<MapPointId> {
    let mut created = Vec::new();
    for p in points {
        let free1 = map
            .get_keyframe(kf_id)
            .is_some_and(|kf| kf.get_map_point(p.feature_idx).is_none());
        let free2 = map
            .get_keyframe(p.neighbor)
            .is_some_and(|kf| kf.get_map_point(p.neighbor_idx).is_none());
        if !free1 || !free2 {
            continue;
        }
        let mp_id = map.create_map_point(p.position, p.descriptor, kf_id);
        map.associate(kf_id, p.feature_idx, mp_id);
        map.associate(p.neighbor, p.neighbor_idx, mp_id);
        map.update_map_point(mp_id, pyramid);
        created.push(mp_id);
    }
    if !created.is_empty() {
        debug!("[LocalMapping] KeyFrame {}: {} new points", kf_id, created.len());
    }
    created
}
