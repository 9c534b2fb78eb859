//! Loop correction.
//!
//! Runs with Local Mapping paused, the optimization gate held exclusively
//! and the Atlas write-locked:
//! 1. propagate the verified similarity to the current KeyFrame's
//!    covisibility group and move the points they observe
//! 2. fuse the loop-side points into the corrected group
//! 3. record the new covisibility links and the loop edge
//! 4. optimize the essential graph and move every point with its
//!    reference KeyFrame

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::error::{Result, SlamError};
use crate::features::ScalePyramid;
use crate::geometry::{CameraModel, Sim3};
use crate::optimizer::pose_graph::{self, PoseGraphProblem};
use crate::tracking::matcher::OrbMatcher;

use super::verification::VerifiedPlace;

/// Search radius for fusing loop points into the corrected group.
const FUSE_RADIUS: f64 = 4.0;

#[derive(Debug, Clone, Copy)]
pub struct CorrectionParams {
    pub essential_graph_min_weight: usize,
    pub pose_graph_iterations: usize,
    pub fix_scale: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CorrectionReport {
    pub group_size: usize,
    pub replaced_points: usize,
    pub fused_points: usize,
    pub new_links: usize,
    /// KeyFrames moved by the essential graph; 0 when it was skipped.
    pub optimized_keyframes: usize,
}

/// Corrected and uncorrected `S_iw` of a KeyFrame group.
#[derive(Debug, Clone, Default)]
pub struct GroupCorrection {
    pub corrected: HashMap<KeyFrameId, Sim3>,
    pub non_corrected: HashMap<KeyFrameId, Sim3>,
}

impl GroupCorrection {
    /// Carry `S_cw` of `anchor` to every KeyFrame of `group` through its
    /// current relative pose to the anchor.
    pub fn propagate(map: &Map, anchor: KeyFrameId, s_cw: &Sim3, group: &[KeyFrameId]) -> Option<Self> {
        let t_wc = map.get_keyframe(anchor)?.pose;
        let mut out = Self::default();
        for id in group {
            let Some(kf) = map.get_keyframe(*id) else {
                continue;
            };
            let t_iw = kf.pose_cw();
            let s_ic = Sim3::from_se3(&t_iw.compose(&t_wc));
            out.corrected.insert(*id, s_ic.compose(s_cw));
            out.non_corrected.insert(*id, Sim3::from_se3(&t_iw));
        }
        Some(out)
    }

    /// Move the points observed by the group, each once, then the
    /// KeyFrames themselves.
    pub fn apply(&self, map: &mut Map, pyramid: &ScalePyramid) {
        let mut ids: Vec<KeyFrameId> = self.corrected.keys().copied().collect();
        ids.sort();
        let mut moved: HashSet<MapPointId> = HashSet::new();
        for id in &ids {
            let (Some(s_iw), Some(s_iw_old)) = (self.corrected.get(id), self.non_corrected.get(id)) else {
                continue;
            };
            let s_wi = s_iw.inverse();
            let points: Vec<MapPointId> = map
                .get_keyframe(*id)
                .map(|kf| kf.get_map_point_indices().map(|(_, mp)| mp).collect())
                .unwrap_or_default();
            for mp_id in points {
                if !moved.insert(mp_id) {
                    continue;
                }
                if let Some(mp) = map.get_map_point_mut(mp_id) {
                    if mp.is_bad {
                        continue;
                    }
                    mp.position = s_wi.transform_point(&s_iw_old.transform_point(&mp.position));
                }
                map.update_map_point(mp_id, pyramid);
            }
        }
        for id in &ids {
            let (Some(s_iw), Some(s_iw_old)) = (self.corrected.get(id), self.non_corrected.get(id)) else {
                continue;
            };
            if let Some(kf) = map.get_keyframe_mut(*id) {
                let pose = s_iw.to_se3_unscaled().inverse();
                // Velocity follows the change of orientation.
                let delta = pose.rotation * s_iw_old.rotation;
                kf.velocity = delta * kf.velocity;
                kf.pose = pose;
            }
        }
    }
}

/// Close a loop in `map` (the active map, write-locked by the caller).
pub fn correct_loop(
    map: &mut Map,
    place: &VerifiedPlace,
    params: &CorrectionParams,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
    should_stop: &dyn Fn() -> bool,
) -> Result<CorrectionReport> {
    if !map.contains_keyframe(place.current) || !map.contains_keyframe(place.matched) {
        return Err(SlamError::InvalidInput(format!(
            "loop {} - {} no longer in {}",
            place.current,
            place.matched,
            map.id()
        )));
    }
    let mut report = CorrectionReport::default();

    map.update_connections(place.current);
    let mut group = vec![place.current];
    group.extend(map.get_keyframe(place.current).map(|kf| kf.get_covisibles()).unwrap_or_default());
    group.sort();
    report.group_size = group.len();

    let previous_neighbors: HashMap<KeyFrameId, HashSet<KeyFrameId>> = group
        .iter()
        .filter_map(|id| Some((*id, map.get_keyframe(*id)?.get_covisibles().into_iter().collect())))
        .collect();

    let Some(correction) = GroupCorrection::propagate(map, place.current, &place.s_cw, &group) else {
        return Err(SlamError::InvalidInput(format!("loop anchor {} vanished", place.current)));
    };
    correction.apply(map, pyramid);

    // Verified matches replace the current KeyFrame's own points.
    for (idx, loop_mp) in place.matched_points.iter().enumerate() {
        let Some(loop_mp) = loop_mp.and_then(|id| map.resolve_map_point(id)) else {
            continue;
        };
        let existing = map.get_keyframe(place.current).and_then(|kf| kf.get_map_point(idx));
        match existing {
            Some(own) if own == loop_mp => {}
            Some(own) => {
                map.replace_map_point(own, loop_mp);
                map.update_map_point(loop_mp, pyramid);
                report.replaced_points += 1;
            }
            None => {
                if map.associate(place.current, idx, loop_mp) {
                    map.update_map_point(loop_mp, pyramid);
                    report.replaced_points += 1;
                }
            }
        }
    }

    let matcher = OrbMatcher::new(0.8, true);
    for id in &group {
        if let Some(s_iw) = correction.corrected.get(id) {
            report.fused_points +=
                matcher.fuse_sim3(map, *id, s_iw, &place.candidate_points, FUSE_RADIUS, camera, pyramid);
        }
    }

    let group_set: HashSet<KeyFrameId> = group.iter().copied().collect();
    let mut loop_connections: HashMap<KeyFrameId, HashSet<KeyFrameId>> = HashMap::new();
    for id in &group {
        if !map.contains_keyframe(*id) {
            continue;
        }
        map.update_connections(*id);
        let Some(kf) = map.get_keyframe(*id) else {
            continue;
        };
        let before = previous_neighbors.get(id);
        let links: HashSet<KeyFrameId> = kf
            .get_covisibles()
            .into_iter()
            .filter(|n| !group_set.contains(n) && before.map_or(true, |b| !b.contains(n)))
            .collect();
        report.new_links += links.len();
        if !links.is_empty() {
            loop_connections.insert(*id, links);
        }
    }

    if let Some(problem) = PoseGraphProblem::collect(
        map,
        &correction.corrected,
        &correction.non_corrected,
        &loop_connections,
        Some((place.current, place.matched)),
        params.essential_graph_min_weight,
        params.fix_scale,
    ) {
        match pose_graph::solve(&problem, params.pose_graph_iterations, should_stop) {
            Ok(Some(solution)) => {
                report.optimized_keyframes = pose_graph::apply(map, &problem, &solution, pyramid);
            }
            Ok(None) => debug!("[LoopClosing] Essential graph interrupted"),
            Err(e) => warn!("[LoopClosing] Essential graph discarded: {}", e),
        }
    }

    map.add_loop_edge(place.current, place.matched);
    map.bump_big_change();
    info!(
        "[LoopClosing] Loop {} - {} closed: {} KFs corrected, {} points replaced, {} fused, {} new links",
        place.current,
        place.matched,
        report.group_size,
        report.replaced_points,
        report.fused_points,
        report.new_links
    );
    Ok(report)
}
