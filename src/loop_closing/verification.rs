//! Geometric verification of loop and merge candidates.
//!
//! Verification runs on a [`PlaceSnapshot`]: a scratch map holding the
//! current KeyFrame, the candidate and the candidate's covisibles, copied
//! out of the Atlas under its read lock. Matching, RANSAC and refinement
//! then proceed with no lock held.

use tracing::debug;

use crate::atlas::atlas::Atlas;
use crate::atlas::keyframe_db::Candidate;
use crate::atlas::map::{KeyFrameId, Map, MapId, MapPointId};
use crate::config::LoopClosingConfig;
use crate::features::ScalePyramid;
use crate::geometry::{CameraModel, Sim3};
use crate::tracking::matcher::OrbMatcher;

use super::sim3_solver::{RansacParams, Sim3Solver};

/// Search radius for guided matching once `S12` is known.
const SIM3_SEARCH_RADIUS: f64 = 7.5;
/// Search radius when projecting the candidate group into the current KeyFrame.
const PROJECTION_RADIUS: f64 = 10.0;

#[derive(Debug, Clone, Copy)]
pub struct VerificationParams {
    pub bow_match_ratio: f64,
    pub min_bow_matches: usize,
    pub ransac_iterations: usize,
    pub ransac_min_inliers: usize,
    pub min_projection_matches: usize,
    /// 6-DoF instead of 7-DoF alignment.
    pub fix_scale: bool,
}

impl VerificationParams {
    pub fn new(config: &LoopClosingConfig, fix_scale: bool) -> Self {
        Self {
            bow_match_ratio: config.bow_match_ratio,
            min_bow_matches: config.min_bow_matches,
            ransac_iterations: config.ransac_iterations,
            ransac_min_inliers: config.ransac_min_inliers,
            min_projection_matches: config.min_projection_matches,
            fix_scale,
        }
    }
}

/// Scratch copy of the KeyFrames one verification looks at.
#[derive(Debug)]
pub struct PlaceSnapshot {
    pub map: Map,
    pub current: KeyFrameId,
    pub candidate: KeyFrameId,
    pub candidate_map: MapId,
    /// The candidate and its covisibles, candidate first.
    pub candidate_group: Vec<KeyFrameId>,
}

impl PlaceSnapshot {
    /// Copy `current` (active map) and the candidate group (any map).
    ///
    /// For a merge candidate both sides keep the coordinates of their own
    /// map; the resulting similarity relates the two worlds.
    pub fn collect(atlas: &Atlas, current: KeyFrameId, candidate: &Candidate) -> Option<Self> {
        let active = atlas.active_map();
        active.get_keyframe(current)?;
        let source = atlas.map(candidate.map_id)?;
        let candidate_kf = source.get_keyframe(candidate.keyframe_id)?;
        if candidate_kf.is_bad {
            return None;
        }

        let mut candidate_group = vec![candidate.keyframe_id];
        candidate_group.extend(candidate_kf.get_covisibles().into_iter().filter(|id| *id != current));

        let map = if candidate.map_id == active.id() {
            let mut ids = candidate_group.clone();
            ids.push(current);
            active.snapshot(&ids)
        } else {
            let mut map = active.snapshot(&[current]);
            map.absorb(source.snapshot(&candidate_group));
            map
        };
        Some(Self {
            map,
            current,
            candidate: candidate.keyframe_id,
            candidate_map: candidate.map_id,
            candidate_group,
        })
    }
}

/// A candidate that passed geometric verification.
#[derive(Debug, Clone)]
pub struct VerifiedPlace {
    pub current: KeyFrameId,
    pub matched: KeyFrameId,
    pub matched_map: MapId,
    /// `S_12`: candidate camera to current camera.
    pub s12: Sim3,
    /// Pose of the current KeyFrame in the candidate's world, `S_12 · T_2w`.
    pub s_cw: Sim3,
    /// Candidate-side point matched to each feature of the current KeyFrame.
    pub matched_points: Vec<Option<MapPointId>>,
    /// Every point of the candidate group, sorted.
    pub candidate_points: Vec<MapPointId>,
    pub candidate_group: Vec<KeyFrameId>,
}

impl VerifiedPlace {
    pub fn num_matches(&self) -> usize {
        self.matched_points.iter().flatten().count()
    }
}

/// Verify one candidate: BoW matching, Sim3 RANSAC with refinement, guided
/// matching with the refined similarity and projection of the candidate
/// group. `None` when any stage falls below its threshold.
pub fn verify(
    snapshot: &PlaceSnapshot,
    params: &VerificationParams,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
    seed: u64,
) -> Option<VerifiedPlace> {
    let map = &snapshot.map;
    let current = map.get_keyframe(snapshot.current)?;
    let candidate = map.get_keyframe(snapshot.candidate)?;
    let matcher = OrbMatcher::new(params.bow_match_ratio, true);

    let bow_matches = matcher.search_by_bow_keyframes(current, candidate, map);
    let n_bow = bow_matches.iter().flatten().count();
    if n_bow < params.min_bow_matches {
        debug!(
            "[LoopClosing] {} vs {}: {} BoW matches, rejected",
            snapshot.current, snapshot.candidate, n_bow
        );
        return None;
    }

    let ransac = RansacParams {
        max_iterations: params.ransac_iterations,
        min_inliers: params.ransac_min_inliers,
        fix_scale: params.fix_scale,
    };
    let solver = Sim3Solver::from_matches(current, candidate, &bow_matches, map, camera, pyramid, ransac);
    let Some(estimate) = solver.solve(seed) else {
        debug!(
            "[LoopClosing] {} vs {}: no Sim3 from {} correspondences",
            snapshot.current,
            snapshot.candidate,
            solver.len()
        );
        return None;
    };

    let mut matches12: Vec<Option<MapPointId>> = vec![None; bow_matches.len()];
    for (c, inlier) in solver.correspondences().iter().zip(&estimate.inliers) {
        if *inlier {
            matches12[c.idx1] = Some(c.mp2);
        }
    }
    matcher.search_by_sim3(
        current,
        candidate,
        map,
        &mut matches12,
        &estimate.s12,
        SIM3_SEARCH_RADIUS,
        camera,
        pyramid,
    );

    // Re-score the enlarged match set against the refined similarity.
    let guided = Sim3Solver::from_matches(current, candidate, &matches12, map, camera, pyramid, ransac);
    let inliers = guided.check_inliers(&estimate.s12);
    let n_inliers = inliers.iter().filter(|i| **i).count();
    if n_inliers < params.ransac_min_inliers {
        debug!(
            "[LoopClosing] {} vs {}: {} inliers after guided matching, rejected",
            snapshot.current, snapshot.candidate, n_inliers
        );
        return None;
    }

    let mut matched_points: Vec<Option<MapPointId>> = vec![None; current.num_features()];
    for (c, inlier) in guided.correspondences().iter().zip(&inliers) {
        if *inlier {
            matched_points[c.idx1] = Some(c.mp2);
        }
    }

    let s_cw = estimate.s12.compose(&Sim3::from_se3(&candidate.pose_cw()));
    let mut candidate_points: Vec<MapPointId> = map
        .get_map_points_from_keyframes(&snapshot.candidate_group)
        .into_iter()
        .collect();
    candidate_points.sort();
    matcher.search_by_projection_sim3(
        current,
        &s_cw,
        &candidate_points,
        &mut matched_points,
        PROJECTION_RADIUS,
        map,
        camera,
        pyramid,
    );

    let total = matched_points.iter().flatten().count();
    if total < params.min_projection_matches {
        debug!(
            "[LoopClosing] {} vs {}: {} projection matches, rejected",
            snapshot.current, snapshot.candidate, total
        );
        return None;
    }

    debug!(
        "[LoopClosing] {} vs {} verified: {} BoW, {} inliers, {} total, scale {:.3}",
        snapshot.current, snapshot.candidate, n_bow, n_inliers, total, estimate.s12.scale
    );
    Some(VerifiedPlace {
        current: snapshot.current,
        matched: snapshot.candidate,
        matched_map: snapshot.candidate_map,
        s12: estimate.s12,
        s_cw,
        matched_points,
        candidate_points,
        candidate_group: snapshot.candidate_group.clone(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::atlas::map::KeyFrameId;
    use crate::geometry::SE3;
    use crate::system::test_support::SyntheticScene;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    /// Rigid drift applied to the revisiting KeyFrames.
    pub(crate) fn drift() -> SE3 {
        SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.03, 0.01), Vector3::new(0.25, -0.05, 0.1))
    }

    /// Move KeyFrames and the points they created by `t`, as accumulated
    /// odometry error would.
    pub(crate) fn apply_drift(map: &mut Map, kfs: &[KeyFrameId], t: &SE3) {
        let points: Vec<MapPointId> = map
            .map_points()
            .filter(|mp| kfs.contains(&mp.reference_kf))
            .map(|mp| mp.id)
            .collect();
        for id in kfs {
            let kf = map.get_keyframe_mut(*id).unwrap();
            kf.pose = t.compose(&kf.pose);
        }
        for id in points {
            let mp = map.get_map_point_mut(id).unwrap();
            mp.position = t.transform_point(&mp.position);
        }
    }

    /// A start segment, then a drifted revisit of the same place with its
    /// own, duplicated points. Returns (start KeyFrames, revisit KeyFrames).
    pub(crate) fn revisit_atlas(scene: &SyntheticScene) -> (Atlas, Vec<KeyFrameId>, Vec<KeyFrameId>) {
        let mut atlas = Atlas::new();
        let start = scene.populate(atlas.active_map_mut(), &[0.0, 0.05, 0.1, 0.15]);
        let revisit = scene.populate(atlas.active_map_mut(), &[0.0, 0.05, 0.1]);
        apply_drift(atlas.active_map_mut(), &revisit, &drift());
        (atlas, start, revisit)
    }

    #[test]
    fn test_revisit_is_verified() {
        let scene = SyntheticScene::new(71, 250);
        let (atlas, start, revisit) = revisit_atlas(&scene);
        let candidate = Candidate {
            keyframe_id: start[0],
            map_id: atlas.active_map_id(),
            score: 1.0,
        };
        let snapshot = PlaceSnapshot::collect(&atlas, revisit[0], &candidate).unwrap();
        assert!(snapshot.candidate_group.contains(&start[1]));
        assert!(!snapshot.candidate_group.contains(&revisit[0]));

        let params = VerificationParams::new(&LoopClosingConfig::default(), true);
        let place = verify(&snapshot, &params, &scene.camera, &scene.pyramid, 7).unwrap();
        assert_eq!(place.matched, start[0]);
        assert!(place.num_matches() >= params.min_projection_matches);

        // Both KeyFrames sit at the same true pose, so the corrected pose of
        // the revisit is the start pose.
        let expected = atlas.active_map().get_keyframe(start[0]).unwrap().pose_cw();
        let corrected = place.s_cw.to_se3_unscaled();
        assert_relative_eq!(corrected.translation, expected.translation, epsilon = 1e-3);
        assert_relative_eq!(place.s12.scale, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_unrelated_place_is_rejected() {
        let scene = SyntheticScene::new(72, 250);
        let other = SyntheticScene::new(73, 250);
        let mut atlas = Atlas::new();
        let start = scene.populate(atlas.active_map_mut(), &[0.0, 0.05]);
        let elsewhere = other.populate(atlas.active_map_mut(), &[0.0, 0.05]);
        let candidate = Candidate {
            keyframe_id: start[0],
            map_id: atlas.active_map_id(),
            score: 1.0,
        };
        let snapshot = PlaceSnapshot::collect(&atlas, elsewhere[0], &candidate).unwrap();
        let params = VerificationParams::new(&LoopClosingConfig::default(), true);
        assert!(verify(&snapshot, &params, &scene.camera, &scene.pyramid, 7).is_none());
    }
}
