//! Map merging.
//!
//! When the active map revisits a place stored in an inactive map, the
//! inactive map is moved into the active map's frame, absorbed, and the two
//! neighborhoods around the seam are fused and welded by a local BA. The
//! merged map keeps the active map's identity.

use nalgebra::UnitQuaternion;
use tracing::{debug, info, warn};

use crate::atlas::atlas::Atlas;
use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::error::{Result, SlamError};
use crate::features::ScalePyramid;
use crate::geometry::{CameraModel, Sim3, SE3};
use crate::optimizer::bundle_adjustment::{self, BaProblem};
use crate::tracking::matcher::OrbMatcher;

use super::verification::VerifiedPlace;

/// Covisibles of the current KeyFrame taking part in the weld.
const WELD_NEIGHBORS: usize = 15;
const FUSE_RADIUS: f64 = 4.0;

#[derive(Debug, Clone, Copy)]
pub struct MergeParams {
    /// Restrict the alignment to a rotation about the gravity axis.
    pub inertial: bool,
    pub weld_iterations: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub absorbed_keyframes: usize,
    pub absorbed_points: usize,
    pub fused_points: usize,
    pub welded_keyframes: usize,
}

/// Similarity taking the matched map's world into the active map's world:
/// `T_wc(current) · S_cw`, where `S_cw` is the verified pose of the current
/// KeyFrame in the matched map.
pub fn alignment(current_pose_wc: &SE3, place: &VerifiedPlace, inertial: bool) -> Sim3 {
    let s = Sim3::from_se3(current_pose_wc).compose(&place.s_cw);
    if inertial {
        // Both worlds are gravity aligned along z: only yaw is unobservable.
        let (_, _, yaw) = s.rotation.euler_angles();
        Sim3::new(UnitQuaternion::from_euler_angles(0.0, 0.0, yaw), s.translation, 1.0)
    } else {
        s
    }
}

/// Merge the matched map of `place` into the active map.
///
/// The caller holds the optimization gate and the Atlas write lock with
/// Local Mapping paused.
pub fn merge_maps(
    atlas: &mut Atlas,
    place: &VerifiedPlace,
    params: &MergeParams,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
    should_stop: &dyn Fn() -> bool,
) -> Result<MergeReport> {
    let active_id = atlas.active_map_id();
    let other_id = place.matched_map;
    if other_id == active_id {
        return Err(SlamError::InvalidInput(format!("{} is the active map", other_id)));
    }
    let Some(current_pose) = atlas.active_map().get_keyframe(place.current).map(|kf| kf.pose) else {
        return Err(SlamError::InvalidInput(format!("{} left the active map", place.current)));
    };
    if !atlas.map(other_id).is_some_and(|m| m.contains_keyframe(place.matched)) {
        return Err(SlamError::InvalidInput(format!("{} left {}", place.matched, other_id)));
    }
    let Some(mut other) = atlas.remove_map(other_id) else {
        return Err(SlamError::InvalidInput(format!("{} vanished", other_id)));
    };

    let s_active_other = alignment(&current_pose, place, params.inertial);
    other.transform(&s_active_other);
    other.reroot_spanning_tree(place.matched);

    let mut report = MergeReport {
        absorbed_keyframes: other.num_keyframes(),
        absorbed_points: other.num_map_points(),
        ..MergeReport::default()
    };

    let map = atlas.active_map_mut();
    map.absorb(other);
    map.set_parent(place.matched, place.current);
    map.add_merge_edge(place.current, place.matched);

    report.fused_points = fuse_seam(map, place, camera, pyramid);

    let mut window: Vec<KeyFrameId> = vec![place.current];
    window.extend(map.get_local_keyframes(place.current, WELD_NEIGHBORS));
    window.extend(place.candidate_group.iter().copied().filter(|id| map.contains_keyframe(*id)));
    window.sort();
    window.dedup();
    for id in &window {
        map.update_connections(*id);
    }
    if let Some(problem) = BaProblem::collect_window(map, &window, pyramid) {
        match bundle_adjustment::solve(&problem, camera, params.weld_iterations, should_stop) {
            Ok(Some(solution)) => report.welded_keyframes = bundle_adjustment::apply(map, &solution, pyramid),
            Ok(None) => debug!("[LoopClosing] Weld BA interrupted"),
            Err(e) => warn!("[LoopClosing] Weld BA discarded: {}", e),
        }
    }
    map.bump_big_change();

    atlas.keyframe_db.retag_map(other_id, active_id);
    info!(
        "[LoopClosing] Merged {} into {} at {} - {}: {} KFs, {} points, {} fused",
        other_id,
        active_id,
        place.current,
        place.matched,
        report.absorbed_keyframes,
        report.absorbed_points,
        report.fused_points
    );
    Ok(report)
}

/// Replace the current KeyFrame's points by their verified matches, then
/// fuse each side's points into the other side's KeyFrames.
fn fuse_seam(map: &mut Map, place: &VerifiedPlace, camera: &CameraModel, pyramid: &ScalePyramid) -> usize {
    let mut fused = 0;
    for (idx, matched) in place.matched_points.iter().enumerate() {
        let Some(matched) = matched.and_then(|id| map.resolve_map_point(id)) else {
            continue;
        };
        match map.get_keyframe(place.current).and_then(|kf| kf.get_map_point(idx)) {
            Some(own) if own == matched => {}
            Some(own) => {
                map.replace_map_point(own, matched);
                map.update_map_point(matched, pyramid);
                fused += 1;
            }
            None => {
                if map.associate(place.current, idx, matched) {
                    map.update_map_point(matched, pyramid);
                    fused += 1;
                }
            }
        }
    }

    let mut current_group = vec![place.current];
    current_group.extend(map.get_local_keyframes(place.current, WELD_NEIGHBORS));
    let mut current_points: Vec<MapPointId> = map.get_map_points_from_keyframes(&current_group).into_iter().collect();
    current_points.sort();

    let matcher = OrbMatcher::new(0.8, true);
    for id in &current_group {
        fused += matcher.fuse(map, *id, &place.candidate_points, FUSE_RADIUS, camera, pyramid);
    }
    for id in &place.candidate_group {
        fused += matcher.fuse(map, *id, &current_points, FUSE_RADIUS, camera, pyramid);
    }
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::keyframe_db::Candidate;
    use crate::config::LoopClosingConfig;
    use crate::loop_closing::verification::tests::{apply_drift, drift};
    use crate::loop_closing::verification::{verify, PlaceSnapshot, VerificationParams};
    use crate::system::test_support::SyntheticScene;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    /// An inactive map of the start segment and an active map revisiting it
    /// in a different world frame.
    fn two_maps(scene: &SyntheticScene) -> (Atlas, Vec<KeyFrameId>, Vec<KeyFrameId>) {
        let mut atlas = Atlas::new();
        let old = scene.populate(atlas.active_map_mut(), &[0.0, 0.05, 0.1, 0.15]);
        let old_map = atlas.active_map_id();
        atlas.create_new_map();
        let new = scene.populate(atlas.active_map_mut(), &[0.0, 0.05, 0.1]);
        apply_drift(atlas.active_map_mut(), &new, &drift());
        let new_map = atlas.active_map_id();
        for (kfs, map_id) in [(&old, old_map), (&new, new_map)] {
            for kf in kfs.iter() {
                let bow = atlas.find_keyframe(*kf).unwrap().bow_vector.clone().unwrap();
                atlas.keyframe_db.add(*kf, map_id, &bow);
            }
        }
        (atlas, old, new)
    }

    fn verified(atlas: &Atlas, scene: &SyntheticScene, current: KeyFrameId, candidate: KeyFrameId) -> VerifiedPlace {
        let map_id = atlas.all_maps().iter().find(|m| m.contains_keyframe(candidate)).unwrap().id();
        let candidate = Candidate {
            keyframe_id: candidate,
            map_id,
            score: 1.0,
        };
        let snapshot = PlaceSnapshot::collect(atlas, current, &candidate).unwrap();
        let params = VerificationParams::new(&LoopClosingConfig::default(), true);
        verify(&snapshot, &params, &scene.camera, &scene.pyramid, 5).unwrap()
    }

    #[test]
    fn test_inactive_map_lands_in_active_frame() {
        let scene = SyntheticScene::new(91, 250);
        let (mut atlas, old, new) = two_maps(&scene);
        let place = verified(&atlas, &scene, new[0], old[0]);
        let params = MergeParams {
            inertial: false,
            weld_iterations: 5,
        };
        let report = merge_maps(&mut atlas, &place, &params, &scene.camera, &scene.pyramid, &|| false).unwrap();

        assert_eq!(atlas.num_maps(), 1);
        assert_eq!(report.absorbed_keyframes, old.len());
        assert!(report.fused_points > 0);
        let map = atlas.active_map();
        assert!(old.iter().all(|id| map.contains_keyframe(*id)));
        assert!(map.keyframes().all(|kf| kf.map_id == map.id()));

        // The old start now sits where the drifted revisit saw it.
        let expected = drift().compose(&SyntheticScene::pose_at(0.15));
        let moved = map.get_keyframe(old[3]).unwrap().pose;
        assert_relative_eq!(moved.translation, expected.translation, epsilon = 2e-2);

        let seam = map.get_keyframe(old[0]).unwrap();
        assert_eq!(seam.parent_id, Some(new[0]));
        assert!(seam.merge_edges.contains(&new[0]));
    }

    #[test]
    fn test_merge_into_active_map_is_refused() {
        let scene = SyntheticScene::new(92, 250);
        let (mut atlas, old, new) = two_maps(&scene);
        let mut place = verified(&atlas, &scene, new[0], old[0]);
        place.matched_map = atlas.active_map_id();
        let params = MergeParams {
            inertial: false,
            weld_iterations: 5,
        };
        assert!(merge_maps(&mut atlas, &place, &params, &scene.camera, &scene.pyramid, &|| false).is_err());
        assert_eq!(atlas.num_maps(), 2);
    }

    #[test]
    fn test_inertial_alignment_keeps_gravity() {
        let scene = SyntheticScene::new(93, 250);
        let (atlas, old, new) = two_maps(&scene);
        let place = verified(&atlas, &scene, new[0], old[0]);
        let pose = atlas.find_keyframe(new[0]).unwrap().pose;
        let s = alignment(&pose, &place, true);
        let z = Vector3::z();
        assert_relative_eq!(s.rotation * z, z, epsilon = 1e-9);
        assert_relative_eq!(s.scale, 1.0);
    }
}
