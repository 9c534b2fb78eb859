//! Relocalization against the active map.
//!
//! Candidate KeyFrames come from the place recognition index. Each candidate
//! is matched through the vocabulary, a pose is hypothesized with PnP RANSAC
//! and refined by motion-only optimization; if too few inliers remain, more
//! matches are searched by projecting the candidate's points.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::atlas::keyframe_db::KeyFrameDatabase;
use crate::atlas::map::{KeyFrameId, Map, MapId, MapPointId};
use crate::features::ScalePyramid;
use crate::geometry::pnp::{solve_pnp_ransac, Correspondence, PnPRansacParams};
use crate::geometry::CameraModel;
use crate::optimizer::pose_only::optimize_frame_pose;
use crate::optimizer::CHI2_MONO;
use crate::tracking::frame::Frame;
use crate::tracking::matcher::{OrbMatcher, ProjectionCandidate};
use crate::vocabulary::OrbVocabulary;

/// Inliers after the first optimization for a candidate to stay alive.
const MIN_OPTIMIZED_INLIERS: usize = 10;
/// Below this many inliers the narrow projection search is tried as well.
const MIN_INLIERS_NARROW_SEARCH: usize = 30;
const WIDE_SEARCH_RADIUS: f64 = 10.0;
const NARROW_SEARCH_RADIUS: f64 = 3.0;

pub struct Relocalizer {
    matcher: OrbMatcher,
    projection_matcher: OrbMatcher,
    min_bow_matches: usize,
    min_inliers: usize,
    rng: StdRng,
}

impl Relocalizer {
    pub fn new(min_bow_matches: usize, min_inliers: usize) -> Self {
        Self {
            matcher: OrbMatcher::new(0.75, true),
            projection_matcher: OrbMatcher::new(0.9, true),
            min_bow_matches,
            min_inliers,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// Try to place `frame` in the map. On success the frame carries the pose
    /// and inlier matches, and the id of the KeyFrame that matched is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn relocalize(
        &mut self,
        frame: &mut Frame,
        map: &Map,
        map_id: MapId,
        keyframe_db: &KeyFrameDatabase,
        vocabulary: &OrbVocabulary,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
    ) -> Option<KeyFrameId> {
        frame.compute_bow(vocabulary);
        let bow = frame.bow_vector.clone()?;
        let candidates = keyframe_db.detect_relocalization_candidates(&bow, map_id, |id| map.get_keyframe(id));
        if candidates.is_empty() {
            return None;
        }
        debug!("[Relocalization] Frame {}: {} candidates", frame.id, candidates.len());

        for candidate in candidates {
            let Some(kf) = map.get_keyframe(candidate.keyframe_id) else {
                continue;
            };
            let mut trial = frame.clone();
            trial.clear_matches();
            let n = self.matcher.search_by_bow_frame(kf, &mut trial, map);
            if n < self.min_bow_matches {
                continue;
            }
            if let Some(inliers) = self.verify(&mut trial, candidate.keyframe_id, map, camera, pyramid) {
                info!(
                    "[Relocalization] Frame {} relocalized against KeyFrame {} with {} inliers",
                    frame.id, candidate.keyframe_id, inliers
                );
                *frame = trial;
                return Some(candidate.keyframe_id);
            }
        }
        None
    }

    /// PnP hypothesis, pose optimization and guided search for one candidate.
    fn verify(
        &mut self,
        frame: &mut Frame,
        kf_id: KeyFrameId,
        map: &Map,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
    ) -> Option<usize> {
        let mut indices = Vec::new();
        let mut corrs = Vec::new();
        for (idx, mp) in frame.map_points.iter().enumerate() {
            let Some(point) = mp.and_then(|id| map.get_map_point(id)) else {
                continue;
            };
            let kp = &frame.features.keypoints_un[idx];
            let sigma2 = pyramid.sigma2(kp.octave);
            indices.push(idx);
            corrs.push(Correspondence {
                point_world: point.position,
                bearing: camera.unproject(kp.x, kp.y),
                max_error_sq: CHI2_MONO * sigma2 * camera.inv_fx * camera.inv_fx,
            });
        }
        let params = PnPRansacParams::default();
        let pnp = solve_pnp_ransac(&corrs, &params, &mut self.rng)?;

        for (k, idx) in indices.iter().enumerate() {
            if !pnp.inlier_mask[k] {
                frame.map_points[*idx] = None;
            }
        }
        frame.pose = Some(pnp.pose_cw.inverse());
        let mut good = self.optimize(frame, map, camera, pyramid)?;
        if good < MIN_OPTIMIZED_INLIERS {
            return None;
        }

        if good < self.min_inliers {
            let kf = map.get_keyframe(kf_id)?;
            let found: HashSet<MapPointId> = frame.map_points.iter().flatten().copied().collect();
            let ids = kf.get_map_point_indices().map(|(_, id)| id).filter(|id| !found.contains(id));
            let candidates = ProjectionCandidate::collect(frame, map, ids, camera, pyramid, 0.5);
            let added = self
                .projection_matcher
                .search_by_projection(frame, &candidates, WIDE_SEARCH_RADIUS, pyramid);
            if added + good >= self.min_inliers {
                good = self.optimize(frame, map, camera, pyramid)?;
                if good > MIN_INLIERS_NARROW_SEARCH && good < self.min_inliers {
                    let found: HashSet<MapPointId> = frame.map_points.iter().flatten().copied().collect();
                    let ids = kf.get_map_point_indices().map(|(_, id)| id).filter(|id| !found.contains(id));
                    let candidates = ProjectionCandidate::collect(frame, map, ids, camera, pyramid, 0.5);
                    let added = self
                        .projection_matcher
                        .search_by_projection(frame, &candidates, NARROW_SEARCH_RADIUS, pyramid);
                    if good + added >= self.min_inliers {
                        good = self.optimize(frame, map, camera, pyramid)?;
                    }
                }
            }
        }
        (good >= self.min_inliers).then_some(good)
    }

    /// Pose optimization that also drops the outlier matches.
    fn optimize(&self, frame: &mut Frame, map: &Map, camera: &CameraModel, pyramid: &ScalePyramid) -> Option<usize> {
        let good = optimize_frame_pose(frame, map, camera, pyramid, None).ok()?;
        for idx in 0..frame.map_points.len() {
            if frame.outliers[idx] {
                frame.map_points[idx] = None;
                frame.outliers[idx] = false;
            }
        }
        Some(good)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::MapId;

    #[test]
    fn test_relocalizes_near_a_keyframe() {
        use crate::system::test_support::SyntheticScene;

        let scene = SyntheticScene::new(11, 400);
        let (map, kfs) = scene.build_map(&[0.0, 0.3, 0.6]);
        let mut db = KeyFrameDatabase::new();
        for kf in map.keyframes() {
            db.add(kf.id, map.id(), kf.bow_vector.as_ref().unwrap());
        }

        let (mut frame, _) = scene.frame_at(50, 5.0, 0.35);
        let truth = frame.pose.take().unwrap();
        frame.bow_vector = None;
        frame.feature_vector = None;

        let mut reloc = Relocalizer::new(15, 50);
        let kf = reloc
            .relocalize(
                &mut frame,
                &map,
                map.id(),
                &db,
                &scene.vocabulary,
                &scene.camera,
                &scene.pyramid,
            )
            .unwrap();
        assert!(kfs.contains(&kf));
        let pose = frame.pose.unwrap();
        assert!((pose.translation - truth.translation).norm() < 1e-3);
        assert!(frame.num_tracked() >= 50);
    }

    #[test]
    fn test_unknown_place_fails() {
        use crate::system::test_support::SyntheticScene;

        let scene = SyntheticScene::new(12, 300);
        let (map, _) = scene.build_map(&[0.0, 0.3]);
        let mut db = KeyFrameDatabase::new();
        for kf in map.keyframes() {
            db.add(kf.id, map.id(), kf.bow_vector.as_ref().unwrap());
        }
        let elsewhere = SyntheticScene::new(13, 300);
        let (mut frame, _) = elsewhere.frame_at(9, 1.0, 0.0);
        frame.pose = None;

        let mut reloc = Relocalizer::new(15, 50);
        let found = reloc.relocalize(
            &mut frame,
            &map,
            MapId::new(0),
            &db,
            &scene.vocabulary,
            &scene.camera,
            &scene.pyramid,
        );
        assert!(found.is_none());
        assert!(frame.pose.is_none());
    }
}
