//! Map bootstrap.
//!
//! Monocular maps start from two frames with enough parallax: matches are
//! searched in a window around the reference keypoints, the relative motion
//! is recovered from the essential matrix and the structure is scaled to a
//! median depth of one. Stereo and RGB-D maps start from a single frame
//! whose features already carry depth.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::atlas::atlas::Atlas;
use crate::atlas::map::KeyFrameId;
use crate::config::TrackingConfig;
use crate::error::{Result, SlamError};
use crate::features::ScalePyramid;
use crate::geometry::two_view::{self, TwoViewParams};
use crate::geometry::{CameraModel, SE3};
use crate::optimizer::bundle_adjustment::{self, BaProblem};
use crate::tracking::frame::Frame;
use crate::tracking::matcher::OrbMatcher;
use crate::vocabulary::OrbVocabulary;

/// Search radius (pixels) around the reference keypoint.
const INIT_SEARCH_WINDOW: f64 = 100.0;
const INIT_NN_RATIO: f64 = 0.9;
/// Iterations of the BA run on the two initial KeyFrames.
const INIT_BA_ITERATIONS: usize = 20;
/// Inertial monocular initialization gives up on a reference older than this.
const MAX_INERTIAL_REFERENCE_AGE_S: f64 = 1.0;

/// Result of a successful two-view reconstruction.
#[derive(Debug, Clone)]
pub struct TwoViewInit {
    pub reference: Frame,
    /// Current camera from reference camera.
    pub t21: SE3,
    /// (reference feature, current feature, point in the reference camera frame).
    pub matches: Vec<(usize, usize, Vector3<f64>)>,
}

/// Two-frame monocular initializer.
pub struct MonocularInitializer {
    reference: Option<Frame>,
    /// Where each reference feature was last matched.
    prev_matched: Vec<(f64, f64)>,
    min_features: usize,
    min_matches: usize,
    params: TwoViewParams,
    camera: CameraModel,
    matcher: OrbMatcher,
    rng: StdRng,
}

impl MonocularInitializer {
    pub fn new(config: &TrackingConfig, camera: &CameraModel) -> Self {
        Self {
            reference: None,
            prev_matched: Vec::new(),
            min_features: config.min_init_features,
            min_matches: config.min_init_matches,
            params: TwoViewParams {
                iterations: config.init_ransac_iterations,
                sigma: 1.0,
                focal: camera.fx,
                min_parallax_deg: config.min_init_parallax_deg,
                min_triangulated: config.min_init_triangulated,
            },
            camera: camera.clone(),
            matcher: OrbMatcher::new(INIT_NN_RATIO, true),
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub fn reference_timestamp(&self) -> Option<f64> {
        self.reference.as_ref().map(|f| f.timestamp)
    }

    pub fn reset(&mut self) {
        self.reference = None;
        self.prev_matched.clear();
    }

    fn set_reference(&mut self, frame: &Frame) -> bool {
        self.reset();
        if frame.num_features() < self.min_features {
            return false;
        }
        self.prev_matched = frame.features.keypoints_un.iter().map(|kp| (kp.x, kp.y)).collect();
        self.reference = Some(frame.clone());
        true
    }

    /// Feed one frame.
    ///
    /// Returns `Ok(None)` when the frame became the new reference and
    /// `Err(InitializationFailure)` when this attempt failed. After a failure
    /// caused by weak matching the current frame replaces the reference.
    pub fn process(&mut self, frame: &Frame, inertial: bool) -> Result<Option<TwoViewInit>> {
        let Some(reference) = self.reference.as_ref() else {
            if self.set_reference(frame) {
                debug!("[Initializer] Reference frame {} ({} features)", frame.id, frame.num_features());
            }
            return Ok(None);
        };

        if frame.num_features() < self.min_features {
            self.reset();
            return Err(SlamError::InitializationFailure(format!(
                "frame {} has {} features",
                frame.id,
                frame.num_features()
            )));
        }
        if inertial && frame.timestamp - reference.timestamp > MAX_INERTIAL_REFERENCE_AGE_S {
            self.set_reference(frame);
            return Err(SlamError::InitializationFailure("reference frame too old".into()));
        }

        let (matches12, n_matches) = self.matcher.search_for_initialization(
            &reference.features,
            &frame.features,
            &mut self.prev_matched,
            INIT_SEARCH_WINDOW,
        );
        if n_matches < self.min_matches {
            self.set_reference(frame);
            return Err(SlamError::InitializationFailure(format!("only {n_matches} initialization matches")));
        }

        let pairs: Vec<(usize, usize)> = matches12
            .iter()
            .enumerate()
            .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
            .collect();
        let (x1, x2): (Vec<Vector3<f64>>, Vec<Vector3<f64>>) = pairs
            .iter()
            .map(|&(i1, i2)| {
                let k1 = &reference.features.keypoints_un[i1];
                let k2 = &frame.features.keypoints_un[i2];
                (self.camera.unproject(k1.x, k1.y), self.camera.unproject(k2.x, k2.y))
            })
            .unzip();

        let Some(result) = two_view::reconstruct(&x1, &x2, &self.params, &mut self.rng) else {
            return Err(SlamError::InitializationFailure(format!(
                "no valid two-view reconstruction from {n_matches} matches"
            )));
        };

        let matches = pairs
            .iter()
            .zip(&result.points)
            .filter_map(|(&(i1, i2), p)| p.map(|p| (i1, i2, p)))
            .collect::<Vec<_>>();
        info!(
            "[Initializer] Two-view reconstruction: {} points, parallax {:.2} deg",
            matches.len(),
            result.parallax_deg
        );
        let reference = self.reference.take().unwrap_or_else(|| frame.clone());
        self.prev_matched.clear();
        Ok(Some(TwoViewInit {
            reference,
            t21: result.t21,
            matches,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Initial maps
// ─────────────────────────────────────────────────────────────────────────────

/// Create the first two KeyFrames and their points from a two-view
/// reconstruction. `current` receives its pose and point associations.
///
/// On failure the active map is left empty.
pub fn build_monocular_map(
    atlas: &mut Atlas,
    init: TwoViewInit,
    current: &mut Frame,
    vocabulary: &OrbVocabulary,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
    min_tracked: usize,
) -> Result<(KeyFrameId, KeyFrameId)> {
    let mut reference = init.reference;
    reference.pose = Some(SE3::identity());
    reference.compute_bow(vocabulary);
    current.pose = Some(init.t21.inverse());
    current.compute_bow(vocabulary);
    current.clear_matches();

    let kf1 = atlas.add_keyframe(&reference);
    let kf2 = atlas.add_keyframe(current);
    let map = atlas.active_map_mut();
    for (i1, i2, p) in &init.matches {
        let Some(descriptor) = current.features.descriptors.get(*i2).copied() else {
            continue;
        };
        let mp = map.create_map_point(*p, descriptor, kf2);
        map.associate(kf1, *i1, mp);
        map.associate(kf2, *i2, mp);
        map.update_map_point(mp, pyramid);
        current.map_points[*i2] = Some(mp);
    }
    map.update_connections(kf1);
    map.update_connections(kf2);

    if let Some(problem) = BaProblem::collect_global(map, pyramid) {
        match bundle_adjustment::solve(&problem, camera, INIT_BA_ITERATIONS, &|| false) {
            Ok(Some(solution)) => {
                bundle_adjustment::apply(map, &solution, pyramid);
            }
            Ok(None) => {}
            Err(e) => warn!("[Initializer] Initial BA discarded: {}", e),
        }
    }

    let median_depth = map.get_keyframe(kf1).and_then(|kf| {
        let positions: Vec<Vector3<f64>> = kf
            .get_map_point_indices()
            .filter_map(|(_, id)| map.get_map_point(id).map(|mp| mp.position))
            .collect();
        kf.compute_scene_median_depth(positions.into_iter())
    });
    let tracked = map.get_keyframe(kf2).map_or(0, |kf| kf.num_map_points());
    let median_depth = match median_depth {
        Some(d) if d > 0.0 && tracked >= min_tracked => d,
        _ => {
            atlas.reset_active_map();
            current.clear_matches();
            return Err(SlamError::InitializationFailure(format!(
                "degenerate initial map ({tracked} tracked points)"
            )));
        }
    };

    // Scale so the reference sees its points at unit median depth.
    let inv_median = 1.0 / median_depth;
    let mut pose2 = map.get_keyframe(kf2).map(|kf| kf.pose).unwrap_or_default();
    pose2.translation *= inv_median;
    if let Some(kf) = map.get_keyframe_mut(kf2) {
        kf.pose = pose2;
    }
    let point_ids: Vec<_> = map.map_points().map(|mp| mp.id).collect();
    for id in &point_ids {
        if let Some(mp) = map.get_map_point_mut(*id) {
            mp.position *= inv_median;
        }
        map.update_map_point(*id, pyramid);
    }
    current.pose = Some(pose2);
    // BA may have dropped outlier observations.
    if let Some(kf) = map.get_keyframe(kf2) {
        current.map_points.clone_from(&kf.map_point_ids);
    }

    info!(
        "[Initializer] Monocular map {}: 2 KeyFrames, {} points",
        map.id(),
        map.num_map_points()
    );
    Ok((kf1, kf2))
}

/// Create the first KeyFrame from a frame with depth. Every feature with a
/// positive depth becomes a map point.
pub fn build_stereo_map(
    atlas: &mut Atlas,
    frame: &mut Frame,
    vocabulary: &OrbVocabulary,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
) -> KeyFrameId {
    let pose = *frame.pose.get_or_insert_with(SE3::identity);
    frame.compute_bow(vocabulary);
    frame.clear_matches();

    let kf = atlas.add_keyframe(frame);
    let map = atlas.active_map_mut();
    for idx in 0..frame.num_features() {
        let Some(p) = frame.features.unproject_stereo(idx, camera, &pose) else {
            continue;
        };
        let mp = map.create_map_point(p, frame.features.descriptors[idx], kf);
        map.associate(kf, idx, mp);
        map.update_map_point(mp, pyramid);
        frame.map_points[idx] = Some(mp);
    }
    info!(
        "[Initializer] Stereo map {}: first KeyFrame with {} points",
        map.id(),
        map.num_map_points()
    );
    kf
}
