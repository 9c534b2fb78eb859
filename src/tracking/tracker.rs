//! Main tracker: orchestrates frame processing and pose estimation.
//!
//! This implementation follows the ORB-SLAM3 design:
//! - Uses shared `Atlas` via RwLock for thread-safe access
//! - Predicts the pose from IMU preintegration, the motion model or the
//!   reference KeyFrame
//! - Tracks the local covisible map by projection and refines the pose with
//!   motion-only optimization
//! - Sends new keyframes to Local Mapping via a bounded channel, never blocking
//! - Handles loss with relocalization and starts new maps in the Atlas

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::config::{SensorMode, SlamConfig, TrackingConfig};
use crate::error::{Result, SlamError};
use crate::features::{FeatureExtractor, ScalePyramid};
use crate::geometry::{CameraModel, SE3};
use crate::imu::{ImuBias, ImuSample, Preintegrated};
use crate::optimizer::pose_only::optimize_frame_pose;
use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::SharedState;
use crate::tracking::frame::Frame;
use crate::tracking::frame_builder::{FrameBuilder, SensorInput};
use crate::tracking::initializer::{build_monocular_map, build_stereo_map, MonocularInitializer};
use crate::tracking::keyframe_decision::{KeyFrameContext, KeyFrameDecision};
use crate::tracking::matcher::{OrbMatcher, ProjectionCandidate};
use crate::tracking::motion_model::MotionModel;
use crate::tracking::relocalization::Relocalizer;
use crate::tracking::TrackingState;
use crate::vocabulary::OrbVocabulary;

/// Inliers needed after each intermediate pose optimization.
const MIN_POSE_INLIERS: usize = 10;
/// Projection radius for last-frame tracking (monocular / with depth).
const LAST_FRAME_RADIUS_MONO: f64 = 15.0;
const LAST_FRAME_RADIUS_DEPTH: f64 = 7.0;
/// Best covisibles added per local KeyFrame.
const LOCAL_NEIGHBORS: usize = 10;
/// Close points created with each new depth KeyFrame.
const MAX_CLOSE_POINTS: usize = 100;
/// Cosine limit of the viewing angle for local map projection.
const VIEW_COS_LIMIT: f64 = 0.5;

/// Points matched by one frame, for the visible/found counters.
#[derive(Debug, Default)]
struct PointStatistics {
    visible: Vec<MapPointId>,
    found: Vec<MapPointId>,
}

/// Main tracking structure.
pub struct Tracker {
    sensor: SensorMode,
    config: TrackingConfig,
    camera: CameraModel,
    pyramid: ScalePyramid,
    frame_builder: FrameBuilder,
    vocabulary: Arc<OrbVocabulary>,

    /// Shared state (Atlas, flags) - thread-safe access.
    shared: Arc<SharedState>,

    /// Channel to send keyframes to Local Mapping.
    kf_sender: Sender<NewKeyFrameMsg>,

    initializer: MonocularInitializer,
    relocalizer: Relocalizer,
    last_frame_matcher: OrbMatcher,
    bow_matcher: OrbMatcher,
    local_map_matcher: OrbMatcher,
    motion_model: MotionModel,

    /// Keyframe creation decision logic.
    kf_decision: KeyFrameDecision,

    /// Tracking state machine.
    pub state: TrackingState,

    last_frame: Option<Frame>,
    /// Reference keyframe used for tracking.
    reference_kf: Option<KeyFrameId>,
    /// Most recently inserted keyframe.
    last_keyframe: Option<KeyFrameId>,
    /// Last frame pose relative to its reference keyframe, to follow map corrections.
    last_relative: Option<(KeyFrameId, SE3)>,
    local_keyframes: Vec<KeyFrameId>,
    local_points: Vec<MapPointId>,

    /// Timestamp at which tracking was lost.
    lost_since: Option<f64>,
    /// Frames spent in `Lost` without relocalizing.
    lost_frames: u32,

    /// IMU preintegrated since the last keyframe.
    /// Reset when a new keyframe is created.
    imu_since_keyframe: Option<Preintegrated>,
}

impl Tracker {
    pub fn new(
        config: &SlamConfig,
        extractor: Box<dyn FeatureExtractor>,
        vocabulary: Arc<OrbVocabulary>,
        shared: Arc<SharedState>,
        kf_sender: Sender<NewKeyFrameMsg>,
    ) -> Self {
        let frame_builder = FrameBuilder::new(config, extractor);
        let camera = frame_builder.camera().clone();
        let pyramid = frame_builder.pyramid().clone();
        Self {
            sensor: config.sensor,
            config: config.tracking.clone(),
            initializer: MonocularInitializer::new(&config.tracking, &camera),
            relocalizer: Relocalizer::new(
                config.tracking.relocalization_min_bow_matches,
                config.tracking.relocalization_min_inliers,
            ),
            last_frame_matcher: OrbMatcher::new(0.9, true),
            bow_matcher: OrbMatcher::new(0.7, true),
            local_map_matcher: OrbMatcher::new(0.8, false),
            motion_model: MotionModel::new(),
            kf_decision: KeyFrameDecision::new(config.sensor, &config.tracking, config.max_frames_between_keyframes()),
            state: TrackingState::NoImagesYet,
            camera,
            pyramid,
            frame_builder,
            vocabulary,
            shared,
            kf_sender,
            last_frame: None,
            reference_kf: None,
            last_keyframe: None,
            last_relative: None,
            local_keyframes: Vec::new(),
            local_points: Vec::new(),
            lost_since: None,
            lost_frames: 0,
            imu_since_keyframe: None,
        }
    }

    /// Process one sensor sample and return the pose published after it.
    ///
    /// Only input errors are returned; initialization failures and tracking
    /// loss show up in the tracking state.
    pub fn process_frame(&mut self, input: SensorInput<'_>, timestamp: f64, imu: Option<&[ImuSample]>) -> Result<SE3> {
        let bias = self.current_bias();
        let mut frame = self.frame_builder.build(input, timestamp, imu, bias)?;

        if self.state == TrackingState::NoImagesYet {
            self.state = TrackingState::NotInitialized;
        }
        if let Some(pre) = frame.preintegrated_frame.as_ref() {
            let mut accumulated = pre.clone();
            if let Some(old) = self.imu_since_keyframe.take() {
                accumulated.merge_previous(&old);
            }
            self.imu_since_keyframe = Some(accumulated);
        }
        let map_just_changed = self.follow_map_change();

        match self.state {
            TrackingState::NotInitialized => self.initialize(&mut frame),
            TrackingState::Ok => self.track_ok(&mut frame, map_just_changed),
            TrackingState::RecentlyLost => self.track_recently_lost(&mut frame),
            TrackingState::Lost => self.track_lost(&mut frame),
            TrackingState::SystemNotReady | TrackingState::NoImagesYet => {}
        }

        self.shared.set_tracking_state(self.state);
        if matches!(self.state, TrackingState::Ok | TrackingState::RecentlyLost) {
            if let Some(pose) = frame.pose {
                self.shared.publish_pose(pose);
            }
        }
        debug!(
            "[Tracking] Frame {} t={:.3}: {:?}, {} tracked",
            frame.id,
            frame.timestamp,
            self.state,
            frame.num_tracked()
        );
        self.remember_last_frame(frame);
        Ok(self.shared.pose())
    }

    /// Forget everything about the current map. Used by reset.
    pub fn reset(&mut self) {
        self.frame_builder.reset();
        self.clear_map_state();
        self.state = TrackingState::NoImagesYet;
    }

    pub fn frame_builder(&self) -> &FrameBuilder {
        &self.frame_builder
    }

    fn clear_map_state(&mut self) {
        self.initializer.reset();
        self.motion_model.reset();
        self.kf_decision.reset();
        self.last_frame = None;
        self.reference_kf = None;
        self.last_keyframe = None;
        self.last_relative = None;
        self.local_keyframes.clear();
        self.local_points.clear();
        self.lost_since = None;
        self.lost_frames = 0;
        self.imu_since_keyframe = None;
    }

    fn current_bias(&self) -> ImuBias {
        if !self.sensor.is_inertial() {
            return ImuBias::zero();
        }
        let atlas = self.shared.atlas.read();
        atlas.active_map().imu_bias
    }

    fn remember_last_frame(&mut self, mut frame: Frame) {
        for idx in 0..frame.map_points.len() {
            if frame.outliers[idx] {
                frame.map_points[idx] = None;
                frame.outliers[idx] = false;
            }
        }
        if let (Some(ref_id), Some(pose)) = (self.reference_kf, frame.pose) {
            let atlas = self.shared.atlas.read();
            if let Some(kf) = atlas.active_map().get_keyframe(ref_id) {
                self.last_relative = Some((ref_id, kf.pose.inverse().compose(&pose)));
            }
        }
        self.last_frame = Some(frame);
    }

    /// Move the last pose with a loop correction or merge. Returns true if
    /// the map changed since the previous frame.
    fn follow_map_change(&mut self) -> bool {
        if !self.shared.take_map_changed() {
            return false;
        }
        let Some((ref_id, relative)) = self.last_relative else {
            return true;
        };
        let atlas = self.shared.atlas.read();
        if let Some(kf) = atlas.active_map().get_keyframe(ref_id) {
            let pose = kf.pose.compose(&relative);
            if let Some(last) = self.last_frame.as_mut() {
                last.pose = Some(pose);
            }
            self.motion_model.set_last_pose(&pose);
            debug!("[Tracking] Map changed, last pose follows {}", ref_id);
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────────

    fn initialize(&mut self, frame: &mut Frame) {
        // Inertial maps start from a frame that carries its IMU interval.
        if self.sensor.is_inertial() && frame.preintegrated_frame.is_none() {
            debug!("[Tracking] Frame {} waits for IMU data", frame.id);
            return;
        }
        if self.sensor.is_monocular() {
            self.initialize_monocular(frame);
        } else {
            self.initialize_stereo(frame);
        }
    }

    fn initialize_monocular(&mut self, frame: &mut Frame) {
        let init = match self.initializer.process(frame, self.sensor.is_inertial()) {
            Ok(Some(init)) => init,
            Ok(None) => {
                if self.initializer.reference_timestamp() == Some(frame.timestamp) {
                    self.imu_since_keyframe = None;
                }
                return;
            }
            Err(e) => {
                debug!("[Tracking] {}", e);
                if self.initializer.reference_timestamp() == Some(frame.timestamp) {
                    self.imu_since_keyframe = None;
                }
                return;
            }
        };

        frame.preintegrated_keyframe = self.imu_since_keyframe.take();
        let shared = self.shared.clone();
        let built = {
            let mut atlas = shared.atlas.write();
            build_monocular_map(
                &mut atlas,
                init,
                frame,
                &self.vocabulary,
                &self.camera,
                &self.pyramid,
                self.config.min_init_triangulated,
            )
            .map(|kfs| (kfs, atlas.active_map_id()))
        };
        let ((kf1, kf2), map_id) = match built {
            Ok(done) => done,
            Err(e) => {
                debug!("[Tracking] {}", e);
                self.initializer.reset();
                return;
            }
        };
        self.initializer.reset();

        self.reference_kf = Some(kf2);
        self.last_keyframe = Some(kf2);
        self.local_keyframes = vec![kf1, kf2];
        self.motion_model.reset();
        if let Some(pose) = frame.pose {
            self.motion_model.update(&pose);
        }
        self.kf_decision.keyframe_created(frame.id, frame.timestamp);
        self.send_keyframe(kf1, map_id);
        self.send_keyframe(kf2, map_id);
        self.state = TrackingState::Ok;
    }

    fn initialize_stereo(&mut self, frame: &mut Frame) {
        if frame.num_features() < self.config.min_init_features_stereo {
            debug!(
                "[Tracking] Frame {}: {} features, not enough to start a map",
                frame.id,
                frame.num_features()
            );
            return;
        }
        frame.pose = Some(SE3::identity());
        frame.preintegrated_keyframe = None;
        self.imu_since_keyframe = None;
        let shared = self.shared.clone();
        let (kf, map_id) = {
            let mut atlas = shared.atlas.write();
            let kf = build_stereo_map(&mut atlas, frame, &self.vocabulary, &self.camera, &self.pyramid);
            (kf, atlas.active_map_id())
        };

        self.reference_kf = Some(kf);
        self.last_keyframe = Some(kf);
        self.local_keyframes = vec![kf];
        self.motion_model.reset();
        self.motion_model.update(&SE3::identity());
        self.kf_decision.keyframe_created(frame.id, frame.timestamp);
        self.send_keyframe(kf, map_id);
        self.state = TrackingState::Ok;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracking states
    // ─────────────────────────────────────────────────────────────────────────

    fn track_ok(&mut self, frame: &mut Frame, map_just_changed: bool) {
        let shared = self.shared.clone();
        let outcome = {
            let atlas = shared.atlas.read();
            let map = atlas.active_map();
            let use_imu = self.sensor.is_inertial() && map.is_imu_initialized() && !map_just_changed;
            let predicted = use_imu
                .then(|| self.predict_from_imu(frame, map))
                .flatten()
                .or_else(|| self.motion_model.predict());
            self.track_visual(frame, map, predicted)
        };

        match outcome {
            Ok(stats) => {
                self.update_point_statistics(&stats);
                self.on_tracked(frame);
            }
            Err(e) => {
                info!("[Tracking] Frame {}: {}", frame.id, e);
                self.on_lost(frame);
            }
        }
    }

    fn track_recently_lost(&mut self, frame: &mut Frame) {
        let shared = self.shared.clone();
        let window_over = self
            .lost_since
            .is_some_and(|t| frame.timestamp - t > self.config.recently_lost_window_s);

        let (outcome, imu_ready) = {
            let atlas = shared.atlas.read();
            let map = atlas.active_map();
            if self.sensor.is_inertial() && map.is_imu_initialized() {
                let predicted = self.predict_from_imu(frame, map);
                (self.track_visual(frame, map, predicted), true)
            } else {
                (self.relocalize(frame, &atlas), false)
            }
        };

        match outcome {
            Ok(stats) => {
                info!("[Tracking] Frame {}: recovered", frame.id);
                self.update_point_statistics(&stats);
                self.on_tracked(frame);
            }
            Err(e) if window_over => {
                info!("[Tracking] Frame {}: {}, now lost", frame.id, e);
                self.state = TrackingState::Lost;
                self.lost_frames = 0;
                self.motion_model.reset();
            }
            Err(e) => {
                debug!("[Tracking] Frame {}: {}", frame.id, e);
                if !imu_ready {
                    frame.pose = None;
                }
                frame.clear_matches();
            }
        }
    }

    fn track_lost(&mut self, frame: &mut Frame) {
        let shared = self.shared.clone();
        let (outcome, keyframes) = {
            let atlas = shared.atlas.read();
            (self.relocalize(frame, &atlas), atlas.active_map().num_keyframes())
        };
        match outcome {
            Ok(stats) => {
                self.update_point_statistics(&stats);
                self.on_tracked(frame);
            }
            Err(e) => {
                self.lost_frames += 1;
                debug!("[Tracking] Frame {}: {} ({} lost frames)", frame.id, e, self.lost_frames);
                frame.pose = None;
                if keyframes < self.config.min_keyframes_for_recently_lost
                    || self.lost_frames >= self.config.lost_frames_before_new_map
                {
                    self.start_new_map();
                }
            }
        }
    }

    fn on_tracked(&mut self, frame: &mut Frame) {
        self.state = TrackingState::Ok;
        self.lost_since = None;
        self.lost_frames = 0;
        frame.reference_kf = self.reference_kf;
        if let Some(pose) = frame.pose {
            self.motion_model.update(&pose);
        }
        if self.need_new_keyframe(frame) {
            self.create_keyframe(frame);
        }
    }

    fn on_lost(&mut self, frame: &mut Frame) {
        let (keyframes, imu_ready) = {
            let atlas = self.shared.atlas.read();
            let map = atlas.active_map();
            (map.num_keyframes(), self.sensor.is_inertial() && map.is_imu_initialized())
        };
        self.motion_model.clear_velocity();
        if keyframes >= self.config.min_keyframes_for_recently_lost {
            self.state = TrackingState::RecentlyLost;
            self.lost_since = Some(frame.timestamp);
        } else {
            self.state = TrackingState::Lost;
            self.lost_frames = 0;
        }
        // Only an IMU prediction is worth publishing while lost.
        if self.state == TrackingState::Lost || !imu_ready {
            frame.pose = None;
        }
        frame.clear_matches();
    }

    /// Retire the active map and go back to initialization.
    fn start_new_map(&mut self) {
        let id = self.shared.atlas.write().create_new_map();
        info!("[Tracking] Tracking lost for good, starting map {}", id);
        self.clear_map_state();
        self.state = TrackingState::NotInitialized;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pose estimation
    // ─────────────────────────────────────────────────────────────────────────

    /// Predict the camera pose from the IMU since the last keyframe.
    fn predict_from_imu(&self, frame: &mut Frame, map: &Map) -> Option<SE3> {
        let calib = self.frame_builder.imu_calib()?;
        let pre = self.imu_since_keyframe.as_ref()?;
        let kf = map.get_keyframe(self.last_keyframe?)?;
        let start = kf.nav_state(calib);
        let end = pre.predict(&start, &map.imu_bias);
        frame.velocity = Some(end.v_wb);
        let t_wb = SE3::from_rt(&end.r_wb, end.p_wb);
        Some(t_wb.compose(&calib.t_bc))
    }

    /// Motion-model or reference tracking followed by local map tracking.
    fn track_visual(&mut self, frame: &mut Frame, map: &Map, predicted: Option<SE3>) -> Result<PointStatistics> {
        let mut tracked = false;
        if let Some(pose) = predicted {
            frame.pose = Some(pose);
            tracked = self.track_last_frame(frame, map);
        }
        if !tracked {
            tracked = self.track_reference_keyframe(frame, map);
        }
        if !tracked {
            if predicted.is_some() && self.sensor.is_inertial() {
                frame.pose = predicted;
            }
            return Err(SlamError::TrackingLoss("no pose from last frame or reference keyframe".into()));
        }
        self.track_local_map(frame, map)
    }

    /// Pose optimization that removes outlier matches. Returns the inliers.
    fn optimize(&self, frame: &mut Frame, map: &Map) -> usize {
        let inliers = match optimize_frame_pose(frame, map, &self.camera, &self.pyramid, None) {
            Ok(n) => n,
            Err(e) => {
                debug!("[Tracking] Pose optimization discarded: {}", e);
                return 0;
            }
        };
        for idx in 0..frame.map_points.len() {
            if frame.outliers[idx] {
                frame.map_points[idx] = None;
                frame.outliers[idx] = false;
            }
        }
        inliers
    }

    /// Project the last frame's points with the predicted pose.
    fn track_last_frame(&mut self, frame: &mut Frame, map: &Map) -> bool {
        let Some(last) = self.last_frame.as_ref() else {
            return false;
        };
        let monocular = self.sensor.is_monocular();
        let th = if monocular {
            LAST_FRAME_RADIUS_MONO
        } else {
            LAST_FRAME_RADIUS_DEPTH
        };
        frame.clear_matches();
        let mut n = self
            .last_frame_matcher
            .search_by_projection_last_frame(frame, last, map, th, &self.camera, &self.pyramid, monocular);
        if n < self.config.min_matches_motion_model {
            frame.clear_matches();
            n = self.last_frame_matcher.search_by_projection_last_frame(
                frame,
                last,
                map,
                2.0 * th,
                &self.camera,
                &self.pyramid,
                monocular,
            );
        }
        if n < self.config.min_matches_motion_model {
            debug!("[Tracking] Frame {}: {} last-frame matches", frame.id, n);
            return false;
        }
        self.optimize(frame, map) >= MIN_POSE_INLIERS
    }

    /// Match the reference keyframe through the vocabulary.
    fn track_reference_keyframe(&mut self, frame: &mut Frame, map: &Map) -> bool {
        let Some(kf) = self.reference_kf.and_then(|id| map.get_keyframe(id)) else {
            return false;
        };
        frame.compute_bow(&self.vocabulary);
        frame.clear_matches();
        let n = self.bow_matcher.search_by_bow_frame(kf, frame, map);
        if n < self.config.min_matches_reference {
            debug!("[Tracking] Frame {}: {} reference matches", frame.id, n);
            return false;
        }
        let start = self.last_frame.as_ref().and_then(|f| f.pose).unwrap_or(kf.pose);
        frame.pose = Some(start);
        self.optimize(frame, map) >= MIN_POSE_INLIERS
    }

    /// Search the local map and optimize again.
    fn track_local_map(&mut self, frame: &mut Frame, map: &Map) -> Result<PointStatistics> {
        self.update_local_keyframes(frame, map);
        self.local_points = {
            let mut points: Vec<MapPointId> = map.get_map_points_from_keyframes(&self.local_keyframes).into_iter().collect();
            points.sort();
            points
        };

        let matched: HashSet<MapPointId> = frame.map_points.iter().flatten().copied().collect();
        let candidates = ProjectionCandidate::collect(
            frame,
            map,
            self.local_points.iter().copied().filter(|id| !matched.contains(id)),
            &self.camera,
            &self.pyramid,
            VIEW_COS_LIMIT,
        );
        let mut stats = PointStatistics {
            visible: matched.iter().copied().chain(candidates.iter().map(|c| c.mp_id)).collect(),
            found: Vec::new(),
        };
        let th = if self.kf_decision.recently_relocalized(frame.id) {
            5.0
        } else if self.sensor.has_depth() {
            3.0
        } else {
            1.0
        };
        let added = self
            .local_map_matcher
            .search_by_projection(frame, &candidates, th, &self.pyramid);

        let inliers = self.optimize(frame, map);
        stats.found = frame.map_points.iter().flatten().copied().collect();

        let needed = if self.kf_decision.recently_relocalized(frame.id) {
            self.config.min_inliers_after_relocalization
        } else {
            self.config.min_inliers_ok
        };
        debug!(
            "[Tracking] Frame {}: local map {} KFs / {} points, {} added, {} inliers",
            frame.id,
            self.local_keyframes.len(),
            self.local_points.len(),
            added,
            inliers
        );
        if inliers < needed {
            return Err(SlamError::TrackingLoss(format!("{inliers} inliers, {needed} needed")));
        }
        Ok(stats)
    }

    /// KeyFrames observing the current matches, their neighbors, children
    /// and parents. The most shared one becomes the reference.
    fn update_local_keyframes(&mut self, frame: &mut Frame, map: &Map) {
        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for mp in frame.map_points.iter().flatten().filter_map(|id| map.get_map_point(*id)) {
            for kf_id in mp.observations.keys() {
                *counter.entry(*kf_id).or_default() += 1;
            }
        }
        let good = |id: &KeyFrameId| map.get_keyframe(*id).is_some_and(|kf| !kf.is_bad);
        let mut first: Vec<(KeyFrameId, usize)> = counter.into_iter().filter(|(id, _)| good(id)).collect();
        if first.is_empty() {
            return;
        }
        first.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.reference_kf = Some(first[0].0);
        frame.reference_kf = self.reference_kf;

        let max = self.config.max_local_keyframes;
        let mut local: Vec<KeyFrameId> = first.iter().map(|(id, _)| *id).take(max).collect();
        let mut seen: HashSet<KeyFrameId> = local.iter().copied().collect();
        for (kf_id, _) in &first {
            if local.len() >= max {
                break;
            }
            let Some(kf) = map.get_keyframe(*kf_id) else {
                continue;
            };
            let mut children: Vec<KeyFrameId> = kf.children_ids.iter().copied().collect();
            children.sort();
            for group in [kf.get_best_covisibles(LOCAL_NEIGHBORS), children, kf.parent_id.into_iter().collect()] {
                if let Some(next) = group.into_iter().find(|id| good(id) && !seen.contains(id)) {
                    seen.insert(next);
                    local.push(next);
                }
            }
        }
        local.truncate(max);
        self.local_keyframes = local;
    }

    fn relocalize(&mut self, frame: &mut Frame, atlas: &crate::atlas::atlas::Atlas) -> Result<PointStatistics> {
        let map = atlas.active_map();
        let found = self.relocalizer.relocalize(
            frame,
            map,
            map.id(),
            &atlas.keyframe_db,
            &self.vocabulary,
            &self.camera,
            &self.pyramid,
        );
        let Some(kf_id) = found else {
            return Err(SlamError::TrackingLoss("relocalization failed".into()));
        };
        info!("[Tracking] Frame {} relocalized at {}", frame.id, kf_id);
        self.kf_decision.relocalized(frame.id);
        self.reference_kf = Some(kf_id);
        self.motion_model.reset();
        self.track_local_map(frame, map)
    }

    /// Bump visible/found counters under a short write lock.
    fn update_point_statistics(&self, stats: &PointStatistics) {
        let mut atlas = self.shared.atlas.write();
        let map = atlas.active_map_mut();
        for id in &stats.visible {
            if let Some(mp) = map.get_map_point_mut(*id) {
                mp.increase_visible(1);
            }
        }
        for id in &stats.found {
            if let Some(mp) = map.get_map_point_mut(*id) {
                mp.increase_found(1);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrames
    // ─────────────────────────────────────────────────────────────────────────

    fn need_new_keyframe(&self, frame: &Frame) -> bool {
        if self.shared.is_pause_requested() {
            return false;
        }
        let atlas = self.shared.atlas.read();
        let map = atlas.active_map();
        let keyframes_in_map = map.num_keyframes();
        let min_obs = KeyFrameDecision::min_observations(keyframes_in_map);
        let reference_points = self
            .reference_kf
            .and_then(|id| map.get_keyframe(id))
            .map_or(0, |kf| {
                kf.get_map_point_indices()
                    .filter_map(|(_, id)| map.get_map_point(id))
                    .filter(|mp| !mp.is_bad && mp.num_observations() >= min_obs)
                    .count()
            });

        let (mut tracked_close, mut untracked_close) = (0, 0);
        if self.sensor.has_depth() {
            for idx in 0..frame.num_features() {
                let Some(d) = frame.features.depth[idx] else {
                    continue;
                };
                if d <= 0.0 || d >= self.camera.th_depth {
                    continue;
                }
                if frame.map_points[idx].is_some() && !frame.outliers[idx] {
                    tracked_close += 1;
                } else {
                    untracked_close += 1;
                }
            }
        }

        let ctx = KeyFrameContext {
            frame_id: frame.id,
            timestamp: frame.timestamp,
            tracked_inliers: frame.num_tracked(),
            reference_points,
            tracked_close,
            untracked_close,
            keyframes_in_map,
            local_mapping_idle: self.shared.is_local_mapping_idle(),
            local_mapping_queue: self.kf_sender.len(),
            imu_initialized: map.is_imu_initialized(),
        };
        self.kf_decision.should_create_keyframe(&ctx)
    }

    /// Insert the frame as a keyframe and hand it to Local Mapping.
    fn create_keyframe(&mut self, frame: &mut Frame) {
        if self.kf_sender.is_full() {
            warn!("[Tracking] Local mapping queue full, KeyFrame from frame {} skipped", frame.id);
            return;
        }
        frame.compute_bow(&self.vocabulary);
        frame.preintegrated_keyframe = self.imu_since_keyframe.take();
        let Some(pose) = frame.pose else {
            return;
        };

        let shared = self.shared.clone();
        let (kf_id, map_id, created) = {
            let mut atlas = shared.atlas.write();
            let kf_id = atlas.add_keyframe(frame);
            let map_id = atlas.active_map_id();
            let map = atlas.active_map_mut();
            for idx in 0..frame.num_features() {
                if let Some(mp) = frame.map_points[idx].filter(|_| !frame.outliers[idx]) {
                    map.associate(kf_id, idx, mp);
                }
            }
            let created = if self.sensor.has_depth() {
                self.create_close_points(map, kf_id, frame, &pose)
            } else {
                0
            };
            (kf_id, map_id, created)
        };

        self.reference_kf = Some(kf_id);
        self.last_keyframe = Some(kf_id);
        frame.reference_kf = Some(kf_id);
        self.kf_decision.keyframe_created(frame.id, frame.timestamp);
        debug!(
            "[Tracking] New KeyFrame {} from frame {} ({} close points)",
            kf_id, frame.id, created
        );
        self.send_keyframe(kf_id, map_id);
    }

    /// Create points for the closest untracked depth features, nearest first.
    fn create_close_points(&self, map: &mut Map, kf_id: KeyFrameId, frame: &mut Frame, pose: &SE3) -> usize {
        let mut by_depth: Vec<(f64, usize)> = (0..frame.num_features())
            .filter_map(|idx| frame.features.depth[idx].filter(|d| *d > 0.0).map(|d| (d, idx)))
            .collect();
        by_depth.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut considered = 0;
        let mut created = 0;
        for (depth, idx) in by_depth {
            if frame.map_points[idx].is_none() {
                if let Some(p) = frame.features.unproject_stereo(idx, &self.camera, pose) {
                    let mp = map.create_map_point(p, frame.features.descriptors[idx], kf_id);
                    map.associate(kf_id, idx, mp);
                    map.update_map_point(mp, &self.pyramid);
                    frame.map_points[idx] = Some(mp);
                    created += 1;
                }
            }
            considered += 1;
            if depth > self.camera.th_depth && considered > MAX_CLOSE_POINTS {
                break;
            }
        }
        created
    }

    fn send_keyframe(&self, keyframe_id: KeyFrameId, map_id: crate::atlas::map::MapId) {
        // Signal Local Mapping that a new keyframe is coming (abort current BA)
        self.shared.request_abort_ba();
        let msg = NewKeyFrameMsg {
            keyframe_id,
            map_id,
            generation: self.shared.generation(),
        };
        match self.kf_sender.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("[Tracking] Local mapping queue full, {} not queued", keyframe_id),
            Err(TrySendError::Disconnected(_)) => debug!("[Tracking] Local mapping not running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::test_support::{tagged_image, ScriptedExtractor, SyntheticScene};
    use crossbeam_channel::{bounded, Receiver};

    fn stereo_config(scene: &SyntheticScene) -> SlamConfig {
        let mut config = SlamConfig::default();
        config.sensor = SensorMode::Rgbd;
        config.camera.fx = scene.camera.fx;
        config.camera.fy = scene.camera.fy;
        config.camera.cx = scene.camera.cx;
        config.camera.cy = scene.camera.cy;
        config.camera.width = crate::system::test_support::WIDTH;
        config.camera.height = crate::system::test_support::HEIGHT;
        config.camera.baseline = Some(crate::system::test_support::BASELINE);
        config.camera.depth_map_factor = crate::system::test_support::DEPTH_FACTOR;
        config.tracking.min_init_features_stereo = 50;
        config
    }

    fn tracker(scene: &SyntheticScene, xs: &[f64]) -> (Tracker, Receiver<NewKeyFrameMsg>) {
        let scripts = xs
            .iter()
            .map(|x| scene.observe(&SyntheticScene::pose_at(*x)).0)
            .collect();
        let (tx, rx) = bounded(16);
        let t = Tracker::new(
            &stereo_config(scene),
            Box::new(ScriptedExtractor { scripts }),
            scene.vocabulary.clone(),
            SharedState::new(),
            tx,
        );
        (t, rx)
    }

    fn feed(t: &mut Tracker, scene: &SyntheticScene, tag: u8, x: f64, ts: f64) -> SE3 {
        let image = tagged_image(tag);
        let depth = scene.depth_image(&SyntheticScene::pose_at(x));
        t.process_frame(SensorInput::Rgbd { image: &image, depth: &depth }, ts, None)
            .unwrap()
    }

    #[test]
    fn test_rgbd_initializes_and_tracks() {
        let scene = SyntheticScene::new(21, 400);
        let xs = [0.0, 0.02, 0.04, 0.06];
        let (mut t, rx) = tracker(&scene, &xs);
        assert_eq!(t.state, TrackingState::NoImagesYet);

        feed(&mut t, &scene, 1, xs[0], 0.0);
        assert_eq!(t.state, TrackingState::Ok);
        assert_eq!(rx.try_recv().map(|m| m.generation).ok(), Some(0));

        let mut pose = SE3::identity();
        for (n, x) in xs.iter().enumerate().skip(1) {
            pose = feed(&mut t, &scene, n as u8 + 1, *x, n as f64 * 0.05);
            assert_eq!(t.state, TrackingState::Ok);
        }
        assert!(pose.is_valid_rigid(1e-6));
        assert!((pose.translation.x - 0.06).abs() < 0.02);
    }

    #[test]
    fn test_blank_frame_loses_then_relocalizes() {
        let scene = SyntheticScene::new(22, 400);
        let xs = [0.0, 0.02];
        let (mut t, _rx) = tracker(&scene, &xs);
        feed(&mut t, &scene, 1, 0.0, 0.0);
        feed(&mut t, &scene, 2, 0.02, 0.05);
        assert_eq!(t.state, TrackingState::Ok);

        feed(&mut t, &scene, 0, 0.02, 0.10);
        assert_eq!(t.state, TrackingState::Lost);

        feed(&mut t, &scene, 1, 0.0, 0.15);
        assert_eq!(t.state, TrackingState::Ok);
    }

    #[test]
    fn test_reset_returns_to_no_images() {
        let scene = SyntheticScene::new(23, 300);
        let (mut t, _rx) = tracker(&scene, &[0.0]);
        feed(&mut t, &scene, 1, 0.0, 0.0);
        t.reset();
        assert_eq!(t.state, TrackingState::NoImagesYet);
        assert!(t.frame_builder().last_timestamp().is_none());
    }

    #[test]
    fn test_invalid_input_leaves_state() {
        let scene = SyntheticScene::new(24, 300);
        let (mut t, _rx) = tracker(&scene, &[0.0]);
        feed(&mut t, &scene, 1, 0.0, 1.0);
        let image = tagged_image(1);
        let depth = scene.depth_image(&SyntheticScene::pose_at(0.0));
        let err = t
            .process_frame(SensorInput::Rgbd { image: &image, depth: &depth }, 0.5, None)
            .unwrap_err();
        assert!(matches!(err, SlamError::InvalidInput(_)));
        assert_eq!(t.state, TrackingState::Ok);
    }
}
