//! SLAM System - Main entry point and thread orchestration.
//!
//! The `SlamSystem` is the top-level struct that users interact with. It owns
//! the shared state, runs Tracking in the caller's thread and spawns the
//! Local Mapping and Loop Closing threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::bounded;
use image::GrayImage;
use nalgebra::DMatrix;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::atlas::map::{MapStats, StampedPose};
use crate::config::SlamConfig;
use crate::error::{Result, SlamError};
use crate::features::{FeatureExtractor, OrbExtractor};
use crate::geometry::SE3;
use crate::imu::ImuSample;
use crate::local_mapping::LocalMapper;
use crate::loop_closing::LoopCloser;
use crate::tracking::frame_builder::{DepthImage, SensorInput};
use crate::tracking::state::TrackingState;
use crate::tracking::Tracker;
use crate::vocabulary::OrbVocabulary;

use super::messages::LoopKeyFrameMsg;
use super::occupancy::occupancy_grid;
use super::shared_state::SharedState;

/// Capacity of the keyframe channel between Local Mapping and Loop Closing.
const LOOP_CHANNEL_CAPACITY: usize = 32;

/// Upper bound on the reset handshake. Workers acknowledge within one
/// receive timeout unless they are inside a long optimization step.
const RESET_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Workers {
    local_mapping: Option<JoinHandle<()>>,
    loop_closing: Option<JoinHandle<()>>,
}

/// Main SLAM system orchestrating Tracking, Local Mapping and Loop Closing.
///
/// All methods take `&self`; the system can be shared between threads.
/// `process_*` and `reset` serialize on the tracker mutex.
pub struct SlamSystem {
    config: SlamConfig,
    vocabulary: Option<Arc<OrbVocabulary>>,

    /// Shared state (Atlas, flags) accessible by all threads.
    shared: Arc<SharedState>,

    /// Extractor handed to the next tracker. `None` falls back to ORB.
    extractor: Mutex<Option<Box<dyn FeatureExtractor>>>,
    tracker: Mutex<Option<Tracker>>,
    workers: Mutex<Workers>,

    running: AtomicBool,
    use_viewer: AtomicBool,
}

impl SlamSystem {
    /// Create an idle system. Nothing runs until [`SlamSystem::initialize`].
    ///
    /// Without a vocabulary, `config.vocabulary_path` is loaded on
    /// initialization.
    pub fn new(config: SlamConfig, vocabulary: Option<Arc<OrbVocabulary>>) -> Self {
        Self {
            config,
            vocabulary,
            shared: SharedState::new(),
            extractor: Mutex::new(None),
            tracker: Mutex::new(None),
            workers: Mutex::new(Workers::default()),
            running: AtomicBool::new(false),
            use_viewer: AtomicBool::new(false),
        }
    }

    /// Like [`SlamSystem::new`], with a custom feature extractor for the
    /// first run.
    pub fn with_extractor(
        config: SlamConfig,
        vocabulary: Option<Arc<OrbVocabulary>>,
        extractor: Box<dyn FeatureExtractor>,
    ) -> Self {
        let system = Self::new(config, vocabulary);
        *system.extractor.lock() = Some(extractor);
        system
    }

    /// Validate the configuration, load the vocabulary and start the worker
    /// threads. Calling it on a running system does nothing.
    pub fn initialize(&self) -> Result<()> {
        let mut tracker_slot = self.tracker.lock();
        if self.is_running() {
            return Ok(());
        }
        self.config.validate()?;
        let vocabulary = self.load_vocabulary()?;

        self.shared.clear_shutdown();
        self.shared.clear_stop_global_ba();
        self.shared.resume_local_mapping();

        let (kf_sender, kf_receiver) = bounded(self.config.tracking.max_queued_keyframes);
        let (lc_sender, lc_receiver) = bounded::<LoopKeyFrameMsg>(LOOP_CHANNEL_CAPACITY);
        let loop_closing = self.config.loop_closing.enabled;

        let mut workers = self.workers.lock();
        if loop_closing {
            let mut closer = LoopCloser::new(&self.config, Arc::clone(&self.shared));
            workers.loop_closing = Some(spawn("loop-closing", move || closer.run(lc_receiver))?);
        }
        let mut mapper = LocalMapper::new(&self.config, Arc::clone(&self.shared), loop_closing.then_some(lc_sender));
        workers.local_mapping = Some(spawn("local-mapping", move || mapper.run(kf_receiver))?);

        let extractor = self
            .extractor
            .lock()
            .take()
            .unwrap_or_else(|| Box::new(OrbExtractor::new(self.config.extractor.clone())));
        *tracker_slot = Some(Tracker::new(
            &self.config,
            extractor,
            vocabulary,
            Arc::clone(&self.shared),
            kf_sender,
        ));

        self.shared.publish_pose(SE3::identity());
        self.shared.set_tracking_state(TrackingState::NoImagesYet);
        self.running.store(true, Ordering::SeqCst);
        info!(
            "[System] Initialized ({:?}, loop closing {})",
            self.config.sensor,
            if loop_closing { "on" } else { "off" }
        );
        Ok(())
    }

    fn load_vocabulary(&self) -> Result<Arc<OrbVocabulary>> {
        let vocabulary = match (&self.vocabulary, &self.config.vocabulary_path) {
            (Some(vocabulary), _) => Arc::clone(vocabulary),
            (None, Some(path)) => {
                info!("[System] Loading vocabulary from {}", path.display());
                Arc::new(OrbVocabulary::load_from_text(path)?)
            }
            (None, None) => {
                return Err(SlamError::Configuration(
                    "no vocabulary given and no vocabulary_path configured".into(),
                ))
            }
        };
        if vocabulary.is_empty() {
            return Err(SlamError::Configuration("vocabulary has no words".into()));
        }
        Ok(vocabulary)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sensor input
    // ─────────────────────────────────────────────────────────────────────────

    fn process(&self, input: SensorInput<'_>, timestamp: f64, imu: Option<&[ImuSample]>) -> Result<SE3> {
        let mut tracker = self.tracker.lock();
        let Some(tracker) = tracker.as_mut() else {
            return Err(SlamError::invalid_input("system is not initialized"));
        };
        tracker.process_frame(input, timestamp, imu)
    }

    pub fn process_monocular(&self, image: &GrayImage, timestamp: f64) -> Result<SE3> {
        self.process(SensorInput::Monocular { image }, timestamp, None)
    }

    /// `imu` holds the samples since the previous frame, oldest first.
    pub fn process_monocular_inertial(&self, image: &GrayImage, timestamp: f64, imu: &[ImuSample]) -> Result<SE3> {
        self.process(SensorInput::Monocular { image }, timestamp, Some(imu))
    }

    pub fn process_stereo(&self, left: &GrayImage, right: &GrayImage, timestamp: f64) -> Result<SE3> {
        self.process(SensorInput::Stereo { left, right }, timestamp, None)
    }

    pub fn process_stereo_inertial(
        &self,
        left: &GrayImage,
        right: &GrayImage,
        timestamp: f64,
        imu: &[ImuSample],
    ) -> Result<SE3> {
        self.process(SensorInput::Stereo { left, right }, timestamp, Some(imu))
    }

    pub fn process_rgbd(&self, image: &GrayImage, depth: &DepthImage, timestamp: f64) -> Result<SE3> {
        self.process(SensorInput::Rgbd { image, depth }, timestamp, None)
    }

    pub fn process_rgbd_inertial(
        &self,
        image: &GrayImage,
        depth: &DepthImage,
        timestamp: f64,
        imu: &[ImuSample],
    ) -> Result<SE3> {
        self.process(SensorInput::Rgbd { image, depth }, timestamp, Some(imu))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reset and shutdown
    // ─────────────────────────────────────────────────────────────────────────

    /// Abandon the active map and start over.
    ///
    /// The old map is kept as an inactive map when it has KeyFrames, so a
    /// later revisit can merge it back.
    pub fn reset(&self) -> Result<()> {
        self.reset_within(RESET_ACK_TIMEOUT)
    }

    /// Reset, giving the workers `timeout` to reach a safe point. On timeout
    /// the active map and the tracker are left untouched; the bumped
    /// generation still cancels whatever the workers are doing.
    fn reset_within(&self, timeout: Duration) -> Result<()> {
        let mut tracker = self.tracker.lock();
        let generation = self.shared.bump_generation();
        self.shared.request_stop_global_ba();
        self.shared.resume_local_mapping();
        info!("[System] Reset requested (generation {})", generation);

        let acked = self.shared.wait_for_acks(generation, timeout);
        self.shared.clear_stop_global_ba();
        self.shared.clear_abort_ba();
        if !acked {
            warn!("[System] Workers did not acknowledge reset within {:?}, map kept", timeout);
            return Err(SlamError::WorkerTimeout(format!(
                "reset generation {generation} not acknowledged within {timeout:?}"
            )));
        }

        let map_id = {
            let _gate = self.shared.optimization_gate.write();
            self.shared.atlas.write().create_new_map()
        };
        if let Some(tracker) = tracker.as_mut() {
            tracker.reset();
        }
        self.shared.take_map_changed();
        self.shared.publish_pose(SE3::identity());
        if self.is_running() {
            self.shared.set_tracking_state(TrackingState::NoImagesYet);
        }
        self.shared.record_reset();
        info!("[System] Reset done, active map is now {}", map_id);
        Ok(())
    }

    /// Stop the workers and drop all maps. Safe to call more than once.
    pub fn shutdown(&self) {
        let mut tracker = self.tracker.lock();
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("[System] Shutting down");
        self.shared.request_shutdown();
        self.shared.request_stop_global_ba();
        self.shared.resume_local_mapping();
        // Dropping the tracker closes the keyframe channel.
        *tracker = None;

        let mut workers = self.workers.lock();
        for (name, handle) in [
            ("local mapping", workers.local_mapping.take()),
            ("loop closing", workers.loop_closing.take()),
        ] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!("[System] The {} thread panicked", name);
                }
            }
        }

        self.shared.atlas.write().clear();
        self.shared.publish_pose(SE3::identity());
        self.shared.set_tracking_state(TrackingState::SystemNotReady);
        info!("[System] Shut down");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Latest published camera pose, world from camera.
    pub fn get_pose(&self) -> SE3 {
        self.shared.pose()
    }

    /// KeyFrame trajectory of the active map, sorted by timestamp.
    pub fn get_trajectory(&self) -> Vec<StampedPose> {
        self.shared.atlas.read().active_map().trajectory()
    }

    /// Occupancy grid of the active map; see [`super::occupancy`].
    pub fn get_2d_occmap(&self) -> DMatrix<i16> {
        occupancy_grid(self.shared.atlas.read().active_map(), &self.config.occupancy)
    }

    pub fn get_tracking_state(&self) -> TrackingState {
        self.shared.tracking_state()
    }

    pub fn is_lost(&self) -> bool {
        self.get_tracking_state().is_lost()
    }

    pub fn get_reset_count(&self) -> u64 {
        self.shared.reset_count()
    }

    /// True exactly once after each reset.
    pub fn was_map_reset(&self) -> bool {
        self.shared.take_reset_latch()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// No viewer ships with the engine; the flag is only recorded.
    pub fn set_use_viewer(&self, use_viewer: bool) {
        self.use_viewer.store(use_viewer, Ordering::SeqCst);
        info!("[System] Viewer {}", if use_viewer { "requested" } else { "disabled" });
    }

    pub fn num_maps(&self) -> usize {
        self.shared.atlas.read().num_maps()
    }

    pub fn active_map_stats(&self) -> MapStats {
        self.shared.atlas.read().active_map().stats()
    }

    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    /// Shared state, for embedding applications that draw the map.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }
}

fn spawn(name: &str, body: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| SlamError::Configuration(format!("cannot spawn {name} thread: {e}")))
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorMode;
    use crate::system::shared_state::Worker;
    use crate::system::occupancy::{OCC_FREE, OCC_OCCUPIED, OCC_UNKNOWN};
    use crate::system::test_support::{self, tagged_image, ScriptedExtractor, SyntheticScene};
    use std::path::PathBuf;

    fn rgbd_config(scene: &SyntheticScene) -> SlamConfig {
        let mut config = SlamConfig::default();
        config.sensor = SensorMode::Rgbd;
        config.camera.fx = scene.camera.fx;
        config.camera.fy = scene.camera.fy;
        config.camera.cx = scene.camera.cx;
        config.camera.cy = scene.camera.cy;
        config.camera.width = test_support::WIDTH;
        config.camera.height = test_support::HEIGHT;
        config.camera.baseline = Some(test_support::BASELINE);
        config.camera.depth_map_factor = test_support::DEPTH_FACTOR;
        config.tracking.min_init_features_stereo = 50;
        config
    }

    fn scripted(scene: &SyntheticScene, xs: &[f64]) -> Box<ScriptedExtractor> {
        let scripts = xs
            .iter()
            .map(|x| scene.observe(&SyntheticScene::pose_at(*x)).0)
            .collect();
        Box::new(ScriptedExtractor { scripts })
    }

    fn rgbd_system(scene: &SyntheticScene, xs: &[f64]) -> SlamSystem {
        let system = SlamSystem::with_extractor(rgbd_config(scene), Some(scene.vocabulary.clone()), scripted(scene, xs));
        system.initialize().unwrap();
        system
    }

    fn feed(system: &SlamSystem, scene: &SyntheticScene, tag: u8, x: f64, ts: f64) -> Result<SE3> {
        let image = tagged_image(tag);
        let depth = scene.depth_image(&SyntheticScene::pose_at(x));
        system.process_rgbd(&image, &depth, ts)
    }

    #[test]
    fn test_system_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SlamSystem>();
    }

    #[test]
    fn test_lifecycle() {
        let scene = SyntheticScene::new(101, 300);
        let system = SlamSystem::new(rgbd_config(&scene), Some(scene.vocabulary.clone()));
        assert!(!system.is_running());
        assert_eq!(system.get_tracking_state(), TrackingState::SystemNotReady);
        let err = feed(&system, &scene, 1, 0.0, 0.0).unwrap_err();
        assert!(matches!(err, SlamError::InvalidInput(_)));

        system.initialize().unwrap();
        assert!(system.is_running());
        assert_eq!(system.get_tracking_state(), TrackingState::NoImagesYet);
        system.initialize().unwrap();

        system.shutdown();
        assert!(!system.is_running());
        assert_eq!(system.get_tracking_state(), TrackingState::SystemNotReady);
        system.shutdown();
        assert!(feed(&system, &scene, 1, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_missing_vocabulary_is_a_configuration_error() {
        let scene = SyntheticScene::new(102, 100);
        let system = SlamSystem::new(rgbd_config(&scene), None);
        assert!(matches!(system.initialize(), Err(SlamError::Configuration(_))));
        assert!(!system.is_running());

        let mut config = rgbd_config(&scene);
        config.vocabulary_path = Some(PathBuf::from("/nonexistent/ORBvoc.txt"));
        let system = SlamSystem::new(config, None);
        assert!(matches!(system.initialize(), Err(SlamError::Configuration(_))));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let scene = SyntheticScene::new(103, 100);
        let mut config = rgbd_config(&scene);
        config.camera.fx = 0.0;
        let system = SlamSystem::new(config, Some(scene.vocabulary.clone()));
        let err = system.initialize().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_rgbd_tracks_and_exports() {
        let scene = SyntheticScene::new(104, 400);
        let xs = [0.0, 0.02, 0.04, 0.06];
        let system = rgbd_system(&scene, &xs);

        let mut pose = SE3::identity();
        for (n, x) in xs.iter().enumerate() {
            pose = feed(&system, &scene, n as u8 + 1, *x, n as f64 * 0.05).unwrap();
            assert_eq!(system.get_tracking_state(), TrackingState::Ok);
        }
        assert!((pose.translation.x - 0.06).abs() < 0.02);
        assert_eq!(system.get_pose(), pose);
        assert!(!system.is_lost());

        let trajectory = system.get_trajectory();
        assert!(!trajectory.is_empty());
        assert!(trajectory.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(system.active_map_stats().keyframes >= 1);

        let grid = system.get_2d_occmap();
        assert!(grid.nrows() > 1 && grid.ncols() > 1);
    }

    #[test]
    fn test_wrong_sensor_is_rejected() {
        let scene = SyntheticScene::new(105, 300);
        let system = rgbd_system(&scene, &[0.0]);
        feed(&system, &scene, 1, 0.0, 0.0).unwrap();

        let image = tagged_image(1);
        let err = system.process_monocular(&image, 0.1).unwrap_err();
        assert!(matches!(err, SlamError::InvalidInput(_)));
        let err = system.process_stereo(&image, &image, 0.1).unwrap_err();
        assert!(matches!(err, SlamError::InvalidInput(_)));
        assert_eq!(system.get_tracking_state(), TrackingState::Ok);
    }

    #[test]
    fn test_reset_starts_a_new_map() {
        let scene = SyntheticScene::new(106, 400);
        let xs = [0.0, 0.02];
        let system = rgbd_system(&scene, &xs);
        feed(&system, &scene, 1, 0.0, 0.0).unwrap();
        feed(&system, &scene, 2, 0.02, 0.05).unwrap();
        assert!(!system.was_map_reset());

        system.reset().unwrap();
        assert_eq!(system.get_reset_count(), 1);
        assert!(system.was_map_reset());
        assert!(!system.was_map_reset());
        assert_eq!(system.get_tracking_state(), TrackingState::NoImagesYet);
        assert_eq!(system.get_pose(), SE3::identity());
        assert!(system.get_trajectory().is_empty());
        assert_eq!(system.num_maps(), 2);

        // Timestamps restart after a reset.
        feed(&system, &scene, 1, 0.0, 0.0).unwrap();
        assert_eq!(system.get_tracking_state(), TrackingState::Ok);
        assert!(system.active_map_stats().keyframes >= 1);
    }

    #[test]
    fn test_reset_before_initialize() {
        let scene = SyntheticScene::new(107, 100);
        let system = SlamSystem::new(rgbd_config(&scene), Some(scene.vocabulary.clone()));
        system.reset().unwrap();
        assert_eq!(system.get_reset_count(), 1);
        assert_eq!(system.get_tracking_state(), TrackingState::SystemNotReady);
    }

    #[test]
    fn test_reset_waits_for_unresponsive_worker() {
        let scene = SyntheticScene::new(109, 100);
        let system = SlamSystem::new(rgbd_config(&scene), Some(scene.vocabulary.clone()));
        let shared = system.shared_state();
        // A worker that registered but never reaches its loop boundary.
        shared.set_worker_alive(Worker::LoopClosing, true);

        let err = system.reset_within(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, SlamError::WorkerTimeout(_)));
        assert!(!err.is_fatal());
        assert_eq!(system.get_reset_count(), 0);
        assert!(!system.was_map_reset());
        assert_eq!(system.num_maps(), 1);

        shared.ack(Worker::LoopClosing, shared.generation() + 1);
        system.reset_within(Duration::from_millis(20)).unwrap();
        assert_eq!(system.get_reset_count(), 1);
        assert!(system.was_map_reset());
    }

    #[test]
    fn test_shared_between_threads() {
        let scene = SyntheticScene::new(108, 400);
        let xs = [0.0, 0.02, 0.04];
        let system = Arc::new(rgbd_system(&scene, &xs));

        let reader = {
            let system = Arc::clone(&system);
            thread::spawn(move || {
                for _ in 0..20 {
                    let _ = system.get_pose();
                    let _ = system.get_trajectory();
                    let _ = system.get_tracking_state();
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };
        for (n, x) in xs.iter().enumerate() {
            feed(&system, &scene, n as u8 + 1, *x, n as f64 * 0.05).unwrap();
        }
        reader.join().unwrap();
        assert_eq!(system.get_tracking_state(), TrackingState::Ok);
    }

    #[test]
    fn test_blank_frame_loses_then_relocalizes() {
        let scene = SyntheticScene::new(110, 400);
        let system = rgbd_system(&scene, &[0.0, 0.02]);
        feed(&system, &scene, 1, 0.0, 0.0).unwrap();
        feed(&system, &scene, 2, 0.02, 0.05).unwrap();
        let before = system.get_trajectory().len();

        feed(&system, &scene, 0, 0.02, 0.10).unwrap();
        assert_eq!(system.get_tracking_state(), TrackingState::Lost);
        assert!(system.is_lost());

        let pose = feed(&system, &scene, 1, 0.0, 0.15).unwrap();
        assert_eq!(system.get_tracking_state(), TrackingState::Ok);
        assert!(pose.is_valid_rigid(1e-6));
        assert!(system.get_trajectory().len() >= before);

        let grid = system.get_2d_occmap();
        assert!(grid
            .iter()
            .all(|c| [OCC_FREE, OCC_OCCUPIED, OCC_UNKNOWN].contains(c)));
    }

    #[test]
    fn test_out_of_order_imu_is_rejected() {
        let scene = SyntheticScene::new(111, 400);
        let mut config = rgbd_config(&scene);
        config.sensor = SensorMode::ImuMonocular;
        config.camera.baseline = None;
        let system = SlamSystem::with_extractor(config, Some(scene.vocabulary.clone()), scripted(&scene, &[0.0, 0.1]));
        system.initialize().unwrap();

        let still = |t: f64| ImuSample::new(0.0, 0.0, 9.81, 0.0, 0.0, 0.0, t);
        system
            .process_monocular_inertial(&tagged_image(1), 0.0, &[])
            .unwrap();
        let state = system.get_tracking_state();
        let pose = system.get_pose();

        let err = system
            .process_monocular_inertial(&tagged_image(2), 0.1, &[still(0.08), still(0.05)])
            .unwrap_err();
        assert!(matches!(err, SlamError::InvalidInput(_)));
        assert_eq!(system.get_tracking_state(), state);
        assert_eq!(system.get_pose(), pose);

        // The same frame with a sorted batch is accepted.
        system
            .process_monocular_inertial(&tagged_image(2), 0.1, &[still(0.05), still(0.08)])
            .unwrap();
    }

    #[test]
    fn test_monocular_initializes_from_two_views() {
        let scene = SyntheticScene::new(109, 400);
        let mut config = rgbd_config(&scene);
        config.sensor = SensorMode::Monocular;
        config.camera.baseline = None;
        let system = SlamSystem::with_extractor(config, Some(scene.vocabulary.clone()), scripted(&scene, &[0.0, 0.4]));
        system.initialize().unwrap();

        system.process_monocular(&tagged_image(1), 0.0).unwrap();
        assert_eq!(system.get_tracking_state(), TrackingState::NotInitialized);
        let pose = system.process_monocular(&tagged_image(2), 0.1).unwrap();
        assert_eq!(system.get_tracking_state(), TrackingState::Ok);
        assert!(pose.is_valid_rigid(1e-6));
        assert!(system.active_map_stats().map_points >= 50);
        assert!(!system.get_trajectory().is_empty());
    }
}
