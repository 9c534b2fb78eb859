//! LoopCloser - Main loop closing thread.
//!
//! For every KeyFrame forwarded by Local Mapping:
//! 1. Detect consistent loop and merge candidates (BoW + temporal consistency)
//! 2. Snapshot each candidate under the Atlas read lock and verify it with
//!    no lock held (Sim3 RANSAC, guided matching)
//! 3. Merge (if a merge candidate verified) or correct the loop, with Local
//!    Mapping paused and the optimization gate held for write
//! 4. Launch a Global BA in the background
//!
//! Merge candidates are tried before loop candidates.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::atlas::atlas::Atlas;
use crate::atlas::keyframe_db::Candidate;
use crate::atlas::map::MapId;
use crate::config::{LoopClosingConfig, SensorMode, SlamConfig};
use crate::features::ScalePyramid;
use crate::geometry::CameraModel;
use crate::imu::InertialStage;
use crate::optimizer::bundle_adjustment::{self, BaProblem};
use crate::system::messages::LoopKeyFrameMsg;
use crate::system::shared_state::{SharedState, Worker};

use super::corrector::{correct_loop, CorrectionParams};
use super::detector::PlaceDetector;
use super::merger::{merge_maps, MergeParams};
use super::verification::{verify, PlaceSnapshot, VerificationParams, VerifiedPlace};

/// Timeout for receiving keyframes from the channel.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Iterations of the BA welding a merge seam.
const WELD_ITERATIONS: usize = 10;

/// Statistics for the loop closer.
#[derive(Debug, Default, Clone)]
pub struct LoopCloserStats {
    /// Number of keyframes processed.
    pub keyframes_processed: usize,

    /// Number of loop and merge candidates that passed the consistency check.
    pub candidates_detected: usize,

    pub loops_corrected: usize,
    pub maps_merged: usize,
    pub global_ba_launched: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaceKind {
    Loop,
    Merge,
}

/// What happened to one KeyFrame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Nothing,
    LoopClosed,
    MapsMerged,
}

/// The LoopCloser thread handler.
pub struct LoopCloser {
    config: LoopClosingConfig,
    sensor: SensorMode,
    camera: CameraModel,
    pyramid: ScalePyramid,
    shared: Arc<SharedState>,
    detector: PlaceDetector,
    stats: LoopCloserStats,

    /// Background global BA, if one was launched.
    global_ba: Option<JoinHandle<()>>,

    /// Generation the current batch belongs to.
    generation: u64,
}

impl LoopCloser {
    pub fn new(config: &SlamConfig, shared: Arc<SharedState>) -> Self {
        let generation = shared.generation();
        Self {
            config: config.loop_closing.clone(),
            sensor: config.sensor,
            camera: CameraModel::from_config(&config.camera),
            pyramid: ScalePyramid::from_config(&config.extractor),
            shared,
            detector: PlaceDetector::new(&config.loop_closing),
            stats: LoopCloserStats::default(),
            global_ba: None,
            generation,
        }
    }

    pub fn stats(&self) -> &LoopCloserStats {
        &self.stats
    }

    /// Main thread loop. Runs until shutdown or until the channel closes.
    pub fn run(&mut self, receiver: Receiver<LoopKeyFrameMsg>) {
        let shared = Arc::clone(&self.shared);
        self.generation = shared.generation();
        shared.set_worker_alive(Worker::LoopClosing, true);
        info!("[LoopClosing] Started");

        loop {
            if shared.is_shutdown_requested() {
                break;
            }

            let current = shared.generation();
            if current != self.generation {
                self.start_generation(current, &receiver);
                continue;
            }

            match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    self.process_keyframe(msg);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.stop_global_ba();
        shared.set_worker_alive(Worker::LoopClosing, false);
        info!(
            "[LoopClosing] Stopped ({} keyframes, {} loops, {} merges)",
            self.stats.keyframes_processed, self.stats.loops_corrected, self.stats.maps_merged
        );
    }

    fn start_generation(&mut self, generation: u64, receiver: &Receiver<LoopKeyFrameMsg>) {
        let dropped = receiver.try_iter().count();
        self.stop_global_ba();
        self.detector.reset();
        self.generation = generation;
        self.shared.ack(Worker::LoopClosing, generation);
        debug!(
            "[LoopClosing] Generation {}: dropped {} queued keyframes",
            generation, dropped
        );
    }

    fn is_stale(&self) -> bool {
        self.shared.is_stale(self.generation)
    }

    /// Scale is observable (and fixed) with depth or an initialized IMU.
    fn fix_scale(&self, imu_initialized: bool) -> bool {
        !self.sensor.is_monocular() || imu_initialized
    }

    /// Detect, verify and act on one KeyFrame.
    pub fn process_keyframe(&mut self, msg: LoopKeyFrameMsg) -> LoopOutcome {
        if !self.config.enabled || msg.generation != self.generation || self.is_stale() {
            return LoopOutcome::Nothing;
        }
        self.stats.keyframes_processed += 1;

        let (snapshots, fix_scale) = {
            let atlas = self.shared.atlas.read();
            if atlas.active_map_id() != msg.map_id {
                return LoopOutcome::Nothing;
            }
            let detection = self.detector.detect(&atlas, msg.keyframe_id);
            if detection.is_empty() {
                return LoopOutcome::Nothing;
            }
            self.stats.candidates_detected += detection.loops.len() + detection.merges.len();

            let active = atlas.active_map();
            let inertial = self.sensor.is_inertial();
            let initialized = |stage: InertialStage| stage >= InertialStage::Initialized;
            if inertial && !initialized(active.inertial_stage()) {
                debug!("[LoopClosing] {} waits for inertial initialization", msg.keyframe_id);
                return LoopOutcome::Nothing;
            }
            let merge_allowed = |c: &Candidate| {
                !inertial || atlas.map(c.map_id).is_some_and(|m| initialized(m.inertial_stage()))
            };

            let mut snapshots: Vec<(PlaceKind, PlaceSnapshot)> = Vec::new();
            for c in detection.merges.iter().filter(|c| merge_allowed(c)) {
                if let Some(s) = PlaceSnapshot::collect(&atlas, msg.keyframe_id, c) {
                    snapshots.push((PlaceKind::Merge, s));
                }
            }
            for c in &detection.loops {
                if let Some(s) = PlaceSnapshot::collect(&atlas, msg.keyframe_id, c) {
                    snapshots.push((PlaceKind::Loop, s));
                }
            }
            (snapshots, self.fix_scale(active.is_imu_initialized()))
        };

        let params = VerificationParams::new(&self.config, fix_scale);
        for (kind, snapshot) in snapshots {
            if self.is_stale() {
                return LoopOutcome::Nothing;
            }
            let seed = msg.keyframe_id.0 ^ (snapshot.candidate.0 << 20);
            let Some(place) = verify(&snapshot, &params, &self.camera, &self.pyramid, seed) else {
                continue;
            };
            let done = match kind {
                PlaceKind::Merge => self.merge(&place, msg.map_id),
                PlaceKind::Loop => self.close_loop(&place, msg.map_id, fix_scale),
            };
            if done {
                self.detector.mark_corrected(place.current);
                if self.config.global_ba {
                    self.launch_global_ba();
                }
                return match kind {
                    PlaceKind::Merge => LoopOutcome::MapsMerged,
                    PlaceKind::Loop => LoopOutcome::LoopClosed,
                };
            }
        }
        LoopOutcome::Nothing
    }

    /// Stop the global BA, park Local Mapping and run `body` under the gate
    /// and Atlas write locks. `None` when the pause was abandoned or the
    /// active map changed identity.
    fn with_map_exclusive<T>(
        &mut self,
        map_id: MapId,
        body: impl FnOnce(&mut Atlas, &dyn Fn() -> bool) -> T,
    ) -> Option<T> {
        self.stop_global_ba();
        let shared = Arc::clone(&self.shared);
        let generation = self.generation;
        shared.request_local_mapping_pause();
        if !shared.wait_local_mapping_paused(generation) {
            shared.resume_local_mapping();
            return None;
        }
        let result = {
            let _gate = shared.optimization_gate.write();
            let mut atlas = shared.atlas.write();
            if shared.is_stale(generation) || atlas.active_map_id() != map_id {
                None
            } else {
                let should_stop = || shared.is_stale(generation) || shared.is_shutdown_requested();
                Some(body(&mut *atlas, &should_stop))
            }
        };
        shared.resume_local_mapping();
        result
    }

    fn close_loop(&mut self, place: &VerifiedPlace, map_id: MapId, fix_scale: bool) -> bool {
        let params = CorrectionParams {
            essential_graph_min_weight: self.config.essential_graph_min_weight,
            pose_graph_iterations: self.config.pose_graph_iterations,
            fix_scale,
        };
        let camera = self.camera.clone();
        let pyramid = self.pyramid.clone();
        let result = self.with_map_exclusive(map_id, |atlas, should_stop| {
            correct_loop(atlas.active_map_mut(), place, &params, &camera, &pyramid, should_stop)
        });
        match result {
            Some(Ok(_)) => {
                self.shared.set_map_changed();
                self.stats.loops_corrected += 1;
                true
            }
            Some(Err(e)) => {
                warn!("[LoopClosing] Loop correction abandoned: {}", e);
                false
            }
            None => false,
        }
    }

    fn merge(&mut self, place: &VerifiedPlace, map_id: MapId) -> bool {
        let params = MergeParams {
            inertial: self.sensor.is_inertial(),
            weld_iterations: WELD_ITERATIONS,
        };
        let camera = self.camera.clone();
        let pyramid = self.pyramid.clone();
        let result = self.with_map_exclusive(map_id, |atlas, should_stop| {
            merge_maps(atlas, place, &params, &camera, &pyramid, should_stop)
        });
        match result {
            Some(Ok(_)) => {
                self.shared.set_map_changed();
                self.stats.maps_merged += 1;
                true
            }
            Some(Err(e)) => {
                warn!("[LoopClosing] Merge abandoned: {}", e);
                false
            }
            None => false,
        }
    }

    /// Start a global BA on the active map, stopping any running one first.
    fn launch_global_ba(&mut self) {
        self.stop_global_ba();
        let shared = Arc::clone(&self.shared);
        let camera = self.camera.clone();
        let pyramid = self.pyramid.clone();
        let iterations = self.config.global_ba_iterations;
        let generation = self.generation;

        shared.set_global_ba_running(true);
        let spawned = thread::Builder::new().name("global-ba".into()).spawn({
            let shared = Arc::clone(&shared);
            move || {
                run_global_ba(&shared, &camera, &pyramid, iterations, generation);
                shared.set_global_ba_running(false);
            }
        });
        match spawned {
            Ok(handle) => {
                self.global_ba = Some(handle);
                self.stats.global_ba_launched += 1;
            }
            Err(e) => {
                warn!("[GlobalBA] Could not spawn thread: {}", e);
                shared.set_global_ba_running(false);
            }
        }
    }

    /// Ask the global BA to stop and wait for it.
    fn stop_global_ba(&mut self) {
        if let Some(handle) = self.global_ba.take() {
            self.shared.request_stop_global_ba();
            if handle.join().is_err() {
                warn!("[GlobalBA] Thread panicked");
                self.shared.set_global_ba_running(false);
            }
        }
        self.shared.clear_stop_global_ba();
    }
}

/// Optimize every KeyFrame and point of the active map.
///
/// Nothing is written when the run is stopped, the generation changes or
/// the active map changes identity. Returns the number of updated KeyFrames.
pub fn run_global_ba(
    shared: &SharedState,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
    iterations: usize,
    generation: u64,
) -> Option<usize> {
    let should_stop = || shared.is_stale(generation) || shared.should_stop_global_ba() || shared.is_shutdown_requested();

    let (map_id, problem) = {
        let atlas = shared.atlas.read();
        let map = atlas.active_map();
        (map.id(), BaProblem::collect_global(map, pyramid)?)
    };
    info!(
        "[GlobalBA] Started on {} ({} keyframes, {} points)",
        map_id,
        problem.keyframes.len(),
        problem.points.len()
    );

    let solution = match bundle_adjustment::solve(&problem, camera, iterations, &should_stop) {
        Ok(Some(solution)) => solution,
        Ok(None) => {
            info!("[GlobalBA] Stopped");
            return None;
        }
        Err(e) => {
            warn!("[GlobalBA] Discarded: {}", e);
            return None;
        }
    };

    shared.request_local_mapping_pause();
    if !shared.wait_local_mapping_paused(generation) {
        shared.resume_local_mapping();
        return None;
    }
    let updated = {
        let _gate = shared.optimization_gate.write();
        let mut atlas = shared.atlas.write();
        if should_stop() || atlas.active_map_id() != map_id {
            None
        } else {
            let map = atlas.active_map_mut();
            let n = bundle_adjustment::apply_global(map, &solution, pyramid);
            map.bump_big_change();
            Some(n)
        }
    };
    shared.resume_local_mapping();

    if let Some(n) = updated {
        shared.set_map_changed();
        info!("[GlobalBA] Finished on {}: {} keyframes updated", map_id, n);
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::KeyFrameId;
    use crate::loop_closing::verification::tests::revisit_atlas;
    use crate::system::test_support::SyntheticScene;
    use crossbeam_channel::bounded;

    fn closer(shared: &Arc<SharedState>, scene: &SyntheticScene, config: LoopClosingConfig) -> LoopCloser {
        let slam = SlamConfig {
            sensor: SensorMode::Stereo,
            loop_closing: config,
            ..SlamConfig::default()
        };
        let mut closer = LoopCloser::new(&slam, Arc::clone(shared));
        closer.camera = scene.camera.clone();
        closer.pyramid = scene.pyramid.clone();
        closer
    }

    fn msg(shared: &SharedState, kf: KeyFrameId) -> LoopKeyFrameMsg {
        LoopKeyFrameMsg {
            keyframe_id: kf,
            map_id: shared.atlas.read().active_map_id(),
            generation: shared.generation(),
        }
    }

    /// Shared state whose active map holds a drifted revisit of its start,
    /// with every KeyFrame indexed for place recognition.
    fn revisit_shared(scene: &SyntheticScene) -> (Arc<SharedState>, Vec<KeyFrameId>, Vec<KeyFrameId>) {
        let shared = SharedState::new();
        let (mut atlas, start, revisit) = revisit_atlas(scene);
        let map_id = atlas.active_map_id();
        for kf in start.iter().chain(&revisit) {
            let bow = atlas.active_map().get_keyframe(*kf).unwrap().bow_vector.clone().unwrap();
            atlas.keyframe_db.add(*kf, map_id, &bow);
        }
        *shared.atlas.write() = atlas;
        (shared, start, revisit)
    }

    fn permissive() -> LoopClosingConfig {
        LoopClosingConfig {
            min_map_keyframes: 5,
            consistency_threshold: 0,
            global_ba: false,
            ..LoopClosingConfig::default()
        }
    }

    #[test]
    fn test_revisit_closes_loop() {
        let scene = SyntheticScene::new(101, 250);
        let (shared, start, revisit) = revisit_shared(&scene);
        let mut closer = closer(&shared, &scene, permissive());

        let outcome = closer.process_keyframe(msg(&shared, revisit[0]));
        assert_eq!(outcome, LoopOutcome::LoopClosed);
        assert_eq!(closer.stats().loops_corrected, 1);
        assert!(shared.take_map_changed());

        let atlas = shared.atlas.read();
        let kf = atlas.active_map().get_keyframe(revisit[0]).unwrap();
        assert!(kf.loop_edges.contains(&start[0]));
    }

    #[test]
    fn test_disabled_loop_closing_ignores_keyframes() {
        let scene = SyntheticScene::new(102, 250);
        let (shared, _, revisit) = revisit_shared(&scene);
        let config = LoopClosingConfig {
            enabled: false,
            ..permissive()
        };
        let mut closer = closer(&shared, &scene, config);
        assert_eq!(closer.process_keyframe(msg(&shared, revisit[0])), LoopOutcome::Nothing);
        assert_eq!(closer.stats().keyframes_processed, 0);
    }

    #[test]
    fn test_stale_message_is_dropped() {
        let scene = SyntheticScene::new(103, 250);
        let (shared, _, revisit) = revisit_shared(&scene);
        let mut closer = closer(&shared, &scene, permissive());
        let old = msg(&shared, revisit[0]);
        shared.bump_generation();
        assert_eq!(closer.process_keyframe(old), LoopOutcome::Nothing);
    }

    #[test]
    fn test_global_ba_applies_to_active_map() {
        let scene = SyntheticScene::new(104, 200);
        let shared = SharedState::new();
        let kfs = scene.populate(shared.atlas.write().active_map_mut(), &[0.0, 0.05, 0.1]);
        {
            let mut atlas = shared.atlas.write();
            let kf = atlas.active_map_mut().get_keyframe_mut(kfs[2]).unwrap();
            kf.pose.translation.x += 0.01;
        }
        let updated = run_global_ba(&shared, &scene.camera, &scene.pyramid, 10, shared.generation());
        assert!(updated.is_some());
        assert!(shared.take_map_changed());
        let x = shared.atlas.read().active_map().get_keyframe(kfs[2]).unwrap().pose.translation.x;
        assert!((x - 0.1).abs() < 0.005);
    }

    #[test]
    fn test_stopped_global_ba_writes_nothing() {
        let scene = SyntheticScene::new(105, 200);
        let shared = SharedState::new();
        let kfs = scene.populate(shared.atlas.write().active_map_mut(), &[0.0, 0.05, 0.1]);
        shared.request_stop_global_ba();
        assert!(run_global_ba(&shared, &scene.camera, &scene.pyramid, 10, shared.generation()).is_none());
        assert!(!shared.take_map_changed());
        assert!(shared.atlas.read().active_map().contains_keyframe(kfs[0]));
    }

    #[test]
    fn test_thread_acknowledges_reset() {
        let scene = SyntheticScene::new(106, 100);
        let shared = SharedState::new();
        let (tx, rx) = bounded(4);
        let mut closer = closer(&shared, &scene, LoopClosingConfig::default());
        let handle = thread::spawn(move || closer.run(rx));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !shared.is_worker_alive(Worker::LoopClosing) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let generation = shared.bump_generation();
        assert!(shared.wait_for_acks(generation, Duration::from_secs(2)));

        shared.request_shutdown();
        drop(tx);
        handle.join().unwrap();
        assert!(!shared.is_worker_alive(Worker::LoopClosing));
    }
}
