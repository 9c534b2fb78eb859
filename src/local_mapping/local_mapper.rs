//! Local Mapper - Main Local Mapping thread implementation.
//!
//! Processes keyframes received from Tracking:
//! 1. Refreshes the keyframe's points and covisibility links
//! 2. Culls recent map points that did not hold up
//! 3. Triangulates new map points against the best covisibles
//! 4. Fuses duplicates across the neighborhood (queue empty)
//! 5. Local BA under the read side of the optimization gate (queue empty)
//! 6. Staged inertial initialization (visual-inertial sensors)
//! 7. Keyframe culling (removes redundant keyframes)
//! 8. Forwards the keyframe to Loop Closing
//!
//! Every step re-checks the reset generation; a stale batch is abandoned
//! and the queue drained before the new generation is acknowledged.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::atlas::map::KeyFrameId;
use crate::config::{LocalMappingConfig, SensorMode, SlamConfig};
use crate::features::ScalePyramid;
use crate::geometry::CameraModel;
use crate::optimizer::bundle_adjustment::{self, BaProblem};
use crate::system::messages::{LoopKeyFrameMsg, NewKeyFrameMsg};
use crate::system::shared_state::{SharedState, Worker};

use super::culling::{KeyFrameCulling, RecentPoints};
use super::imu_init::InertialScheduler;
use super::search_in_neighbors::{search_in_neighbors, FuseParams};
use super::triangulation::{collect_new_points, insert_new_points, TriangulationParams};

/// Timeout for receiving keyframes. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Sleep between checks while parked for loop closing.
const PAUSE_POLL: Duration = Duration::from_millis(5);

/// Fusion radius in pixels at level 0.
const FUSE_RADIUS: f64 = 3.0;
const FUSE_RADIUS_INERTIAL: f64 = 4.0;

/// Local Mapping thread state.
pub struct LocalMapper {
    config: LocalMappingConfig,
    sensor: SensorMode,
    camera: CameraModel,
    pyramid: ScalePyramid,
    shared: Arc<SharedState>,

    /// Channel sender to Loop Closing thread.
    lc_sender: Option<Sender<LoopKeyFrameMsg>>,

    recent_points: RecentPoints,
    inertial: Option<InertialScheduler>,

    /// Generation the current batch belongs to.
    generation: u64,
}

impl LocalMapper {
    pub fn new(config: &SlamConfig, shared: Arc<SharedState>, lc_sender: Option<Sender<LoopKeyFrameMsg>>) -> Self {
        let generation = shared.generation();
        Self {
            config: config.local_mapping.clone(),
            sensor: config.sensor,
            camera: CameraModel::from_config(&config.camera),
            pyramid: ScalePyramid::from_config(&config.extractor),
            shared,
            lc_sender,
            recent_points: RecentPoints::default(),
            inertial: InertialScheduler::new(config),
            generation,
        }
    }

    /// Main thread loop: receive keyframes and process them.
    ///
    /// This runs until shutdown is requested or the channel is closed.
    pub fn run(&mut self, kf_receiver: Receiver<NewKeyFrameMsg>) {
        let shared = Arc::clone(&self.shared);
        self.generation = shared.generation();
        shared.set_worker_alive(Worker::LocalMapping, true);
        info!("[LocalMapping] Started");

        loop {
            if shared.is_shutdown_requested() {
                break;
            }

            let current = shared.generation();
            if current != self.generation {
                self.start_generation(current, &kf_receiver);
                continue;
            }

            // Handle pause request from LoopCloser
            if shared.is_pause_requested() {
                self.park();
                continue;
            }

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    shared.set_local_mapping_idle(false);
                    self.process_keyframe(msg, &kf_receiver);
                    shared.set_local_mapping_idle(kf_receiver.is_empty());
                }
                Err(RecvTimeoutError::Timeout) => {
                    shared.set_local_mapping_idle(true);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        shared.set_local_mapping_idle(true);
        shared.set_local_mapping_paused(false);
        shared.set_worker_alive(Worker::LocalMapping, false);
        info!("[LocalMapping] Stopped");
    }

    /// Drop everything queued under older generations and acknowledge `generation`.
    fn start_generation(&mut self, generation: u64, kf_receiver: &Receiver<NewKeyFrameMsg>) {
        let dropped = kf_receiver.try_iter().count();
        self.recent_points.clear();
        self.generation = generation;
        self.shared.set_local_mapping_paused(false);
        self.shared.set_local_mapping_idle(true);
        self.shared.ack(Worker::LocalMapping, generation);
        debug!(
            "[LocalMapping] Generation {}: dropped {} queued keyframes",
            generation, dropped
        );
    }

    /// Park until loop closing releases us, a reset happens or shutdown.
    fn park(&self) {
        let shared = &self.shared;
        shared.set_local_mapping_paused(true);
        debug!("[LocalMapping] Paused");
        while shared.is_pause_requested() && !shared.is_stale(self.generation) {
            std::thread::sleep(PAUSE_POLL);
        }
        shared.set_local_mapping_paused(false);
        debug!("[LocalMapping] Resumed");
    }

    fn is_stale(&self) -> bool {
        self.shared.is_stale(self.generation)
    }

    /// Process a single keyframe message.
    pub fn process_keyframe(&mut self, msg: NewKeyFrameMsg, kf_receiver: &Receiver<NewKeyFrameMsg>) {
        if msg.generation != self.generation || self.is_stale() {
            return;
        }
        let kf_id = msg.keyframe_id;

        // Clear abort flag (we're starting fresh)
        self.shared.clear_abort_ba();

        // Step 1: refresh observations and graph links
        let Some(monocular) = self.insert_keyframe(msg) else {
            return;
        };

        // Step 2: cull map points still on probation
        self.cull_map_points(kf_id, monocular);
        if self.is_stale() {
            return;
        }

        // Step 3: new map points from the covisibles
        if !self.create_new_map_points(kf_id, monocular) {
            return;
        }

        // Step 4: fuse duplicates while nothing else is waiting
        if kf_receiver.is_empty() {
            self.fuse_neighbors(kf_id, monocular);
        }
        if self.is_stale() {
            return;
        }

        if kf_receiver.is_empty() && !self.shared.is_pause_requested() {
            // Step 5: local BA
            self.local_bundle_adjustment(kf_id);

            // Step 6: inertial initialization and refinements
            if let Some(scheduler) = &self.inertial {
                scheduler.step(&self.shared, self.generation);
            }

            // Step 7: redundant keyframes
            self.cull_keyframes(kf_id);
        }
        if self.is_stale() {
            return;
        }

        // Step 8: hand over to Loop Closing (non-blocking)
        if let Some(sender) = &self.lc_sender {
            match sender.try_send(LoopKeyFrameMsg::from(msg)) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("[LocalMapping] Loop closing queue full, {} not forwarded", kf_id);
                }
            }
        }
    }

    /// Refresh the keyframe's points and covisibility links.
    ///
    /// Returns whether the active map is monocular, or `None` if the keyframe
    /// is no longer in the active map.
    fn insert_keyframe(&mut self, msg: NewKeyFrameMsg) -> Option<bool> {
        let mut atlas = self.shared.atlas.write();
        if atlas.active_map_id() != msg.map_id {
            debug!("[LocalMapping] {} belongs to a retired map", msg.keyframe_id);
            return None;
        }
        let map = atlas.active_map_mut();
        let kf = map.get_keyframe(msg.keyframe_id)?;
        let points: Vec<_> = kf.get_map_point_indices().map(|(_, id)| id).collect();
        for mp_id in points {
            // Points created by tracking for this keyframe start their probation here.
            if map.get_map_point(mp_id).is_some_and(|mp| mp.first_kf_id == msg.keyframe_id) {
                self.recent_points.push(mp_id);
            }
            map.update_map_point(mp_id, &self.pyramid);
        }
        map.update_connections(msg.keyframe_id);
        debug!(
            "[LocalMapping] Processing {} ({} keyframes, {} points)",
            msg.keyframe_id,
            map.num_keyframes(),
            map.num_map_points()
        );
        Some(self.sensor.is_monocular())
    }

    fn cull_map_points(&mut self, kf_id: KeyFrameId, monocular: bool) {
        let min_observations = if monocular {
            self.config.min_observations_mono
        } else {
            self.config.min_observations_stereo
        };
        let mut atlas = self.shared.atlas.write();
        let map = atlas.active_map_mut();
        self.recent_points.cull(map, kf_id, min_observations, &self.config);
    }

    /// Triangulate against the covisibles. Returns false when the batch was
    /// abandoned.
    fn create_new_map_points(&mut self, kf_id: KeyFrameId, monocular: bool) -> bool {
        let shared = Arc::clone(&self.shared);
        let generation = self.generation;
        let should_stop = || shared.is_stale(generation);

        let (points, map_id) = {
            let atlas = shared.atlas.read();
            let map = atlas.active_map();
            let inertial = map.is_imu_initialized();
            let params = TriangulationParams {
                neighbors: if monocular {
                    self.config.triangulation_neighbors_mono
                } else {
                    self.config.triangulation_neighbors
                },
                min_parallax_cos: if inertial {
                    self.config.min_parallax_cos_inertial
                } else {
                    self.config.min_parallax_cos
                },
                monocular,
                inertial,
            };
            let Some(points) = collect_new_points(map, kf_id, &self.camera, &self.pyramid, &params, &should_stop)
            else {
                return false;
            };
            (points, map.id())
        };
        if points.is_empty() {
            return !self.is_stale();
        }

        let mut atlas = shared.atlas.write();
        if self.is_stale() || atlas.active_map_id() != map_id || !atlas.active_map().contains_keyframe(kf_id) {
            return false;
        }
        let created = insert_new_points(atlas.active_map_mut(), kf_id, &points, &self.pyramid);
        self.recent_points.extend(created);
        true
    }

    fn fuse_neighbors(&self, kf_id: KeyFrameId, monocular: bool) {
        let mut atlas = self.shared.atlas.write();
        if self.is_stale() {
            return;
        }
        let map = atlas.active_map_mut();
        let inertial = map.is_imu_initialized();
        let params = FuseParams {
            neighbors: if monocular {
                self.config.fuse_neighbors_mono
            } else {
                self.config.fuse_neighbors
            },
            radius: if inertial { FUSE_RADIUS_INERTIAL } else { FUSE_RADIUS },
            inertial,
        };
        search_in_neighbors(map, kf_id, &self.camera, &self.pyramid, &params);
    }

    /// Local Bundle Adjustment using three-phase locking.
    ///
    /// 1. **COLLECT**: read lock to extract the local window
    /// 2. **SOLVE**: no atlas lock, polling the abort closure between iterations
    /// 3. **APPLY**: write lock, skipping entities that disappeared
    ///
    /// The whole run holds the read side of the optimization gate, so loop
    /// correction and merges wait for it (and ask it to stop through the
    /// pause flag).
    fn local_bundle_adjustment(&self, kf_id: KeyFrameId) {
        let shared = Arc::clone(&self.shared);
        let generation = self.generation;
        let should_stop =
            || shared.is_stale(generation) || shared.should_abort_ba() || shared.is_pause_requested();

        let _gate = shared.optimization_gate.read();

        // PHASE 1: COLLECT (read lock)
        let (problem, map_id) = {
            let atlas = shared.atlas.read();
            let map = atlas.active_map();
            match BaProblem::collect_local(map, kf_id, self.config.max_local_ba_keyframes, &self.pyramid) {
                Some(p) => (p, map.id()),
                None => return,
            }
        };

        // PHASE 2: SOLVE (no lock held)
        let solution = match bundle_adjustment::solve(
            &problem,
            &self.camera,
            self.config.local_ba_iterations,
            &should_stop,
        ) {
            Ok(Some(solution)) => solution,
            Ok(None) => {
                debug!("[LocalBA] {} aborted", kf_id);
                return;
            }
            Err(e) => {
                warn!("[LocalBA] {} discarded: {}", kf_id, e);
                return;
            }
        };

        // PHASE 3: APPLY (write lock)
        let mut atlas = shared.atlas.write();
        if shared.is_stale(generation) || atlas.active_map_id() != map_id {
            return;
        }
        let updated = bundle_adjustment::apply(atlas.active_map_mut(), &solution, &self.pyramid);
        debug!(
            "[LocalBA] {} iters={} cost {:.3} -> {:.3} (updated={}, outliers={})",
            kf_id,
            solution.iterations,
            solution.initial_cost,
            solution.final_cost,
            updated,
            solution.outliers.len()
        );
    }

    fn cull_keyframes(&self, kf_id: KeyFrameId) {
        let shared = Arc::clone(&self.shared);
        let generation = self.generation;
        let should_stop = || shared.is_stale(generation);

        let mut atlas = shared.atlas.write();
        if should_stop() {
            return;
        }
        let inertial = self.sensor.is_inertial();
        let culling = KeyFrameCulling::new(&self.config, inertial);
        let culled = culling.cull(atlas.active_map_mut(), kf_id, &should_stop);
        for id in &culled {
            atlas.keyframe_db.erase(*id);
        }
        if !culled.is_empty() {
            info!(
                "[KFCulling] Removed {} redundant keyframes (remaining: {})",
                culled.len(),
                atlas.active_map().num_keyframes()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::MapId;
    use crate::system::test_support::SyntheticScene;
    use crossbeam_channel::bounded;
    use std::thread;
    use std::time::Instant;

    fn stereo_config() -> SlamConfig {
        SlamConfig {
            sensor: SensorMode::Stereo,
            ..SlamConfig::default()
        }
    }

    fn insert_keyframes(shared: &SharedState, scene: &SyntheticScene, xs: &[f64]) -> (MapId, Vec<KeyFrameId>) {
        let mut atlas = shared.atlas.write();
        let map_id = atlas.active_map_id();
        let kfs = scene.populate(atlas.active_map_mut(), xs);
        (map_id, kfs)
    }

    fn mapper(shared: &Arc<SharedState>) -> (LocalMapper, Receiver<LoopKeyFrameMsg>) {
        let (lc_tx, lc_rx) = bounded(32);
        let mut m = LocalMapper::new(&stereo_config(), Arc::clone(shared), Some(lc_tx));
        let scene = SyntheticScene::new(0, 1);
        m.camera = scene.camera;
        m.pyramid = scene.pyramid;
        (m, lc_rx)
    }

    #[test]
    fn test_processed_keyframe_is_forwarded() {
        let shared = SharedState::new();
        let scene = SyntheticScene::new(51, 250);
        let (map_id, kfs) = insert_keyframes(&shared, &scene, &[0.0, 0.3, 0.6]);
        let (mut m, lc_rx) = mapper(&shared);
        let (_tx, rx) = bounded::<NewKeyFrameMsg>(3);

        let msg = NewKeyFrameMsg {
            keyframe_id: kfs[2],
            map_id,
            generation: shared.generation(),
        };
        m.process_keyframe(msg, &rx);

        let forwarded = lc_rx.try_recv().unwrap();
        assert_eq!(forwarded.keyframe_id, kfs[2]);
        let atlas = shared.atlas.read();
        let kf = atlas.active_map().get_keyframe(kfs[2]).unwrap();
        assert!(kf.parent_id.is_some());
        assert!(!kf.get_covisibles().is_empty());
    }

    #[test]
    fn test_stale_message_is_dropped() {
        let shared = SharedState::new();
        let scene = SyntheticScene::new(52, 250);
        let (map_id, kfs) = insert_keyframes(&shared, &scene, &[0.0, 0.3]);
        let (mut m, lc_rx) = mapper(&shared);
        let (_tx, rx) = bounded::<NewKeyFrameMsg>(3);

        let old = shared.generation();
        shared.bump_generation();
        m.process_keyframe(
            NewKeyFrameMsg {
                keyframe_id: kfs[1],
                map_id,
                generation: old,
            },
            &rx,
        );
        assert!(lc_rx.try_recv().is_err());
    }

    #[test]
    fn test_thread_acknowledges_reset_and_pauses() {
        let shared = SharedState::new();
        let (tx, rx) = bounded::<NewKeyFrameMsg>(3);
        let (mut m, _lc_rx) = mapper(&shared);
        let handle = thread::spawn(move || m.run(rx));

        let start = Instant::now();
        while !shared.is_worker_alive(Worker::LocalMapping) {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(1));
        }

        let generation = shared.bump_generation();
        assert!(shared.wait_for_acks(generation, Duration::from_secs(2)));

        shared.request_local_mapping_pause();
        assert!(shared.wait_local_mapping_paused(generation));
        shared.resume_local_mapping();

        shared.request_shutdown();
        drop(tx);
        handle.join().unwrap();
        assert!(!shared.is_worker_alive(Worker::LocalMapping));
    }
}
