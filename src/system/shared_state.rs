//! Shared state between the Tracking, Local Mapping and Loop Closing threads.
//!
//! The `SharedState` struct holds all data that needs to be accessed by
//! multiple threads. The Atlas sits behind a `parking_lot::RwLock`; a second
//! `RwLock<()>` (the optimization gate) is the outer tier of the two-tier
//! lock: local BA holds it for read, loop correction, map merging and the
//! global BA write-back hold it for write.
//!
//! Cancellation is cooperative. `reset()` bumps `generation`; every worker
//! compares the generation it started a batch under with the current one at
//! each checkpoint and acknowledges the new value at its next loop boundary.

use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::atlas::atlas::Atlas;
use crate::geometry::SE3;
use crate::tracking::state::TrackingState;

/// Poll interval of the pause and acknowledgement waits.
const WAIT_POLL: Duration = Duration::from_millis(2);

/// Background workers taking part in the reset handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Worker {
    LocalMapping,
    LoopClosing,
}

#[derive(Debug, Default)]
struct WorkerSlot {
    alive: AtomicBool,
    acked_generation: AtomicU64,
}

/// Shared state accessible by all threads.
pub struct SharedState {
    /// The Atlas containing all maps, keyframes, and map points.
    pub atlas: RwLock<Atlas>,

    /// Outer tier of the two-tier lock.
    pub optimization_gate: RwLock<()>,

    /// Reset epoch.
    generation: AtomicU64,
    local_mapping: WorkerSlot,
    loop_closing: WorkerSlot,

    /// Request all workers to finish and exit.
    shutdown_requested: AtomicBool,

    /// Loop closing asks Local Mapping to park between steps.
    pause_local_mapping: AtomicBool,
    /// Local Mapping is parked.
    local_mapping_paused: AtomicBool,
    /// Local Mapping has nothing queued and is waiting for KeyFrames.
    local_mapping_idle: AtomicBool,

    /// Signal to abort Local BA early when a new keyframe arrives.
    abort_ba: AtomicBool,

    /// Set by loop closing and map merging after they moved KeyFrames;
    /// Tracking re-fetches the last pose and local map when it sees it.
    map_changed: AtomicBool,

    stop_global_ba: AtomicBool,
    global_ba_running: AtomicBool,

    /// Most recently published camera pose (T_wc).
    pose: RwLock<SE3>,
    tracking_state: AtomicI8,
    reset_count: AtomicU64,
    reset_latch: AtomicBool,
}

impl SharedState {
    /// Create a new SharedState with an empty Atlas.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slot(&self, worker: Worker) -> &WorkerSlot {
        match worker {
            Worker::LocalMapping => &self.local_mapping,
            Worker::LoopClosing => &self.loop_closing,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Generation (reset epoch)
    // ─────────────────────────────────────────────────────────────────────────

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Start a new epoch. Returns the new generation.
    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// True when work started under `generation` must be abandoned.
    pub fn is_stale(&self, generation: u64) -> bool {
        self.generation() != generation || self.is_shutdown_requested()
    }

    pub fn set_worker_alive(&self, worker: Worker, alive: bool) {
        let slot = self.slot(worker);
        if alive {
            slot.acked_generation.store(self.generation(), Ordering::SeqCst);
        }
        slot.alive.store(alive, Ordering::SeqCst);
    }

    pub fn is_worker_alive(&self, worker: Worker) -> bool {
        self.slot(worker).alive.load(Ordering::SeqCst)
    }

    /// Worker acknowledges that it dropped everything from older generations.
    pub fn ack(&self, worker: Worker, generation: u64) {
        self.slot(worker).acked_generation.store(generation, Ordering::SeqCst);
    }

    /// Block until every live worker acknowledged `generation`.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_for_acks(&self, generation: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = [Worker::LocalMapping, Worker::LoopClosing].into_iter().any(|w| {
                let slot = self.slot(w);
                slot.alive.load(Ordering::SeqCst) && slot.acked_generation.load(Ordering::SeqCst) < generation
            });
            if !pending {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────────

    /// Request shutdown of the worker threads.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn clear_shutdown(&self) {
        self.shutdown_requested.store(false, Ordering::SeqCst);
    }

    /// Check if shutdown was requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local Mapping pause protocol
    // ─────────────────────────────────────────────────────────────────────────

    pub fn request_local_mapping_pause(&self) {
        self.pause_local_mapping.store(true, Ordering::SeqCst);
    }

    pub fn resume_local_mapping(&self) {
        self.pause_local_mapping.store(false, Ordering::SeqCst);
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause_local_mapping.load(Ordering::SeqCst)
    }

    pub fn set_local_mapping_paused(&self, paused: bool) {
        self.local_mapping_paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_local_mapping_paused(&self) -> bool {
        self.local_mapping_paused.load(Ordering::SeqCst)
    }

    /// Wait until Local Mapping parked.
    ///
    /// Gives up (returning false) when `generation` goes stale or the mapper
    /// is not running; a dead mapper counts as parked only if it never ran.
    pub fn wait_local_mapping_paused(&self, generation: u64) -> bool {
        loop {
            if self.is_stale(generation) {
                return false;
            }
            if !self.is_worker_alive(Worker::LocalMapping) || self.is_local_mapping_paused() {
                return true;
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    pub fn set_local_mapping_idle(&self, idle: bool) {
        self.local_mapping_idle.store(idle, Ordering::SeqCst);
    }

    /// Local Mapping accepts KeyFrames without falling behind.
    pub fn is_local_mapping_idle(&self) -> bool {
        self.local_mapping_idle.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Optimization flags
    // ─────────────────────────────────────────────────────────────────────────

    /// Check if BA should be aborted.
    pub fn should_abort_ba(&self) -> bool {
        self.abort_ba.load(Ordering::SeqCst)
    }

    /// Signal that BA should be aborted (new keyframe arriving).
    pub fn request_abort_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    /// Clear the abort BA flag (after BA completes or is aborted).
    pub fn clear_abort_ba(&self) {
        self.abort_ba.store(false, Ordering::SeqCst);
    }

    pub fn set_map_changed(&self) {
        self.map_changed.store(true, Ordering::SeqCst);
    }

    /// Read and clear the map-changed flag.
    pub fn take_map_changed(&self) -> bool {
        self.map_changed.swap(false, Ordering::SeqCst)
    }

    pub fn request_stop_global_ba(&self) {
        self.stop_global_ba.store(true, Ordering::SeqCst);
    }

    pub fn clear_stop_global_ba(&self) {
        self.stop_global_ba.store(false, Ordering::SeqCst);
    }

    pub fn should_stop_global_ba(&self) -> bool {
        self.stop_global_ba.load(Ordering::SeqCst)
    }

    pub fn set_global_ba_running(&self, running: bool) {
        self.global_ba_running.store(running, Ordering::SeqCst);
    }

    pub fn is_global_ba_running(&self) -> bool {
        self.global_ba_running.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Published state
    // ─────────────────────────────────────────────────────────────────────────

    pub fn publish_pose(&self, pose: SE3) {
        *self.pose.write() = pose;
    }

    pub fn pose(&self) -> SE3 {
        *self.pose.read()
    }

    pub fn set_tracking_state(&self, state: TrackingState) {
        self.tracking_state.store(state.code(), Ordering::SeqCst);
    }

    pub fn tracking_state(&self) -> TrackingState {
        TrackingState::from_code(self.tracking_state.load(Ordering::SeqCst)).unwrap_or_default()
    }

    /// Count a finished reset and arm the latch.
    pub fn record_reset(&self) {
        self.reset_count.fetch_add(1, Ordering::SeqCst);
        self.reset_latch.store(true, Ordering::SeqCst);
    }

    pub fn reset_count(&self) -> u64 {
        self.reset_count.load(Ordering::SeqCst)
    }

    /// True exactly once per reset.
    pub fn take_reset_latch(&self) -> bool {
        self.reset_latch.swap(false, Ordering::SeqCst)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            atlas: RwLock::new(Atlas::new()),
            optimization_gate: RwLock::new(()),
            generation: AtomicU64::new(0),
            local_mapping: WorkerSlot::default(),
            loop_closing: WorkerSlot::default(),
            shutdown_requested: AtomicBool::new(false),
            pause_local_mapping: AtomicBool::new(false),
            local_mapping_paused: AtomicBool::new(false),
            local_mapping_idle: AtomicBool::new(true),
            abort_ba: AtomicBool::new(false),
            map_changed: AtomicBool::new(false),
            stop_global_ba: AtomicBool::new(false),
            global_ba_running: AtomicBool::new(false),
            pose: RwLock::new(SE3::identity()),
            tracking_state: AtomicI8::new(TrackingState::SystemNotReady.code()),
            reset_count: AtomicU64::new(0),
            reset_latch: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_latch_fires_once() {
        let shared = SharedState::new();
        assert!(!shared.take_reset_latch());
        shared.record_reset();
        assert_eq!(shared.reset_count(), 1);
        assert!(shared.take_reset_latch());
        assert!(!shared.take_reset_latch());
    }

    #[test]
    fn test_acks_skip_dead_workers() {
        let shared = SharedState::new();
        let gen = shared.bump_generation();
        assert!(shared.wait_for_acks(gen, Duration::from_millis(10)));

        shared.set_worker_alive(Worker::LocalMapping, true);
        let gen = shared.bump_generation();
        assert!(!shared.wait_for_acks(gen, Duration::from_millis(10)));
        shared.ack(Worker::LocalMapping, gen);
        assert!(shared.wait_for_acks(gen, Duration::from_millis(10)));
    }

    #[test]
    fn test_pause_wait_aborts_on_new_generation() {
        let shared = SharedState::new();
        shared.set_worker_alive(Worker::LocalMapping, true);
        let gen = shared.generation();
        shared.request_local_mapping_pause();

        let waiter = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.wait_local_mapping_paused(gen))
        };
        std::thread::sleep(Duration::from_millis(10));
        shared.bump_generation();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_tracking_state_round_trip() {
        let shared = SharedState::new();
        assert_eq!(shared.tracking_state(), TrackingState::SystemNotReady);
        shared.set_tracking_state(TrackingState::RecentlyLost);
        assert_eq!(shared.tracking_state(), TrackingState::RecentlyLost);
        assert!(!shared.take_map_changed());
        shared.set_map_changed();
        assert!(shared.take_map_changed());
    }
}
