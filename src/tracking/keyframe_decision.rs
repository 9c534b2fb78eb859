//! KeyFrame decision criteria as described in ORB-SLAM3.

use crate::config::{SensorMode, TrackingConfig};

/// Tracked-to-reference ratio for sensors with depth.
const DEPTH_TRACKED_RATIO: f64 = 0.75;
/// A close-point KeyFrame is needed when fewer than this many close points are tracked...
const CLOSE_TRACKED_MAX: usize = 100;
/// ...and more than this many close points are not.
const CLOSE_UNTRACKED_MIN: usize = 70;
/// Matches needed for any quality-based KeyFrame.
const MIN_INLIERS_FOR_KEYFRAME: usize = 15;

/// Snapshot of everything the decision looks at for one frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyFrameContext {
    pub frame_id: u64,
    pub timestamp: f64,
    /// Inliers after local map tracking.
    pub tracked_inliers: usize,
    /// Points of the reference KeyFrame with enough observations.
    pub reference_points: usize,
    /// Close stereo/depth features matched to a map point.
    pub tracked_close: usize,
    /// Close stereo/depth features without a map point.
    pub untracked_close: usize,
    pub keyframes_in_map: usize,
    pub local_mapping_idle: bool,
    pub local_mapping_queue: usize,
    pub imu_initialized: bool,
}

/// Criteria for deciding whether to create a new KeyFrame.
///
/// Based on ORB-SLAM3 paper Section V-A:
/// - Frames and time since the last KeyFrame
/// - Tracked points relative to the reference KeyFrame
/// - Close points for stereo and RGB-D
/// - Local mapping availability
pub struct KeyFrameDecision {
    sensor: SensorMode,
    min_frames: u64,
    max_frames: u64,
    tracked_ratio: f64,
    tracked_ratio_single_keyframe: f64,
    close_points_ratio: f64,
    inertial_interval: f64,
    max_queued: usize,

    last_keyframe_frame: u64,
    last_keyframe_time: f64,
    last_relocalization_frame: Option<u64>,
}

impl KeyFrameDecision {
    pub fn new(sensor: SensorMode, config: &TrackingConfig, max_frames: u64) -> Self {
        Self {
            sensor,
            min_frames: config.min_frames,
            max_frames,
            tracked_ratio: config.tracked_ratio,
            tracked_ratio_single_keyframe: config.tracked_ratio_single_keyframe,
            close_points_ratio: config.close_points_ratio,
            inertial_interval: config.inertial_keyframe_interval_s,
            max_queued: config.max_queued_keyframes,
            last_keyframe_frame: 0,
            last_keyframe_time: f64::NEG_INFINITY,
            last_relocalization_frame: None,
        }
    }

    /// Minimum number of observations a reference point needs to count.
    pub fn min_observations(keyframes_in_map: usize) -> usize {
        if keyframes_in_map <= 2 {
            2
        } else {
            3
        }
    }

    /// Whether the close-point rule asks for a KeyFrame.
    fn needs_close_points(&self, ctx: &KeyFrameContext) -> bool {
        self.sensor.has_depth() && ctx.tracked_close < CLOSE_TRACKED_MAX && ctx.untracked_close > CLOSE_UNTRACKED_MIN
    }

    pub fn should_create_keyframe(&self, ctx: &KeyFrameContext) -> bool {
        // Do not insert right after a relocalization while the map is large.
        if let Some(reloc) = self.last_relocalization_frame {
            if ctx.frame_id < reloc + self.max_frames && ctx.keyframes_in_map as u64 > self.max_frames {
                return false;
            }
        }

        let need_close = self.needs_close_points(ctx);
        let mut ratio = if self.sensor.is_monocular() {
            self.tracked_ratio
        } else {
            DEPTH_TRACKED_RATIO
        };
        if ctx.keyframes_in_map < 2 {
            ratio = self.tracked_ratio_single_keyframe;
        }
        let since_last = ctx.frame_id.saturating_sub(self.last_keyframe_frame);
        let reference = ctx.reference_points as f64;
        let inliers = ctx.tracked_inliers as f64;

        let c1a = since_last >= self.max_frames;
        let c1b = since_last >= self.min_frames && ctx.local_mapping_idle;
        let c1c = self.sensor.has_depth() && (inliers < reference * self.close_points_ratio || need_close);
        let c2 = (inliers < reference * ratio || need_close) && ctx.tracked_inliers > MIN_INLIERS_FOR_KEYFRAME;
        let c3 = self.sensor.is_inertial()
            && !ctx.imu_initialized
            && ctx.timestamp - self.last_keyframe_time >= self.inertial_interval;

        if !(((c1a || c1b || c1c) && c2) || c3) {
            return false;
        }
        if ctx.local_mapping_idle {
            return true;
        }
        // Busy mapper: depth sensors may still queue a few KeyFrames.
        !self.sensor.is_monocular() && ctx.local_mapping_queue < self.max_queued
    }

    /// Record that a KeyFrame was created from this frame.
    pub fn keyframe_created(&mut self, frame_id: u64, timestamp: f64) {
        self.last_keyframe_frame = frame_id;
        self.last_keyframe_time = timestamp;
    }

    pub fn relocalized(&mut self, frame_id: u64) {
        self.last_relocalization_frame = Some(frame_id);
    }

    /// True within `max_frames` frames after a relocalization.
    pub fn recently_relocalized(&self, frame_id: u64) -> bool {
        self.last_relocalization_frame
            .is_some_and(|r| frame_id < r + self.max_frames)
    }

    pub fn reset(&mut self) {
        self.last_keyframe_frame = 0;
        self.last_keyframe_time = f64::NEG_INFINITY;
        self.last_relocalization_frame = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(sensor: SensorMode) -> KeyFrameDecision {
        let mut d = KeyFrameDecision::new(sensor, &TrackingConfig::default(), 20);
        d.keyframe_created(0, 0.0);
        d
    }

    fn ctx() -> KeyFrameContext {
        KeyFrameContext {
            frame_id: 5,
            timestamp: 0.1,
            tracked_inliers: 200,
            reference_points: 210,
            tracked_close: 150,
            untracked_close: 10,
            keyframes_in_map: 5,
            local_mapping_idle: true,
            local_mapping_queue: 0,
            imu_initialized: false,
        }
    }

    #[test]
    fn test_well_tracked_frame_is_not_keyframe() {
        assert!(!decision(SensorMode::Monocular).should_create_keyframe(&ctx()));
    }

    #[test]
    fn test_tracking_drop_creates_keyframe() {
        let c = KeyFrameContext {
            tracked_inliers: 100,
            ..ctx()
        };
        assert!(decision(SensorMode::Monocular).should_create_keyframe(&c));
        assert!(decision(SensorMode::Stereo).should_create_keyframe(&c));
    }

    #[test]
    fn test_too_few_inliers_never_creates_keyframe() {
        let c = KeyFrameContext {
            tracked_inliers: 10,
            ..ctx()
        };
        assert!(!decision(SensorMode::Stereo).should_create_keyframe(&c));
    }

    #[test]
    fn test_busy_mapper_blocks_monocular_only() {
        let c = KeyFrameContext {
            frame_id: 25,
            tracked_inliers: 100,
            local_mapping_idle: false,
            local_mapping_queue: 1,
            ..ctx()
        };
        assert!(!decision(SensorMode::Monocular).should_create_keyframe(&c));
        assert!(decision(SensorMode::Stereo).should_create_keyframe(&c));
        let full = KeyFrameContext {
            local_mapping_queue: 3,
            ..c
        };
        assert!(!decision(SensorMode::Stereo).should_create_keyframe(&full));
    }

    #[test]
    fn test_close_points_trigger_for_depth_sensors() {
        let c = KeyFrameContext {
            tracked_close: 40,
            untracked_close: 120,
            ..ctx()
        };
        assert!(decision(SensorMode::Rgbd).should_create_keyframe(&c));
        assert!(!decision(SensorMode::Monocular).should_create_keyframe(&c));
    }

    #[test]
    fn test_inertial_time_rule_before_initialization() {
        let d = decision(SensorMode::ImuStereo);
        let early = KeyFrameContext {
            timestamp: 0.1,
            ..ctx()
        };
        let late = KeyFrameContext {
            timestamp: 0.3,
            ..ctx()
        };
        assert!(!d.should_create_keyframe(&early));
        assert!(d.should_create_keyframe(&late));
        let initialized = KeyFrameContext {
            imu_initialized: true,
            ..late
        };
        assert!(!d.should_create_keyframe(&initialized));
    }

    #[test]
    fn test_relocalization_suppresses_keyframes_in_large_maps() {
        let mut d = decision(SensorMode::Stereo);
        d.relocalized(4);
        let c = KeyFrameContext {
            tracked_inliers: 100,
            keyframes_in_map: 50,
            ..ctx()
        };
        assert!(d.recently_relocalized(5));
        assert!(!d.should_create_keyframe(&c));
    }
}
