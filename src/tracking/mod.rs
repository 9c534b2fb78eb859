//! Tracking thread: turns sensor samples into posed Frames and KeyFrames.
//!
//! This module implements the TRACKING component from ORB-SLAM3 Figure 1:
//! - Frame construction (feature extraction, stereo/depth, IMU preintegration)
//! - Map initialization (two-view monocular, single-frame stereo/RGB-D)
//! - Pose prediction (IMU, constant velocity, reference KeyFrame)
//! - Track local map (projection-based search)
//! - Relocalization
//! - New KeyFrame decision

pub mod frame;
pub mod frame_builder;
pub mod initializer;
pub mod keyframe_decision;
pub mod matcher;
pub mod motion_model;
pub mod relocalization;
pub mod state;
pub mod tracker;

pub use frame_builder::{DepthImage, SensorInput};
pub use state::TrackingState;
pub use tracker::Tracker;
