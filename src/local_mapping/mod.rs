//! Local Mapping thread.
//!
//! Consumes keyframes from Tracking and maintains the local neighborhood of
//! the active map:
//! - Refreshes covisibility links and point statistics
//! - Culls recent map points and triangulates new ones
//! - Fuses duplicates across neighboring keyframes
//! - Runs local bundle adjustment and culls redundant keyframes
//! - Drives the staged inertial initialization for visual-inertial sensors

pub mod culling;
pub mod imu_init;
mod local_mapper;
pub mod search_in_neighbors;
pub mod triangulation;

pub use local_mapper::LocalMapper;
