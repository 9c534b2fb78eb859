//! Visual and visual-inertial SLAM engine.
//!
//! [`system::SlamSystem`] is the entry point: it tracks camera samples in the
//! caller's thread and runs Local Mapping and Loop Closing in the background.

pub mod atlas;
pub mod config;
pub mod error;
pub mod features;
pub mod geometry;
pub mod imu;
pub mod local_mapping;
pub mod loop_closing;
pub mod optimizer;
pub mod system;
pub mod tracking;
pub mod vocabulary;

pub use config::{SensorMode, SlamConfig};
pub use error::{Result, SlamError};
pub use system::SlamSystem;
pub use tracking::state::TrackingState;
