//! SLAM system orchestration and thread management.
//!
//! This module contains the top-level `SlamSystem` that spawns and coordinates
//! the Tracking, Local Mapping and Loop Closing threads, along with shared
//! state, inter-thread messaging types and the occupancy export.

pub mod messages;
pub mod occupancy;
pub mod shared_state;
mod slam_system;

#[cfg(test)]
pub mod test_support;

pub use messages::{LoopKeyFrameMsg, NewKeyFrameMsg};
pub use occupancy::{occupancy_grid, OCC_FREE, OCC_OCCUPIED, OCC_UNKNOWN};
pub use shared_state::{SharedState, Worker};
pub use slam_system::SlamSystem;
