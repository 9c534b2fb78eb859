//! Atlas module - Multi-map SLAM data structures.
//!
//! The Atlas is the top-level data structure that manages:
//! - Active map (current working map)
//! - Non-active maps (after tracking loss or reset, candidates for merging)
//! - BoW KeyFrame database (for place recognition)

pub mod atlas;
pub mod keyframe_db;
pub mod map;

pub use atlas::Atlas;
pub use keyframe_db::{Candidate, KeyFrameDatabase};
pub use map::{KeyFrame, KeyFrameId, Map, MapId, MapPoint, MapPointId, MapStats, StampedPose};
