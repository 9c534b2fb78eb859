//! Map module - Core SLAM map data structures.
//!
//! This module contains:
//! - [`KeyFrame`] - Selected frames with poses and feature observations
//! - [`MapPoint`] - 3D landmarks observed by KeyFrames
//! - [`Map`] - Arena owning KeyFrames, MapPoints, and their relationships
//!
//! # Architecture
//!
//! The map forms a bipartite graph structure:
//! - KeyFrames observe MapPoints (KF → MP via `map_point_ids`)
//! - MapPoints track their observers (MP → KF via `observations`)
//!
//! KeyFrames also maintain graph structures, stored as id sets:
//! - **Covisibility Graph**: Edges weighted by shared MapPoint count
//! - **Spanning Tree**: Parent/children links used by the essential graph
//! - **Loop and merge edges**: Added by loop correction and map merging
//!
//! # Example
//!
//! ```ignore
//! let mut map = Map::new(MapId::new(0), Arc::new(IdAllocator::default()));
//! let kf_id = map.create_keyframe(&frame);
//! let mp_id = map.create_map_point(position, descriptor, kf_id);
//! map.associate(kf_id, feature_idx, mp_id);
//! map.update_connections(kf_id);
//! let local_kfs = map.get_local_keyframes(kf_id, 10);
//! ```

pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::KeyFrame;
pub use map::{Map, MapStats, StampedPose, COVISIBILITY_MIN_WEIGHT};
pub use map_point::MapPoint;
pub use types::{IdAllocator, KeyFrameId, MapId, MapPointId};
