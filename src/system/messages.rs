//! Inter-thread message types.
//!
//! KeyFrames live in the Atlas; messages only carry ids plus the reset
//! generation they were produced under, so a receiver can drop work that
//! predates a reset without touching the map.

use crate::atlas::map::{KeyFrameId, MapId};

/// Sent from Tracking to Local Mapping when a new keyframe was inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewKeyFrameMsg {
    /// The ID assigned to this keyframe by Tracking.
    pub keyframe_id: KeyFrameId,

    /// Map the keyframe was inserted into.
    pub map_id: MapId,

    pub generation: u64,
}

/// Sent from Local Mapping to Loop Closing once a keyframe is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopKeyFrameMsg {
    pub keyframe_id: KeyFrameId,
    pub map_id: MapId,
    pub generation: u64,
}

impl From<NewKeyFrameMsg> for LoopKeyFrameMsg {
    fn from(msg: NewKeyFrameMsg) -> Self {
        Self {
            keyframe_id: msg.keyframe_id,
            map_id: msg.map_id,
            generation: msg.generation,
        }
    }
}
