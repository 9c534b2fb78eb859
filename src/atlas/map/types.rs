//! Core ID types for the Atlas map structures.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Unique identifier for a KeyFrame across the whole Atlas.
///
/// KeyFrameIds are lightweight handles for cross-referencing without
/// Arc/Rc, which keeps the covisibility graph free of ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a MapPoint across the whole Atlas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPointId(pub u64);

impl MapPointId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

/// Identifier of a Map inside the Atlas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapId(pub u32);

impl MapId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Map{}", self.0)
    }
}

/// Id counters owned by the Atlas and shared with each of its maps, so ids
/// never collide when maps are merged.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_keyframe: AtomicU64,
    next_map_point: AtomicU64,
    next_map: AtomicU32,
}

impl IdAllocator {
    pub fn keyframe(&self) -> KeyFrameId {
        KeyFrameId(self.next_keyframe.fetch_add(1, Ordering::Relaxed))
    }

    pub fn map_point(&self) -> MapPointId {
        MapPointId(self.next_map_point.fetch_add(1, Ordering::Relaxed))
    }

    pub fn map(&self) -> MapId {
        MapId(self.next_map.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_id_equality() {
        assert_eq!(KeyFrameId::new(42), KeyFrameId::new(42));
        assert_ne!(KeyFrameId::new(42), KeyFrameId::new(43));
    }

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", MapPointId::new(123)), "MP123");
        assert_eq!(format!("{}", KeyFrameId::new(7)), "KF7");
        assert_eq!(format!("{}", MapId::new(2)), "Map2");
    }

    #[test]
    fn test_allocator_is_monotonic() {
        let ids = IdAllocator::default();
        let a = ids.keyframe();
        let b = ids.keyframe();
        assert!(b > a);
        assert_eq!(ids.map_point(), MapPointId(0));
        assert_eq!(ids.map(), MapId(0));
        assert_eq!(ids.map(), MapId(1));
    }
}
