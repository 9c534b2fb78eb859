//! Atlas - multi-map container.
//!
//! The Atlas owns one or more `Map` instances:
//! - One **active** map where Tracking, Local Mapping and Loop Closing operate.
//! - Zero or more **non-active** maps, kept after tracking loss or reset and
//!   eligible for merging back into the active map.
//!
//! It also owns the shared `KeyFrameDatabase` used for place recognition
//! and the id counters shared by all maps.

use std::sync::Arc;

use tracing::info;

use crate::atlas::map::{IdAllocator, KeyFrame, KeyFrameId, Map, MapId};
use crate::tracking::frame::Frame;

use super::keyframe_db::KeyFrameDatabase;

pub struct Atlas {
    /// All maps; the active one is at `active_map_idx`.
    maps: Vec<Map>,
    active_map_idx: usize,
    /// Shared keyframe database for place recognition.
    pub keyframe_db: KeyFrameDatabase,
    ids: Arc<IdAllocator>,
}

impl Atlas {
    /// Create a new Atlas with a single empty active map.
    pub fn new() -> Self {
        let ids = Arc::new(IdAllocator::default());
        let first = Map::new(ids.map(), ids.clone());
        Self {
            maps: vec![first],
            active_map_idx: 0,
            keyframe_db: KeyFrameDatabase::new(),
            ids,
        }
    }

    pub fn num_maps(&self) -> usize {
        self.maps.len()
    }

    pub fn active_map(&self) -> &Map {
        &self.maps[self.active_map_idx]
    }

    pub fn active_map_mut(&mut self) -> &mut Map {
        &mut self.maps[self.active_map_idx]
    }

    pub fn active_map_id(&self) -> MapId {
        self.active_map().id()
    }

    pub fn all_maps(&self) -> &[Map] {
        &self.maps
    }

    pub fn map(&self, id: MapId) -> Option<&Map> {
        self.maps.iter().find(|m| m.id() == id)
    }

    pub fn map_mut(&mut self, id: MapId) -> Option<&mut Map> {
        self.maps.iter_mut().find(|m| m.id() == id)
    }

    /// Active map plus one other map, both mutable.
    pub fn active_and_other_mut(&mut self, other: MapId) -> Option<(&mut Map, &mut Map)> {
        let other_idx = self.maps.iter().position(|m| m.id() == other)?;
        if other_idx == self.active_map_idx {
            return None;
        }
        let active = self.active_map_idx;
        if active < other_idx {
            let (left, right) = self.maps.split_at_mut(other_idx);
            Some((&mut left[active], &mut right[0]))
        } else {
            let (left, right) = self.maps.split_at_mut(active);
            Some((&mut right[0], &mut left[other_idx]))
        }
    }

    /// Look up a KeyFrame in any map.
    pub fn find_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.maps.iter().find_map(|m| m.get_keyframe(id))
    }

    /// Insert a posed frame into the active map as a KeyFrame and index it
    /// for place recognition when its BoW vector is available.
    pub fn add_keyframe(&mut self, frame: &Frame) -> KeyFrameId {
        let map = &mut self.maps[self.active_map_idx];
        let map_id = map.id();
        let kf_id = map.create_keyframe(frame);
        if let Some(bow) = frame.bow_vector.as_ref() {
            self.keyframe_db.add(kf_id, map_id, bow);
        }
        kf_id
    }

    /// Retire the active map and start a fresh one.
    ///
    /// A map with KeyFrames stays in the Atlas as an inactive map; an empty
    /// one is discarded.
    pub fn create_new_map(&mut self) -> MapId {
        let old = self.active_map_id();
        if self.active_map().num_keyframes() == 0 {
            self.maps.remove(self.active_map_idx);
        }
        let id = self.ids.map();
        self.maps.push(Map::new(id, self.ids.clone()));
        self.active_map_idx = self.maps.len() - 1;
        info!("[Atlas] New active map {} (previous {}, {} maps)", id, old, self.maps.len());
        id
    }

    /// Throw away the active map's contents, e.g. after a failed initialization.
    pub fn reset_active_map(&mut self) -> MapId {
        let old = self.active_map_id();
        self.keyframe_db.erase_map(old);
        let id = self.ids.map();
        self.maps[self.active_map_idx] = Map::new(id, self.ids.clone());
        id
    }

    /// Detach a non-active map, e.g. after it was merged.
    pub fn remove_map(&mut self, id: MapId) -> Option<Map> {
        let idx = self.maps.iter().position(|m| m.id() == id)?;
        if idx == self.active_map_idx {
            return None;
        }
        let map = self.maps.remove(idx);
        if idx < self.active_map_idx {
            self.active_map_idx -= 1;
        }
        Some(map)
    }

    /// Drop all maps and database entries, leaving one empty active map.
    pub fn clear(&mut self) {
        self.keyframe_db.clear();
        self.maps.clear();
        self.maps.push(Map::new(self.ids.map(), self.ids.clone()));
        self.active_map_idx = 0;
    }
}

impl Default for Atlas {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Atlas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atlas")
            .field("maps", &self.maps)
            .field("active", &self.active_map_id())
            .field("keyframe_db", &self.keyframe_db)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Features, KeyPoint};
    use crate::geometry::{CameraModel, SE3};
    use crate::tracking::frame::FrameFeatures;

    fn frame() -> Frame {
        let camera = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480);
        let features = Features {
            keypoints: vec![KeyPoint::new(10.0, 10.0, 0)],
            descriptors: vec![[0; 32]],
        };
        let mut f = Frame::new(0, 0.0, FrameFeatures::new(features, &camera));
        f.pose = Some(SE3::identity());
        f
    }

    #[test]
    fn test_empty_map_is_discarded() {
        let mut atlas = Atlas::new();
        let first = atlas.active_map_id();
        let second = atlas.create_new_map();
        assert_ne!(first, second);
        assert_eq!(atlas.num_maps(), 1);
        assert!(atlas.map(first).is_none());
    }

    #[test]
    fn test_populated_map_becomes_inactive() {
        let mut atlas = Atlas::new();
        let first = atlas.active_map_id();
        let kf = atlas.active_map_mut().create_keyframe(&frame());
        atlas.create_new_map();
        assert_eq!(atlas.num_maps(), 2);
        assert_eq!(atlas.find_keyframe(kf).map(|k| k.map_id), Some(first));

        // Ids stay unique across maps.
        let kf2 = atlas.active_map_mut().create_keyframe(&frame());
        assert_ne!(kf, kf2);
    }

    #[test]
    fn test_remove_map_keeps_active_index() {
        let mut atlas = Atlas::new();
        let first = atlas.active_map_id();
        atlas.active_map_mut().create_keyframe(&frame());
        let second = atlas.create_new_map();

        assert!(atlas.remove_map(second).is_none(), "active map cannot be removed");
        assert!(atlas.active_and_other_mut(first).is_some());
        let removed = atlas.remove_map(first).unwrap();
        assert_eq!(removed.num_keyframes(), 1);
        assert_eq!(atlas.active_map_id(), second);
    }

    #[test]
    fn test_add_keyframe_indexes_bow() {
        let mut atlas = Atlas::new();
        let mut f = frame();
        f.bow_vector = Some([(3u32, 1.0)].into_iter().collect());
        let kf = atlas.add_keyframe(&f);
        assert!(atlas.keyframe_db.contains(kf));
        let plain = atlas.add_keyframe(&frame());
        assert!(!atlas.keyframe_db.contains(plain));
        assert_eq!(atlas.active_map().num_keyframes(), 2);
    }
}
