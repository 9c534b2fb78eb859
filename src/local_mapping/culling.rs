//! Map point and keyframe culling.
//!
//! New points stay on probation for a few keyframes and are dropped if
//! tracking rarely finds them or too few keyframes observe them. A keyframe
//! is dropped when most of its points are already well observed elsewhere.

use std::collections::VecDeque;

use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::config::LocalMappingConfig;

/// Points created by recent keyframes, in creation order.
#[derive(Debug, Default)]
pub struct RecentPoints {
    points: VecDeque<MapPointId>,
}

impl RecentPoints {
    pub fn push(&mut self, mp_id: MapPointId) {
        self.points.push_back(mp_id);
    }

    pub fn extend(&mut self, ids: impl IntoIterator<Item = MapPointId>) {
        self.points.extend(ids);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Check every probationary point against `current`. Returns the number
    /// of points erased from the map.
    pub fn cull(&mut self, map: &mut Map, current: KeyFrameId, min_observations: usize, config: &LocalMappingConfig) -> usize {
        let mut erased = 0;
        let mut kept = VecDeque::with_capacity(self.points.len());
        while let Some(mp_id) = self.points.pop_front() {
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            let age = current.0.saturating_sub(mp.first_kf_id.0);
            if mp.is_bad
                || mp.found_ratio() < config.min_found_ratio
                || (age >= 2 && mp.num_observations() <= min_observations)
            {
                map.erase_map_point(mp_id);
                erased += 1;
            } else if age < config.recent_point_window {
                kept.push_back(mp_id);
            }
        }
        self.points = kept;
        if erased > 0 {
            debug!("[LocalMapping] Culled {} recent points, {} on probation", erased, self.points.len());
        }
        erased
    }
}

/// Redundancy test parameters for keyframe culling.
#[derive(Debug, Clone)]
pub struct KeyFrameCulling {
    pub redundancy_ratio: f64,
    pub observers: usize,
    pub inertial: bool,
    pub max_gap_s: f64,
}

impl KeyFrameCulling {
    pub fn new(config: &LocalMappingConfig, inertial: bool) -> Self {
        Self {
            redundancy_ratio: if inertial {
                config.redundancy_ratio_inertial
            } else {
                config.redundancy_ratio
            },
            observers: config.redundant_observers,
            inertial,
            max_gap_s: config.max_inertial_gap_s,
        }
    }

    /// Whether `kf_id` is redundant: enough of its points are seen by at
    /// least `observers` other keyframes at the same or a finer scale.
    pub fn is_redundant(&self, map: &Map, kf_id: KeyFrameId) -> bool {
        let Some(kf) = map.get_keyframe(kf_id) else {
            return false;
        };
        let mut total = 0usize;
        let mut redundant = 0usize;
        for (idx, mp_id) in kf.get_map_point_indices() {
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            if mp.is_bad {
                continue;
            }
            total += 1;
            if mp.num_observations() <= self.observers {
                continue;
            }
            let level = kf.features.keypoints_un[idx].octave;
            let mut observers = 0;
            for (other, other_idx) in &mp.observations {
                if *other == kf_id {
                    continue;
                }
                let Some(o) = map.get_keyframe(*other) else {
                    continue;
                };
                if o.features.keypoints_un[*other_idx].octave <= level + 1 {
                    observers += 1;
                    if observers >= self.observers {
                        break;
                    }
                }
            }
            if observers >= self.observers {
                redundant += 1;
            }
        }
        total > 0 && redundant as f64 > self.redundancy_ratio * total as f64
    }

    /// Inertial maps keep a keyframe when dropping it would leave its
    /// neighbors further apart than `max_gap_s`.
    fn opens_gap(&self, map: &Map, kf_id: KeyFrameId) -> bool {
        if !self.inertial {
            return false;
        }
        let Some(kf) = map.get_keyframe(kf_id) else {
            return true;
        };
        let (Some(prev), Some(next)) = (
            kf.prev_kf.and_then(|id| map.get_keyframe(id)),
            kf.next_kf.and_then(|id| map.get_keyframe(id)),
        ) else {
            return true;
        };
        next.timestamp - prev.timestamp > self.max_gap_s
    }

    /// Cull redundant covisibles of `current`. Returns the culled ids.
    pub fn cull(&self, map: &mut Map, current: KeyFrameId, should_stop: &dyn Fn() -> bool) -> Vec<KeyFrameId> {
        let Some(kf) = map.get_keyframe(current) else {
            return Vec::new();
        };
        let mut candidates = kf.get_covisibles();
        candidates.sort();
        let mut culled = Vec::new();
        for id in candidates {
            if should_stop() {
                break;
            }
            if id == current || Some(id) == map.origin_keyframe() {
                continue;
            }
            if self.opens_gap(map, id) || !self.is_redundant(map, id) {
                continue;
            }
            if map.cull_keyframe(id).is_some() {
                culled.push(id);
            }
        }
        if !culled.is_empty() {
            debug!("[LocalMapping] Culled {} redundant keyframes", culled.len());
        }
        culled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::test_support::SyntheticScene;

    /// The point of `kf` with the most observations, other than `except`.
    fn best_observed(map: &Map, kf: KeyFrameId, except: MapPointId) -> MapPointId {
        map.get_keyframe(kf)
            .unwrap()
            .get_map_point_indices()
            .map(|(_, id)| id)
            .filter(|id| *id != except)
            .max_by_key(|id| (map.get_map_point(*id).unwrap().num_observations(), std::cmp::Reverse(*id)))
            .unwrap()
    }

    #[test]
    fn test_unobserved_recent_points_are_culled() {
        let scene = SyntheticScene::new(41, 150);
        let (mut map, kfs) = scene.build_map(&[0.0, 0.2, 0.4]);
        let config = LocalMappingConfig::default();

        // A point seen by one KeyFrame only, created two KeyFrames ago.
        let lonely = map.create_map_point(nalgebra::Vector3::new(0.0, 0.0, 7.0), scene.descriptors[0], kfs[0]);
        // A point tracking keeps missing.
        let missed = map.get_keyframe(kfs[2]).unwrap().get_map_point_indices().next().unwrap().1;
        {
            let mp = map.get_map_point_mut(missed).unwrap();
            mp.increase_visible(20);
            mp.increase_found(1);
        }
        let healthy = best_observed(&map, kfs[2], missed);

        let mut recent = RecentPoints::default();
        recent.extend([lonely, missed, healthy]);
        let current = KeyFrameId(kfs[0].0 + 2);
        let erased = recent.cull(&mut map, current, config.min_observations_stereo, &config);
        assert_eq!(erased, 2);
        assert!(map.get_map_point(lonely).is_none());
        assert!(map.get_map_point(missed).is_none());
        assert!(map.get_map_point(healthy).is_some());
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn test_points_leave_probation() {
        let scene = SyntheticScene::new(42, 150);
        let (mut map, kfs) = scene.build_map(&[0.0, 0.2, 0.4, 0.6]);
        let config = LocalMappingConfig::default();
        let healthy = best_observed(&map, kfs[0], MapPointId(u64::MAX));
        let mut recent = RecentPoints::default();
        recent.push(healthy);
        let current = KeyFrameId(kfs[0].0 + config.recent_point_window);
        recent.cull(&mut map, current, config.min_observations_stereo, &config);
        assert!(recent.is_empty());
        assert!(map.get_map_point(healthy).is_some());
    }

    #[test]
    fn test_redundant_keyframe_is_culled_but_origin_is_kept() {
        let scene = SyntheticScene::new(43, 200);
        let (mut map, kfs) = scene.build_map(&[0.0, 0.05, 0.1, 0.15, 0.2, 0.25]);
        let culling = KeyFrameCulling::new(&LocalMappingConfig::default(), false);
        assert!(culling.is_redundant(&map, kfs[2]));

        let culled = culling.cull(&mut map, kfs[5], &|| false);
        assert!(!culled.is_empty());
        assert!(!culled.contains(&kfs[0]));
        assert!(!culled.contains(&kfs[5]));
        assert!(map.contains_keyframe(kfs[0]));
        // The trajectory still lists every KeyFrame.
        assert_eq!(map.trajectory().len(), kfs.len());
    }

    #[test]
    fn test_inertial_gap_keeps_keyframe() {
        let scene = SyntheticScene::new(44, 200);
        let (mut map, kfs) = scene.build_map(&[0.0, 0.05, 0.1]);
        // Stretch the chain so the middle KeyFrame bridges five seconds.
        map.get_keyframe_mut(kfs[2]).unwrap().timestamp = 5.0;
        let culling = KeyFrameCulling::new(&LocalMappingConfig::default(), true);
        assert!(culling.opens_gap(&map, kfs[1]));
        let culled = culling.cull(&mut map, kfs[2], &|| false);
        assert!(!culled.contains(&kfs[1]));
    }
}
