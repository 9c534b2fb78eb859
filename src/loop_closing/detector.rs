//! Place recognition with temporal consistency checking.
//!
//! Every KeyFrame from Local Mapping is queried against the KeyFrame
//! database twice: for loop candidates inside the active map and for merge
//! candidates in the inactive maps. A candidate is only reported once its
//! covisibility group has been re-detected by `consistency_threshold`
//! consecutive KeyFrames.

use std::collections::HashSet;

use tracing::debug;

use crate::atlas::atlas::Atlas;
use crate::atlas::keyframe_db::Candidate;
use crate::atlas::map::KeyFrameId;
use crate::config::LoopClosingConfig;

/// A candidate group that has been detected `count` times in a row.
#[derive(Debug, Clone)]
struct ConsistentGroup {
    members: HashSet<KeyFrameId>,
    count: usize,
}

/// Tracks temporal consistency of place recognition candidates.
///
/// Each candidate forms a group with its covisibles. A group is consistent
/// with a group of the previous KeyFrame when they share a KeyFrame.
#[derive(Debug, Clone)]
pub struct ConsistencyChecker {
    threshold: usize,
    groups: Vec<ConsistentGroup>,
}

impl ConsistencyChecker {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            groups: Vec::new(),
        }
    }

    /// Feed the candidates of one KeyFrame, each with its group, and return
    /// those that reached the threshold.
    pub fn check(&mut self, candidates: Vec<(Candidate, HashSet<KeyFrameId>)>) -> Vec<Candidate> {
        let mut next: Vec<ConsistentGroup> = Vec::new();
        let mut extended = vec![false; self.groups.len()];
        let mut consistent = Vec::new();
        for (candidate, members) in candidates {
            let mut reached = false;
            let mut linked = false;
            for (i, previous) in self.groups.iter().enumerate() {
                if previous.members.is_disjoint(&members) {
                    continue;
                }
                linked = true;
                let count = previous.count + 1;
                reached |= count >= self.threshold;
                // Each previous group is continued by one candidate only.
                if !extended[i] {
                    extended[i] = true;
                    next.push(ConsistentGroup {
                        members: members.clone(),
                        count,
                    });
                }
            }
            if !linked {
                reached = self.threshold == 0;
                next.push(ConsistentGroup { members, count: 0 });
            }
            if reached {
                consistent.push(candidate);
            }
        }
        self.groups = next;
        consistent
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

/// Consistent candidates found for one KeyFrame.
#[derive(Debug, Default, Clone)]
pub struct Detection {
    pub loops: Vec<Candidate>,
    pub merges: Vec<Candidate>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty() && self.merges.is_empty()
    }
}

/// Loop and merge candidate detection for the Loop Closing thread.
#[derive(Debug, Clone)]
pub struct PlaceDetector {
    min_keyframes_between: u64,
    min_map_keyframes: usize,
    merge_enabled: bool,
    loops: ConsistencyChecker,
    merges: ConsistencyChecker,
    last_correction: Option<KeyFrameId>,
}

impl PlaceDetector {
    pub fn new(config: &LoopClosingConfig) -> Self {
        Self {
            min_keyframes_between: config.min_keyframes_between,
            min_map_keyframes: config.min_map_keyframes,
            merge_enabled: config.merge_enabled,
            loops: ConsistencyChecker::new(config.consistency_threshold),
            merges: ConsistencyChecker::new(config.consistency_threshold),
            last_correction: None,
        }
    }

    /// Query the database for `kf_id`, which must be in the active map.
    pub fn detect(&mut self, atlas: &Atlas, kf_id: KeyFrameId) -> Detection {
        let map = atlas.active_map();
        let Some(kf) = map.get_keyframe(kf_id) else {
            return Detection::default();
        };
        if map.num_keyframes() < self.min_map_keyframes {
            return Detection::default();
        }
        if let Some(last) = self.last_correction {
            if kf_id.0 < last.0 + self.min_keyframes_between {
                return Detection::default();
            }
        }

        let group_of = |c: Candidate| {
            let mut members: HashSet<KeyFrameId> = atlas
                .find_keyframe(c.keyframe_id)
                .map(|k| k.get_covisibles().into_iter().collect())
                .unwrap_or_default();
            members.insert(c.keyframe_id);
            (c, members)
        };

        let loop_candidates: Vec<_> = atlas
            .keyframe_db
            .detect_loop_candidates(kf, |id| map.get_keyframe(id))
            .into_iter()
            .map(group_of)
            .collect();
        let loops = self.loops.check(loop_candidates);

        let merges = if self.merge_enabled && atlas.num_maps() > 1 {
            let merge_candidates: Vec<_> = atlas
                .keyframe_db
                .detect_merge_candidates(kf, |id| atlas.find_keyframe(id))
                .into_iter()
                .map(group_of)
                .collect();
            self.merges.check(merge_candidates)
        } else {
            Vec::new()
        };

        if !loops.is_empty() || !merges.is_empty() {
            debug!(
                "[LoopClosing] {}: {} consistent loop and {} merge candidates",
                kf_id,
                loops.len(),
                merges.len()
            );
        }
        Detection { loops, merges }
    }

    /// Record a loop correction or merge at `kf_id`; detection restarts.
    pub fn mark_corrected(&mut self, kf_id: KeyFrameId) {
        self.last_correction = Some(kf_id);
        self.loops.clear();
        self.merges.clear();
    }

    /// Forget everything, e.g. after a reset.
    pub fn reset(&mut self) {
        self.last_correction = None;
        self.loops.clear();
        self.merges.clear();
    }
}
