//! KeyFrameDatabase - inverted index for place recognition.
//!
//! Maps each vocabulary word to the KeyFrames containing it, so a query only
//! scores KeyFrames that share words with it. Candidates are ranked by the
//! accumulated score of their covisibility group rather than individually,
//! which favours places seen consistently by several KeyFrames.
//!
//! Used by:
//! - Tracking, for global relocalization inside the active map
//! - Loop closing, for loop candidates (active map) and merge candidates
//!   (inactive maps)

use std::collections::{HashMap, HashSet};

use crate::atlas::map::{KeyFrame, KeyFrameId, MapId};
use crate::vocabulary::{BowVector, OrbVocabulary};

/// Covisibles pooled into a candidate's group score.
const GROUP_SIZE: usize = 10;
/// Candidates must share at least this fraction of the best word count.
const MIN_COMMON_WORDS_RATIO: f64 = 0.8;
/// Groups below this fraction of the best accumulated score are dropped.
const MIN_GROUP_SCORE_RATIO: f64 = 0.75;

/// Candidate keyframe with its accumulated group score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub map_id: MapId,
    pub score: f64,
}

struct Entry {
    map_id: MapId,
    bow: BowVector,
}

pub struct KeyFrameDatabase {
    /// word_id -> KeyFrames containing the word.
    inverted: HashMap<u32, Vec<KeyFrameId>>,
    entries: HashMap<KeyFrameId, Entry>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self {
            inverted: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    /// Add or replace a keyframe entry.
    pub fn add(&mut self, kf_id: KeyFrameId, map_id: MapId, bow: &BowVector) {
        self.erase(kf_id);
        for word in bow.keys() {
            self.inverted.entry(*word).or_default().push(kf_id);
        }
        self.entries.insert(kf_id, Entry { map_id, bow: bow.clone() });
    }

    pub fn erase(&mut self, kf_id: KeyFrameId) {
        let Some(entry) = self.entries.remove(&kf_id) else {
            return;
        };
        for word in entry.bow.keys() {
            if let Some(list) = self.inverted.get_mut(word) {
                list.retain(|k| *k != kf_id);
                if list.is_empty() {
                    self.inverted.remove(word);
                }
            }
        }
    }

    /// Move every entry of `from` to `to` after a merge.
    pub fn retag_map(&mut self, from: MapId, to: MapId) {
        for entry in self.entries.values_mut() {
            if entry.map_id == from {
                entry.map_id = to;
            }
        }
    }

    /// Drop every entry belonging to a map.
    pub fn erase_map(&mut self, map_id: MapId) {
        let ids: Vec<KeyFrameId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.map_id == map_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.erase(id);
        }
    }

    pub fn clear(&mut self) {
        self.inverted.clear();
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, kf_id: KeyFrameId) -> bool {
        self.entries.contains_key(&kf_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Relocalization candidates for a frame inside `map_id`.
    pub fn detect_relocalization_candidates<'a>(
        &self,
        query: &BowVector,
        map_id: MapId,
        lookup: impl Fn(KeyFrameId) -> Option<&'a KeyFrame>,
    ) -> Vec<Candidate> {
        self.detect(query, 0.0, |id, entry| entry.map_id == map_id && lookup(id).is_some(), &lookup)
    }

    /// Loop candidates for `kf` inside its own map.
    ///
    /// The KeyFrame itself and its covisibles are excluded, and candidates
    /// must score at least as high as the weakest covisible does.
    pub fn detect_loop_candidates<'a>(
        &self,
        kf: &KeyFrame,
        lookup: impl Fn(KeyFrameId) -> Option<&'a KeyFrame>,
    ) -> Vec<Candidate> {
        let Some(query) = kf.bow_vector.as_ref() else {
            return Vec::new();
        };
        let connected: HashSet<KeyFrameId> = kf.get_covisibles().into_iter().chain([kf.id]).collect();
        let min_score = kf
            .get_covisibles()
            .into_iter()
            .filter_map(|id| lookup(id).and_then(|k| k.bow_vector.as_ref()))
            .map(|bow| OrbVocabulary::score(query, bow))
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.min(s))))
            .unwrap_or(0.0);
        self.detect(
            query,
            min_score,
            |id, entry| entry.map_id == kf.map_id && !connected.contains(&id) && lookup(id).is_some(),
            &lookup,
        )
    }

    /// Merge candidates for `kf` from every map other than its own.
    pub fn detect_merge_candidates<'a>(
        &self,
        kf: &KeyFrame,
        lookup: impl Fn(KeyFrameId) -> Option<&'a KeyFrame>,
    ) -> Vec<Candidate> {
        let Some(query) = kf.bow_vector.as_ref() else {
            return Vec::new();
        };
        self.detect(query, 0.0, |id, entry| entry.map_id != kf.map_id && lookup(id).is_some(), &lookup)
    }

    fn detect<'a>(
        &self,
        query: &BowVector,
        min_score: f64,
        accept: impl Fn(KeyFrameId, &Entry) -> bool,
        lookup: impl Fn(KeyFrameId) -> Option<&'a KeyFrame>,
    ) -> Vec<Candidate> {
        // Count shared words.
        let mut common: HashMap<KeyFrameId, usize> = HashMap::new();
        for word in query.keys() {
            let Some(list) = self.inverted.get(word) else {
                continue;
            };
            for kf_id in list {
                if let Some(entry) = self.entries.get(kf_id) {
                    if accept(*kf_id, entry) {
                        *common.entry(*kf_id).or_insert(0) += 1;
                    }
                }
            }
        }
        let Some(max_common) = common.values().copied().max() else {
            return Vec::new();
        };
        let min_common = (MIN_COMMON_WORDS_RATIO * max_common as f64) as usize;

        // Score KeyFrames with enough shared words.
        let mut scores: HashMap<KeyFrameId, f64> = HashMap::new();
        for (kf_id, n) in &common {
            if *n <= min_common && *n != max_common {
                continue;
            }
            let Some(entry) = self.entries.get(kf_id) else {
                continue;
            };
            let score = OrbVocabulary::score(query, &entry.bow);
            if score >= min_score {
                scores.insert(*kf_id, score);
            }
        }
        if scores.is_empty() {
            return Vec::new();
        }

        // Accumulate over covisibility groups.
        let mut groups: Vec<Candidate> = Vec::new();
        for (kf_id, score) in &scores {
            let Some(map_id) = self.entries.get(kf_id).map(|e| e.map_id) else {
                continue;
            };
            let mut acc = *score;
            let mut best = (*kf_id, *score);
            if let Some(kf) = lookup(*kf_id) {
                for neighbor in kf.get_best_covisibles(GROUP_SIZE) {
                    if let Some(s) = scores.get(&neighbor) {
                        acc += s;
                        if *s > best.1 || (*s == best.1 && neighbor < best.0) {
                            best = (neighbor, *s);
                        }
                    }
                }
            }
            groups.push(Candidate {
                keyframe_id: best.0,
                map_id,
                score: acc,
            });
        }

        let best_acc = groups.iter().map(|c| c.score).fold(0.0, f64::max);
        let threshold = MIN_GROUP_SCORE_RATIO * best_acc;
        groups.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.keyframe_id.cmp(&b.keyframe_id)));

        let mut seen = HashSet::new();
        groups
            .into_iter()
            .filter(|c| c.score >= threshold && seen.insert(c.keyframe_id))
            .collect()
    }
}

impl Default for KeyFrameDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyFrameDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrameDatabase")
            .field("entries", &self.entries.len())
            .field("words", &self.inverted.len())
            .finish()
    }
}
