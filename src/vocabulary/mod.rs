//! ORB vocabulary for Bag-of-Words place recognition.
//!
//! A DBoW2-style hierarchical k-means tree over binary descriptors:
//! - [`BowVector`]: word id -> L1-normalized tf-idf weight, compared with the L1 score
//! - [`FeatureVector`]: tree node (a few levels above the leaves) -> feature indices,
//!   used to restrict descriptor matching to features that share a node

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::features::{hamming_distance, Descriptor};

pub type BowVector = HashMap<u32, f64>;

/// Ordered so that descriptor matching visits nodes deterministically.
pub type FeatureVector = BTreeMap<u32, Vec<usize>>;

/// Levels above the leaves used to group features for matching.
pub const FEATURE_VECTOR_LEVELS_UP: usize = 4;

#[derive(Debug, Error)]
pub enum VocabularyError {
    #[error("vocabulary I/O error: {0}")]
    Io(String),
    #[error("vocabulary parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone)]
struct VocabNode {
    parent: Option<u32>,
    children: Vec<u32>,
    descriptor: Descriptor,
    weight: f64,
    word_id: Option<u32>,
}

impl VocabNode {
    fn root() -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            descriptor: [0; 32],
            weight: 0.0,
            word_id: None,
        }
    }
}

pub struct OrbVocabulary {
    nodes: Vec<VocabNode>,
    /// Word id -> node id.
    words: Vec<u32>,
    k: usize,
    l: usize,
}

impl OrbVocabulary {
    /// Load a DBoW2 text vocabulary.
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf d0 d1 ... d31 weight
    /// ```
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| VocabularyError::Io(format!("cannot open {:?}: {}", path, e)))?;
        let vocab = Self::from_reader(BufReader::new(file))?;
        info!(
            "[Vocabulary] Loaded {:?}: k={}, L={}, {} nodes, {} words",
            path,
            vocab.k,
            vocab.l,
            vocab.nodes.len(),
            vocab.words.len()
        );
        Ok(vocab)
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, VocabularyError> {
        let mut lines = reader.lines();
        let header = lines
            .next()
            .ok_or_else(|| VocabularyError::Parse("empty vocabulary".into()))?
            .map_err(|e| VocabularyError::Io(e.to_string()))?;
        let mut head = header.split_whitespace();
        let mut field = |name: &str| -> Result<usize, VocabularyError> {
            head.next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| VocabularyError::Parse(format!("bad header field {name}")))
        };
        let k = field("k")?;
        let l = field("L")?;

        let mut nodes = vec![VocabNode::root()];
        let mut words = Vec::new();
        for (i, line) in lines.enumerate() {
            let line = line.map_err(|e| VocabularyError::Io(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let line_no = i + 2;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 35 {
                return Err(VocabularyError::Parse(format!(
                    "line {line_no}: expected 35 fields, found {}",
                    parts.len()
                )));
            }
            let parse_err = |what: &str| VocabularyError::Parse(format!("line {line_no}: invalid {what}"));
            let parent: u32 = parts[0].parse().map_err(|_| parse_err("parent"))?;
            let is_leaf = match parts[1] {
                "1" => true,
                "0" => false,
                _ => return Err(parse_err("leaf flag")),
            };
            let mut descriptor = [0u8; 32];
            for (b, s) in descriptor.iter_mut().zip(&parts[2..34]) {
                *b = s.parse().map_err(|_| parse_err("descriptor byte"))?;
            }
            let weight: f64 = parts[34].parse().map_err(|_| parse_err("weight"))?;

            let id = nodes.len() as u32;
            let parent_node = nodes
                .get_mut(parent as usize)
                .ok_or_else(|| parse_err("forward parent reference"))?;
            parent_node.children.push(id);

            let word_id = if is_leaf {
                words.push(id);
                Some(words.len() as u32 - 1)
            } else {
                None
            };
            nodes.push(VocabNode {
                parent: Some(parent),
                children: Vec::new(),
                descriptor,
                weight,
                word_id,
            });
        }

        if words.is_empty() {
            return Err(VocabularyError::Parse("vocabulary has no words".into()));
        }
        Ok(Self { nodes, words, k, l })
    }

    /// Flat single-level vocabulary whose words are the given descriptors,
    /// all with unit weight.
    pub fn from_words(words: &[Descriptor]) -> Self {
        let mut nodes = vec![VocabNode::root()];
        let mut ids = Vec::with_capacity(words.len());
        for (i, d) in words.iter().enumerate() {
            let id = nodes.len() as u32;
            nodes[0].children.push(id);
            nodes.push(VocabNode {
                parent: Some(0),
                children: Vec::new(),
                descriptor: *d,
                weight: 1.0,
                word_id: Some(i as u32),
            });
            ids.push(id);
        }
        Self {
            nodes,
            words: ids,
            k: words.len(),
            l: 1,
        }
    }

    pub fn params(&self) -> (usize, usize) {
        (self.k, self.l)
    }

    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Descend to the closest leaf. Returns `(word_id, leaf node id)`.
    fn quantize(&self, desc: &Descriptor) -> (u32, u32) {
        let mut node = 0usize;
        while let Some(&first) = self.nodes[node].children.first() {
            let mut best = first;
            let mut best_dist = hamming_distance(desc, &self.nodes[first as usize].descriptor);
            for &child in &self.nodes[node].children[1..] {
                let d = hamming_distance(desc, &self.nodes[child as usize].descriptor);
                if d < best_dist {
                    best_dist = d;
                    best = child;
                }
            }
            node = best as usize;
        }
        (self.nodes[node].word_id.unwrap_or(0), node as u32)
    }

    fn ancestor(&self, mut node: u32, levels_up: usize) -> u32 {
        for _ in 0..levels_up {
            match self.nodes[node as usize].parent {
                Some(p) => node = p,
                None => break,
            }
        }
        node
    }

    pub fn transform(&self, descriptors: &[Descriptor], levels_up: usize) -> (BowVector, FeatureVector) {
        let mut bow = BowVector::new();
        let mut feat = FeatureVector::new();
        for (i, d) in descriptors.iter().enumerate() {
            let (word, leaf) = self.quantize(d);
            let weight = self.nodes[leaf as usize].weight;
            if weight > 0.0 {
                *bow.entry(word).or_insert(0.0) += weight;
            }
            feat.entry(self.ancestor(leaf, levels_up)).or_default().push(i);
        }
        let sum: f64 = bow.values().sum();
        if sum > 0.0 {
            bow.values_mut().for_each(|v| *v /= sum);
        }
        (bow, feat)
    }

    /// L1 similarity in `[0, 1]`, 1 for identical vectors.
    pub fn score(a: &BowVector, b: &BowVector) -> f64 {
        let mut diff = 0.0;
        for (w, va) in a {
            diff += (va - b.get(w).copied().unwrap_or(0.0)).abs();
        }
        for (w, vb) in b {
            if !a.contains_key(w) {
                diff += vb.abs();
            }
        }
        1.0 - 0.5 * diff
    }
}

impl std::fmt::Debug for OrbVocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrbVocabulary")
            .field("k", &self.k)
            .field("L", &self.l)
            .field("nodes", &self.nodes.len())
            .field("words", &self.words.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Cursor;

    fn desc(byte: u8) -> Descriptor {
        [byte; 32]
    }

    #[test]
    fn test_score_identical_and_disjoint() {
        let a: BowVector = [(1, 0.5), (2, 0.5)].into_iter().collect();
        let b: BowVector = [(3, 1.0)].into_iter().collect();
        assert_relative_eq!(OrbVocabulary::score(&a, &a), 1.0);
        assert_relative_eq!(OrbVocabulary::score(&a, &b), 0.0);
    }

    #[test]
    fn test_flat_vocabulary_transform() {
        let vocab = OrbVocabulary::from_words(&[desc(0x00), desc(0xFF), desc(0x0F)]);
        let (bow, feat) = vocab.transform(&[desc(0x01), desc(0xFE), desc(0xFF)], FEATURE_VECTOR_LEVELS_UP);
        assert_eq!(bow.len(), 2);
        assert_relative_eq!(bow[&1], 2.0 / 3.0, epsilon = 1e-12);
        // Flat tree: every feature groups under the root.
        assert_eq!(feat.len(), 1);
        assert_eq!(feat[&0], vec![0, 1, 2]);
    }

    #[test]
    fn test_parse_two_level_text() {
        let zeros = vec!["0"; 32].join(" ");
        let ones = vec!["255"; 32].join(" ");
        let text = format!(
            "2 2 0 0\n0 0 {zeros} 0\n0 0 {ones} 0\n1 1 {zeros} 0.5\n1 1 {zeros} 0.7\n2 1 {ones} 1.2\n"
        );
        let vocab = OrbVocabulary::from_reader(Cursor::new(text)).unwrap();
        assert_eq!(vocab.num_words(), 3);
        assert_eq!(vocab.params(), (2, 2));
        let (bow, feat) = vocab.transform(&[desc(0xFF)], 1);
        assert_eq!(bow.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(feat.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_malformed_line_is_error() {
        let text = "10 6 0 0\n0 1 12 weight\n";
        assert!(matches!(
            OrbVocabulary::from_reader(Cursor::new(text)),
            Err(VocabularyError::Parse(_))
        ));
    }

    #[test]
    fn test_empty_vocabulary_is_error() {
        assert!(OrbVocabulary::from_reader(Cursor::new("10 6 0 0\n")).is_err());
        assert!(OrbVocabulary::from_reader(Cursor::new("")).is_err());
    }
}
