//! Revision identifiers and revision chains.
//!
//! A revision identifier is `"<generation>-<hash>"` where the generation is the
//! depth of the revision in its history. A chain lists the revisions of one
//! document from the current leaf down to its oldest known ancestor.
//!
//! On the wire a chain travels as [`Revisions`]: the generation of the head
//! (`start`) plus the list of hashes, newest first.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RevisionError {
    #[error("Malformed revision: {0:?}")]
    Malformed(String),

    #[error("Empty revision chain")]
    EmptyChain,

    #[error("Revision {rev} is not the head of its chain (start {start})")]
    HeadMismatch { rev: String, start: u64 },

    #[error("No generation after {0}")]
    GenerationOverflow(u64),
}

pub type Result<T> = std::result::Result<T, RevisionError>;

/// A parsed revision identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision {
    generation: u64,
    hash: String,
}

impl Revision {
    /// Build a revision from its parts.
    ///
    /// Fails if the generation is zero or the hash is empty.
    pub fn new(generation: u64, hash: impl Into<String>) -> Result<Self> {
        let hash = hash.into();
        if generation == 0 || hash.is_empty() {
            return Err(RevisionError::Malformed(serialize(generation, &hash)));
        }
        Ok(Self { generation, hash })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The revision right after this one, with a fresh hash.
    pub fn next(&self, hashes: &dyn HashSource) -> Result<Self> {
        let generation = self
            .generation
            .checked_add(1)
            .ok_or(RevisionError::GenerationOverflow(self.generation))?;
        Ok(Self {
            generation,
            hash: hashes.next_hash(),
        })
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for Revision {
    type Err = RevisionError;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, hash) = s
            .split_once('-')
            .ok_or_else(|| RevisionError::Malformed(s.to_string()))?;

        // u64::from_str accepts a leading '+', the canonical form does not
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RevisionError::Malformed(s.to_string()));
        }
        let generation: u64 = prefix
            .parse()
            .map_err(|_| RevisionError::Malformed(s.to_string()))?;
        if generation == 0 || hash.is_empty() || prefix.starts_with('0') {
            return Err(RevisionError::Malformed(s.to_string()));
        }

        Ok(Self {
            generation,
            hash: hash.to_string(),
        })
    }
}

impl Serialize for Revision {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Split a revision string into its generation and hash.
pub fn parse(id: &str) -> Result<(u64, String)> {
    let rev: Revision = id.parse()?;
    Ok((rev.generation, rev.hash))
}

/// Generation of a revision string.
pub fn generation_of(id: &str) -> Result<u64> {
    Ok(id.parse::<Revision>()?.generation)
}

/// Canonical `"<generation>-<hash>"` form.
pub fn serialize(generation: u64, hash: &str) -> String {
    format!("{}-{}", generation, hash)
}

/// Wire structure of a revision chain: `{"start": N, "ids": [...]}`.
///
/// `ids[0]` is the hash of revision `start`, `ids[1]` of `start - 1`, and so on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revisions {
    pub start: u64,
    pub ids: Vec<String>,
}

impl Revisions {
    pub fn new(start: u64, ids: Vec<String>) -> Self {
        Self { start, ids }
    }

    /// Revisions struct whose head is `rev` and which has no known ancestors.
    pub fn single(rev: &Revision) -> Self {
        Self {
            start: rev.generation,
            ids: vec![rev.hash.clone()],
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Revision identifier of the head of the chain.
    pub fn head_rev(&self) -> Result<Revision> {
        let hash = self.ids.first().ok_or(RevisionError::EmptyChain)?;
        Revision::new(self.start, hash.clone())
    }

    /// Full revision strings, newest first.
    ///
    /// Generations are derived from `start`, so an entry whose derived
    /// generation would fall below 1 is not representable and is skipped.
    pub fn rev_strings(&self) -> Vec<String> {
        self.ids
            .iter()
            .enumerate()
            .filter(|(i, _)| (*i as u64) < self.start)
            .map(|(i, id)| serialize(self.start - i as u64, id))
            .collect()
    }

    /// Build the wire struct from a chain, taking `start` from its head.
    pub fn from_chain(chain: &RevisionChain) -> Self {
        Self {
            start: chain.head().map(|r| r.generation).unwrap_or(0),
            ids: chain.iter().map(|r| r.hash.clone()).collect(),
        }
    }

    /// Check that `rev` is the head of this chain.
    pub fn ensure_head(&self, rev: &Revision) -> Result<()> {
        if self.start != rev.generation || self.ids.first() != Some(&rev.hash) {
            return Err(RevisionError::HeadMismatch {
                rev: rev.to_string(),
                start: self.start,
            });
        }
        Ok(())
    }
}

/// Ordered revisions of one document, newest first.
///
/// A chain read from a store is contiguous (each generation is one more than
/// the next entry's). A chain manufactured by conflict resolution may carry
/// entries of both divergent branches, so contiguity is checked on demand
/// rather than enforced on construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionChain(Vec<Revision>);

impl RevisionChain {
    pub fn new(revs: Vec<Revision>) -> Result<Self> {
        if revs.is_empty() {
            return Err(RevisionError::EmptyChain);
        }
        Ok(Self(revs))
    }

    /// Parse a list of revision strings, newest first.
    pub fn parse<S: AsRef<str>>(ids: &[S]) -> Result<Self> {
        let revs = ids
            .iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<Revision>>>()?;
        Self::new(revs)
    }

    /// Expand the wire struct into full revisions.
    ///
    /// Ids that would fall below generation 1 (a merged chain can carry more
    /// ids than its start) are dropped.
    pub fn from_revisions(revisions: &Revisions) -> Result<Self> {
        let revs = revisions
            .ids
            .iter()
            .take(revisions.start.min(usize::MAX as u64) as usize)
            .enumerate()
            .map(|(i, id)| Revision::new(revisions.start - i as u64, id.clone()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(revs)
    }

    pub fn head(&self) -> Option<&Revision> {
        self.0.first()
    }

    /// Everything after the head.
    pub fn ancestors(&self) -> &[Revision] {
        self.0.get(1..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Revision> {
        self.0.iter()
    }

    pub fn contains(&self, rev: &Revision) -> bool {
        self.0.contains(rev)
    }

    /// True when each entry is exactly one generation above the next.
    pub fn is_contiguous(&self) -> bool {
        self.0
            .windows(2)
            .all(|pair| pair[1].generation.checked_add(1) == Some(pair[0].generation))
    }

    pub fn into_inner(self) -> Vec<Revision> {
        self.0
    }

    pub(crate) fn push_head(&mut self, rev: Revision) {
        self.0.insert(0, rev);
    }

    pub(crate) fn push_tail(&mut self, rev: Revision) {
        self.0.push(rev);
    }

    /// Remove the head, unless it is the only entry.
    pub(crate) fn pop_head(&mut self) -> Option<Revision> {
        if self.0.len() < 2 {
            return None;
        }
        Some(self.0.remove(0))
    }
}

impl<'a> IntoIterator for &'a RevisionChain {
    type Item = &'a Revision;
    type IntoIter = std::slice::Iter<'a, Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Source of fresh revision hashes.
pub trait HashSource: Send + Sync {
    fn next_hash(&self) -> String;
}

/// Random hex hashes, as a document store would generate them.
#[derive(Debug, Clone)]
pub struct RandomHashes {
    bytes: usize,
}

impl RandomHashes {
    pub const DEFAULT_BYTES: usize = 16;

    pub fn new(bytes: usize) -> Self {
        Self {
            bytes: bytes.max(1),
        }
    }
}

impl Default for RandomHashes {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BYTES)
    }
}

impl HashSource for RandomHashes {
    fn next_hash(&self) -> String {
        use rand::Rng;
        let mut rng = rand::rng();
        (0..self.bytes)
            .map(|_| format!("{:02x}", rng.random::<u8>()))
            .collect()
    }
}

/// Deterministic hashes (`<prefix>0001`, `<prefix>0002`, ...).
///
/// Two sources built with the same prefix produce the same sequence, which is
/// what lets tests assert that two peers converge on identical revisions.
#[derive(Debug)]
pub struct SequentialHashes {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialHashes {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl HashSource for SequentialHashes {
    fn next_hash(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{:04}", self.prefix, n)
    }
}

impl<T: HashSource + ?Sized> HashSource for std::sync::Arc<T> {
    fn next_hash(&self) -> String {
        (**self).next_hash()
    }
}
