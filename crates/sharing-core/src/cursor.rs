//! Pending write context for one replicated change.
//!
//! A `PendingWrite` holds the revision the next forced write must use and the
//! chain to attach as its history. It is created once per incoming change and
//! moved through every step of processing that change. It is not
//! `Clone`: one change, one owner.
//!
//! Some logical operations take two physical writes (an upload first writes a
//! trashed placeholder, then finalizes it). The replication protocol only gives
//! the chain of the final state, so the head revision is stashed during the
//! first write and restored for the second one.

use crate::resolver::{resolve, Resolution};
use crate::revision::{HashSource, Result, Revision, RevisionChain, Revisions};
use tracing::debug;

/// The revision and chain to use for the next forced write.
#[derive(Debug, PartialEq, Eq)]
pub struct PendingWrite {
    rev: Revision,
    /// Wire form written with the document, kept verbatim
    revisions: Revisions,
    /// Same history with every revision at its own generation
    chain: RevisionChain,
}

/// A head revision removed by [`PendingWrite::stash`].
///
/// Not `Clone`: a stash can be restored exactly once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a stash must be given back with PendingWrite::unstash"]
pub struct Stash(Revision);

impl Stash {
    pub fn hash(&self) -> &str {
        self.0.hash()
    }
}

/// Outcome of [`PendingWrite::stash`].
#[derive(Debug)]
pub enum Stashed {
    /// The head was removed; the cursor now targets the previous revision.
    Ready(PendingWrite, Stash),
    /// Not enough revisions in the chain. The caller falls back to revisions
    /// generated by the store for this document.
    Fallback,
}

impl PendingWrite {
    /// Context for writing `rev` with `revisions` as history.
    ///
    /// `rev` must parse and be the head of `revisions`.
    pub fn new(rev: &str, revisions: Revisions) -> Result<Self> {
        let rev: Revision = rev.parse()?;
        revisions.ensure_head(&rev)?;
        let chain = RevisionChain::from_revisions(&revisions)?;
        Ok(Self {
            rev,
            revisions,
            chain,
        })
    }

    /// Context whose target is the head of `chain`.
    pub fn from_chain(chain: &RevisionChain) -> Result<Self> {
        let revisions = Revisions::from_chain(chain);
        let rev = revisions.head_rev()?;
        Ok(Self {
            rev,
            revisions,
            chain: chain.clone(),
        })
    }

    pub fn rev(&self) -> &Revision {
        &self.rev
    }

    pub fn revisions(&self) -> &Revisions {
        &self.revisions
    }

    /// Every revision of the pending history at its real generation.
    ///
    /// Differs from [`Self::revisions`] after a merge: the wire form derives
    /// generations from their position.
    pub fn chain(&self) -> &RevisionChain {
        &self.chain
    }

    pub fn into_parts(self) -> (Revision, Revisions) {
        (self.rev, self.revisions)
    }

    /// Add a fresh revision on top of the chain and target it.
    ///
    /// Used when a local change (e.g. a rename after a name collision) must be
    /// propagated back to the other instances.
    pub fn increment_revision(&mut self, hashes: &dyn HashSource) -> Result<()> {
        let next = self.rev.next(hashes)?;
        self.revisions.start = next.generation();
        self.revisions.ids.insert(0, next.hash().to_string());
        self.chain.push_head(next.clone());
        debug!("Incremented pending revision to {}", next);
        self.rev = next;
        Ok(())
    }

    /// Append a placeholder ancestor when a single revision is left.
    ///
    /// The placeholder is only used by local bookkeeping so that the head can
    /// be stashed for a two-write operation. A head at generation 1 has no room
    /// for an ancestor and is left alone.
    pub fn create_bogus_prev_rev(&mut self, hashes: &dyn HashSource) {
        if self.revisions.ids.len() != 1 || self.revisions.start < 2 {
            return;
        }
        let Ok(bogus) = Revision::new(self.revisions.start - 1, hashes.next_hash()) else {
            return;
        };
        self.revisions.ids.push(bogus.hash().to_string());
        self.chain.push_tail(bogus);
    }

    /// Keep the head revision for later and target the previous one.
    ///
    /// A new document needs at least 2 revisions: one to stash and one for the
    /// next write. An existing document needs 3: the one already stored, the
    /// one for the next write, and the stash.
    pub fn stash(mut self, new_document: bool) -> Stashed {
        let min_revs = if new_document { 2 } else { 3 };
        if self.revisions.ids.len() < min_revs || self.revisions.start < 2 {
            debug!(
                "Cannot stash {} ({} revisions, {} needed)",
                self.rev,
                self.revisions.ids.len(),
                min_revs
            );
            return Stashed::Fallback;
        }
        let Ok(below) = Revision::new(self.revisions.start - 1, self.revisions.ids[1].clone())
        else {
            return Stashed::Fallback;
        };
        if self.chain.pop_head().is_none() {
            return Stashed::Fallback;
        }

        self.revisions.ids.remove(0);
        self.revisions.start = below.generation();
        let stashed = std::mem::replace(&mut self.rev, below);
        Stashed::Ready(self, Stash(stashed))
    }

    /// Put a stashed head back and target it again.
    pub fn unstash(mut self, stash: Stash) -> Self {
        let Stash(rev) = stash;
        self.revisions.start = rev.generation();
        self.revisions.ids.insert(0, rev.hash().to_string());
        self.chain.push_head(rev.clone());
        self.rev = rev;
        self
    }

    /// Reconcile this context with the locally stored chain of the document.
    ///
    /// Returns `None` when one side is strictly ahead: no revision has to be
    /// manufactured and the write can go through the normal path. Otherwise the
    /// context now targets the merged revision.
    pub fn resolve_conflict(
        self,
        local_chain: &RevisionChain,
        hashes: &dyn HashSource,
    ) -> Result<(Option<Self>, Resolution)> {
        let resolution = resolve(&self.rev, &self.chain, local_chain, hashes)?;
        match &resolution {
            Resolution::AdoptAsIs { winner, .. } => {
                debug!(
                    "Conflict on {}: {:?} side is ahead, no forced revision",
                    self.rev, winner
                );
                Ok((None, resolution))
            }
            Resolution::Merged { chain } => {
                let pending = Self::from_chain(chain)?;
                debug!("Conflict on {}: merged into {}", self.rev, pending.rev);
                Ok((Some(pending), resolution))
            }
        }
    }
}
