//! Conflict resolution between two divergent revision chains.
//!
//! When a replicated change does not descend from the locally stored leaf, two
//! cases are possible:
//!
//! 1. The leaves have different generations. The side with the higher
//!    generation wins and its chain is used as is on both instances. Their
//!    ancestors below that point may differ, which is acceptable.
//! 2. The leaves have the same generation (a real concurrent edit). A new
//!    revision is manufactured one generation above, and both ancestor chains
//!    are mixed below it. Each instance applying the resolution ends up on the
//!    same leaf.
//!
//! Mixing order: entries are sorted by descending generation. At equal
//! generation, incoming entries come before local ones, and entries of one side
//! keep their original order. Revisions present on both sides appear once.

use crate::revision::{HashSource, Result, Revision, RevisionChain};
use std::collections::HashSet;

/// Which side of a conflict supplied the winning chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Incoming,
    Local,
}

/// Result of resolving a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// One side is strictly ahead; its chain is kept unchanged.
    AdoptAsIs { winner: Side, chain: RevisionChain },
    /// Same generation on both sides; a fresh revision heads the mixed chain.
    Merged { chain: RevisionChain },
}

impl Resolution {
    /// Head of the chain both instances will converge to.
    pub fn leaf(&self) -> &Revision {
        let chain = match self {
            Resolution::AdoptAsIs { chain, .. } => chain,
            Resolution::Merged { chain } => chain,
        };
        chain
            .head()
            .expect("resolution chains always have a head")
    }
}

/// Decide how to reconcile an incoming chain with the local one.
///
/// `incoming_leaf` is the revision the peer proposes; `incoming_chain` is its
/// history, headed by that revision. An incoming chain that does not start with
/// `incoming_leaf` is treated as the leaf's ancestors.
///
/// Fails only when the merged revision would need a generation past `u64::MAX`.
pub fn resolve(
    incoming_leaf: &Revision,
    incoming_chain: &RevisionChain,
    local_chain: &RevisionChain,
    hashes: &dyn HashSource,
) -> Result<Resolution> {
    let incoming = with_head(incoming_leaf, incoming_chain);
    let Some(local_leaf) = local_chain.head() else {
        return Ok(Resolution::AdoptAsIs {
            winner: Side::Incoming,
            chain: incoming,
        });
    };

    if local_leaf.generation() != incoming_leaf.generation() {
        let resolution = if incoming_leaf.generation() > local_leaf.generation() {
            Resolution::AdoptAsIs {
                winner: Side::Incoming,
                chain: incoming,
            }
        } else {
            Resolution::AdoptAsIs {
                winner: Side::Local,
                chain: local_chain.clone(),
            }
        };
        return Ok(resolution);
    }

    let fresh = local_leaf.next(hashes)?;
    let mut revs = vec![fresh];
    if !incoming.ancestors().is_empty() {
        revs.extend(mixup(incoming.ancestors(), local_chain.ancestors()));
    }

    Ok(Resolution::Merged {
        chain: RevisionChain::new(revs)?,
    })
}

/// Interleave two newest-first revision lists without duplicates.
pub fn mixup(incoming: &[Revision], local: &[Revision]) -> Vec<Revision> {
    let mut mixed = Vec::with_capacity(incoming.len() + local.len());
    let mut seen: HashSet<&Revision> = HashSet::new();
    let (mut i, mut j) = (0, 0);

    while i < incoming.len() || j < local.len() {
        let take_incoming = match (incoming.get(i), local.get(j)) {
            (Some(a), Some(b)) => a.generation() >= b.generation(),
            (Some(_), None) => true,
            (None, _) => false,
        };
        let rev = if take_incoming {
            i += 1;
            &incoming[i - 1]
        } else {
            j += 1;
            &local[j - 1]
        };
        if seen.insert(rev) {
            mixed.push(rev.clone());
        }
    }

    mixed
}

fn with_head(leaf: &Revision, chain: &RevisionChain) -> RevisionChain {
    if chain.head() == Some(leaf) {
        return chain.clone();
    }
    let mut revs = Vec::with_capacity(chain.len() + 1);
    revs.push(leaf.clone());
    revs.extend(chain.iter().cloned());
    RevisionChain::new(revs).expect("chain has the incoming leaf")
}
