//! Known revisions of shared documents.
//!
//! Each shared document has a `SharedRef` record listing every revision known
//! to have been produced for it, on this instance or on any peer. The record is
//! updated after every forced write and read by the replication rounds that
//! decide what each peer still needs.
//!
//! Records live in the shared doctype, keyed by `"<doctype>/<doc id>"`.

use crate::config::SharingConfig;
use crate::revision::{Revision, RevisionChain, RevisionError, Revisions};
use crate::store::{DocStore, StoreError, StoredDoc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Revision error: {0}")]
    Revision(#[from] RevisionError),

    #[error("Invalid shared reference id: {0}")]
    InvalidId(String),
}

pub type Result<T> = std::result::Result<T, SharedError>;

/// Sharing-specific state of a shared document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedInfo {
    /// Index of the sharing rule that matched the document
    pub rule: usize,
    /// The document left this sharing
    #[serde(default)]
    pub removed: bool,
    /// The document is a file whose content is replicated too
    #[serde(default)]
    pub binary: bool,
}

/// Record of the revisions known for one shared document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedRef {
    #[serde(skip)]
    pub sid: String,
    /// Revision of the record itself in the store
    #[serde(skip)]
    pub rev: String,
    /// Known revisions, ordered by generation then hash
    #[serde(default)]
    revisions: Vec<Revision>,
    /// Per sharing state, keyed by sharing id
    #[serde(default)]
    pub infos: BTreeMap<String, SharedInfo>,
}

impl SharedRef {
    pub fn new(doctype: &str, doc_id: &str) -> Self {
        Self {
            sid: format!("{}/{}", doctype, doc_id),
            rev: String::new(),
            revisions: Vec::new(),
            infos: BTreeMap::new(),
        }
    }

    /// Id of the shared document (after the doctype prefix).
    pub fn doc_id(&self) -> &str {
        self.sid.split_once('/').map(|(_, id)| id).unwrap_or(&self.sid)
    }

    pub fn doctype(&self) -> &str {
        self.sid.split_once('/').map(|(dt, _)| dt).unwrap_or("")
    }

    pub fn known(&self) -> &[Revision] {
        &self.revisions
    }

    pub fn knows(&self, rev: &Revision) -> bool {
        self.revisions.binary_search(rev).is_ok()
    }

    /// Revisions at the highest known generation.
    pub fn leaves(&self) -> Vec<&Revision> {
        let Some(max) = self.revisions.last().map(Revision::generation) else {
            return Vec::new();
        };
        self.revisions
            .iter()
            .filter(|r| r.generation() == max)
            .collect()
    }

    /// Record the revisions of `chain`, newest first, down to the first one
    /// already known. Returns how many were new.
    ///
    /// Entries below a known revision were recorded with it. Stopping there
    /// keeps a stored merged chain, whose older generations are positional,
    /// from adding revisions that never existed.
    pub fn add_chain(&mut self, chain: &RevisionChain) -> usize {
        let mut added = 0;
        for rev in chain {
            match self.revisions.binary_search(rev) {
                Ok(_) => break,
                Err(pos) => {
                    self.revisions.insert(pos, rev.clone());
                    added += 1;
                }
            }
        }
        added
    }

    /// Record every revision of a wire chain. Returns how many were new.
    pub fn add_revisions(&mut self, revisions: &Revisions) -> Result<usize> {
        let chain = RevisionChain::from_revisions(revisions)?;
        Ok(self.add_chain(&chain))
    }

    /// Attach the document to a sharing.
    pub fn add_sharing(&mut self, sharing_id: &str, rule: usize, binary: bool) {
        self.infos.insert(
            sharing_id.to_string(),
            SharedInfo {
                rule,
                removed: false,
                binary,
            },
        );
    }

    /// Mark the document as removed from one sharing.
    pub fn mark_removed(&mut self, sharing_id: &str) {
        if let Some(info) = self.infos.get_mut(sharing_id) {
            info.removed = true;
        }
    }

    /// True when no sharing still holds the document.
    pub fn is_removed_everywhere(&self) -> bool {
        self.infos.values().all(|info| info.removed)
    }

    fn from_stored(doc: StoredDoc) -> Result<Self> {
        let mut shared: SharedRef = serde_json::from_value(doc.body)?;
        shared.sid = doc.id;
        shared.rev = doc.rev;
        Ok(shared)
    }
}

/// Persists `SharedRef` records in a document store.
#[derive(Clone)]
pub struct SharedRefs<S: DocStore> {
    store: S,
    doctype: String,
    /// Documents of this doctype carry replicated content
    files_doctype: String,
}

impl<S: DocStore> SharedRefs<S> {
    pub fn new(store: S, config: &SharingConfig) -> Self {
        Self {
            store,
            doctype: config.shared_doctype.clone(),
            files_doctype: config.files_doctype.clone(),
        }
    }

    /// Record for a document of `doctype`, if it is shared.
    pub async fn get(&self, doctype: &str, doc_id: &str) -> Result<Option<SharedRef>> {
        let sid = format!("{}/{}", doctype, doc_id);
        match self.store.get(&self.doctype, &sid).await? {
            Some(doc) => Ok(Some(SharedRef::from_stored(doc)?)),
            None => Ok(None),
        }
    }

    /// Record for a document, created and persisted if missing.
    pub async fn create_or_get(
        &self,
        doctype: &str,
        doc_id: &str,
        sharing_id: &str,
        rule: usize,
    ) -> Result<SharedRef> {
        let (mut shared, attached) = self.load_attached(doctype, doc_id, sharing_id, rule).await?;
        if attached {
            self.save(&mut shared).await?;
            debug!("Saved shared reference {}", shared.sid);
        }
        Ok(shared)
    }

    /// Record for a document, attached to `sharing_id`, without persisting.
    ///
    /// A document not shared yet gets a fresh record with an empty `rev`; it
    /// is stored by the first [`Self::update_file_shared`] or
    /// [`Self::record_chain`], once the document itself was written.
    pub async fn load_or_new(
        &self,
        doctype: &str,
        doc_id: &str,
        sharing_id: &str,
        rule: usize,
    ) -> Result<SharedRef> {
        let (shared, _) = self.load_attached(doctype, doc_id, sharing_id, rule).await?;
        Ok(shared)
    }

    async fn load_attached(
        &self,
        doctype: &str,
        doc_id: &str,
        sharing_id: &str,
        rule: usize,
    ) -> Result<(SharedRef, bool)> {
        let mut shared = match self.get(doctype, doc_id).await? {
            Some(shared) => shared,
            None => SharedRef::new(doctype, doc_id),
        };
        let attached = !shared.infos.contains_key(sharing_id);
        if attached {
            shared.add_sharing(sharing_id, rule, doctype == self.files_doctype);
        }
        Ok((shared, attached))
    }

    /// Add a freshly stored chain to the known revisions and persist.
    ///
    /// Errors are surfaced: a stale record would make later rounds diverge.
    pub async fn update_file_shared(
        &self,
        shared: &mut SharedRef,
        revisions: &Revisions,
    ) -> Result<()> {
        let chain = RevisionChain::from_revisions(revisions)?;
        self.record_chain(shared, &chain).await
    }

    /// Same as [`Self::update_file_shared`] for a chain whose generations are
    /// already known, such as a merged chain.
    pub async fn record_chain(&self, shared: &mut SharedRef, chain: &RevisionChain) -> Result<()> {
        let added = shared.add_chain(chain);
        self.save(shared).await?;
        debug!("Recorded {} new revision(s) for {}", added, shared.sid);
        Ok(())
    }

    /// Delete the record of a document permanently removed from the share.
    pub async fn remove(&self, shared: &SharedRef) -> Result<()> {
        if shared.rev.is_empty() {
            return Ok(());
        }
        self.store.delete(&self.doctype, &shared.sid, &shared.rev).await?;
        debug!("Removed shared reference {}", shared.sid);
        Ok(())
    }

    async fn save(&self, shared: &mut SharedRef) -> Result<()> {
        if !shared.sid.contains('/') {
            return Err(SharedError::InvalidId(shared.sid.clone()));
        }
        let body = serde_json::to_value(&*shared)?;
        shared.rev = if shared.rev.is_empty() {
            self.store.create(&self.doctype, &shared.sid, body).await?
        } else {
            self.store
                .update(&self.doctype, &shared.sid, &shared.rev, body)
                .await?
        };
        Ok(())
    }
}
