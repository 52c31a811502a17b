//! Applies replicated changes to the local instance.
//!
//! Each change gets its own `PendingWrite` and its own `ForcedWriteIndexer`:
//! 1. Parse and validate the change.
//! 2. Compare the incoming chain with the stored one: new document, fast
//!    forward, already known, or divergent (conflict resolution).
//! 3. Rename on a local name collision, adding one revision.
//! 4. Write through the forced indexer, guarded by the leaf read in step 2, and
//!    record the written chain in the document's `SharedRef`.
//!
//! A local write landing between steps 2 and 4 fails the change with a
//! storage conflict ([`ReplicateError::is_conflict`]); applying it again
//! resolves against the new leaf.

use crate::config::SharingConfig;
use crate::cursor::PendingWrite;
use crate::docs::{join_path, DirDoc, DirOrFile, FileDoc, DIR_TYPE, ROOT_DIR_ID, TRASH_DIR_ID};
use crate::forced::ForcedWriteIndexer;
use crate::indexer::{IndexError, Indexer, StoreIndexer};
use crate::protocol::{IncomingChange, ParsedChange, ProtocolError, ReplicationBatch};
use crate::realtime::EventBus;
use crate::resolver::{Resolution, Side};
use crate::revision::{HashSource, RevisionChain, RevisionError};
use crate::shared::{SharedError, SharedRef, SharedRefs};
use crate::store::{DocStore, Expected, StoreError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReplicateError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Revision error: {0}")]
    Revision(#[from] RevisionError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Shared reference error: {0}")]
    Shared(#[from] SharedError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Doctype {0} is not replicated")]
    UnsupportedDoctype(String),

    #[error("{0} changed between file and directory")]
    TypeMismatch(String),

    #[error("No free name for {name} in {dir_id}")]
    NameCollision { dir_id: String, name: String },
}

impl ReplicateError {
    /// The document moved while the change was applied; the change has to be
    /// resolved again against the new leaf.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ReplicateError::Store(StoreError::Conflict { .. })
                | ReplicateError::Index(IndexError::Store(StoreError::Conflict { .. }))
        )
    }
}

pub type Result<T> = std::result::Result<T, ReplicateError>;

/// What applying one change did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// New document stored with the incoming revision
    Created,
    /// The incoming chain extends the stored one
    FastForwarded,
    /// Divergent, the incoming side was ahead and its chain was adopted
    AdoptedIncoming,
    /// Divergent, the local side was ahead: nothing written
    KeptLocal,
    /// Divergent at the same generation: a merged revision was manufactured
    Merged,
    /// The incoming revision is already in the stored chain
    AlreadyKnown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub id: String,
    pub outcome: Outcome,
    /// Stored revision after the change
    pub rev: String,
    /// New name given after a local name collision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_to: Option<String>,
}

/// Result of a whole batch. A failed change does not stop the batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub applied: Vec<ApplyReport>,
    pub failed: Vec<(String, ReplicateError)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

type Forced<S> = ForcedWriteIndexer<StoreIndexer<S>, S>;

/// Replicates changes of one sharing into a local instance.
pub struct Replicator<S: DocStore + Clone> {
    store: S,
    bus: Arc<EventBus>,
    config: SharingConfig,
    hashes: Arc<dyn HashSource>,
    refs: SharedRefs<S>,
    sharing_id: String,
}

impl<S: DocStore + Clone> Replicator<S> {
    pub fn new(
        store: S,
        bus: Arc<EventBus>,
        config: SharingConfig,
        hashes: Arc<dyn HashSource>,
        sharing_id: &str,
    ) -> Self {
        Self {
            refs: SharedRefs::new(store.clone(), &config),
            store,
            bus,
            config,
            hashes,
            sharing_id: sharing_id.to_string(),
        }
    }

    /// The normal indexer of the instance.
    pub fn indexer(&self) -> StoreIndexer<S> {
        StoreIndexer::new(self.store.clone(), Arc::clone(&self.bus), &self.config)
    }

    pub fn shared_refs(&self) -> &SharedRefs<S> {
        &self.refs
    }

    /// Create the root and trash directories.
    pub async fn init(&self) -> Result<()> {
        self.indexer().init_index().await?;
        Ok(())
    }

    fn forced(&self, pending: PendingWrite, shared: SharedRef, expected: Expected) -> Forced<S> {
        ForcedWriteIndexer::new(
            self.indexer(),
            self.store.clone(),
            Arc::clone(&self.bus),
            &self.config,
            Arc::clone(&self.hashes),
        )
        .with_pending(pending)
        .with_shared(shared)
        .expecting(expected)
    }

    /// Apply every change in order, collecting failures per document.
    pub async fn apply_batch(&self, batch: &ReplicationBatch) -> BatchReport {
        let mut report = BatchReport::default();
        for change in &batch.changes {
            match self.apply(change).await {
                Ok(applied) => report.applied.push(applied),
                Err(e) => {
                    let id = change.id().unwrap_or("<no id>").to_string();
                    warn!("Cannot replicate {}: {}", id, e);
                    report.failed.push((id, e));
                }
            }
        }
        info!(
            "Applied {} change(s), {} failed",
            report.applied.len(),
            report.failed.len()
        );
        report
    }

    /// Apply one replicated change.
    pub async fn apply(&self, change: &IncomingChange) -> Result<ApplyReport> {
        if change.doctype != self.config.files_doctype {
            return Err(ReplicateError::UnsupportedDoctype(change.doctype.clone()));
        }
        let ParsedChange { doc, pending } = change.parse()?;
        let id = doc.id().to_string();
        // Persisted only once the document is written
        let mut shared = self
            .refs
            .load_or_new(&self.config.files_doctype, &id, &self.sharing_id, 0)
            .await?;

        let Some(local) = self.store.get(&self.config.files_doctype, &id).await? else {
            debug!("{} is new, creating it at {}", id, pending.rev());
            let forced = self.forced(pending, shared, Expected::Absent);
            return self.create(doc, forced).await;
        };

        let local_chain = RevisionChain::from_revisions(&local.revisions)?;
        if local_chain.contains(pending.rev()) {
            debug!("{} already has {}", id, pending.rev());
            self.refs.record_chain(&mut shared, pending.chain()).await?;
            return Ok(ApplyReport {
                id,
                outcome: Outcome::AlreadyKnown,
                rev: local.rev,
                renamed_to: None,
            });
        }
        // Both histories are known from now on, whatever gets written
        let incoming_chain = pending.chain().clone();
        shared.add_chain(&local_chain);
        shared.add_chain(&incoming_chain);

        let local_doc = DirOrFile::from_stored(local.clone()).map_err(IndexError::from)?;
        let expected = Expected::Rev(local.rev.clone());
        let fast_forward = local_chain
            .head()
            .map(|head| incoming_chain.contains(head))
            .unwrap_or(false);
        if fast_forward {
            let forced = self.forced(pending, shared, expected);
            return self
                .update(local_doc, doc, forced, Outcome::FastForwarded)
                .await;
        }

        let (merged, resolution) = pending.resolve_conflict(&local_chain, self.hashes.as_ref())?;
        match (merged, resolution) {
            (Some(pending), _) => {
                info!("Conflict on {}, merged into {}", id, pending.rev());
                let forced = self.forced(pending, shared, expected);
                self.update(local_doc, doc, forced, Outcome::Merged).await
            }
            (None, Resolution::AdoptAsIs { winner: Side::Incoming, chain }) => {
                let forced = self.forced(PendingWrite::from_chain(&chain)?, shared, expected);
                self.update(local_doc, doc, forced, Outcome::AdoptedIncoming)
                    .await
            }
            (None, _) => {
                debug!("{} is ahead locally at {}", id, local.rev);
                self.refs.record_chain(&mut shared, &incoming_chain).await?;
                Ok(ApplyReport {
                    id,
                    outcome: Outcome::KeptLocal,
                    rev: local.rev,
                    renamed_to: None,
                })
            }
        }
    }

    async fn create(&self, mut doc: DirOrFile, mut forced: Forced<S>) -> Result<ApplyReport> {
        let (parent, renamed_to) = self.place(&mut forced, &mut doc).await?;
        let id = doc.id().to_string();

        match doc {
            DirOrFile::Dir(mut dir) => {
                dir.path = join_path(&parent.path, &dir.name);
                forced.create_named_dir_doc(&mut dir).await?;
            }
            DirOrFile::File(mut file) => {
                let upload = !file.md5sum.is_empty()
                    && forced
                        .pending()
                        .map(|p| p.rev().generation() >= 2)
                        .unwrap_or(false);
                if upload {
                    let mut placeholder = file.clone();
                    placeholder.trashed = true;
                    forced.create_named_file_doc(&mut placeholder).await?;
                    file.rev = placeholder.rev.clone();
                    forced
                        .update_file_doc(Some(&placeholder), &mut file)
                        .await?;
                } else if file.trashed {
                    // A trashed create would be taken for an upload placeholder
                    forced.update_file_doc(None, &mut file).await?;
                } else {
                    forced.create_named_file_doc(&mut file).await?;
                }
            }
        }
        self.finish(forced, id, Outcome::Created, renamed_to).await
    }

    async fn update(
        &self,
        local: DirOrFile,
        mut doc: DirOrFile,
        mut forced: Forced<S>,
        outcome: Outcome,
    ) -> Result<ApplyReport> {
        let (parent, renamed_to) = self.place(&mut forced, &mut doc).await?;
        let id = doc.id().to_string();

        match (local, doc) {
            (DirOrFile::File(old), DirOrFile::File(mut file)) => {
                file.rev = old.rev.clone();
                forced.update_file_doc(Some(&old), &mut file).await?;
            }
            (DirOrFile::Dir(old), DirOrFile::Dir(mut dir)) => {
                dir.rev = old.rev.clone();
                dir.path = join_path(&parent.path, &dir.name);
                forced.update_dir_doc(Some(&old), &mut dir).await?;
            }
            _ => return Err(ReplicateError::TypeMismatch(id)),
        }
        self.finish(forced, id, outcome, renamed_to).await
    }

    /// Check the parent directory and give the document a free name in it.
    ///
    /// A rename adds one revision on top of the pending chain so that the new
    /// name replicates back to the other instances.
    async fn place(
        &self,
        forced: &mut Forced<S>,
        doc: &mut DirOrFile,
    ) -> Result<(DirDoc, Option<String>)> {
        let parent = forced.dir_by_id(doc.dir_id()).await?;
        let children = forced.dir_children(&parent).await?;
        let taken = |name: &str| {
            children
                .iter()
                .any(|c| c.name() == name && c.id() != doc.id())
        };
        if !taken(doc.name()) {
            return Ok((parent, None));
        }

        let is_file = matches!(doc, DirOrFile::File(_));
        let original = doc.name().to_string();
        let free = (2..)
            .take(self.config.max_conflict_renames as usize)
            .map(|n| conflict_name(&original, n, is_file))
            .find(|candidate| !taken(candidate))
            .ok_or_else(|| ReplicateError::NameCollision {
                dir_id: parent.id.clone(),
                name: original.clone(),
            })?;

        match doc {
            DirOrFile::Dir(dir) => dir.name = free.clone(),
            DirOrFile::File(file) => file.name = free.clone(),
        }
        forced.increment_revision()?;
        info!("Name collision on {}, renamed to {}", original, free);
        Ok((parent, Some(free)))
    }

    async fn finish(
        &self,
        forced: Forced<S>,
        id: String,
        outcome: Outcome,
        renamed_to: Option<String>,
    ) -> Result<ApplyReport> {
        let (pending, shared) = forced.into_parts();
        let stored = self
            .store
            .get(&self.config.files_doctype, &id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                doctype: self.config.files_doctype.clone(),
                id: id.clone(),
            })?;
        if let Some(mut shared) = shared {
            match &pending {
                Some(pending) => self.refs.record_chain(&mut shared, pending.chain()).await?,
                // Fell back to revisions generated by the store
                None => {
                    self.refs
                        .update_file_shared(&mut shared, &stored.revisions)
                        .await?
                }
            }
        }
        debug!("{} is now at {} ({:?})", id, stored.rev, outcome);
        Ok(ApplyReport {
            id,
            outcome,
            rev: stored.rev,
            renamed_to,
        })
    }

    /// Every replicable document, parents before children.
    pub async fn export(&self) -> Result<ReplicationBatch> {
        let doctype = &self.config.files_doctype;
        let mut docs: Vec<_> = self
            .store
            .all(doctype)
            .await?
            .into_iter()
            .filter(|d| d.id != ROOT_DIR_ID && d.id != TRASH_DIR_ID)
            .collect();
        docs.sort_by_key(|d| {
            let is_dir = d.body.get("type").and_then(Value::as_str) == Some(DIR_TYPE);
            let depth = d
                .body
                .get("path")
                .and_then(Value::as_str)
                .map(|p| p.matches('/').count())
                .unwrap_or(0);
            (!is_dir, depth)
        });
        Ok(ReplicationBatch::new(
            docs.iter()
                .map(|d| IncomingChange::from_stored(doctype, d))
                .collect(),
        ))
    }

    /// Current state of a file or directory.
    pub async fn get(&self, id: &str) -> Result<DirOrFile> {
        Ok(self.indexer().dir_or_file_by_id(id).await?)
    }

    /// Current state of a file.
    pub async fn file(&self, id: &str) -> Result<FileDoc> {
        Ok(self.indexer().file_by_id(id).await?)
    }
}

/// Name given to a document whose name is already taken: `"<stem> (<n>).<ext>"`.
pub fn conflict_name(name: &str, n: u32, is_file: bool) -> String {
    if is_file {
        if let Some((stem, ext)) = name.rsplit_once('.') {
            if !stem.is_empty() {
                return format!("{} ({}).{}", stem, n, ext);
            }
        }
    }
    format!("{} ({})", name, n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{Revision, Revisions, SequentialHashes};
    use crate::store::{ForcedDoc, MemoryStore, StoredDoc};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    const FILES: &str = "io.cozy.files";

    async fn replicator() -> Replicator<Arc<MemoryStore>> {
        let store = Arc::new(MemoryStore::with_hashes(Arc::new(SequentialHashes::new("s"))));
        let replicator = Replicator::new(
            store,
            Arc::new(EventBus::new()),
            SharingConfig::default(),
            Arc::new(SequentialHashes::new("m")),
            "sharing-1",
        );
        replicator.init().await.unwrap();
        replicator
    }

    fn revs(start: u64, ids: &[&str]) -> Revisions {
        Revisions::new(start, ids.iter().map(|s| s.to_string()).collect())
    }

    fn file_change(id: &str, name: &str, start: u64, ids: &[&str], md5sum: &str) -> IncomingChange {
        IncomingChange {
            doctype: FILES.into(),
            doc: json!({
                "_id": id,
                "type": "file",
                "name": name,
                "dir_id": ROOT_DIR_ID,
                "created_at": "2024-05-01T10:00:00Z",
                "updated_at": "2024-05-01T10:00:00Z",
                "size": "4",
                "md5sum": md5sum,
            }),
            rev: format!("{}-{}", start, ids[0]),
            revisions: revs(start, ids),
        }
    }

    fn dir_change(id: &str, name: &str, start: u64, ids: &[&str]) -> IncomingChange {
        IncomingChange {
            doctype: FILES.into(),
            doc: json!({
                "_id": id,
                "type": "directory",
                "name": name,
                "dir_id": ROOT_DIR_ID,
                "path": format!("/{}", name),
                "created_at": "2024-05-01T10:00:00Z",
                "updated_at": "2024-05-01T10:00:00Z",
            }),
            rev: format!("{}-{}", start, ids[0]),
            revisions: revs(start, ids),
        }
    }

    #[test]
    fn test_conflict_name() {
        assert_eq!(conflict_name("a.txt", 2, true), "a (2).txt");
        assert_eq!(conflict_name("archive.tar.gz", 3, true), "archive.tar (3).gz");
        assert_eq!(conflict_name(".bashrc", 2, true), ".bashrc (2)");
        assert_eq!(conflict_name("v1.0", 2, false), "v1.0 (2)");
    }

    #[tokio::test]
    async fn test_new_directory_gets_incoming_revision() {
        let r = replicator().await;
        let report = r.apply(&dir_change("d1", "Photos", 1, &["aaa"])).await.unwrap();
        assert_eq!(report.outcome, Outcome::Created);
        assert_eq!(report.rev, "1-aaa");
        match r.get("d1").await.unwrap() {
            DirOrFile::Dir(d) => assert_eq!(d.path, "/Photos"),
            DirOrFile::File(_) => panic!("expected a directory"),
        }
    }

    #[tokio::test]
    async fn test_new_file_with_content_is_uploaded_in_two_writes() {
        let r = replicator().await;
        let (_sub, events) = r.bus.record();
        let change = file_change("f1", "a.txt", 2, &["bbb", "aaa"], "md5");

        let report = r.apply(&change).await.unwrap();
        assert_eq!(report.rev, "2-bbb");
        let file = r.file("f1").await.unwrap();
        assert!(!file.trashed);

        // Placeholder write emits nothing, finalize emits an update
        let verbs: Vec<&str> = events.lock().unwrap().iter().map(|e| e.verb()).collect();
        assert_eq!(verbs, vec!["updated"]);

        let shared = r.refs.get(FILES, "f1").await.unwrap().unwrap();
        assert_eq!(shared.known().len(), 2);
    }

    #[tokio::test]
    async fn test_fast_forward_and_already_known() {
        let r = replicator().await;
        r.apply(&file_change("f1", "a.txt", 1, &["aaa"], "")).await.unwrap();

        let change = file_change("f1", "a.txt", 3, &["ccc", "bbb", "aaa"], "");
        let report = r.apply(&change).await.unwrap();
        assert_eq!(report.outcome, Outcome::FastForwarded);
        assert_eq!(report.rev, "3-ccc");

        let report = r.apply(&change).await.unwrap();
        assert_eq!(report.outcome, Outcome::AlreadyKnown);

        let older = file_change("f1", "a.txt", 2, &["bbb", "aaa"], "");
        assert_eq!(r.apply(&older).await.unwrap().outcome, Outcome::AlreadyKnown);
    }

    #[tokio::test]
    async fn test_concurrent_edit_at_same_generation_is_merged() {
        let r = replicator().await;
        r.apply(&file_change("f1", "a.txt", 2, &["local", "root"], "")).await.unwrap();

        let report = r
            .apply(&file_change("f1", "a.txt", 2, &["remote", "root"], ""))
            .await
            .unwrap();
        assert_eq!(report.outcome, Outcome::Merged);
        assert_eq!(report.rev, "3-m0001");

        let known = |shared: &SharedRef| -> BTreeSet<String> {
            shared.known().iter().map(Revision::to_string).collect()
        };
        let expected: BTreeSet<String> = ["1-root", "2-local", "2-remote", "3-m0001"]
            .into_iter()
            .map(String::from)
            .collect();
        let shared = r.refs.get(FILES, "f1").await.unwrap().unwrap();
        assert_eq!(known(&shared), expected);

        // The merged revision coming back in its stored form reads as 3-m0001, 2-root
        let stored = r.store.get(FILES, "f1").await.unwrap().unwrap();
        let echo = IncomingChange::from_stored(FILES, &stored);
        assert_eq!(r.apply(&echo).await.unwrap().outcome, Outcome::AlreadyKnown);
        let shared = r.refs.get(FILES, "f1").await.unwrap().unwrap();
        assert_eq!(known(&shared), expected);
    }

    #[tokio::test]
    async fn test_merge_past_max_generation_fails_without_writing() {
        let r = replicator().await;
        r.apply(&file_change("f1", "a.txt", u64::MAX, &["local"], ""))
            .await
            .unwrap();

        let err = r
            .apply(&file_change("f1", "b.txt", u64::MAX, &["remote"], ""))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReplicateError::Revision(RevisionError::GenerationOverflow(u64::MAX))
        ));
        let file = r.file("f1").await.unwrap();
        assert_eq!(file.rev, format!("{}-local", u64::MAX));
        assert_eq!(file.name, "a.txt");
    }

    #[tokio::test]
    async fn test_divergent_with_incoming_ahead_adopts_incoming_chain() {
        let r = replicator().await;
        r.apply(&file_change("f1", "a.txt", 2, &["local", "root"], "")).await.unwrap();

        let report = r
            .apply(&file_change("f1", "b.txt", 3, &["r3", "r2", "root"], ""))
            .await
            .unwrap();
        assert_eq!(report.outcome, Outcome::AdoptedIncoming);
        assert_eq!(report.rev, "3-r3");
        assert_eq!(r.file("f1").await.unwrap().name, "b.txt");
    }

    #[tokio::test]
    async fn test_divergent_with_local_ahead_keeps_local() {
        let r = replicator().await;
        r.apply(&file_change("f1", "a.txt", 3, &["l3", "l2", "root"], "")).await.unwrap();

        let report = r
            .apply(&file_change("f1", "b.txt", 2, &["r2", "root"], ""))
            .await
            .unwrap();
        assert_eq!(report.outcome, Outcome::KeptLocal);
        assert_eq!(report.rev, "3-l3");
        assert_eq!(r.file("f1").await.unwrap().name, "a.txt");
    }

    #[tokio::test]
    async fn test_name_collision_renames_and_adds_one_revision() {
        let r = replicator().await;
        r.apply(&file_change("f1", "a.txt", 1, &["aaa"], "")).await.unwrap();

        let report = r
            .apply(&file_change("f2", "a.txt", 1, &["bbb"], ""))
            .await
            .unwrap();
        assert_eq!(report.renamed_to.as_deref(), Some("a (2).txt"));
        assert_eq!(report.rev, "2-m0001");
        assert_eq!(r.file("f2").await.unwrap().name, "a (2).txt");
        assert_eq!(r.file("f1").await.unwrap().name, "a.txt");
    }

    #[tokio::test]
    async fn test_batch_collects_failures() {
        let r = replicator().await;
        let mut bad = file_change("bad", "x.txt", 1, &["aaa"], "");
        bad.rev = "one-aaa".into();
        let mut orphan = file_change("orphan", "y.txt", 1, &["aaa"], "");
        orphan.doc["dir_id"] = json!("missing");
        let batch = ReplicationBatch::new(vec![
            bad,
            orphan,
            file_change("ok", "z.txt", 1, &["aaa"], ""),
        ]);

        let report = r.apply_batch(&batch).await;
        assert!(!report.is_success());
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].id, "ok");
        assert_eq!(report.failed.len(), 2);
        assert!(matches!(
            report.failed[0].1,
            ReplicateError::Protocol(ProtocolError::Revision(_))
        ));
        assert!(matches!(
            report.failed[1].1,
            ReplicateError::Index(IndexError::NotFound(_))
        ));
        assert!(r.store.get(FILES, "orphan").await.unwrap().is_none());
        assert!(r.refs.get(FILES, "orphan").await.unwrap().is_none());
        assert!(r.refs.get(FILES, "ok").await.unwrap().is_some());
    }

    /// Store on which a local edit lands right before the next forced write.
    #[derive(Clone)]
    struct RacingStore {
        inner: Arc<MemoryStore>,
        armed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DocStore for RacingStore {
        async fn get(&self, doctype: &str, id: &str) -> crate::store::Result<Option<StoredDoc>> {
            self.inner.get(doctype, id).await
        }

        async fn all(&self, doctype: &str) -> crate::store::Result<Vec<StoredDoc>> {
            self.inner.all(doctype).await
        }

        async fn create(&self, doctype: &str, id: &str, body: Value) -> crate::store::Result<String> {
            self.inner.create(doctype, id, body).await
        }

        async fn update(
            &self,
            doctype: &str,
            id: &str,
            expected_rev: &str,
            body: Value,
        ) -> crate::store::Result<String> {
            self.inner.update(doctype, id, expected_rev, body).await
        }

        async fn delete(&self, doctype: &str, id: &str, expected_rev: &str) -> crate::store::Result<()> {
            self.inner.delete(doctype, id, expected_rev).await
        }

        async fn bulk_force_update(
            &self,
            doctype: &str,
            docs: Vec<ForcedDoc>,
        ) -> crate::store::Result<()> {
            if self.armed.swap(false, Ordering::SeqCst) {
                for doc in &docs {
                    if let Some(stored) = self.inner.get(doctype, &doc.id).await? {
                        let mut body = stored.body.clone();
                        body["name"] = json!("local edit.txt");
                        self.inner.update(doctype, &doc.id, &stored.rev, body).await?;
                    }
                }
            }
            self.inner.bulk_force_update(doctype, docs).await
        }
    }

    #[tokio::test]
    async fn test_local_write_during_apply_is_a_conflict() {
        let store = RacingStore {
            inner: Arc::new(MemoryStore::with_hashes(Arc::new(SequentialHashes::new("s")))),
            armed: Arc::new(AtomicBool::new(false)),
        };
        let r = Replicator::new(
            store.clone(),
            Arc::new(EventBus::new()),
            SharingConfig::default(),
            Arc::new(SequentialHashes::new("m")),
            "sharing-1",
        );
        r.init().await.unwrap();
        r.apply(&file_change("f1", "a.txt", 1, &["aaa"], "")).await.unwrap();

        store.armed.store(true, Ordering::SeqCst);
        let change = file_change("f1", "a.txt", 3, &["ccc", "bbb", "aaa"], "");
        let err = r.apply(&change).await.unwrap_err();
        assert!(err.is_conflict(), "{:?}", err);

        // The local edit survives and the record did not learn the rejected chain
        let file = r.file("f1").await.unwrap();
        assert_eq!(file.name, "local edit.txt");
        assert!(file.rev.starts_with("2-s"));
        let shared = r.refs.get(FILES, "f1").await.unwrap().unwrap();
        assert!(!shared.knows(&"3-ccc".parse().unwrap()));

        // Applied again, the change is resolved against the new leaf
        let report = r.apply(&change).await.unwrap();
        assert_eq!(report.outcome, Outcome::AdoptedIncoming);
        assert_eq!(report.rev, "3-ccc");
    }

    #[tokio::test]
    async fn test_other_doctypes_are_rejected() {
        let r = replicator().await;
        let mut change = file_change("f1", "a.txt", 1, &["aaa"], "");
        change.doctype = "io.cozy.contacts".into();
        assert!(matches!(
            r.apply(&change).await,
            Err(ReplicateError::UnsupportedDoctype(_))
        ));
    }

    #[tokio::test]
    async fn test_export_puts_directories_first() {
        let r = replicator().await;
        r.apply(&file_change("f1", "a.txt", 1, &["aaa"], "")).await.unwrap();
        r.apply(&dir_change("d1", "Photos", 1, &["bbb"])).await.unwrap();

        let batch = r.export().await.unwrap();
        let ids: Vec<&str> = batch.changes.iter().filter_map(|c| c.id()).collect();
        assert_eq!(ids, vec!["d1", "f1"]);
    }
}
