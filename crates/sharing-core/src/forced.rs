//! ForcedWriteIndexer: writes replicated documents with pre-determined revisions.
//!
//! Wraps another [`Indexer`]. Without a pending write every call is delegated.
//! With one, creates and updates of files and directories bypass the store's
//! own revision generation: the document is stored with the pending revision
//! and chain, verbatim, and the realtime event the bypassed path would have
//! emitted is emitted here. Structural operations that make no sense under
//! forced revisions are rejected.

use crate::config::SharingConfig;
use crate::cursor::{PendingWrite, Stashed};
use crate::docs::{DirDoc, DirOrFile, FileDoc};
use crate::indexer::{file_event_doc, FsckLog, IndexError, Indexer, Result};
use crate::realtime::{EventBus, RealtimeEvent};
use crate::revision::HashSource;
use crate::shared::{SharedRef, SharedRefs};
use crate::store::{DocStore, Expected, ForcedDoc};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Decorator forcing the revisions of the writes of one replicated change.
pub struct ForcedWriteIndexer<I: Indexer, S: DocStore> {
    inner: I,
    store: S,
    refs: SharedRefs<S>,
    bus: Arc<EventBus>,
    hashes: Arc<dyn HashSource>,
    doctype: String,
    pending: Option<PendingWrite>,
    shared: Option<SharedRef>,
    /// Stored state the next forced write replaces
    expected: Expected,
}

impl<I: Indexer, S: DocStore + Clone> ForcedWriteIndexer<I, S> {
    /// Idle decorator: every call goes to `inner` until a pending write is set.
    pub fn new(
        inner: I,
        store: S,
        bus: Arc<EventBus>,
        config: &SharingConfig,
        hashes: Arc<dyn HashSource>,
    ) -> Self {
        Self {
            refs: SharedRefs::new(store.clone(), &config),
            inner,
            store,
            bus,
            hashes,
            doctype: config.files_doctype.clone(),
            pending: None,
            shared: None,
            expected: Expected::Any,
        }
    }

    pub fn with_pending(mut self, pending: PendingWrite) -> Self {
        self.pending = Some(pending);
        self
    }

    /// Known revisions record updated after every forced update.
    pub fn with_shared(mut self, shared: SharedRef) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Reject the first forced write with `StoreError::Conflict` unless the
    /// document is still in the `expected` state. Later writes of the same
    /// change expect the revision written just before.
    pub fn expecting(mut self, expected: Expected) -> Self {
        self.expected = expected;
        self
    }
}

impl<I: Indexer, S: DocStore> ForcedWriteIndexer<I, S> {
    pub fn is_forced(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&PendingWrite> {
        self.pending.as_ref()
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }

    /// Target one more revision than the incoming chain, for a local rename.
    pub fn increment_revision(&mut self) -> Result<()> {
        if let Some(pending) = self.pending.as_mut() {
            pending.increment_revision(self.hashes.as_ref())?;
        }
        Ok(())
    }

    /// Give back what is left of the pending write and the shared record.
    pub fn into_parts(self) -> (Option<PendingWrite>, Option<SharedRef>) {
        (self.pending, self.shared)
    }

    async fn write_forced(&self, pending: &PendingWrite, id: &str, body: Value) -> Result<String> {
        let rev = pending.rev().to_string();
        self.store
            .bulk_force_update(
                &self.doctype,
                vec![ForcedDoc {
                    id: id.to_string(),
                    rev: rev.clone(),
                    revisions: pending.revisions().clone(),
                    body,
                    expected: self.expected.clone(),
                }],
            )
            .await?;
        debug!("Forced {} to {}", id, rev);
        Ok(rev)
    }

    fn track(&mut self, rev: &str) {
        if self.expected != Expected::Any {
            self.expected = Expected::Rev(rev.to_string());
        }
    }

    async fn update_shared(&mut self) -> Result<()> {
        if let (Some(shared), Some(pending)) = (self.shared.as_mut(), self.pending.as_ref()) {
            self.refs.record_chain(shared, pending.chain()).await?;
        }
        Ok(())
    }

    /// Write a trashed placeholder on the revision below the target, keeping
    /// the target for the write that finalizes the upload.
    async fn create_placeholder(&mut self, doc: &mut FileDoc) -> Result<()> {
        let Some(mut pending) = self.pending.take() else {
            return self.inner.create_named_file_doc(doc).await;
        };
        if pending.revisions().len() == 1 {
            pending.create_bogus_prev_rev(self.hashes.as_ref());
        }

        match pending.stash(true) {
            Stashed::Ready(pending, stash) => {
                let written = self.write_forced(&pending, &doc.id, doc.to_body()?).await;
                self.pending = Some(pending.unstash(stash));
                doc.rev = written?;
                self.track(&doc.rev);
                Ok(())
            }
            Stashed::Fallback => {
                warn!(
                    "Not enough revisions to upload {}, using generated revisions",
                    doc.id
                );
                self.inner.create_named_file_doc(doc).await
            }
        }
    }
}

#[async_trait]
impl<I: Indexer, S: DocStore> Indexer for ForcedWriteIndexer<I, S> {
    async fn init_index(&mut self) -> Result<()> {
        if self.is_forced() {
            return Err(IndexError::UnsupportedOperation("init_index"));
        }
        self.inner.init_index().await
    }

    async fn disk_usage(&self) -> Result<u64> {
        self.inner.disk_usage().await
    }

    async fn files_usage(&self) -> Result<u64> {
        self.inner.files_usage().await
    }

    async fn trash_usage(&self) -> Result<u64> {
        self.inner.trash_usage().await
    }

    async fn create_file_doc(&mut self, doc: &mut FileDoc) -> Result<()> {
        if self.is_forced() {
            return Err(IndexError::UnsupportedOperation("create_file_doc"));
        }
        self.inner.create_file_doc(doc).await
    }

    async fn create_named_file_doc(&mut self, doc: &mut FileDoc) -> Result<()> {
        if !self.is_forced() {
            return self.inner.create_named_file_doc(doc).await;
        }

        // The upload finalizes the placeholder with a second write
        if doc.trashed {
            return self.create_placeholder(doc).await;
        }

        let path = match self.inner.file_path(doc).await {
            Ok(path) => path,
            Err(e) => {
                error!("Cannot compute full path for {}: {}", doc.id, e);
                return Err(e);
            }
        };
        let Some(pending) = self.pending.as_ref() else {
            return self.inner.create_named_file_doc(doc).await;
        };
        doc.rev = self.write_forced(pending, &doc.id, doc.to_body()?).await?;
        self.track(&doc.rev);
        self.bus.emit(RealtimeEvent::created(
            &self.doctype,
            &doc.id,
            file_event_doc(doc, &path)?,
        ));
        Ok(())
    }

    async fn update_file_doc(&mut self, old: Option<&FileDoc>, doc: &mut FileDoc) -> Result<()> {
        let Some(pending) = self.pending.as_ref() else {
            return self.inner.update_file_doc(old, doc).await;
        };

        doc.rev = self.write_forced(pending, &doc.id, doc.to_body()?).await?;
        self.track(&doc.rev);
        self.update_shared().await?;

        let path = self.inner.file_path(doc).await?;
        let old = match old {
            Some(old) => {
                let old_path = self.inner.file_path(old).await?;
                Some(file_event_doc(old, &old_path)?)
            }
            None => None,
        };
        self.bus.emit(RealtimeEvent::updated(
            &self.doctype,
            &doc.id,
            file_event_doc(doc, &path)?,
            old,
        ));
        Ok(())
    }

    async fn delete_file_doc(&mut self, doc: &FileDoc) -> Result<()> {
        if self.is_forced() {
            return Err(IndexError::UnsupportedOperation("delete_file_doc"));
        }
        self.inner.delete_file_doc(doc).await
    }

    async fn create_dir_doc(&mut self, doc: &mut DirDoc) -> Result<()> {
        if self.is_forced() {
            return Err(IndexError::UnsupportedOperation("create_dir_doc"));
        }
        self.inner.create_dir_doc(doc).await
    }

    async fn create_named_dir_doc(&mut self, doc: &mut DirDoc) -> Result<()> {
        if !self.is_forced() {
            return self.inner.create_named_dir_doc(doc).await;
        }
        self.update_dir_doc(None, doc).await
    }

    async fn update_dir_doc(&mut self, old: Option<&DirDoc>, doc: &mut DirDoc) -> Result<()> {
        let Some(pending) = self.pending.as_ref() else {
            return self.inner.update_dir_doc(old, doc).await;
        };

        doc.rev = self.write_forced(pending, &doc.id, doc.to_body()?).await?;
        self.track(&doc.rev);
        self.update_shared().await?;

        let old = old.map(DirDoc::to_json).transpose()?;
        self.bus.emit(RealtimeEvent::updated(
            &self.doctype,
            &doc.id,
            doc.to_json()?,
            old,
        ));
        Ok(())
    }

    async fn delete_dir_doc(&mut self, doc: &DirDoc) -> Result<()> {
        if self.is_forced() {
            return Err(IndexError::UnsupportedOperation("delete_dir_doc"));
        }
        self.inner.delete_dir_doc(doc).await
    }

    async fn delete_dir_doc_and_content(
        &mut self,
        doc: &DirDoc,
        only_content: bool,
    ) -> Result<(Vec<FileDoc>, u64)> {
        if self.is_forced() {
            return Err(IndexError::UnsupportedOperation("delete_dir_doc_and_content"));
        }
        self.inner.delete_dir_doc_and_content(doc, only_content).await
    }

    async fn batch_delete(&mut self, docs: &[DirOrFile]) -> Result<()> {
        if self.is_forced() {
            return Err(IndexError::UnsupportedOperation("batch_delete"));
        }
        self.inner.batch_delete(docs).await
    }

    async fn dir_by_id(&self, id: &str) -> Result<DirDoc> {
        self.inner.dir_by_id(id).await
    }

    async fn dir_by_path(&self, path: &str) -> Result<DirDoc> {
        self.inner.dir_by_path(path).await
    }

    async fn file_by_id(&self, id: &str) -> Result<FileDoc> {
        self.inner.file_by_id(id).await
    }

    async fn file_by_path(&self, path: &str) -> Result<FileDoc> {
        self.inner.file_by_path(path).await
    }

    async fn file_path(&self, doc: &FileDoc) -> Result<String> {
        self.inner.file_path(doc).await
    }

    async fn dir_or_file_by_id(&self, id: &str) -> Result<DirOrFile> {
        self.inner.dir_or_file_by_id(id).await
    }

    async fn dir_or_file_by_path(&self, path: &str) -> Result<DirOrFile> {
        self.inner.dir_or_file_by_path(path).await
    }

    async fn dir_children(&self, dir: &DirDoc) -> Result<Vec<DirOrFile>> {
        self.inner.dir_children(dir).await
    }

    async fn dir_length(&self, dir: &DirDoc) -> Result<usize> {
        self.inner.dir_length(dir).await
    }

    async fn dir_child_exists(&self, dir_id: &str, name: &str) -> Result<bool> {
        self.inner.dir_child_exists(dir_id, name).await
    }

    async fn check_index_integrity(&self) -> Result<Vec<FsckLog>> {
        if self.is_forced() {
            return Err(IndexError::UnsupportedOperation("check_index_integrity"));
        }
        self.inner.check_index_integrity().await
    }
}
