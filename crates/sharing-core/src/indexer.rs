//! Indexer trait: the capability set over file and directory records.
//!
//! The virtual file system talks to its records only through this trait. Two
//! implementations exist:
//! - `StoreIndexer` - the normal path, revisions generated by the store
//! - `ForcedWriteIndexer` (in `forced`) - writes with pre-determined revisions
//!   while a replicated change is being applied

use crate::config::SharingConfig;
use crate::docs::{join_path, split_path, DirDoc, DirOrFile, FileDoc, ROOT_DIR_ID, TRASH_DIR_ID};
use crate::realtime::{EventBus, RealtimeEvent};
use crate::revision::RevisionError;
use crate::shared::SharedError;
use crate::store::{DocStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation not supported while forcing revisions: {0}")]
    UnsupportedOperation(&'static str),

    #[error("Revision error: {0}")]
    Revision(#[from] RevisionError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Shared reference error: {0}")]
    Shared(#[from] SharedError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid document: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// One problem found by [`Indexer::check_index_integrity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FsckLog {
    /// The parent directory of a record does not exist
    MissingParent { id: String, dir_id: String },
    /// A directory path does not match its parent path and name
    PathMismatch {
        id: String,
        expected: String,
        actual: String,
    },
    /// A record cannot be decoded
    InvalidDocument { id: String, message: String },
}

/// Create, update, delete and query file and directory records.
///
/// Writes take `&mut self`: an indexer is driven by a single change at a time.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Create the root and trash directories if missing
    async fn init_index(&mut self) -> Result<()>;

    /// Bytes used by every file, trashed or not
    async fn disk_usage(&self) -> Result<u64>;
    /// Bytes used by files
    async fn files_usage(&self) -> Result<u64>;
    /// Bytes used by trashed files
    async fn trash_usage(&self) -> Result<u64>;

    /// Create a file, generating its id if empty
    async fn create_file_doc(&mut self, doc: &mut FileDoc) -> Result<()>;
    /// Create a file with the id it already has
    async fn create_named_file_doc(&mut self, doc: &mut FileDoc) -> Result<()>;
    async fn update_file_doc(&mut self, old: Option<&FileDoc>, doc: &mut FileDoc) -> Result<()>;
    async fn delete_file_doc(&mut self, doc: &FileDoc) -> Result<()>;

    async fn create_dir_doc(&mut self, doc: &mut DirDoc) -> Result<()>;
    async fn create_named_dir_doc(&mut self, doc: &mut DirDoc) -> Result<()>;
    async fn update_dir_doc(&mut self, old: Option<&DirDoc>, doc: &mut DirDoc) -> Result<()>;
    async fn delete_dir_doc(&mut self, doc: &DirDoc) -> Result<()>;
    /// Delete everything below `doc`, and `doc` itself unless `only_content`.
    /// Returns the deleted files and their total size.
    async fn delete_dir_doc_and_content(
        &mut self,
        doc: &DirDoc,
        only_content: bool,
    ) -> Result<(Vec<FileDoc>, u64)>;
    async fn batch_delete(&mut self, docs: &[DirOrFile]) -> Result<()>;

    async fn dir_by_id(&self, id: &str) -> Result<DirDoc>;
    async fn dir_by_path(&self, path: &str) -> Result<DirDoc>;
    async fn file_by_id(&self, id: &str) -> Result<FileDoc>;
    async fn file_by_path(&self, path: &str) -> Result<FileDoc>;
    /// Full path of a file, from its parent directory
    async fn file_path(&self, doc: &FileDoc) -> Result<String>;
    async fn dir_or_file_by_id(&self, id: &str) -> Result<DirOrFile>;
    async fn dir_or_file_by_path(&self, path: &str) -> Result<DirOrFile>;

    /// Direct children of a directory, sorted by name
    async fn dir_children(&self, dir: &DirDoc) -> Result<Vec<DirOrFile>>;
    async fn dir_length(&self, dir: &DirDoc) -> Result<usize>;
    async fn dir_child_exists(&self, dir_id: &str, name: &str) -> Result<bool>;

    async fn check_index_integrity(&self) -> Result<Vec<FsckLog>>;
}

/// Event payload of a file: its JSON with the computed full path.
pub(crate) fn file_event_doc(doc: &FileDoc, path: &str) -> Result<Value> {
    let mut json = doc.to_json()?;
    if let Value::Object(map) = &mut json {
        map.insert("path".to_string(), Value::String(path.to_string()));
    }
    Ok(json)
}

/// The normal indexer over a document store.
pub struct StoreIndexer<S: DocStore> {
    store: S,
    bus: Arc<EventBus>,
    doctype: String,
}

impl<S: DocStore> StoreIndexer<S> {
    pub fn new(store: S, bus: Arc<EventBus>, config: &SharingConfig) -> Self {
        Self {
            store,
            bus,
            doctype: config.files_doctype.clone(),
        }
    }

    pub fn doctype(&self) -> &str {
        &self.doctype
    }

    async fn entries(&self) -> Result<Vec<DirOrFile>> {
        self.store
            .all(&self.doctype)
            .await?
            .into_iter()
            .map(|doc| DirOrFile::from_stored(doc).map_err(IndexError::from))
            .collect()
    }

    async fn files(&self) -> Result<Vec<FileDoc>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter_map(|e| match e {
                DirOrFile::File(f) => Some(f),
                DirOrFile::Dir(_) => None,
            })
            .collect())
    }

    async fn dirs(&self) -> Result<Vec<DirDoc>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter_map(|e| match e {
                DirOrFile::Dir(d) => Some(d),
                DirOrFile::File(_) => None,
            })
            .collect())
    }

    async fn delete_file(&mut self, doc: &FileDoc) -> Result<()> {
        self.store.delete(&self.doctype, &doc.id, &doc.rev).await?;
        self.bus.emit(RealtimeEvent::deleted(&self.doctype, &doc.id));
        Ok(())
    }

    async fn delete_dir(&mut self, doc: &DirDoc) -> Result<()> {
        self.store.delete(&self.doctype, &doc.id, &doc.rev).await?;
        self.bus.emit(RealtimeEvent::deleted(&self.doctype, &doc.id));
        Ok(())
    }

    /// Rewrite the paths of the directories below a moved directory.
    async fn move_subdirs(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        let prefix = format!("{}/", old_path.trim_end_matches('/'));
        for mut dir in self.dirs().await? {
            let Some(rest) = dir.path.strip_prefix(&prefix) else {
                continue;
            };
            let old = dir.clone();
            dir.path = join_path(new_path, rest);
            dir.rev = self
                .store
                .update(&self.doctype, &dir.id, &dir.rev, dir.to_body()?)
                .await?;
            self.bus.emit(RealtimeEvent::updated(
                &self.doctype,
                &dir.id,
                dir.to_json()?,
                Some(old.to_json()?),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: DocStore> Indexer for StoreIndexer<S> {
    async fn init_index(&mut self) -> Result<()> {
        let now = Utc::now();
        for mut dir in [DirDoc::root(now), DirDoc::trash(now)] {
            if self.store.get(&self.doctype, &dir.id).await?.is_none() {
                self.create_named_dir_doc(&mut dir).await?;
                info!("Created {} at {}", dir.id, dir.path);
            }
        }
        Ok(())
    }

    async fn disk_usage(&self) -> Result<u64> {
        self.files_usage().await
    }

    async fn files_usage(&self) -> Result<u64> {
        Ok(self.files().await?.iter().map(|f| f.size).sum())
    }

    async fn trash_usage(&self) -> Result<u64> {
        Ok(self
            .files()
            .await?
            .iter()
            .filter(|f| f.trashed || f.dir_id == TRASH_DIR_ID)
            .map(|f| f.size)
            .sum())
    }

    async fn create_file_doc(&mut self, doc: &mut FileDoc) -> Result<()> {
        if doc.id.is_empty() {
            doc.id = uuid::Uuid::new_v4().simple().to_string();
        }
        self.create_named_file_doc(doc).await
    }

    async fn create_named_file_doc(&mut self, doc: &mut FileDoc) -> Result<()> {
        if doc.id.is_empty() {
            return Err(IndexError::Invalid("file without id".into()));
        }
        doc.rev = self
            .store
            .create(&self.doctype, &doc.id, doc.to_body()?)
            .await?;
        let path = self.file_path(doc).await?;
        self.bus.emit(RealtimeEvent::created(
            &self.doctype,
            &doc.id,
            file_event_doc(doc, &path)?,
        ));
        Ok(())
    }

    async fn update_file_doc(&mut self, old: Option<&FileDoc>, doc: &mut FileDoc) -> Result<()> {
        doc.rev = self
            .store
            .update(&self.doctype, &doc.id, &doc.rev, doc.to_body()?)
            .await?;
        let path = self.file_path(doc).await?;
        let old = match old {
            Some(old) => {
                let old_path = self.file_path(old).await?;
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
        self.delete_file(doc).await
    }

    async fn create_dir_doc(&mut self, doc: &mut DirDoc) -> Result<()> {
        if doc.id.is_empty() {
            doc.id = uuid::Uuid::new_v4().simple().to_string();
        }
        self.create_named_dir_doc(doc).await
    }

    async fn create_named_dir_doc(&mut self, doc: &mut DirDoc) -> Result<()> {
        if doc.id.is_empty() {
            return Err(IndexError::Invalid("directory without id".into()));
        }
        if doc.path.is_empty() {
            let parent = self.dir_by_id(&doc.dir_id).await?;
            doc.path = join_path(&parent.path, &doc.name);
        }
        doc.rev = self
            .store
            .create(&self.doctype, &doc.id, doc.to_body()?)
            .await?;
        self.bus
            .emit(RealtimeEvent::created(&self.doctype, &doc.id, doc.to_json()?));
        Ok(())
    }

    async fn update_dir_doc(&mut self, old: Option<&DirDoc>, doc: &mut DirDoc) -> Result<()> {
        doc.rev = self
            .store
            .update(&self.doctype, &doc.id, &doc.rev, doc.to_body()?)
            .await?;
        if let Some(old) = old {
            if old.path != doc.path {
                self.move_subdirs(&old.path, &doc.path).await?;
            }
        }
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
        self.delete_dir(doc).await
    }

    async fn delete_dir_doc_and_content(
        &mut self,
        doc: &DirDoc,
        only_content: bool,
    ) -> Result<(Vec<FileDoc>, u64)> {
        let entries = self.entries().await?;
        let mut by_parent: HashMap<&str, Vec<&DirOrFile>> = HashMap::new();
        for entry in &entries {
            by_parent.entry(entry.dir_id()).or_default().push(entry);
        }

        // Parents are collected before their children
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        let mut queue = vec![doc.id.as_str()];
        while let Some(dir_id) = queue.pop() {
            for child in by_parent.get(dir_id).into_iter().flatten() {
                match child {
                    DirOrFile::File(f) => files.push(f.clone()),
                    DirOrFile::Dir(d) => {
                        queue.push(&d.id);
                        dirs.push(d.clone());
                    }
                }
            }
        }

        let mut total = 0;
        for file in &files {
            self.delete_file(file).await?;
            total += file.size;
        }
        for dir in dirs.iter().rev() {
            self.delete_dir(dir).await?;
        }
        if !only_content {
            self.delete_dir(doc).await?;
        }
        debug!(
            "Deleted {} file(s) and {} dir(s) below {}",
            files.len(),
            dirs.len(),
            doc.path
        );
        Ok((files, total))
    }

    async fn batch_delete(&mut self, docs: &[DirOrFile]) -> Result<()> {
        for doc in docs {
            match doc {
                DirOrFile::Dir(d) => self.delete_dir(d).await?,
                DirOrFile::File(f) => self.delete_file(f).await?,
            }
        }
        Ok(())
    }

    async fn dir_by_id(&self, id: &str) -> Result<DirDoc> {
        match self.dir_or_file_by_id(id).await? {
            DirOrFile::Dir(dir) => Ok(dir),
            DirOrFile::File(_) => Err(IndexError::NotFound(format!("directory {}", id))),
        }
    }

    async fn dir_by_path(&self, path: &str) -> Result<DirDoc> {
        self.dirs()
            .await?
            .into_iter()
            .find(|d| d.path == path)
            .ok_or_else(|| IndexError::NotFound(format!("directory {}", path)))
    }

    async fn file_by_id(&self, id: &str) -> Result<FileDoc> {
        match self.dir_or_file_by_id(id).await? {
            DirOrFile::File(file) => Ok(file),
            DirOrFile::Dir(_) => Err(IndexError::NotFound(format!("file {}", id))),
        }
    }

    async fn file_by_path(&self, path: &str) -> Result<FileDoc> {
        let not_found = || IndexError::NotFound(format!("file {}", path));
        let (parent_path, name) = split_path(path).ok_or_else(not_found)?;
        let parent = self.dir_by_path(parent_path).await.map_err(|_| not_found())?;
        self.files()
            .await?
            .into_iter()
            .find(|f| f.dir_id == parent.id && f.name == name)
            .ok_or_else(not_found)
    }

    async fn file_path(&self, doc: &FileDoc) -> Result<String> {
        let parent = self.dir_by_id(&doc.dir_id).await?;
        Ok(join_path(&parent.path, &doc.name))
    }

    async fn dir_or_file_by_id(&self, id: &str) -> Result<DirOrFile> {
        let doc = self
            .store
            .get(&self.doctype, id)
            .await?
            .ok_or_else(|| IndexError::NotFound(id.to_string()))?;
        Ok(DirOrFile::from_stored(doc)?)
    }

    async fn dir_or_file_by_path(&self, path: &str) -> Result<DirOrFile> {
        match self.dir_by_path(path).await {
            Ok(dir) => Ok(DirOrFile::Dir(dir)),
            Err(IndexError::NotFound(_)) => Ok(DirOrFile::File(self.file_by_path(path).await?)),
            Err(e) => Err(e),
        }
    }

    async fn dir_children(&self, dir: &DirDoc) -> Result<Vec<DirOrFile>> {
        let mut children: Vec<DirOrFile> = self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.dir_id() == dir.id && e.id() != dir.id)
            .collect();
        children.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(children)
    }

    async fn dir_length(&self, dir: &DirDoc) -> Result<usize> {
        Ok(self.dir_children(dir).await?.len())
    }

    async fn dir_child_exists(&self, dir_id: &str, name: &str) -> Result<bool> {
        Ok(self
            .entries()
            .await?
            .iter()
            .any(|e| e.dir_id() == dir_id && e.name() == name && e.id() != dir_id))
    }

    async fn check_index_integrity(&self) -> Result<Vec<FsckLog>> {
        let mut logs = Vec::new();
        let mut entries = Vec::new();
        for doc in self.store.all(&self.doctype).await? {
            let id = doc.id.clone();
            match DirOrFile::from_stored(doc) {
                Ok(entry) => entries.push(entry),
                Err(e) => logs.push(FsckLog::InvalidDocument {
                    id,
                    message: e.to_string(),
                }),
            }
        }

        let dirs: HashMap<&str, &DirDoc> = entries
            .iter()
            .filter_map(|e| match e {
                DirOrFile::Dir(d) => Some((d.id.as_str(), d)),
                DirOrFile::File(_) => None,
            })
            .collect();

        let mut seen_paths = HashSet::new();
        for entry in &entries {
            if entry.id() == ROOT_DIR_ID {
                continue;
            }
            let Some(parent) = dirs.get(entry.dir_id()) else {
                logs.push(FsckLog::MissingParent {
                    id: entry.id().to_string(),
                    dir_id: entry.dir_id().to_string(),
                });
                continue;
            };
            if let DirOrFile::Dir(dir) = entry {
                let expected = join_path(&parent.path, &dir.name);
                if dir.path != expected {
                    logs.push(FsckLog::PathMismatch {
                        id: dir.id.clone(),
                        expected,
                        actual: dir.path.clone(),
                    });
                }
                if !seen_paths.insert(dir.path.as_str()) {
                    warn!("Two directories share the path {}", dir.path);
                }
            }
        }
        Ok(logs)
    }
}
