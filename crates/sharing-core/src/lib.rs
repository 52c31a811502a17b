//! sharing-core: revision-tree replication for shared file trees.
//!
//! This crate provides the core functionality for:
//! - Parsing and combining revision chains (`"<generation>-<hash>"`)
//! - Resolving divergent histories of the same document
//! - Writing replicated documents with pre-determined revisions
//! - Tracking the revisions known for each shared document
//! - DocStore and Indexer trait abstractions

pub mod config;
pub mod cursor;
pub mod docs;
pub mod forced;
pub mod indexer;
pub mod protocol;
pub mod realtime;
pub mod replicator;
pub mod resolver;
pub mod revision;
pub mod shared;
pub mod store;

pub use config::{ConfigError, SharingConfig};
pub use cursor::{PendingWrite, Stash, Stashed};
pub use docs::{DirDoc, DirOrFile, FileDoc};
pub use forced::ForcedWriteIndexer;
pub use indexer::{FsckLog, IndexError, Indexer, StoreIndexer};
pub use protocol::{IncomingChange, ProtocolError, ReplicationBatch};
pub use realtime::{EventBus, RealtimeEvent, Subscription};
pub use replicator::{ApplyReport, BatchReport, Outcome, ReplicateError, Replicator};
pub use resolver::{resolve, Resolution, Side};
pub use revision::{
    HashSource, RandomHashes, Revision, RevisionChain, RevisionError, Revisions, SequentialHashes,
};
pub use shared::{SharedError, SharedInfo, SharedRef, SharedRefs};
pub use store::{DocStore, Expected, ForcedDoc, MemoryStore, StoreError, StoredDoc};
