//! Wire format of replication batches.
//!
//! A batch carries documents with the revision chain they must be stored
//! with:
//!
//! ```json
//! {"type":"replicate","changes":[
//!   {"doctype":"io.cozy.files","rev":"2-bbb",
//!    "revisions":{"start":2,"ids":["bbb","aaa"]},
//!    "doc":{"_id":"f1","type":"file","name":"a.txt", ...}}
//! ]}
//! ```
//!
//! Transport is not handled here: batches are plain JSON bytes.

use crate::cursor::PendingWrite;
use crate::docs::DirOrFile;
use crate::revision::{RevisionError, Revisions};
use crate::store::StoredDoc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed revision: {0}")]
    Revision(#[from] RevisionError),

    #[error("Missing field {0}")]
    MissingField(&'static str),

    #[error("Invalid document: {0}")]
    Document(#[from] serde_json::Error),

    #[error("Not a replication batch")]
    WrongType,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// One replicated document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingChange {
    #[serde(default = "default_doctype")]
    pub doctype: String,
    /// Document JSON, with its `_id`
    pub doc: Value,
    pub rev: String,
    pub revisions: Revisions,
}

fn default_doctype() -> String {
    crate::config::DEFAULT_FILES_DOCTYPE.to_string()
}

/// A change whose revision and document have been validated.
#[derive(Debug)]
pub struct ParsedChange {
    pub doc: DirOrFile,
    pub pending: PendingWrite,
}

impl IncomingChange {
    /// Export a stored document so a peer can replicate it.
    pub fn from_stored(doctype: &str, doc: &StoredDoc) -> Self {
        let mut body = doc.body.clone();
        if let Value::Object(map) = &mut body {
            map.insert("_id".to_string(), Value::String(doc.id.clone()));
        }
        Self {
            doctype: doctype.to_string(),
            doc: body,
            rev: doc.rev.clone(),
            revisions: doc.revisions.clone(),
        }
    }

    /// Id of the document, if present.
    pub fn id(&self) -> Option<&str> {
        self.doc.get("_id").and_then(Value::as_str)
    }

    /// Validate the revision and decode the document.
    ///
    /// A malformed revision is fatal for this change only.
    pub fn parse(&self) -> Result<ParsedChange> {
        let pending = PendingWrite::new(&self.rev, self.revisions.clone())?;
        let id = self.id().ok_or(ProtocolError::MissingField("_id"))?;

        let mut body = self.doc.clone();
        if let Value::Object(map) = &mut body {
            map.remove("_id");
            map.remove("_rev");
            map.remove("_revisions");
        }
        let doc = DirOrFile::from_stored(StoredDoc {
            id: id.to_string(),
            rev: self.rev.clone(),
            revisions: self.revisions.clone(),
            body,
        })?;
        Ok(ParsedChange { doc, pending })
    }
}

/// An ordered list of changes.
///
/// Wire format: `{"type":"replicate","changes":[...]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationBatch {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    pub changes: Vec<IncomingChange>,
}

impl ReplicationBatch {
    pub fn new(changes: Vec<IncomingChange>) -> Self {
        Self {
            msg_type: "replicate".to_string(),
            changes,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ReplicationBatch serialization should not fail")
    }

    /// Parse from JSON bytes. Revisions are validated per change, later.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let batch: Self = serde_json::from_slice(data)?;
        if batch.msg_type != "replicate" {
            return Err(ProtocolError::WrongType);
        }
        Ok(batch)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
