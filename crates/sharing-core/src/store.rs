//! DocStore trait abstraction over the per-document storage engine.
//!
//! The store keeps JSON documents grouped by doctype. Each document has a
//! current revision and the chain of revisions that led to it. Two write
//! paths exist:
//!
//! - `create` / `update` / `delete`: the store generates the next revision and
//!   rejects the write if the expected revision is not the stored leaf.
//! - `bulk_force_update`: the caller supplies the revision and its chain, and
//!   the store keeps them verbatim. The revisions are not compared with the
//!   stored ones; only the optional [`Expected`] leaf guards the write.
//!
//! Implementations:
//! - `MemoryStore` - For testing and the replay tool

use crate::revision::{HashSource, RandomHashes, Revision, Revisions};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Document not found: {doctype}/{id}")]
    NotFound { doctype: String, id: String },

    #[error("Document already exists: {doctype}/{id}")]
    AlreadyExists { doctype: String, id: String },

    #[error("Revision conflict on {id}: expected {expected}, stored {actual}")]
    Conflict {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid document: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A document as held by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDoc {
    pub id: String,
    pub rev: String,
    /// History of the document, headed by `rev`
    pub revisions: Revisions,
    /// Document fields, without `_id`/`_rev`
    pub body: Value,
}

/// State a forced write expects to replace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Expected {
    /// Whatever is stored
    #[default]
    Any,
    /// Nothing: the document must not exist yet
    Absent,
    /// The stored leaf must be this revision
    Rev(String),
}

impl Expected {
    /// `StoreError::Conflict` unless `stored` is the expected state.
    pub fn check(&self, id: &str, stored: Option<&StoredDoc>) -> Result<()> {
        let actual = stored.map(|d| d.rev.as_str());
        let expected = match self {
            Expected::Any => return Ok(()),
            Expected::Absent => None,
            Expected::Rev(rev) => Some(rev.as_str()),
        };
        if actual != expected {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected.unwrap_or("<absent>").to_string(),
                actual: actual.unwrap_or("<absent>").to_string(),
            });
        }
        Ok(())
    }
}

/// A document written with an explicit revision.
#[derive(Debug, Clone, PartialEq)]
pub struct ForcedDoc {
    pub id: String,
    pub rev: String,
    pub revisions: Revisions,
    pub body: Value,
    /// Leaf the write was computed against
    pub expected: Expected,
}

/// Per-document storage engine.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Read a document, `None` if it does not exist
    async fn get(&self, doctype: &str, id: &str) -> Result<Option<StoredDoc>>;

    /// All documents of a doctype
    async fn all(&self, doctype: &str) -> Result<Vec<StoredDoc>>;

    /// Create a document at generation 1. Returns the new revision.
    async fn create(&self, doctype: &str, id: &str, body: Value) -> Result<String>;

    /// Replace a document if `expected_rev` is its current revision.
    /// Returns the new revision.
    async fn update(&self, doctype: &str, id: &str, expected_rev: &str, body: Value)
        -> Result<String>;

    /// Delete a document if `expected_rev` is its current revision.
    async fn delete(&self, doctype: &str, id: &str, expected_rev: &str) -> Result<()>;

    /// Store documents with their given revisions, verbatim.
    ///
    /// The body must be a JSON object, `rev` must be the head of `revisions`
    /// and the stored leaf must match `expected` (`StoreError::Conflict`
    /// otherwise). Nothing is written unless every document passes.
    async fn bulk_force_update(&self, doctype: &str, docs: Vec<ForcedDoc>) -> Result<()>;
}

/// In-memory document store
pub struct MemoryStore {
    docs: RwLock<HashMap<String, HashMap<String, StoredDoc>>>,
    hashes: Arc<dyn HashSource>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_hashes(Arc::new(RandomHashes::default()))
    }

    /// Store generating revision hashes from `hashes`.
    pub fn with_hashes(hashes: Arc<dyn HashSource>) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            hashes,
        }
    }

    /// Number of documents of a doctype.
    pub fn count(&self, doctype: &str) -> usize {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        docs.get(doctype).map(HashMap::len).unwrap_or(0)
    }

    fn check_body(body: &Value) -> Result<()> {
        if !body.is_object() {
            return Err(StoreError::Invalid(format!(
                "document body must be an object, got {}",
                body
            )));
        }
        Ok(())
    }

    fn not_found(doctype: &str, id: &str) -> StoreError {
        StoreError::NotFound {
            doctype: doctype.to_string(),
            id: id.to_string(),
        }
    }

    fn check_rev(doc: &StoredDoc, expected_rev: &str) -> Result<()> {
        if doc.rev != expected_rev {
            return Err(StoreError::Conflict {
                id: doc.id.clone(),
                expected: expected_rev.to_string(),
                actual: doc.rev.clone(),
            });
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocStore for MemoryStore {
    async fn get(&self, doctype: &str, id: &str) -> Result<Option<StoredDoc>> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs.get(doctype).and_then(|d| d.get(id)).cloned())
    }

    async fn all(&self, doctype: &str) -> Result<Vec<StoredDoc>> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<StoredDoc> = docs
            .get(doctype)
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn create(&self, doctype: &str, id: &str, body: Value) -> Result<String> {
        Self::check_body(&body)?;
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        let table = docs.entry(doctype.to_string()).or_default();
        if table.contains_key(id) {
            return Err(StoreError::AlreadyExists {
                doctype: doctype.to_string(),
                id: id.to_string(),
            });
        }

        let rev = Revision::new(1, self.hashes.next_hash())
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        table.insert(
            id.to_string(),
            StoredDoc {
                id: id.to_string(),
                rev: rev.to_string(),
                revisions: Revisions::single(&rev),
                body,
            },
        );
        Ok(rev.to_string())
    }

    async fn update(
        &self,
        doctype: &str,
        id: &str,
        expected_rev: &str,
        body: Value,
    ) -> Result<String> {
        Self::check_body(&body)?;
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        let doc = docs
            .get_mut(doctype)
            .and_then(|d| d.get_mut(id))
            .ok_or_else(|| Self::not_found(doctype, id))?;
        Self::check_rev(doc, expected_rev)?;

        let current: Revision = doc
            .rev
            .parse()
            .map_err(|e: crate::revision::RevisionError| StoreError::Invalid(e.to_string()))?;
        let next = current
            .next(self.hashes.as_ref())
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        doc.revisions.start = next.generation();
        doc.revisions.ids.insert(0, next.hash().to_string());
        doc.rev = next.to_string();
        doc.body = body;
        Ok(doc.rev.clone())
    }

    async fn delete(&self, doctype: &str, id: &str, expected_rev: &str) -> Result<()> {
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        let table = docs
            .get_mut(doctype)
            .ok_or_else(|| Self::not_found(doctype, id))?;
        let doc = table.get(id).ok_or_else(|| Self::not_found(doctype, id))?;
        Self::check_rev(doc, expected_rev)?;
        table.remove(id);
        Ok(())
    }

    async fn bulk_force_update(&self, doctype: &str, docs: Vec<ForcedDoc>) -> Result<()> {
        // Validate the whole batch before touching anything
        for doc in &docs {
            Self::check_body(&doc.body)?;
            let rev: Revision = doc
                .rev
                .parse()
                .map_err(|e: crate::revision::RevisionError| StoreError::Invalid(e.to_string()))?;
            doc.revisions
                .ensure_head(&rev)
                .map_err(|e| StoreError::Invalid(e.to_string()))?;
        }

        let mut all = self.docs.write().unwrap_or_else(|e| e.into_inner());
        let table = all.entry(doctype.to_string()).or_default();
        for doc in &docs {
            doc.expected.check(&doc.id, table.get(&doc.id))?;
        }
        for doc in docs {
            table.insert(
                doc.id.clone(),
                StoredDoc {
                    id: doc.id,
                    rev: doc.rev,
                    revisions: doc.revisions,
                    body: doc.body,
                },
            );
        }
        Ok(())
    }
}

// Implement DocStore for Arc<T> where T: DocStore
// This allows sharing a store between the indexers of one instance
#[async_trait]
impl<T: DocStore + ?Sized> DocStore for Arc<T> {
    async fn get(&self, doctype: &str, id: &str) -> Result<Option<StoredDoc>> {
        (**self).get(doctype, id).await
    }

    async fn all(&self, doctype: &str) -> Result<Vec<StoredDoc>> {
        (**self).all(doctype).await
    }

    async fn create(&self, doctype: &str, id: &str, body: Value) -> Result<String> {
        (**self).create(doctype, id, body).await
    }

    async fn update(
        &self,
        doctype: &str,
        id: &str,
        expected_rev: &str,
        body: Value,
    ) -> Result<String> {
        (**self).update(doctype, id, expected_rev, body).await
    }

    async fn delete(&self, doctype: &str, id: &str, expected_rev: &str) -> Result<()> {
        (**self).delete(doctype, id, expected_rev).await
    }

    async fn bulk_force_update(&self, doctype: &str, docs: Vec<ForcedDoc>) -> Result<()> {
        (**self).bulk_force_update(doctype, docs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::SequentialHashes;
    use serde_json::json;

    fn store() -> MemoryStore {
        MemoryStore::with_hashes(Arc::new(SequentialHashes::new("h")))
    }

    #[tokio::test]
    async fn test_create_and_update_generate_revisions() {
        let store = store();

        let rev1 = store.create("docs", "a", json!({"n": 1})).await.unwrap();
        assert_eq!(rev1, "1-h0001");

        let rev2 = store.update("docs", "a", &rev1, json!({"n": 2})).await.unwrap();
        assert_eq!(rev2, "2-h0002");

        let doc = store.get("docs", "a").await.unwrap().unwrap();
        assert_eq!(doc.rev, rev2);
        assert_eq!(doc.revisions, Revisions::new(2, vec!["h0002".into(), "h0001".into()]));
        assert_eq!(doc.body, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_update_rejects_stale_revision() {
        let store = store();
        let rev1 = store.create("docs", "a", json!({})).await.unwrap();
        store.update("docs", "a", &rev1, json!({"n": 1})).await.unwrap();

        let err = store.update("docs", "a", &rev1, json!({"n": 2})).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let err = store.delete("docs", "a", &rev1).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(store.count("docs"), 1);
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let store = store();
        store.create("docs", "a", json!({})).await.unwrap();
        let err = store.create("docs", "a", json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_force_update_stores_verbatim() {
        let store = store();
        let rev1 = store.create("docs", "a", json!({})).await.unwrap();
        assert_eq!(rev1, "1-h0001");

        // No parent check: the forced chain does not even contain the stored leaf
        let revisions = Revisions::new(3, vec!["ccc".into(), "bbb".into()]);
        store
            .bulk_force_update(
                "docs",
                vec![ForcedDoc {
                    id: "a".into(),
                    rev: "3-ccc".into(),
                    revisions: revisions.clone(),
                    body: json!({"forced": true}),
                    expected: Expected::Any,
                }],
            )
            .await
            .unwrap();

        let doc = store.get("docs", "a").await.unwrap().unwrap();
        assert_eq!(doc.rev, "3-ccc");
        assert_eq!(doc.revisions, revisions);
    }

    #[tokio::test]
    async fn test_force_update_validates_structure() {
        let store = store();
        let bad_body = ForcedDoc {
            id: "a".into(),
            rev: "1-a".into(),
            revisions: Revisions::new(1, vec!["a".into()]),
            body: json!([1, 2]),
            expected: Expected::Any,
        };
        assert!(matches!(
            store.bulk_force_update("docs", vec![bad_body]).await,
            Err(StoreError::Invalid(_))
        ));

        let bad_head = ForcedDoc {
            id: "a".into(),
            rev: "2-b".into(),
            revisions: Revisions::new(1, vec!["a".into()]),
            body: json!({}),
            expected: Expected::Any,
        };
        assert!(matches!(
            store.bulk_force_update("docs", vec![bad_head]).await,
            Err(StoreError::Invalid(_))
        ));
        assert_eq!(store.count("docs"), 0);
    }

    fn forced(id: &str, start: u64, ids: &[&str], expected: Expected) -> ForcedDoc {
        ForcedDoc {
            id: id.into(),
            rev: format!("{}-{}", start, ids[0]),
            revisions: Revisions::new(start, ids.iter().map(|s| s.to_string()).collect()),
            body: json!({}),
            expected,
        }
    }

    #[tokio::test]
    async fn test_force_update_rejects_moved_leaf() {
        let store = store();
        let rev1 = store.create("docs", "a", json!({})).await.unwrap();
        let rev2 = store.update("docs", "a", &rev1, json!({"local": true})).await.unwrap();

        let err = store
            .bulk_force_update(
                "docs",
                vec![forced("a", 3, &["ccc", "bbb"], Expected::Rev(rev1.clone()))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { ref actual, .. } if *actual == rev2));
        let doc = store.get("docs", "a").await.unwrap().unwrap();
        assert_eq!(doc.rev, rev2);
        assert_eq!(doc.body, json!({"local": true}));

        store
            .bulk_force_update("docs", vec![forced("a", 3, &["ccc", "bbb"], Expected::Rev(rev2))])
            .await
            .unwrap();
        assert_eq!(store.get("docs", "a").await.unwrap().unwrap().rev, "3-ccc");
    }

    #[tokio::test]
    async fn test_force_update_expecting_absent_document() {
        let store = store();
        store
            .bulk_force_update("docs", vec![forced("a", 1, &["aaa"], Expected::Absent)])
            .await
            .unwrap();

        // Checked for the whole batch before anything is written
        let err = store
            .bulk_force_update(
                "docs",
                vec![
                    forced("b", 1, &["bbb"], Expected::Absent),
                    forced("a", 1, &["zzz"], Expected::Absent),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(store.get("docs", "b").await.unwrap().is_none());
        assert_eq!(store.get("docs", "a").await.unwrap().unwrap().rev, "1-aaa");
    }

    #[tokio::test]
    async fn test_update_at_max_generation_is_invalid() {
        let store = store();
        let top = format!("{}-top", u64::MAX);
        store
            .bulk_force_update(
                "docs",
                vec![forced("a", u64::MAX, &["top"], Expected::Absent)],
            )
            .await
            .unwrap();

        let err = store.update("docs", "a", &top, json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(store.get("docs", "a").await.unwrap().unwrap().rev, top);
    }

    #[tokio::test]
    async fn test_all_sorted_by_id() {
        let store = store();
        store.create("docs", "b", json!({})).await.unwrap();
        store.create("docs", "a", json!({})).await.unwrap();
        store.create("other", "c", json!({})).await.unwrap();
        let ids: Vec<String> = store.all("docs").await.unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
