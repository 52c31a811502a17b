//! Replication between two instances.
//!
//! Each instance has its own in-memory store and its own revision hashes.
//! Batches are exchanged by exporting one instance and applying the export on
//! the other, the way a sharing round would.

use std::sync::Arc;

use chrono::Utc;
use sharing_core::docs::ROOT_DIR_ID;
use sharing_core::{
    BatchReport, DirDoc, DocStore, EventBus, FileDoc, Indexer, MemoryStore, Outcome,
    RealtimeEvent, Replicator, SequentialHashes, SharingConfig,
};

const FILES: &str = "io.cozy.files";

/// One instance taking part in a sharing.
struct Instance {
    replicator: Replicator<Arc<MemoryStore>>,
    store: Arc<MemoryStore>,
    bus: Arc<EventBus>,
}

impl Instance {
    async fn new(name: &str) -> Self {
        let store = Arc::new(MemoryStore::with_hashes(Arc::new(SequentialHashes::new(name))));
        let bus = Arc::new(EventBus::new());
        let replicator = Replicator::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            SharingConfig::default(),
            Arc::new(SequentialHashes::new(format!("merge-{}-", name))),
            "sharing-1",
        );
        replicator.init().await.expect("init");
        Self {
            replicator,
            store,
            bus,
        }
    }

    /// Send every document of this instance to `other`.
    async fn send_to(&self, other: &Instance) -> BatchReport {
        let batch = self.replicator.export().await.expect("export");
        other.replicator.apply_batch(&batch).await
    }

    async fn rev(&self, id: &str) -> String {
        self.store.get(FILES, id).await.unwrap().expect("document").rev
    }

    async fn create_file(&self, id: &str, name: &str) -> FileDoc {
        let mut file = FileDoc::new(id, name, ROOT_DIR_ID, Utc::now());
        self.replicator
            .indexer()
            .create_named_file_doc(&mut file)
            .await
            .unwrap();
        file
    }

    /// Local rename, through the normal path.
    async fn rename(&self, id: &str, name: &str) {
        let mut indexer = self.replicator.indexer();
        let old = indexer.file_by_id(id).await.unwrap();
        let mut file = old.clone();
        file.name = name.to_string();
        indexer.update_file_doc(Some(&old), &mut file).await.unwrap();
    }
}

fn outcomes(report: &BatchReport) -> Vec<(String, Outcome)> {
    report
        .applied
        .iter()
        .map(|r| (r.id.clone(), r.outcome))
        .collect()
}

#[tokio::test]
async fn test_initial_replication_copies_exact_revisions() {
    let a = Instance::new("a").await;
    let b = Instance::new("b").await;

    let root = a.replicator.indexer().dir_by_id(ROOT_DIR_ID).await.unwrap();
    let mut photos = DirDoc::new("d1", "Photos", &root, Utc::now());
    a.replicator
        .indexer()
        .create_named_dir_doc(&mut photos)
        .await
        .unwrap();
    let mut cat = FileDoc::new("f1", "cat.jpg", "d1", Utc::now());
    cat.md5sum = "abc".into();
    cat.size = 42;
    a.replicator
        .indexer()
        .create_named_file_doc(&mut cat)
        .await
        .unwrap();
    a.rename("f1", "kitten.jpg").await;

    let (_sub, events) = b.bus.record();
    let report = a.send_to(&b).await;
    assert!(report.is_success(), "{:?}", report.failed);
    assert_eq!(
        outcomes(&report),
        vec![
            ("d1".to_string(), Outcome::Created),
            ("f1".to_string(), Outcome::Created)
        ]
    );

    assert_eq!(b.rev("d1").await, a.rev("d1").await);
    assert_eq!(b.rev("f1").await, a.rev("f1").await);
    let on_b = b.store.get(FILES, "f1").await.unwrap().unwrap();
    let on_a = a.store.get(FILES, "f1").await.unwrap().unwrap();
    assert_eq!(on_b.revisions, on_a.revisions);
    assert_eq!(on_b.body["name"], "kitten.jpg");

    let file_events: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.id() == "f1")
        .cloned()
        .collect();
    assert_eq!(file_events.len(), 1);
    match &file_events[0] {
        RealtimeEvent::Updated { doc, old, .. } => {
            assert_eq!(doc["path"], "/Photos/kitten.jpg");
            assert_eq!(old.as_ref().unwrap()["trashed"], true);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // A second round changes nothing
    let report = a.send_to(&b).await;
    assert!(report
        .applied
        .iter()
        .all(|r| r.outcome == Outcome::AlreadyKnown));
}

#[tokio::test]
async fn test_sequential_edits_fast_forward() {
    let a = Instance::new("a").await;
    let b = Instance::new("b").await;
    a.create_file("f1", "draft.txt").await;
    a.send_to(&b).await;

    a.rename("f1", "draft-2.txt").await;
    a.rename("f1", "final.txt").await;
    let report = a.send_to(&b).await;
    assert_eq!(outcomes(&report), vec![("f1".to_string(), Outcome::FastForwarded)]);
    assert_eq!(b.rev("f1").await, a.rev("f1").await);
    assert!(b.rev("f1").await.starts_with("3-"));

    // And back: b edits, a fast forwards
    b.rename("f1", "published.txt").await;
    let report = b.send_to(&a).await;
    assert_eq!(outcomes(&report), vec![("f1".to_string(), Outcome::FastForwarded)]);
    assert_eq!(a.rev("f1").await, b.rev("f1").await);
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let a = Instance::new("a").await;
    let b = Instance::new("b").await;
    a.create_file("f1", "notes.txt").await;
    a.send_to(&b).await;

    a.rename("f1", "notes-a.txt").await;
    b.rename("f1", "notes-b.txt").await;
    let a_leaf: sharing_core::Revision = a.rev("f1").await.parse().unwrap();
    let b_leaf: sharing_core::Revision = b.rev("f1").await.parse().unwrap();
    assert_eq!(a_leaf.generation(), b_leaf.generation());
    assert_ne!(a_leaf, b_leaf);

    // Same generation on both sides: a manufactures a merged revision
    let report = b.send_to(&a).await;
    assert_eq!(outcomes(&report), vec![("f1".to_string(), Outcome::Merged)]);
    assert_eq!(a.rev("f1").await, "3-merge-a-0001");

    // b is now behind the merged revision and adopts it as is
    let report = a.send_to(&b).await;
    assert_eq!(outcomes(&report), vec![("f1".to_string(), Outcome::AdoptedIncoming)]);
    assert_eq!(b.rev("f1").await, a.rev("f1").await);

    let on_a = a.replicator.file("f1").await.unwrap();
    let on_b = b.replicator.file("f1").await.unwrap();
    assert_eq!(on_a.name, on_b.name);

    // Converged: nothing left to do in either direction
    let report = b.send_to(&a).await;
    assert_eq!(outcomes(&report), vec![("f1".to_string(), Outcome::AlreadyKnown)]);
    let report = a.send_to(&b).await;
    assert_eq!(outcomes(&report), vec![("f1".to_string(), Outcome::AlreadyKnown)]);

    let shared = a
        .replicator
        .shared_refs()
        .get(FILES, "f1")
        .await
        .unwrap()
        .unwrap();
    assert!(shared.knows(&a_leaf));
    assert!(shared.knows(&b_leaf));
}

#[tokio::test]
async fn test_name_collision_is_renamed_and_replicated_back() {
    let a = Instance::new("a").await;
    let b = Instance::new("b").await;
    a.create_file("from-a", "notes.txt").await;
    b.create_file("from-b", "notes.txt").await;
    let before: sharing_core::Revision = a.rev("from-a").await.parse().unwrap();

    let report = a.send_to(&b).await;
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].renamed_to.as_deref(), Some("notes (2).txt"));

    // Exactly one revision added for the rename
    let renamed: sharing_core::Revision = b.rev("from-a").await.parse().unwrap();
    assert_eq!(renamed.generation(), before.generation() + 1);
    let chain = b.store.get(FILES, "from-a").await.unwrap().unwrap().revisions;
    assert_eq!(chain.ids[1], before.hash());

    // The rename reaches a as a fast forward
    let batch = b.replicator.export().await.unwrap();
    let only_renamed = sharing_core::ReplicationBatch::new(
        batch
            .changes
            .into_iter()
            .filter(|c| c.id() == Some("from-a"))
            .collect(),
    );
    let report = a.replicator.apply_batch(&only_renamed).await;
    assert_eq!(
        outcomes(&report),
        vec![("from-a".to_string(), Outcome::FastForwarded)]
    );
    assert_eq!(a.rev("from-a").await, b.rev("from-a").await);
    assert_eq!(a.replicator.file("from-a").await.unwrap().name, "notes (2).txt");
}
