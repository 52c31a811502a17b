//! sharing-replay: apply replication batches to a fresh in-memory instance.
//!
//! Runs the same replicator as a real instance, against a `MemoryStore`, and
//! prints the outcome of every change, the resulting documents and the
//! realtime events as JSON.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sharing_core::{
    EventBus, HashSource, MemoryStore, RandomHashes, ReplicationBatch, Replicator,
    SequentialHashes, SharingConfig,
};

#[derive(Parser, Debug)]
#[command(name = "sharing-replay")]
#[command(about = "Apply replication batches to an in-memory instance")]
struct Args {
    /// Batch files, applied in order
    #[arg(required = true)]
    batches: Vec<PathBuf>,

    /// JSON config file (defaults to SHARING_* environment variables)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sharing the batches belong to
    #[arg(long, default_value = "replay")]
    sharing_id: String,

    /// Generate revision hashes as <prefix>0001, <prefix>0002, ...
    #[arg(long)]
    deterministic: Option<String>,

    /// Print the final state as a replication batch instead of a report
    #[arg(long)]
    export: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays valid JSON
    let default_filter = if args.verbose {
        "debug,sharing_core=debug"
    } else {
        "info,sharing_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => SharingConfig::from_file(path)?,
        None => SharingConfig::from_env()?,
    };
    let hashes: Arc<dyn HashSource> = match &args.deterministic {
        Some(prefix) => Arc::new(SequentialHashes::new(prefix.clone())),
        None => Arc::new(RandomHashes::new(config.rev_hash_bytes)),
    };

    let store = Arc::new(MemoryStore::with_hashes(Arc::clone(&hashes)));
    let bus = Arc::new(EventBus::new());
    let replicator = Replicator::new(store, Arc::clone(&bus), config, hashes, &args.sharing_id);
    replicator.init().await?;
    let (_subscription, events) = bus.record();

    let mut reports = Vec::new();
    let mut failures = Vec::new();
    for path in &args.batches {
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let batch = ReplicationBatch::from_json(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        info!("Applying {} change(s) from {}", batch.len(), path.display());

        let report = replicator.apply_batch(&batch).await;
        reports.extend(report.applied);
        for (id, error) in report.failed {
            warn!("{}: {}", id, error);
            failures.push(json!({ "id": id, "error": error.to_string() }));
        }
    }

    let state = replicator.export().await?;
    let output = if args.export {
        serde_json::to_value(&state)?
    } else {
        let documents: Vec<_> = state
            .changes
            .iter()
            .map(|c| json!({ "rev": c.rev, "doc": c.doc }))
            .collect();
        let events = events.lock().map(|e| e.clone()).unwrap_or_default();
        json!({
            "reports": reports,
            "failures": failures,
            "documents": documents,
            "events": events,
        })
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    if !failures.is_empty() {
        bail!("{} change(s) could not be applied", failures.len());
    }
    Ok(())
}
