//! Shelf Sync - reconcile two captured e-book libraries from the command line.
//!
//! Both captures are JSON arrays of records. The job report and the
//! reconciled target library are printed to stdout as JSON; logs go to
//! stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use shelf_engine::{MergePolicy, RecordSet};
use shelf_sync::config::{Config, DEFAULT_LOG_FILTER};
use shelf_sync::{InMemoryPlatform, JobStatus, SyncOrchestrator, SyncRequest};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "shelf-sync", version, about)]
struct Args {
    /// Source library capture
    source: PathBuf,

    /// Target library capture
    target: PathBuf,

    /// How changes are written to the target (merge, overwrite, append)
    #[arg(long, env = "SHELF_MERGE_POLICY", default_value = "merge")]
    policy: MergePolicy,

    /// Resolve conflicts automatically where confidence allows
    #[arg(long)]
    auto_resolve: bool,

    #[arg(long, default_value = "source")]
    source_platform: String,

    #[arg(long, default_value = "target")]
    target_platform: String,
}

fn read_capture(path: &Path) -> Result<RecordSet, Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)?;
    let values: Vec<Value> = serde_json::from_str(&json)?;
    let records = RecordSet::from_json_values(values);
    if records.rejected() > 0 {
        tracing::warn!(
            path = %path.display(),
            rejected = records.rejected(),
            quarantined = ?records.quarantined(),
            "Skipped malformed records"
        );
    }
    Ok(records)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_capture(&args.source_platform, read_capture(&args.source)?);
    platform.insert_capture(&args.target_platform, read_capture(&args.target)?);

    let orchestrator = SyncOrchestrator::new(config.reconcile, platform.clone(), platform.clone());
    let request = SyncRequest::new([args.source_platform.clone()], [args.target_platform.clone()])
        .with_policy(args.policy)
        .with_auto_resolve(args.auto_resolve);

    tracing::info!(
        source = %args.source_platform,
        target = %args.target_platform,
        policy = %args.policy,
        "Starting sync"
    );
    let job_id = orchestrator.submit(request)?;
    let job = orchestrator.wait(job_id).await?;
    let report = orchestrator.report(job_id)?;

    let output = serde_json::json!({
        "job": job,
        "report": report,
        "library": platform.records(&args.target_platform),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    if job.status != JobStatus::Completed {
        let error = job.error.unwrap_or_else(|| job.status.to_string());
        return Err(format!("sync job {job_id} did not complete: {error}").into());
    }
    Ok(())
}
