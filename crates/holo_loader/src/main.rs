//! Restore loader node.
//!
//! `replay` runs one loader against a directory backup and drives it through
//! a JSON restore plan with a local coordinator. Routed mutations are written
//! as JSON lines per applier and a summary is printed to stdout.

mod applier_log;
mod fs_backup;
mod plan;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_restore::restore::{Loader, LoaderConfig, LoaderState, NodeId};

use crate::applier_log::JsonLinesApplier;
use crate::fs_backup::FsBackupSource;
use crate::plan::{ChannelCoordinator, ReplayDriver, RestorePlan};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-loader")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Replay(ReplayArgs),
}

/// CLI options for replaying a restore plan.
#[derive(Parser, Debug)]
struct ReplayArgs {
    /// Restore plan (JSON).
    #[arg(long, env = "HOLO_LOADER_PLAN")]
    plan: PathBuf,

    /// Directory receiving `applier-<id>.jsonl` files.
    #[arg(long, env = "HOLO_LOADER_OUT_DIR")]
    out_dir: PathBuf,

    /// Backup location (`file:///dir` or a path). Overrides the plan's url.
    #[arg(long, env = "HOLO_LOADER_BACKUP_URL")]
    backup_url: Option<String>,

    #[arg(long, env = "HOLO_LOADER_NODE_ID", default_value_t = 1)]
    node_id: NodeId,

    #[arg(long, env = "HOLO_LOADER_NODE_INDEX", default_value_t = 0)]
    node_index: usize,

    /// Backup files read concurrently.
    #[arg(long, env = "HOLO_LOADER_MAX_INFLIGHT_FETCHES", default_value_t = 8)]
    max_inflight_fetches: usize,

    /// Soft cap on the size of one applier message.
    #[arg(long, env = "HOLO_LOADER_SEND_BATCH_MAX_BYTES", default_value_t = 1024 * 1024)]
    send_batch_max_bytes: usize,

    /// Attempts per file before a retryable failure is reported.
    #[arg(long, env = "HOLO_LOADER_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// How long to wait for any single loader report.
    #[arg(long, env = "HOLO_LOADER_REPORT_TIMEOUT_MS", default_value_t = 60_000)]
    report_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Replay(args) => run_replay(args).await,
    }
}

async fn run_replay(args: ReplayArgs) -> anyhow::Result<()> {
    let plan = RestorePlan::load(&args.plan)?;
    let backup_url = args
        .backup_url
        .clone()
        .unwrap_or_else(|| plan.backup_url.clone());
    let cfg = LoaderConfig {
        max_inflight_fetches: args.max_inflight_fetches,
        send_batch_max_bytes: args.send_batch_max_bytes,
    }
    .normalized();

    let sink = Arc::new(JsonLinesApplier::create(&args.out_dir).await?);
    let (coordinator, mut reports) = ChannelCoordinator::channel();
    let loader = Loader::new(
        LoaderState::new(args.node_id, args.node_index),
        Arc::new(FsBackupSource),
        sink,
        Arc::new(coordinator),
        cfg,
    )
    .spawn(64);

    tracing::info!(
        plan = %args.plan.display(),
        backup_url = %backup_url,
        batches = plan.batches.len(),
        appliers = plan.appliers.len(),
        "replaying restore plan"
    );
    let mut driver = ReplayDriver::new(
        &plan,
        &backup_url,
        Duration::from_millis(args.report_timeout_ms.max(1)),
        args.max_attempts,
    );
    let outcome = tokio::select! {
        outcome = driver.run(&loader, &mut reports) => outcome,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("replay interrupted")),
    };
    let state = loader.shutdown().await?;
    tracing::info!(
        node = %state.describe_node(),
        batches = state.cumulative.batches_completed,
        files = state.cumulative.files_loaded,
        mutations = state.cumulative.mutations_routed,
        bytes = state.cumulative.bytes_read,
        "loader stopped"
    );
    let summary = outcome?;
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("encode summary")?
    );
    anyhow::ensure!(
        summary.failed_files() == 0,
        "{} file(s) failed to load",
        summary.failed_files()
    );
    Ok(())
}
