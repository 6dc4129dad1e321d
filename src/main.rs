//! # Morning Snapshot
//!
//! A pre-market briefing pipeline. For every ticker on the watchlist it
//! drives remote browser sessions through a handful of finance sites, merges
//! what each source returned into one record per ticker, and writes JSON
//! snapshots plus a Markdown report.
//!
//! ## Features
//!
//! - Per-ticker sources: Yahoo Finance quote and AI analysis, MarketWatch
//!   top stories, Google News
//! - Batch and global sources: Vital Knowledge (one login for the whole
//!   watchlist) and the macro news brief
//! - Bounded browser concurrency with per-task failure isolation
//! - Selector cache so repeated runs skip locator discovery
//! - Error artifacts and per-session metrics for every run
//!
//! ## Usage
//!
//! ```sh
//! morning_snapshot -w config/watchlist.json -c config/snapshot.yaml
//! ```
//!
//! ## Architecture
//!
//! The run moves through fixed stages:
//! 1. **Warm-up**: prime the selector cache for sources that need it
//! 2. **Dispatch**: one task per ticker and per-ticker source, one per batch or global source
//! 3. **Collect**: gather results as tasks finish, bounded by the session limit
//! 4. **Merge**: fold the results into one record per ticker
//! 5. **Persist / Report**: JSON snapshots and the Markdown report

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cache;
mod cli;
mod config;
mod error;
mod models;
mod observability;
mod outputs;
mod pipeline;
mod retry;
mod runner;
mod session;
mod sources;
mod utils;

use cache::SelectorCache;
use cli::Cli;
use config::{Settings, load_watchlist};
use error::{FailurePoint, Result};
use observability::{ErrorRecord, ErrorTracker, Guardrails, MetricsCollector};
use pipeline::{OutputDirs, Pipeline, RunSummary};
use runner::SessionRunner;
use session::stagehand::StagehandProvider;
use sources::FetchContext;
use utils::ensure_writable_dir;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("morning_snapshot starting up");

    let args = Cli::parse();
    debug!(?args.snapshot_dir, ?args.reports_dir, ?args.watchlist, "Parsed CLI arguments");

    // Early check: every output directory must be writable
    for dir in args.output_dirs() {
        if let Err(e) = ensure_writable_dir(&dir).await {
            error!(
                path = %dir.display(),
                error = %e,
                "Output directory is not writable (fix perms or choose a different path)"
            );
            return ExitCode::FAILURE;
        }
    }

    let errors = match ErrorTracker::new(&args.errors_dir) {
        Ok(tracker) => Arc::new(tracker),
        Err(e) => {
            error!(path = %args.errors_dir.display(), error = %e, "Failed to prepare error directory");
            return ExitCode::FAILURE;
        }
    };

    let code = match run(&args, Arc::clone(&errors)).await {
        Ok(summary) => {
            info!(
                tickers = summary.tickers,
                tasks = summary.tasks,
                succeeded = summary.succeeded,
                failed = summary.failed,
                snapshots = summary.snapshots.len(),
                report = ?summary.report,
                metrics = ?summary.metrics,
                errors = summary.errors,
                "Morning snapshot complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Morning snapshot failed");
            errors.record(
                ErrorRecord::from_error(&e, "Pipeline (main)").with_failure_point(FailurePoint::Pipeline),
            );
            error!(summary = %errors.summary_path().display(), "See error summary");
            ExitCode::FAILURE
        }
    };

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );
    code
}

/// Wire settings, cache, session provider and runner together and run the
/// pipeline once.
#[instrument(level = "info", skip_all, fields(watchlist = %args.watchlist.display()))]
async fn run(args: &Cli, errors: Arc<ErrorTracker>) -> Result<RunSummary> {
    let mut settings = Settings::load(args.config.as_deref(), |key| std::env::var(key).ok());
    settings.watchlist = load_watchlist(&args.watchlist);

    let cache = if args.memory_cache || settings.memory_cache {
        SelectorCache::in_memory()
    } else {
        SelectorCache::persistent(&args.cache_file)
    };
    info!(entries = cache.len(), "Selector cache ready");

    let ctx = FetchContext {
        cache: Arc::new(cache),
        errors,
        lookback_days: settings.lookback_days,
        max_stories: settings.max_stories,
        max_cards: settings.max_cards,
        navigation: settings.navigation,
        extraction: settings.extraction,
        credentials: args.credentials(),
    };

    let metrics = Arc::new(MetricsCollector::new(&args.metrics_dir));
    let provider = Arc::new(StagehandProvider::new(args.stagehand_config())?);
    let runner = SessionRunner::new(provider, settings.max_concurrent_browsers, Arc::clone(&metrics), ctx)
        .with_guardrails(Guardrails::new(settings.guardrails))
        .with_region(args.region.clone());

    let dirs = OutputDirs {
        snapshots: args.snapshot_dir.clone(),
        reports: args.reports_dir.clone(),
    };
    let mut pipeline = Pipeline::new(settings, Arc::new(runner), metrics, dirs);
    if let Some(step) = &args.metrics_step {
        pipeline = pipeline.with_metrics_step(step.clone());
    }
    pipeline.run().await
}
