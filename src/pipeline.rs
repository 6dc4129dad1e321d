//! The morning run, stage by stage.
//!
//! ```text
//! INIT → WARMUP → DISPATCH → COLLECT → MERGE → PERSIST → REPORT → DONE
//! ```
//!
//! Every fetch is a task in one [`JoinSet`]: one per (ticker, per-ticker
//! source), one per batch source covering the whole watchlist, one per global
//! source. All of them go through the same [`SessionRunner`], so the runner's
//! semaphore is the only thing bounding open sessions.
//!
//! A failed task never stops the run. It leaves its slot empty and adds
//! `"{Source} failed"` to every ticker it covered. DONE runs even when an
//! earlier stage returned an error.

use crate::config::Settings;
use crate::error::{FailurePoint, Result, SnapshotError};
use crate::models::{MacroNewsSummary, Ticker, TickerRecord};
use crate::observability::{ErrorRecord, ErrorTracker, MetricsCollector};
use crate::outputs::markdown::{ReportItem, build_morning_report, write_report_file};
use crate::outputs::json::write_snapshot;
use crate::runner::SessionRunner;
use crate::sources::{FetchOutcome, FetchShape, FetchTarget, SourceData, SourceFetcher, SourceKind, SourceRegistry};
use chrono::{Local, NaiveDate};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Warmup,
    Dispatch,
    Collect,
    Merge,
    Persist,
    Report,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Warmup => "WARMUP",
            Self::Dispatch => "DISPATCH",
            Self::Collect => "COLLECT",
            Self::Merge => "MERGE",
            Self::Persist => "PERSIST",
            Self::Report => "REPORT",
            Self::Done => "DONE",
        })
    }
}

/// What a dispatched task was for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskKey {
    pub kind: SourceKind,
    pub target: FetchTarget,
}

/// `None` outcome: the task failed and its failure is already recorded.
type TaskResult = (TaskKey, Option<FetchOutcome>);

#[derive(Debug, Clone)]
pub struct OutputDirs {
    pub snapshots: PathBuf,
    pub reports: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Merged {
    /// Watchlist order.
    pub records: Vec<TickerRecord>,
    pub macro_news: Option<MacroNewsSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub tickers: usize,
    pub tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub snapshots: Vec<PathBuf>,
    pub report: Option<PathBuf>,
    pub metrics: Option<PathBuf>,
    pub errors: usize,
}

pub struct Pipeline {
    settings: Settings,
    registry: SourceRegistry,
    runner: Arc<SessionRunner>,
    metrics: Arc<MetricsCollector>,
    dirs: OutputDirs,
    metrics_step: Option<String>,
    as_of: NaiveDate,
}

impl Pipeline {
    /// Pipeline over the built-in sources enabled in `settings`.
    pub fn new(settings: Settings, runner: Arc<SessionRunner>, metrics: Arc<MetricsCollector>, dirs: OutputDirs) -> Self {
        let registry = SourceRegistry::from_toggles(&settings.sources);
        Self {
            settings,
            registry,
            runner,
            metrics,
            dirs,
            metrics_step: None,
            as_of: Local::now().date_naive(),
        }
    }

    /// Save metrics as `{step}.json` instead of `run_{run_id}.json`.
    pub fn with_metrics_step(mut self, step: impl Into<String>) -> Self {
        self.metrics_step = Some(step.into());
        self
    }

    fn errors(&self) -> &Arc<ErrorTracker> {
        &self.runner.context().errors
    }

    fn enter(&self, stage: Stage) {
        info!(%stage, "Pipeline stage");
    }

    #[instrument(level = "info", skip_all, fields(as_of = %self.as_of, tickers = self.settings.watchlist.len()))]
    pub async fn run(&self) -> Result<RunSummary> {
        let outcome = self.execute().await;

        self.enter(Stage::Done);
        let metrics_path = match self.metrics.save_run_metrics(self.metrics_step.as_deref()) {
            Ok(path) => Some(path),
            Err(e) => {
                error!(error = %e, "Failed to save run metrics");
                None
            }
        };
        self.metrics.log_summary();
        self.log_error_summary();

        let mut summary = outcome?;
        summary.metrics = metrics_path;
        summary.errors = self.errors().len();
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            snapshots = summary.snapshots.len(),
            report = ?summary.report,
            "Run complete"
        );
        Ok(summary)
    }

    async fn execute(&self) -> Result<RunSummary> {
        self.enter(Stage::Init);
        let tickers = &self.settings.watchlist;
        info!(
            sources = ?self.registry,
            watchlist = ?tickers,
            max_concurrent_browsers = self.settings.max_concurrent_browsers,
            "Sources enabled"
        );
        if self.registry.is_empty() {
            warn!("Every source is disabled; nothing will be fetched");
        }

        self.enter(Stage::Warmup);
        for fetcher in self.registry.fetchers() {
            if fetcher.needs_warm_up(self.runner.context()) {
                self.runner.warm_up(fetcher).await;
            }
        }

        self.enter(Stage::Dispatch);
        let (mut set, mut keys) = self.dispatch(tickers);
        let tasks = keys.len();
        info!(tasks, "Tasks dispatched");

        self.enter(Stage::Collect);
        let mut results = Vec::with_capacity(tasks);
        match self.settings.run_timeout {
            Some(limit) => {
                let drained = tokio::time::timeout(limit, self.drain(&mut set, &mut keys, &mut results)).await;
                if drained.is_err() {
                    warn!(?limit, unfinished = set.len(), "Run timeout reached; aborting unfinished tasks");
                    set.abort_all();
                    self.drain(&mut set, &mut keys, &mut results).await;
                }
            }
            None => self.drain(&mut set, &mut keys, &mut results).await,
        }
        let succeeded = results.iter().filter(|(_, outcome)| outcome.is_some()).count();
        let failed = results.len() - succeeded;

        self.enter(Stage::Merge);
        let merged = merge(tickers, results);

        self.enter(Stage::Persist);
        let mut snapshots = Vec::new();
        for category in self.registry.categories() {
            let path = write_snapshot(
                &self.dirs.snapshots,
                category,
                self.as_of,
                &merged.records,
                merged.macro_news.as_ref(),
            )
            .await?;
            snapshots.push(path);
        }

        self.enter(Stage::Report);
        let report = self.report(&merged).await?;

        Ok(RunSummary {
            tickers: tickers.len(),
            tasks,
            succeeded,
            failed,
            snapshots,
            report,
            metrics: None,
            errors: 0,
        })
    }

    fn dispatch(&self, tickers: &[Ticker]) -> (JoinSet<Option<FetchOutcome>>, HashMap<Id, TaskKey>) {
        let mut set = JoinSet::new();
        let mut keys = HashMap::new();
        let mut spawn = |fetcher: &Arc<dyn SourceFetcher>, target: FetchTarget, set: &mut JoinSet<Option<FetchOutcome>>| {
            let runner = Arc::clone(&self.runner);
            let fetcher = Arc::clone(fetcher);
            let kind = fetcher.kind();
            let task_target = target.clone();
            let handle = set.spawn(async move { runner.run(fetcher, task_target).await });
            keys.insert(handle.id(), TaskKey { kind, target });
        };

        for ticker in tickers {
            for fetcher in self.registry.fetchers() {
                if fetcher.kind().shape() == FetchShape::PerTicker {
                    spawn(fetcher, FetchTarget::Ticker(ticker.clone()), &mut set);
                }
            }
        }
        for fetcher in self.registry.fetchers() {
            match fetcher.kind().shape() {
                FetchShape::Batch if !tickers.is_empty() => {
                    info!(source = %fetcher.kind(), tickers = tickers.len(), "Batch fetch in its own session");
                    spawn(fetcher, FetchTarget::Tickers(tickers.to_vec()), &mut set);
                }
                FetchShape::Global => {
                    info!(source = %fetcher.kind(), "Global fetch in its own session");
                    spawn(fetcher, FetchTarget::Global, &mut set);
                }
                _ => {}
            }
        }
        (set, keys)
    }

    async fn drain(
        &self,
        set: &mut JoinSet<Option<FetchOutcome>>,
        keys: &mut HashMap<Id, TaskKey>,
        results: &mut Vec<TaskResult>,
    ) {
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => match keys.remove(&id) {
                    Some(key) => results.push((key, outcome)),
                    None => warn!(%id, "Finished task has no key"),
                },
                Err(e) => match keys.remove(&e.id()) {
                    Some(key) => {
                        self.record_join_error(&key, e);
                        results.push((key, None));
                    }
                    None => warn!(error = %e, "Unknown task failed"),
                },
            }
        }
    }

    fn record_join_error(&self, key: &TaskKey, e: JoinError) {
        let err = if e.is_cancelled() {
            SnapshotError::Timeout(self.settings.run_timeout.unwrap_or_default())
        } else {
            SnapshotError::Panicked(e.to_string())
        };
        error!(source = %key.kind, ticker = ?key.target.label(), error = %err, "Task did not finish");
        let mut record = ErrorRecord::from_error(&err, format!("Pipeline ({})", module_path!()))
            .with_failure_point(FailurePoint::Coordination)
            .with_context("source", key.kind.name())
            .with_context("function", "collect");
        if let Some(label) = key.target.label() {
            record = record.with_context("ticker", label);
        }
        self.errors().record(record);
    }

    async fn report(&self, merged: &Merged) -> Result<Option<PathBuf>> {
        let items: Vec<ReportItem<'_>> = merged
            .records
            .iter()
            .filter_map(|record| {
                if let Some(line) = record.error_line() {
                    info!(ticker = %record.ticker, errors = %line, "Ticker had source errors");
                }
                let item = ReportItem::from_record(record);
                if item.is_none() {
                    warn!(ticker = %record.ticker, "Skipping ticker in report (no quote data)");
                }
                item
            })
            .collect();

        if items.is_empty() {
            warn!("No successful tickers to include in report");
            return Ok(None);
        }

        let markdown = build_morning_report(self.as_of, &items, merged.macro_news.as_ref());
        let path = write_report_file(&self.dirs.reports, self.as_of, &markdown).await?;
        Ok(Some(path))
    }

    fn log_error_summary(&self) {
        let summary = self.errors().summary();
        if summary.total_errors == 0 {
            info!("No errors recorded");
            return;
        }
        let breakdown = summary.summary.as_ref();
        warn!(
            total = summary.total_errors,
            most_problematic = breakdown
                .and_then(|b| b.most_problematic_component.as_ref())
                .map(|c| c.component.as_str())
                .unwrap_or("-"),
            most_common_type = breakdown
                .and_then(|b| b.most_common_error_type.as_ref())
                .map(|t| t.error_type.as_str())
                .unwrap_or("-"),
            summary_path = %self.errors().summary_path().display(),
            "Errors recorded this run"
        );
    }
}

/// Fold task results into one record per watchlist ticker.
pub fn merge(tickers: &[Ticker], results: Vec<TaskResult>) -> Merged {
    let mut records: Vec<TickerRecord> = tickers.iter().map(|t| TickerRecord::new(t)).collect();
    let index: HashMap<Ticker, usize> = tickers.iter().enumerate().map(|(i, t)| (t.clone(), i)).collect();
    let mut macro_news = None;

    for (key, outcome) in results {
        let data = match outcome {
            Some(FetchOutcome::Data(data)) => data,
            Some(FetchOutcome::Empty { reason }) => {
                debug!(source = %key.kind, ticker = ?key.target.label(), %reason, "Source produced nothing");
                continue;
            }
            None => {
                let covered = key.target.tickers();
                if covered.is_empty() {
                    warn!(source = %key.kind, "Global source failed");
                }
                for ticker in covered {
                    if let Some(&i) = index.get(&ticker) {
                        records[i].errors.push(format!("{} failed", key.kind.name()));
                    }
                }
                continue;
            }
        };

        if let SourceData::VitalKnowledgeBatch(mut batch) = data {
            for ticker in key.target.tickers() {
                let Some(&i) = index.get(&ticker) else { continue };
                match batch.remove(&ticker) {
                    Some(report) => {
                        info!(%ticker, headlines = report.headlines.len(), "Vital Knowledge headlines from batch");
                        records[i].vital_knowledge = Some(report);
                    }
                    None => warn!(%ticker, "No Vital Knowledge data from batch"),
                }
            }
            continue;
        }
        if let SourceData::MacroNews(brief) = data {
            macro_news = Some(brief);
            continue;
        }

        let Some(i) = key.target.label().and_then(|t| index.get(&t).copied()) else {
            warn!(source = %key.kind, target = ?key.target, "Result for a ticker outside the watchlist");
            continue;
        };
        let record = &mut records[i];
        match data {
            SourceData::Quote(quote) => record.quote = Some(quote),
            SourceData::Analysis(analysis) => record.analysis = Some(analysis),
            SourceData::MarketWatch(stories) => record.marketwatch = Some(stories),
            SourceData::GoogleNews(stories) => record.googlenews = Some(stories),
            SourceData::VitalKnowledgeBatch(_) | SourceData::MacroNews(_) => {}
        }
    }

    Merged { records, macro_news }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceToggles;
    use crate::models::{QuoteSnapshot, VitalKnowledgeReport};
    use crate::session::SessionProvider;
    use crate::session::fake::FakeProvider;
    use crate::sources::yahoo::QUOTE_CONTAINER_KEY;
    use crate::sources::{Credentials, FetchContext, test_context};
    use serde_json::{Value, json};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn only(toggles: &[SourceKind]) -> SourceToggles {
        let mut out = SourceToggles {
            yahoo_quote: false,
            yahoo_analysis: false,
            marketwatch: false,
            google_news: false,
            vital_knowledge: false,
            macro_news: false,
        };
        for kind in toggles {
            match kind {
                SourceKind::YahooQuote => out.yahoo_quote = true,
                SourceKind::YahooAnalysis => out.yahoo_analysis = true,
                SourceKind::MarketWatch => out.marketwatch = true,
                SourceKind::GoogleNews => out.google_news = true,
                SourceKind::VitalKnowledge => out.vital_knowledge = true,
                SourceKind::MacroNews => out.macro_news = true,
            }
        }
        out
    }

    struct Harness {
        pipeline: Pipeline,
        runner: Arc<SessionRunner>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn path(&self, rel: &str) -> PathBuf {
            self.dir.path().join(rel)
        }
    }

    fn harness(provider: &Arc<FakeProvider>, tickers: &[&str], sources: &[SourceKind], k: usize) -> Harness {
        harness_with(provider, tickers, sources, k, |_, _| {})
    }

    fn harness_with(
        provider: &Arc<FakeProvider>,
        tickers: &[&str],
        sources: &[SourceKind],
        k: usize,
        tweak: impl FnOnce(&mut Settings, &mut FetchContext),
    ) -> Harness {
        let (mut ctx, dir) = test_context();
        ctx.cache.set(QUOTE_CONTAINER_KEY, "xpath=/main");
        let mut settings = Settings {
            sources: only(sources),
            max_concurrent_browsers: k,
            watchlist: tickers.iter().map(|t| t.to_string()).collect(),
            ..Settings::default()
        };
        tweak(&mut settings, &mut ctx);

        let metrics = Arc::new(MetricsCollector::with_run_id(dir.path().join("metrics"), "test"));
        let provider: Arc<dyn SessionProvider> = provider.clone();
        let runner = Arc::new(SessionRunner::new(provider, k, Arc::clone(&metrics), ctx));
        let dirs = OutputDirs {
            snapshots: dir.path().join("snapshots"),
            reports: dir.path().join("reports"),
        };
        let pipeline = Pipeline::new(settings, Arc::clone(&runner), metrics, dirs);
        Harness { pipeline, runner, dir }
    }

    fn quotes() -> FakeProvider {
        FakeProvider::new()
            .on_extract("current price", json!({ "last_price": 101.0, "change_pct": 0.4 }))
            .on_extract("top news stories", json!({ "stories": [{ "headline": "Shares climb" }] }))
    }

    fn read_json(path: &std::path::Path) -> Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    fn record<'a>(merged: &'a Merged, ticker: &str) -> &'a TickerRecord {
        merged.records.iter().find(|r| r.ticker == ticker).unwrap()
    }

    #[tokio::test]
    async fn test_two_tickers_one_slot_primary_source_only() {
        let provider = Arc::new(quotes());
        let h = harness(&provider, &["AAPL", "GOOGL"], &[SourceKind::YahooQuote], 1);

        let summary = h.pipeline.run().await.unwrap();

        assert_eq!(provider.created(), 2);
        assert_eq!(provider.peak(), 1);
        assert_eq!(provider.open(), 0);
        assert_eq!((summary.succeeded, summary.failed), (2, 0));

        assert_eq!(summary.snapshots, vec![h.path("snapshots").join(format!(
            "yahoo_snapshot_{}.json",
            Local::now().date_naive().format("%Y-%m-%d")
        ))]);
        let snapshot = read_json(&summary.snapshots[0]);
        let rows = snapshot["tickers"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["ticker"], "AAPL");
        assert_eq!(rows[1]["ticker"], "GOOGL");
        assert!(rows.iter().all(|r| r["quote"]["last_price"] == 101.0 && r["error"].is_null()));

        let report = std::fs::read_to_string(summary.report.unwrap()).unwrap();
        assert!(report.contains("### AAPL"));
        assert!(report.contains("### GOOGL"));

        let metrics = read_json(&summary.metrics.unwrap());
        assert_eq!(metrics["summary"]["success_count"], 2);
        assert_eq!(metrics["summary"]["error_count"], 0);
        assert_eq!(summary.errors, 0);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_source_and_ticker() {
        let provider = Arc::new(quotes().fail_goto("quote/GOOGL"));
        let h = harness(
            &provider,
            &["AAPL", "GOOGL", "MSFT"],
            &[SourceKind::YahooQuote, SourceKind::MarketWatch],
            2,
        );

        let (mut set, mut keys) = h.pipeline.dispatch(&h.pipeline.settings.watchlist);
        let mut results = Vec::new();
        h.pipeline.drain(&mut set, &mut keys, &mut results).await;
        let merged = merge(&h.pipeline.settings.watchlist, results);

        let googl = record(&merged, "GOOGL");
        assert!(googl.quote.is_none());
        assert_eq!(googl.errors, vec!["YahooQuote failed"]);
        assert_eq!(googl.marketwatch.as_ref().unwrap().stories.len(), 1);

        for ticker in ["AAPL", "MSFT"] {
            let r = record(&merged, ticker);
            assert_eq!(r.quote.as_ref().unwrap().ticker, ticker);
            assert!(r.marketwatch.is_some());
            assert!(r.errors.is_empty());
        }
        assert_eq!(h.runner.context().errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_sessions_never_exceed_the_limit() {
        for k in 1..=3 {
            let provider = Arc::new(quotes().with_latency(Duration::from_millis(200)));
            let h = harness(
                &provider,
                &["AAPL", "GOOGL", "MSFT", "AMZN"],
                &[SourceKind::YahooQuote, SourceKind::MarketWatch],
                k,
            );
            let summary = h.pipeline.run().await.unwrap();
            assert_eq!(summary.tasks, 8);
            assert_eq!(provider.created(), 8);
            assert_eq!(provider.peak(), k, "limit {k}");
            assert_eq!(provider.open(), 0);
        }
    }

    #[test]
    fn test_batch_gap_leaves_slot_empty() {
        let tickers: Vec<Ticker> = ["T1", "T2", "T3"].into_iter().map(String::from).collect();
        let batch: BTreeMap<Ticker, VitalKnowledgeReport> = ["T1", "T3"]
            .into_iter()
            .map(|t| (t.to_string(), VitalKnowledgeReport::empty(t)))
            .collect();
        let results = vec![(
            TaskKey {
                kind: SourceKind::VitalKnowledge,
                target: FetchTarget::Tickers(tickers.clone()),
            },
            Some(FetchOutcome::Data(SourceData::VitalKnowledgeBatch(batch))),
        )];

        let merged = merge(&tickers, results);
        assert_eq!(record(&merged, "T1").vital_knowledge, Some(VitalKnowledgeReport::empty("T1")));
        assert_eq!(record(&merged, "T2").vital_knowledge, None);
        assert!(record(&merged, "T2").errors.is_empty());
        assert_eq!(record(&merged, "T3").vital_knowledge, Some(VitalKnowledgeReport::empty("T3")));
    }

    #[test]
    fn test_failed_batch_marks_every_ticker() {
        let tickers: Vec<Ticker> = vec!["AAPL".into(), "GOOGL".into()];
        let results = vec![
            (
                TaskKey {
                    kind: SourceKind::VitalKnowledge,
                    target: FetchTarget::Tickers(tickers.clone()),
                },
                None,
            ),
            (
                TaskKey {
                    kind: SourceKind::YahooQuote,
                    target: FetchTarget::Ticker("AAPL".into()),
                },
                Some(FetchOutcome::Data(SourceData::Quote(QuoteSnapshot {
                    ticker: "AAPL".into(),
                    ..Default::default()
                }))),
            ),
            (
                TaskKey {
                    kind: SourceKind::MacroNews,
                    target: FetchTarget::Global,
                },
                None,
            ),
        ];

        let merged = merge(&tickers, results);
        assert_eq!(record(&merged, "AAPL").errors, vec!["VitalKnowledge failed"]);
        assert_eq!(record(&merged, "GOOGL").errors, vec!["VitalKnowledge failed"]);
        assert!(record(&merged, "AAPL").quote.is_some());
        assert!(merged.macro_news.is_none());
    }

    #[tokio::test]
    async fn test_report_only_lists_quoted_tickers() {
        let provider = Arc::new(quotes().fail_goto("quote/GOOGL"));
        let h = harness(&provider, &["AAPL", "GOOGL"], &[SourceKind::YahooQuote], 2);

        let summary = h.pipeline.run().await.unwrap();
        let report = std::fs::read_to_string(summary.report.unwrap()).unwrap();
        assert!(report.contains("### AAPL"));
        assert!(!report.contains("GOOGL"));

        let snapshot = read_json(&summary.snapshots[0]);
        assert_eq!(snapshot["tickers"][1]["error"], "YahooQuote failed");
    }

    #[tokio::test]
    async fn test_no_quotes_means_no_report_but_metrics() {
        let provider = Arc::new(quotes().fail_goto("finance.yahoo.com"));
        let h = harness(&provider, &["AAPL", "GOOGL"], &[SourceKind::YahooQuote], 2);

        let summary = h.pipeline.run().await.unwrap();
        assert!(summary.report.is_none());
        assert!(!h.path("reports").exists());
        assert!(summary.metrics.as_ref().unwrap().exists());
        assert_eq!(read_json(&summary.metrics.unwrap())["summary"]["error_count"], 2);
        assert_eq!(summary.errors, 2);
    }

    #[tokio::test]
    async fn test_warm_up_runs_once_before_dispatch() {
        let provider = Arc::new(quotes().with_observed(vec![crate::session::ObservedElement {
            selector: "xpath=/body/section".into(),
            description: "quote".into(),
            method: None,
            arguments: vec![],
        }]));
        let h = harness(&provider, &["AAPL", "GOOGL"], &[SourceKind::YahooQuote], 2);
        h.runner.context().cache.clear();

        let summary = h.pipeline.run().await.unwrap();
        assert_eq!(provider.created(), 3);
        assert_eq!(summary.succeeded, 2);
        let extracts: Vec<_> = provider
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("extract"))
            .collect();
        assert!(extracts.iter().all(|c| c.ends_with("selector=xpath=/body/section")));
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_the_batch_for_every_ticker() {
        let provider = Arc::new(quotes());
        let h = harness_with(&provider, &["AAPL", "GOOGL"], &[SourceKind::VitalKnowledge], 1, |_, ctx| {
            ctx.credentials = Credentials::default();
        });

        let summary = h.pipeline.run().await.unwrap();
        assert_eq!((summary.tasks, summary.failed), (1, 1));
        assert!(summary.report.is_none());
        let snapshot = read_json(&summary.snapshots[0]);
        assert!(summary.snapshots[0].ends_with(format!(
            "vital_knowledge_snapshot_{}.json",
            Local::now().date_naive().format("%Y-%m-%d")
        )));
        for row in snapshot["tickers"].as_array().unwrap() {
            assert_eq!(row["error"], "VitalKnowledge failed");
            assert!(row["vital_knowledge"].is_null());
        }
        let records = h.runner.context().errors.records();
        assert_eq!(records[0].error_type, "MissingCredentialsError");
        assert_eq!(records[0].context["tickers"], json!(["AAPL", "GOOGL"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_aborts_and_closes_sessions() {
        let provider = Arc::new(quotes().with_latency(Duration::from_secs(60)));
        let h = harness_with(&provider, &["AAPL", "GOOGL"], &[SourceKind::YahooQuote], 2, |s, _| {
            s.run_timeout = Some(Duration::from_secs(30));
        });

        let summary = h.pipeline.run().await.unwrap();
        assert_eq!((summary.succeeded, summary.failed), (0, 2));
        assert!(summary.report.is_none());

        let records = h.runner.context().errors.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.failure_point == Some(FailurePoint::Coordination)));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(provider.open(), 0);
        assert_eq!(h.runner.available_slots(), 2);
    }
}
