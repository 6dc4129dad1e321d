//! One fetch attempt inside its own browser session.
//!
//! [`SessionRunner::run`] owns the full lifecycle: wait for a concurrency
//! slot, open a session, probe it, hand it to the skill, record metrics and
//! errors, close it. Nothing escapes: a failed fetch is logged, recorded and
//! returned as `None` so sibling tasks carry on.
//!
//! The slot is held by a [`SessionGuard`] together with the session, so it is
//! released only after teardown. If the task is aborted mid-fetch the guard's
//! `Drop` spawns the close and keeps the slot until it finishes.

use crate::error::SnapshotError;
use crate::observability::{ErrorRecord, GuardrailTimer, Guardrails, MetricsCollector, SessionReport};
use crate::session::{BrowserSession, SessionLabels, SessionProvider};
use crate::sources::{FetchContext, FetchOutcome, FetchTarget, SourceFetcher, component_name};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument, warn};

/// A live session plus the concurrency slot it occupies.
pub struct SessionGuard {
    session: Option<Arc<dyn BrowserSession>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SessionGuard {
    fn new(session: Arc<dyn BrowserSession>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            session: Some(session),
            permit: Some(permit),
        }
    }

    /// Close the session, then release the slot. Close failures are logged.
    pub async fn close(mut self) {
        if let Some(session) = self.session.take() {
            close_quietly(session.as_ref()).await;
        }
        self.permit.take();
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(session_id = %session.id(), "Closing abandoned session");
                handle.spawn(async move {
                    close_quietly(session.as_ref()).await;
                    drop(permit);
                });
            }
            Err(_) => warn!(session_id = %session.id(), "No runtime left to close session"),
        }
    }
}

async fn close_quietly(session: &dyn BrowserSession) {
    match session.close().await {
        Ok(()) => debug!(session_id = %session.id(), "Session closed"),
        Err(e) => warn!(session_id = %session.id(), error = %e, "Session teardown failed"),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

pub struct SessionRunner {
    provider: Arc<dyn SessionProvider>,
    limiter: Arc<Semaphore>,
    metrics: Arc<MetricsCollector>,
    ctx: FetchContext,
    guardrails: Guardrails,
    region: Option<String>,
}

impl SessionRunner {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        max_concurrent: usize,
        metrics: Arc<MetricsCollector>,
        ctx: FetchContext,
    ) -> Self {
        Self {
            provider,
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
            metrics,
            ctx,
            guardrails: Guardrails::default(),
            region: None,
        }
    }

    pub fn with_guardrails(mut self, guardrails: Guardrails) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn context(&self) -> &FetchContext {
        &self.ctx
    }

    /// Slots currently free.
    pub fn available_slots(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Run one fetch in a fresh session. `None` means it failed and the
    /// failure has been recorded.
    #[instrument(level = "info", skip_all, fields(source = %fetcher.kind(), ticker = ?target.label()))]
    pub async fn run(&self, fetcher: Arc<dyn SourceFetcher>, target: FetchTarget) -> Option<FetchOutcome> {
        let source = fetcher.kind().name();
        let component = component_name(fetcher.as_ref());
        let failure = |e: &SnapshotError| {
            let mut record = ErrorRecord::from_error(e, component.as_str())
                .with_context("source", source)
                .with_context("function", "fetch");
            record = match &target {
                FetchTarget::Ticker(t) => record.with_context("ticker", t.as_str()),
                FetchTarget::Tickers(ts) => record.with_context("tickers", ts.clone()),
                FetchTarget::Global => record,
            };
            record
        };

        let (session, guard) = match self.open(source, &target).await {
            Ok(opened) => opened,
            Err(e) => {
                error!(error = %e, "Could not create session");
                self.ctx.errors.record(failure(&e));
                return None;
            }
        };
        let started = Instant::now();

        let result = match self.guardrails.check_session(session.as_ref()).await {
            Ok(mut diagnostics) => {
                let timer = GuardrailTimer::start("fetch");
                let fetched = AssertUnwindSafe(fetcher.fetch(session.as_ref(), &target, &self.ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(SnapshotError::Panicked(panic_message(payload))));
                diagnostics.extend(timer.diagnostics());
                diagnostics.extend(self.guardrails.navigation_diagnostics(session.as_ref(), None));
                fetched.map_err(|e| (e, diagnostics))
            }
            Err((e, diagnostics)) => Err((e, diagnostics)),
        };

        self.metrics.record_session(SessionReport {
            source_name: source.to_string(),
            ticker: target.label(),
            session_id: session.id().to_string(),
            duration: started.elapsed(),
            success: result.is_ok(),
            error: result.as_ref().err().map(|(e, _)| e.to_string()),
            usage: session.usage(),
            region: self.region.clone(),
        });

        let outcome = match result {
            Ok(outcome) => {
                match &outcome {
                    FetchOutcome::Data(_) => info!("Fetch complete"),
                    FetchOutcome::Empty { reason } => info!(%reason, "Fetch produced nothing"),
                }
                Some(outcome)
            }
            Err((e, diagnostics)) => {
                error!(error = %e, session_id = %session.id(), "Fetch failed");
                self.ctx.errors.record(
                    failure(&e)
                        .with_diagnostics(diagnostics)
                        .with_session(session.id()),
                );
                None
            }
        };

        drop(session);
        guard.close().await;
        outcome
    }

    /// Give a fetcher its one-off warm-up session. Failures are logged.
    #[instrument(level = "info", skip_all, fields(source = %fetcher.kind()))]
    pub async fn warm_up(&self, fetcher: &Arc<dyn SourceFetcher>) -> bool {
        let source = fetcher.kind().name();
        let (session, guard) = match self.open(source, &FetchTarget::Global).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(error = %e, "Warm-up session could not be created");
                return false;
            }
        };
        let warmed = match self.guardrails.check_session(session.as_ref()).await {
            Ok(_) => match fetcher.warm_up(session.as_ref(), &self.ctx).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Warm-up failed; fetches will discover on their own");
                    false
                }
            },
            Err((e, _)) => {
                warn!(error = %e, "Warm-up session failed its probe");
                false
            }
        };
        drop(session);
        guard.close().await;
        warmed
    }

    async fn open(
        &self,
        source: &str,
        target: &FetchTarget,
    ) -> Result<(Arc<dyn BrowserSession>, SessionGuard), SnapshotError> {
        let permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(|_| SnapshotError::SessionCreation("concurrency limiter closed".into()))?;
        let labels = SessionLabels {
            source: source.to_string(),
            tickers: target.tickers(),
            run_id: self.metrics.run_id().to_string(),
        };
        let session: Arc<dyn BrowserSession> = Arc::from(self.provider.create_session(&labels).await?);
        debug!(session_id = %session.id(), replay = ?session.replay_url(), "Session created");
        let guard = SessionGuard::new(Arc::clone(&session), permit);
        Ok((session, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailurePoint, Result};
    use crate::session::fake::FakeProvider;
    use crate::sources::yahoo::{QUOTE_CONTAINER_KEY, YahooQuote};
    use crate::sources::{SourceData, SourceKind, test_context};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn runner(provider: &Arc<FakeProvider>, k: usize) -> (SessionRunner, Arc<MetricsCollector>, tempfile::TempDir) {
        let (ctx, dir) = test_context();
        ctx.cache.set(QUOTE_CONTAINER_KEY, "xpath=/main");
        let metrics = Arc::new(MetricsCollector::with_run_id(dir.path().join("metrics"), "test"));
        let provider: Arc<dyn SessionProvider> = provider.clone();
        (SessionRunner::new(provider, k, Arc::clone(&metrics), ctx), metrics, dir)
    }

    fn quote_provider() -> FakeProvider {
        FakeProvider::new().on_extract("current price", json!({ "last_price": 101.0 }))
    }

    struct Panicking;

    #[async_trait]
    impl SourceFetcher for Panicking {
        fn kind(&self) -> SourceKind {
            SourceKind::MarketWatch
        }

        fn module(&self) -> &'static str {
            module_path!()
        }

        async fn fetch(&self, _: &dyn BrowserSession, _: &FetchTarget, _: &FetchContext) -> Result<FetchOutcome> {
            panic!("selector index out of range");
        }
    }

    #[tokio::test]
    async fn test_successful_run_records_metrics_and_closes() {
        let provider = Arc::new(quote_provider());
        let (runner, metrics, _dir) = runner(&provider, 1);

        let outcome = runner.run(Arc::new(YahooQuote), FetchTarget::Ticker("AAPL".into())).await;
        assert!(matches!(outcome, Some(FetchOutcome::Data(SourceData::Quote(_)))));
        assert_eq!(provider.created(), 1);
        assert_eq!(provider.open(), 0);
        assert_eq!(runner.available_slots(), 1);

        let run = metrics.run_metrics();
        assert_eq!((run.success_count, run.error_count), (1, 0));
        assert_eq!(run.sessions[0].ticker.as_deref(), Some("AAPL"));
        assert!(runner.context().errors.is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_is_recorded_with_component_and_context() {
        let provider = Arc::new(quote_provider().fail_goto("finance.yahoo.com"));
        let (runner, metrics, _dir) = runner(&provider, 1);

        let outcome = runner.run(Arc::new(YahooQuote), FetchTarget::Ticker("AAPL".into())).await;
        assert!(outcome.is_none());
        assert_eq!(provider.open(), 0);
        assert_eq!(metrics.run_metrics().error_count, 1);

        let records = runner.context().errors.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.component, "YahooQuote (morning_snapshot::sources::yahoo)");
        assert_eq!(record.failure_point, Some(FailurePoint::Navigation));
        assert_eq!(record.context["ticker"], "AAPL");
        assert_eq!(record.context["function"], "fetch");
        assert_eq!(record.session_id.as_deref(), Some("fake-1"));
        assert!(record.diagnostics.contains_key("fetch_duration_ms"));
    }

    #[tokio::test]
    async fn test_session_creation_failure() {
        let provider = Arc::new(quote_provider().fail_creation_for("YahooQuote"));
        let (runner, metrics, _dir) = runner(&provider, 1);

        let outcome = runner.run(Arc::new(YahooQuote), FetchTarget::Ticker("AAPL".into())).await;
        assert!(outcome.is_none());
        assert_eq!(provider.created(), 0);
        assert!(metrics.is_empty());
        assert_eq!(runner.available_slots(), 1);
        let records = runner.context().errors.records();
        assert_eq!(records[0].failure_point, Some(FailurePoint::SessionCreation));
    }

    #[tokio::test]
    async fn test_unresponsive_session_never_reaches_the_skill() {
        let provider = Arc::new(quote_provider().unresponsive());
        let (runner, _metrics, _dir) = runner(&provider, 1);

        let outcome = runner.run(Arc::new(YahooQuote), FetchTarget::Ticker("AAPL".into())).await;
        assert!(outcome.is_none());
        assert!(provider.calls().is_empty());
        assert_eq!(provider.closed(), 1);
        let record = &runner.context().errors.records()[0];
        assert_eq!(record.failure_point, Some(FailurePoint::SessionCreation));
        assert_eq!(record.diagnostics["page_accessible"], json!(false));
    }

    #[tokio::test]
    async fn test_panicking_skill_is_contained() {
        let provider = Arc::new(FakeProvider::new());
        let (runner, _metrics, _dir) = runner(&provider, 1);

        let outcome = runner.run(Arc::new(Panicking), FetchTarget::Ticker("AAPL".into())).await;
        assert!(outcome.is_none());
        assert_eq!(provider.open(), 0);
        let record = &runner.context().errors.records()[0];
        assert_eq!(record.error_type, "PanicError");
        assert!(record.error_message.contains("selector index out of range"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_task_still_closes_session_and_frees_slot() {
        let provider = Arc::new(quote_provider().with_latency(Duration::from_secs(60)));
        let (runner, _metrics, _dir) = runner(&provider, 1);
        let runner = Arc::new(runner);

        let task = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run(Arc::new(YahooQuote), FetchTarget::Ticker("AAPL".into())).await })
        };
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(provider.open(), 1);
        assert_eq!(runner.available_slots(), 0);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(provider.open(), 0);
        assert_eq!(runner.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_warm_up_fills_cache() {
        let provider = Arc::new(FakeProvider::new().with_observed(vec![crate::session::ObservedElement {
            selector: "xpath=/body/section".into(),
            description: "quote".into(),
            method: None,
            arguments: vec![],
        }]));
        let (runner, metrics, _dir) = runner(&provider, 1);
        runner.context().cache.clear();

        let fetcher: Arc<dyn SourceFetcher> = Arc::new(YahooQuote);
        assert!(runner.warm_up(&fetcher).await);
        assert_eq!(runner.context().cache.get(QUOTE_CONTAINER_KEY).as_deref(), Some("xpath=/body/section"));
        assert_eq!(provider.open(), 0);
        assert!(metrics.is_empty());
    }
}
