//! Yahoo Finance quote panel and "Why is it moving?" analysis.
//!
//! The quote skill follows an observe → cache → scoped extract pattern: the
//! page region holding the quote is located once, cached under
//! [`QUOTE_CONTAINER_KEY`], and every later extraction is restricted to it.
//! A cached locator that stops working is dropped and the extraction for
//! that call runs against the whole page.

use super::{FetchContext, FetchOutcome, FetchTarget, SourceData, SourceFetcher, SourceKind};
use crate::cache::SelectorCache;
use crate::error::{Result, SnapshotError};
use crate::models::{AiAnalysis, QuoteSnapshot};
use crate::retry::navigate_with_retry;
use crate::session::{self, Action, BrowserSession, ExtractSchema, NavigateOptions};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const QUOTE_CONTAINER_KEY: &str = "yahoo_quote_main_container";

const QUOTE_REGION: &str = "find the entire quote page section containing the stock price, change, previous close, volume, and statistics table";
const QUOTE_INSTRUCTION: &str =
    "Extract: current price, change, previous close, open, day range, volume, avg volume.";
/// Any liquid symbol works for discovering the quote container.
const WARM_UP_TICKER: &str = "AAPL";

pub fn quote_url(ticker: &str) -> String {
    format!("https://finance.yahoo.com/quote/{}", urlencoding::encode(ticker))
}

async fn locate_quote_region(session: &dyn BrowserSession, cache: &SelectorCache) -> Option<String> {
    if let Some(selector) = cache.get(QUOTE_CONTAINER_KEY) {
        debug!(%selector, "Using cached quote container");
        return Some(selector);
    }
    match session.observe(QUOTE_REGION).await {
        Ok(regions) => {
            let selector = regions.into_iter().next()?.selector;
            cache.set(QUOTE_CONTAINER_KEY, &selector);
            Some(selector)
        }
        Err(e) => {
            warn!(error = %e, "Could not locate the quote container; extracting from the full page");
            None
        }
    }
}

async fn scoped_extract<T: ExtractSchema>(
    session: &dyn BrowserSession,
    cache: &SelectorCache,
    instruction: &str,
    selector: Option<&str>,
) -> Result<T> {
    if let Some(selector) = selector {
        match session::extract::<T>(session, instruction, Some(selector)).await {
            Ok(record) => return Ok(record),
            Err(e) => {
                let miss = SnapshotError::SelectorMiss {
                    key: QUOTE_CONTAINER_KEY.to_string(),
                };
                warn!(%miss, error = %e, "Scoped extract failed; falling back to the full page");
                cache.delete(QUOTE_CONTAINER_KEY);
            }
        }
    }
    session::extract::<T>(session, instruction, None).await
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YahooQuote;

#[async_trait]
impl SourceFetcher for YahooQuote {
    fn kind(&self) -> SourceKind {
        SourceKind::YahooQuote
    }

    fn module(&self) -> &'static str {
        module_path!()
    }

    #[instrument(level = "info", skip_all, fields(source = "YahooQuote", ticker = ?target.label()))]
    async fn fetch(
        &self,
        session: &dyn BrowserSession,
        target: &FetchTarget,
        ctx: &FetchContext,
    ) -> Result<FetchOutcome> {
        let ticker = target.single()?;
        navigate_with_retry(
            session,
            &quote_url(ticker),
            NavigateOptions::load(Duration::from_secs(30)),
            &ctx.navigation,
        )
        .await?;

        let selector = locate_quote_region(session, &ctx.cache).await;
        let mut quote: QuoteSnapshot =
            scoped_extract(session, &ctx.cache, QUOTE_INSTRUCTION, selector.as_deref()).await?;
        quote.ticker = ticker.to_uppercase();

        info!(ticker = %quote.ticker, price = ?quote.last_price, change_pct = ?quote.change_pct, "Quote extracted");
        Ok(FetchOutcome::Data(SourceData::Quote(quote)))
    }

    fn needs_warm_up(&self, ctx: &FetchContext) -> bool {
        ctx.cache.get(QUOTE_CONTAINER_KEY).is_none()
    }

    /// Discover the quote container once so concurrent fetches start with a
    /// cached locator.
    async fn warm_up(&self, session: &dyn BrowserSession, ctx: &FetchContext) -> Result<()> {
        navigate_with_retry(
            session,
            &quote_url(WARM_UP_TICKER),
            NavigateOptions::load(Duration::from_secs(30)),
            &ctx.navigation,
        )
        .await?;
        match locate_quote_region(session, &ctx.cache).await {
            Some(selector) => info!(%selector, "Quote container cached"),
            None => warn!("Warm-up found no quote container"),
        }
        Ok(())
    }
}

fn analysis_instruction(ticker: &str) -> String {
    format!(
        "On this Yahoo Finance page for {ticker}, locate the AI-driven analysis or \
         'Why is this stock moving?' style explanation. Extract: title (heading of the panel), \
         updated_at (any 'Updated ...' timestamp text), summary (2-4 sentence plain-language \
         explanation of why the stock is moving today, paraphrased from visible text), and \
         bullets (3-5 concrete drivers: news, earnings, macro events, analyst actions). \
         Use only text visible on this page. If the panel is not visible, return empty values."
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YahooAnalysis;

#[async_trait]
impl SourceFetcher for YahooAnalysis {
    fn kind(&self) -> SourceKind {
        SourceKind::YahooAnalysis
    }

    fn module(&self) -> &'static str {
        module_path!()
    }

    #[instrument(level = "info", skip_all, fields(source = "YahooAI", ticker = ?target.label()))]
    async fn fetch(
        &self,
        session: &dyn BrowserSession,
        target: &FetchTarget,
        ctx: &FetchContext,
    ) -> Result<FetchOutcome> {
        let ticker = target.single()?;
        navigate_with_retry(
            session,
            &quote_url(ticker),
            NavigateOptions::load(Duration::from_secs(30)),
            &ctx.navigation,
        )
        .await?;
        session.wait(Duration::from_secs(2)).await;

        let toggle = format!(
            "If the page has a tab, button, or link labeled something like 'AI Analysis', \
             'Why is this stock moving?', or 'Why is {ticker} moving today?', select the best \
             element to open that analysis card."
        );
        match session.observe(&toggle).await {
            Ok(found) => match found.into_iter().next() {
                Some(element) => match session.act(Action::Observed(element)).await {
                    Ok(()) => session.wait(Duration::from_secs(5)).await,
                    Err(e) => warn!(%ticker, error = %e, "Could not open the analysis panel; extracting anyway"),
                },
                None => debug!(%ticker, "No analysis toggle on the page"),
            },
            Err(e) => warn!(%ticker, error = %e, "Could not look for the analysis panel; extracting anyway"),
        }

        session.wait(Duration::from_secs(1)).await;
        let mut analysis: AiAnalysis =
            match session::extract(session, &analysis_instruction(ticker), None).await {
                Ok(analysis) => analysis,
                Err(e) => {
                    warn!(%ticker, error = %e, "AI analysis extraction failed; returning an empty analysis");
                    return Ok(FetchOutcome::empty(format!("analysis extraction failed: {e}")));
                }
            };
        analysis.ticker = ticker.to_uppercase();

        if analysis.is_empty() {
            return Ok(FetchOutcome::empty("analysis panel not visible"));
        }
        info!(%ticker, bullets = analysis.bullets.len(), "AI analysis extracted");
        Ok(FetchOutcome::Data(SourceData::Analysis(analysis)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::{FakeProvider, Reply};
    use crate::session::{ObservedElement, SessionLabels, SessionProvider};
    use crate::sources::test_context;
    use serde_json::json;

    fn container() -> ObservedElement {
        ObservedElement {
            selector: "xpath=/html/body/main/section[1]".into(),
            description: "quote section".into(),
            method: None,
            arguments: vec![],
        }
    }

    fn quote_json() -> serde_json::Value {
        json!({ "last_price": 187.5, "change_abs": -2.3, "change_pct": -1.21, "previous_close": 189.8 })
    }

    #[tokio::test]
    async fn test_quote_discovers_and_caches_selector() {
        let (ctx, _dir) = test_context();
        let provider = FakeProvider::new()
            .with_observed(vec![container()])
            .on_extract("current price", quote_json());
        let session = provider.create_session(&SessionLabels::default()).await.unwrap();

        let outcome = YahooQuote
            .fetch(session.as_ref(), &FetchTarget::Ticker("aapl".into()), &ctx)
            .await
            .unwrap();
        let Some(SourceData::Quote(quote)) = outcome.into_data() else {
            panic!("expected a quote");
        };
        assert_eq!(quote.ticker, "AAPL");
        assert_eq!(quote.last_price, Some(187.5));
        assert_eq!(
            ctx.cache.get(QUOTE_CONTAINER_KEY).as_deref(),
            Some("xpath=/html/body/main/section[1]")
        );
        assert!(provider.calls().iter().any(|c| c.contains("selector=xpath=/html/body/main/section[1]")));
        assert!(!YahooQuote.needs_warm_up(&ctx));
    }

    #[tokio::test]
    async fn test_stale_selector_is_dropped_and_full_page_used() {
        let (ctx, _dir) = test_context();
        ctx.cache.set(QUOTE_CONTAINER_KEY, "xpath=/gone");
        let provider = FakeProvider::new()
            .on_scoped_extract("current price", Reply::Fail("selector not found".into()))
            .on_extract("current price", quote_json());
        let session = provider.create_session(&SessionLabels::default()).await.unwrap();

        let outcome = YahooQuote
            .fetch(session.as_ref(), &FetchTarget::Ticker("MSFT".into()), &ctx)
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Data(SourceData::Quote(_))));
        assert_eq!(ctx.cache.get(QUOTE_CONTAINER_KEY), None);
        assert!(provider.calls().iter().any(|c| c.ends_with("selector=-")));
    }

    #[tokio::test]
    async fn test_quote_navigation_failure_propagates() {
        let (ctx, _dir) = test_context();
        let provider = FakeProvider::new().fail_goto("finance.yahoo.com");
        let session = provider.create_session(&SessionLabels::default()).await.unwrap();

        let err = YahooQuote
            .fetch(session.as_ref(), &FetchTarget::Ticker("AAPL".into()), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Navigation { .. }));
        // first try plus two retries
        assert_eq!(provider.calls().iter().filter(|c| c.starts_with("goto")).count(), 3);
    }

    #[tokio::test]
    async fn test_warm_up_populates_cache() {
        let (ctx, _dir) = test_context();
        assert!(YahooQuote.needs_warm_up(&ctx));
        let provider = FakeProvider::new().with_observed(vec![container()]);
        let session = provider.create_session(&SessionLabels::default()).await.unwrap();
        YahooQuote.warm_up(session.as_ref(), &ctx).await.unwrap();
        assert!(!YahooQuote.needs_warm_up(&ctx));
    }

    #[tokio::test]
    async fn test_analysis_extraction_failure_is_empty_not_error() {
        let (ctx, _dir) = test_context();
        let provider = FakeProvider::new().fail_extract("AI-driven analysis", "model refused");
        let session = provider.create_session(&SessionLabels::default()).await.unwrap();

        let outcome = YahooAnalysis
            .fetch(session.as_ref(), &FetchTarget::Ticker("AAPL".into()), &ctx)
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Empty { .. }));
    }

    #[tokio::test]
    async fn test_analysis_opens_panel_and_extracts() {
        let (ctx, _dir) = test_context();
        let provider = FakeProvider::new()
            .with_observed(vec![container()])
            .on_extract(
                "AI-driven analysis",
                json!({ "title": "Why is AAPL moving?", "summary": "Services beat.", "bullets": ["Services +14%"] }),
            );
        let session = provider.create_session(&SessionLabels::default()).await.unwrap();

        let outcome = YahooAnalysis
            .fetch(session.as_ref(), &FetchTarget::Ticker("aapl".into()), &ctx)
            .await
            .unwrap();
        let Some(SourceData::Analysis(analysis)) = outcome.into_data() else {
            panic!("expected an analysis");
        };
        assert_eq!(analysis.ticker, "AAPL");
        assert_eq!(analysis.bullets, vec!["Services +14%"]);
        assert!(provider.calls().iter().any(|c| c.starts_with("act ")));
    }
}
