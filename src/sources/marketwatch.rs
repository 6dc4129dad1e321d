//! MarketWatch top stories for a ticker.
//!
//! MarketWatch sits behind DataDome bot protection, which serves automated
//! browsers a device-check iframe instead of the page. The skill still tries
//! (extracting with iframes included) and reports `Empty` when the page gave
//! nothing back, which is the usual case.

use super::{FetchContext, FetchOutcome, FetchTarget, SourceData, SourceFetcher, SourceKind};
use crate::error::{Result, SnapshotError};
use crate::models::MarketWatchTopStories;
use crate::retry::navigate_with_retry;
use crate::session::{BrowserSession, ExtractRequest, ExtractSchema, NavigateOptions};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub fn stock_url(ticker: &str) -> String {
    format!(
        "https://www.marketwatch.com/investing/stock/{}",
        urlencoding::encode(&ticker.to_lowercase())
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarketWatch;

#[async_trait]
impl SourceFetcher for MarketWatch {
    fn kind(&self) -> SourceKind {
        SourceKind::MarketWatch
    }

    fn module(&self) -> &'static str {
        module_path!()
    }

    #[instrument(level = "info", skip_all, fields(source = "MarketWatch", ticker = ?target.label()))]
    async fn fetch(
        &self,
        session: &dyn BrowserSession,
        target: &FetchTarget,
        ctx: &FetchContext,
    ) -> Result<FetchOutcome> {
        let ticker = target.single()?;
        navigate_with_retry(
            session,
            &stock_url(ticker),
            NavigateOptions::network_idle(Duration::from_secs(30)),
            &ctx.navigation,
        )
        .await?;

        let instruction = format!(
            "Extract up to {} top news stories about {ticker} visible on this page, \
             including content in iframes: headline, url, source and age.",
            ctx.max_cards
        );
        let raw = session
            .extract_raw(ExtractRequest {
                instruction: &instruction,
                schema: MarketWatchTopStories::schema(),
                selector: None,
                iframes: true,
            })
            .await;

        let mut stories = match raw.and_then(|value| {
            serde_json::from_value::<MarketWatchTopStories>(value)
                .map_err(|e| SnapshotError::parse(MarketWatchTopStories::NAME, e))
        }) {
            Ok(stories) => stories,
            Err(e) => {
                warn!(%ticker, error = %e, "No MarketWatch content; likely blocked by DataDome");
                return Ok(FetchOutcome::empty("page blocked or empty"));
            }
        };

        stories.ticker = ticker.to_uppercase();
        stories.stories.retain(|s| !s.headline.trim().is_empty());
        stories.stories.truncate(ctx.max_cards);
        if stories.stories.is_empty() {
            return Ok(FetchOutcome::empty("no stories visible"));
        }
        info!(%ticker, stories = stories.stories.len(), "MarketWatch stories extracted");
        Ok(FetchOutcome::Data(SourceData::MarketWatch(stories)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::FakeProvider;
    use crate::session::{SessionLabels, SessionProvider};
    use crate::sources::test_context;
    use serde_json::json;

    #[test]
    fn test_stock_url_is_lowercase() {
        assert_eq!(stock_url("AAPL"), "https://www.marketwatch.com/investing/stock/aapl");
    }

    #[tokio::test]
    async fn test_blocked_page_is_empty() {
        let (ctx, _dir) = test_context();
        let provider = FakeProvider::new().fail_extract("top news stories", "iframe not accessible");
        let session = provider.create_session(&SessionLabels::default()).await.unwrap();

        let outcome = MarketWatch
            .fetch(session.as_ref(), &FetchTarget::Ticker("AAPL".into()), &ctx)
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Empty { .. }));
    }

    #[tokio::test]
    async fn test_stories_are_capped_at_max_cards() {
        let (ctx, _dir) = test_context();
        let stories: Vec<_> = (0..5).map(|i| json!({ "headline": format!("Story {i}") })).collect();
        let provider = FakeProvider::new().on_extract("top news stories", json!({ "stories": stories }));
        let session = provider.create_session(&SessionLabels::default()).await.unwrap();

        let outcome = MarketWatch
            .fetch(session.as_ref(), &FetchTarget::Ticker("aapl".into()), &ctx)
            .await
            .unwrap();
        let Some(SourceData::MarketWatch(top)) = outcome.into_data() else {
            panic!("expected stories");
        };
        assert_eq!(top.ticker, "AAPL");
        assert_eq!(top.stories.len(), 3);
    }
}
