//! Google News search results for a ticker, each article summarised.
//!
//! The results page is read once for headlines and links, then every article
//! is visited in the same session, one after another. An article that fails
//! to load or summarise is recorded and kept with its headline only; a failed
//! overall summary is recorded and leaves `news_summary` unset.

use super::{FetchContext, FetchOutcome, FetchTarget, SourceData, SourceFetcher, SourceKind, component_name};
use crate::error::{FailurePoint, Result};
use crate::models::{
    GoogleNewsStory, GoogleNewsSummary, GoogleNewsTopStories, Tone, nullable, object_schema,
};
use crate::observability::ErrorRecord;
use crate::retry::navigate_with_retry;
use crate::session::{self, BrowserSession, ExtractSchema, NavigateOptions};
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Search URL restricted to the news tab, the last `days` days, sorted by date.
pub fn search_url(ticker: &str, days: u32) -> String {
    let query = format!("{ticker} stock news");
    format!(
        "https://www.google.com/search?q={}&tbm=nws&tbs=qdr:d{days},sbd:1",
        query.split_whitespace().map(urlencoding::encode).collect::<Vec<_>>().join("+")
    )
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ArticleLink {
    #[serde(default)]
    headline: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    age: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ArticleLinks {
    #[serde(default)]
    articles: Vec<ArticleLink>,
}

impl ExtractSchema for ArticleLinks {
    const NAME: &'static str = "article links";

    fn schema() -> Value {
        object_schema(
            json!({
                "articles": {
                    "type": "array",
                    "items": object_schema(json!({
                        "headline": { "type": "string" },
                        "url": { "type": "string", "description": "Absolute link to the article" },
                        "source": nullable("string", "Publisher, e.g. Reuters"),
                        "age": nullable("string", "e.g. '2 hours ago'"),
                    }), &["headline", "url"]),
                },
            }),
            &[],
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ArticleSummary {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    sentiment: Option<String>,
}

impl ExtractSchema for ArticleSummary {
    const NAME: &'static str = "article summary";

    fn schema() -> Value {
        object_schema(
            json!({
                "summary": nullable("string", "2-3 sentence summary"),
                "sentiment": nullable("string", "One of positive, negative, neutral"),
            }),
            &[],
        )
    }
}

fn links_instruction(max_stories: usize, days: u32) -> String {
    format!(
        "Find the top {max_stories} news article headlines in these Google News search results. \
         For each article extract headline, url (the absolute link), source (publisher name) and \
         age (e.g. '2 hours ago'). Only include articles from the last {days} days, most relevant \
         and recent first."
    )
}

fn article_instruction(ticker: &str) -> String {
    format!(
        "Read this news article about {ticker} stock. Write a brief 2-3 sentence summary of the \
         main news and why it moves {ticker}, using only this article. Return summary and \
         sentiment (positive, negative or neutral)."
    )
}

fn overall_instruction(ticker: &str, stories: &[GoogleNewsStory]) -> Option<String> {
    let mut digest = String::new();
    let mut n = 0;
    for story in stories {
        if let Some(summary) = &story.summary {
            let _ = writeln!(digest, "- {}: {summary}", story.headline);
            n += 1;
        }
    }
    (n > 0).then(|| {
        format!(
            "Based on these {n} news articles about {ticker} stock:\n{digest}\n\
             Provide overall_sentiment (bullish, bearish, mixed or neutral) and bullet_points: \
             exactly 4 concise bullets of the most important market-moving news for {ticker}."
        )
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GoogleNews;

impl GoogleNews {
    async fn read_article(
        &self,
        session: &dyn BrowserSession,
        ticker: &str,
        link: &ArticleLink,
        ctx: &FetchContext,
    ) -> Result<GoogleNewsStory> {
        navigate_with_retry(
            session,
            &link.url,
            NavigateOptions::load(Duration::from_secs(30)),
            &ctx.navigation,
        )
        .await?;
        let read: ArticleSummary = session::extract(session, &article_instruction(ticker), None).await?;
        Ok(GoogleNewsStory {
            headline: link.headline.clone(),
            // final URL after redirects
            url: session.current_url().unwrap_or_else(|| link.url.clone()),
            source: link.source.clone(),
            age: link.age.clone(),
            summary: read.summary.filter(|s| !s.trim().is_empty()),
            sentiment: read.sentiment.and_then(|s| s.parse::<Tone>().ok()),
        })
    }
}

#[async_trait]
impl SourceFetcher for GoogleNews {
    fn kind(&self) -> SourceKind {
        SourceKind::GoogleNews
    }

    fn module(&self) -> &'static str {
        module_path!()
    }

    #[instrument(level = "info", skip_all, fields(source = "GoogleNews", ticker = ?target.label()))]
    async fn fetch(
        &self,
        session: &dyn BrowserSession,
        target: &FetchTarget,
        ctx: &FetchContext,
    ) -> Result<FetchOutcome> {
        let ticker = target.single()?;
        let url = search_url(ticker, ctx.lookback_days);
        navigate_with_retry(
            session,
            &url,
            NavigateOptions::network_idle(Duration::from_secs(30)),
            &ctx.navigation,
        )
        .await?;

        let links: ArticleLinks =
            session::extract(session, &links_instruction(ctx.max_stories, ctx.lookback_days), None).await?;
        let links: Vec<ArticleLink> = links
            .articles
            .into_iter()
            .filter(|l| !l.headline.trim().is_empty() && l.url.starts_with("http"))
            .take(ctx.max_stories)
            .collect();
        if links.is_empty() {
            return Ok(FetchOutcome::empty("no recent articles"));
        }
        info!(%ticker, articles = links.len(), "Visiting articles");

        let mut stories = Vec::with_capacity(links.len());
        for (i, link) in links.iter().enumerate() {
            debug!(%ticker, n = i + 1, headline = %truncate_for_log(&link.headline, 60), "Reading article");
            match self.read_article(session, ticker, link, ctx).await {
                Ok(story) => stories.push(story),
                Err(e) => {
                    warn!(%ticker, url = %link.url, error = %e, "Article failed; keeping headline only");
                    ctx.errors.record(
                        ErrorRecord::from_error(&e, component_name(self))
                            .with_failure_point(FailurePoint::ArticleProcessing)
                            .with_context("ticker", ticker)
                            .with_context("article_headline", link.headline.as_str())
                            .with_context("article_url", link.url.as_str())
                            .with_session(session.id()),
                    );
                    stories.push(GoogleNewsStory {
                        headline: link.headline.clone(),
                        url: link.url.clone(),
                        source: link.source.clone(),
                        age: link.age.clone(),
                        summary: None,
                        sentiment: None,
                    });
                }
            }
        }

        let news_summary = match overall_instruction(ticker, &stories) {
            Some(instruction) => match session::extract::<GoogleNewsSummary>(session, &instruction, None).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!(%ticker, error = %e, "Overall summary failed; returning stories only");
                    ctx.errors.record(
                        ErrorRecord::from_error(&e, component_name(self))
                            .with_failure_point(FailurePoint::SummaryExtraction)
                            .with_context("ticker", ticker)
                            .with_context("phase", "overall_summary_generation")
                            .with_session(session.id()),
                    );
                    None
                }
            },
            None => None,
        };

        let summarised = stories.iter().filter(|s| s.summary.is_some()).count();
        info!(%ticker, stories = stories.len(), summarised, "Google News collected");
        Ok(FetchOutcome::Data(SourceData::GoogleNews(GoogleNewsTopStories {
            ticker: ticker.to_uppercase(),
            stories,
            news_summary,
        })))
    }
}
