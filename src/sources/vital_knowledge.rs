//! Vital Knowledge research portal: per-ticker news across recent reports.
//!
//! One session logs in, lists every report on the "Everything" page, keeps the
//! ones published inside the lookback window and reads each of them once for
//! all tickers. Bullets are weighted by report recency and the heaviest five
//! per ticker survive. A report that fails part-way is recorded and skipped,
//! but tickers already read from it keep their bullets. The portal helpers
//! here are shared with [`super::macro_news`].

use super::dates::{DateWindow, parse_report_date};
use super::weighting::{RecencyWeighting, top_weighted};
use super::{FetchContext, FetchOutcome, FetchTarget, SourceData, SourceFetcher, SourceKind, component_name};
use crate::error::{FailurePoint, Result};
use crate::models::{
    ReportSource, Ticker, VitalKnowledgeHeadline, VitalKnowledgeReport, VitalKnowledgeSummary,
    object_schema, string_list,
};
use crate::observability::ErrorRecord;
use crate::retry::{extract_with_retry, navigate_with_retry};
use crate::session::{self, Action, BrowserSession, ExtractSchema, NavigateOptions};
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const LOGIN_URL: &str = "https://vitalknowledge.net/login";
pub const HOME_URL: &str = "https://vitalknowledge.net/";

const BULLETS_PER_REPORT: usize = 5;
const BULLETS_PER_TICKER: usize = 5;

const EVERYTHING: &str = "Click on the 'Everything' link or button in the navigation";

const TICKER_INSTRUCTION: &str = "You are analyzing a Vital Knowledge market report to extract news \
specific to one stock ticker. Read the entire report. Look for the ticker symbol, the company name, \
products, services or executives tied to the company, analyst ratings, price targets or earnings, \
and sector news that specifically names the company. Skip general market news, sector news that does \
not name the company, and competitor news. Each bullet is 1-2 sentences, specific, with numbers when \
available, and says why it matters for the stock.";

#[derive(Debug, Clone, Default, Deserialize)]
struct ReportLinks {
    #[serde(default)]
    reports: Vec<ReportSource>,
}

impl ExtractSchema for ReportLinks {
    const NAME: &'static str = "report links";

    fn schema() -> Value {
        object_schema(
            json!({
                "reports": {
                    "type": "array",
                    "items": object_schema(json!({
                        "title": { "type": "string", "description": "Report title" },
                        "date_str": { "type": "string", "description": "Date as shown, e.g. 'Dec 3, 2025 05:20 AM'" },
                        "category": { "type": "string", "description": "MORNING, MARKET CLOSE, INTRADAY, EARNINGS, ..." },
                    }), &["title", "date_str"]),
                },
            }),
            &[],
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TickerBullets {
    #[serde(default)]
    bullets: Vec<String>,
}

impl ExtractSchema for TickerBullets {
    const NAME: &'static str = "ticker bullets";

    fn schema() -> Value {
        object_schema(json!({ "bullets": string_list("Up to 5 bullets about the ticker") }), &[])
    }
}

/// Log in with the configured credentials.
pub(crate) async fn login(session: &dyn BrowserSession, ctx: &FetchContext) -> Result<()> {
    let (user, password) = ctx.credentials.vital()?;
    navigate_with_retry(
        session,
        LOGIN_URL,
        NavigateOptions::network_idle(Duration::from_secs(30)),
        &ctx.navigation,
    )
    .await?;
    session
        .act(Action::from(format!("Enter '{user}' into the username or email input field")))
        .await?;
    session
        .act(Action::from(format!("Enter '{password}' into the password input field")))
        .await?;
    session.act(Action::from("Click the login or sign in button")).await?;
    session.wait(Duration::from_secs(3)).await;
    debug!(session_id = %session.id(), "Logged in to Vital Knowledge");
    Ok(())
}

pub(crate) async fn open_everything(session: &dyn BrowserSession) -> Result<()> {
    session.act(Action::from(EVERYTHING)).await?;
    session.wait(Duration::from_secs(2)).await;
    Ok(())
}

/// Reports listed on the "Everything" page that fall inside `window`, in
/// page order (newest first). Unparseable dates are skipped with a warning.
pub(crate) async fn list_reports(session: &dyn BrowserSession, window: &DateWindow) -> Result<Vec<ReportSource>> {
    let listed: ReportLinks = session::extract(
        session,
        "On this Vital Knowledge 'Everything' page, extract all visible report links. For each \
         report give title, date_str (the full date and time as shown, e.g. 'Dec 3, 2025 05:20 AM') \
         and category (MORNING, MARKET CLOSE, INTRADAY, EARNINGS, ...). Include every category.",
        None,
    )
    .await?;
    let total = listed.reports.len();

    let reports: Vec<ReportSource> = listed
        .reports
        .into_iter()
        .filter(|report| match parse_report_date(&report.date_str) {
            Some(at) => window.contains(at),
            None => {
                warn!(title = %report.title, date = %report.date_str, "Could not parse report date");
                false
            }
        })
        .collect();
    info!(total, in_window = reports.len(), window = %window.describe(), "Reports listed");
    Ok(reports)
}

/// Click through to a report, preferring an observed locator.
pub(crate) async fn open_report(session: &dyn BrowserSession, report: &ReportSource) -> Result<()> {
    let found = session
        .observe(&format!(
            "Find the report link with the title '{}' or text matching '{}...'",
            report.title,
            truncate_for_log(&report.title, 50)
        ))
        .await?;
    match found.into_iter().next() {
        Some(link) => session.act(Action::Observed(link)).await?,
        None => {
            session
                .act(Action::from(format!("Click the link with the title '{}'", report.title)))
                .await?
        }
    }
    session.wait(Duration::from_secs(3)).await;
    Ok(())
}

pub(crate) async fn return_to_everything(session: &dyn BrowserSession, ctx: &FetchContext) -> Result<()> {
    navigate_with_retry(
        session,
        HOME_URL,
        NavigateOptions::network_idle(Duration::from_secs(15)),
        &ctx.navigation,
    )
    .await?;
    open_everything(session).await
}

/// `YYYY-MM-DD` of every source, first occurrence only.
fn report_dates(sources: &[ReportSource]) -> Vec<String> {
    let mut dates: Vec<String> = Vec::new();
    for source in sources {
        if let Some(at) = parse_report_date(&source.date_str) {
            let day = at.format("%Y-%m-%d").to_string();
            if !dates.contains(&day) {
                dates.push(day);
            }
        }
    }
    dates
}

fn ticker_instruction(ticker: &str) -> String {
    format!(
        "{TICKER_INSTRUCTION}\n\nTICKER TO FIND: {ticker}\n\nExtract news ONLY about {ticker}. \
         Return up to {BULLETS_PER_REPORT} bullet points, or an empty list if the report has none."
    )
}

fn summary_instruction(ticker: &str, bullets: &[String]) -> String {
    let listed = bullets.iter().map(|b| format!("- {b}")).collect::<Vec<_>>().join("\n");
    format!(
        "Based on these Vital Knowledge bullets about {ticker}:\n{listed}\n\nProvide overall_sentiment \
         (exactly one of bullish, bearish, mixed, neutral), key_themes (2-3 main themes) and summary \
         (1-2 sentences about {ticker})."
    )
}

/// Bullets gathered for one ticker, with the weight of their report.
#[derive(Debug, Default)]
struct Gathered {
    bullets: Vec<(String, f64)>,
    sources: Vec<ReportSource>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VitalKnowledge {
    pub weighting: RecencyWeighting,
}

impl VitalKnowledge {
    pub fn new(weighting: RecencyWeighting) -> Self {
        Self { weighting }
    }

    async fn read_report(
        &self,
        session: &dyn BrowserSession,
        report: &ReportSource,
        weight: f64,
        tickers: &[Ticker],
        gathered: &mut BTreeMap<Ticker, Gathered>,
        ctx: &FetchContext,
    ) -> Result<()> {
        open_report(session, report).await?;

        // Tickers read before a failing extract keep their bullets.
        for ticker in tickers {
            let extracted: TickerBullets =
                extract_with_retry(session, &ticker_instruction(ticker), None, &ctx.extraction).await?;
            debug!(%ticker, bullets = extracted.bullets.len(), report = %report.title, "Ticker bullets");
            let bullets: Vec<String> = extracted
                .bullets
                .into_iter()
                .filter(|b| !b.trim().is_empty())
                .take(BULLETS_PER_REPORT)
                .collect();
            if bullets.is_empty() {
                continue;
            }
            let entry = gathered.entry(ticker.clone()).or_default();
            entry.bullets.extend(bullets.into_iter().map(|b| (b, weight)));
            if !entry.sources.iter().any(|s| s.title == report.title) {
                entry.sources.push(report.clone());
            }
        }
        Ok(())
    }

    async fn summarise(
        &self,
        session: &dyn BrowserSession,
        ticker: &str,
        bullets: &[String],
        ctx: &FetchContext,
    ) -> Option<VitalKnowledgeSummary> {
        match session::extract(session, &summary_instruction(ticker, bullets), None).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(%ticker, error = %e, "Ticker summary failed");
                ctx.errors.record(
                    ErrorRecord::from_error(&e, component_name(self))
                        .with_failure_point(FailurePoint::SummaryExtraction)
                        .with_context("ticker", ticker)
                        .with_context("phase", "summary_generation")
                        .with_session(session.id()),
                );
                None
            }
        }
    }
}

#[async_trait]
impl SourceFetcher for VitalKnowledge {
    fn kind(&self) -> SourceKind {
        SourceKind::VitalKnowledge
    }

    fn module(&self) -> &'static str {
        module_path!()
    }

    #[instrument(level = "info", skip_all, fields(source = "VitalKnowledge", tickers = ?target.label()))]
    async fn fetch(
        &self,
        session: &dyn BrowserSession,
        target: &FetchTarget,
        ctx: &FetchContext,
    ) -> Result<FetchOutcome> {
        let tickers = target.many()?;
        let window = DateWindow::lookback_from_now(ctx.lookback_days);

        login(session, ctx).await?;
        open_everything(session).await?;
        let reports = list_reports(session, &window).await?;
        if reports.is_empty() {
            return Ok(FetchOutcome::empty(format!("no reports between {}", window.describe())));
        }

        let mut gathered: BTreeMap<Ticker, Gathered> = BTreeMap::new();
        let mut processed = 0;
        for (i, report) in reports.iter().enumerate() {
            info!(n = i + 1, of = reports.len(), title = %report.title, "Reading report");
            let weight = self.weighting.weight(i, reports.len());
            let read = self
                .read_report(session, report, weight, tickers, &mut gathered, ctx)
                .await;
            let read = match read {
                Ok(()) if i + 1 < reports.len() => return_to_everything(session, ctx).await,
                other => other,
            };
            match read {
                Ok(()) => processed += 1,
                Err(e) => {
                    warn!(title = %report.title, error = %e, "Skipping report");
                    ctx.errors.record(
                        ErrorRecord::from_error(&e, component_name(self))
                            .with_failure_point(FailurePoint::ReportProcessing)
                            .with_context("report_title", report.title.as_str())
                            .with_context("report_index", i)
                            .with_context("tickers", tickers.to_vec())
                            .with_session(session.id()),
                    );
                }
            }
        }

        let mut out = BTreeMap::new();
        for ticker in tickers {
            let Some(found) = gathered.remove(ticker) else {
                debug!(%ticker, "No Vital Knowledge news");
                out.insert(ticker.clone(), VitalKnowledgeReport::empty(ticker));
                continue;
            };
            let bullets = top_weighted(found.bullets, BULLETS_PER_TICKER);
            let summary = self.summarise(session, ticker, &bullets, ctx).await;
            info!(%ticker, bullets = bullets.len(), reports = found.sources.len(), "Vital Knowledge combined");
            out.insert(
                ticker.clone(),
                VitalKnowledgeReport {
                    ticker: ticker.clone(),
                    headlines: bullets
                        .into_iter()
                        .map(|headline| VitalKnowledgeHeadline {
                            headline,
                            context: None,
                            sentiment: None,
                        })
                        .collect(),
                    report_dates: report_dates(&found.sources),
                    summary,
                    sources: found.sources,
                },
            );
        }

        info!(processed, tickers = tickers.len(), "Vital Knowledge complete");
        Ok(FetchOutcome::Data(SourceData::VitalKnowledgeBatch(out)))
    }
}

/// Report date strings relative to now, for tests that go through the
/// real lookback window.
#[cfg(test)]
pub(crate) fn report_date_hours_ago(hours: i64) -> String {
    (chrono::Utc::now().with_timezone(&chrono_tz::US::Eastern) - chrono::Duration::hours(hours))
        .format("%b %d, %Y %I:%M %p")
        .to_string()
}
