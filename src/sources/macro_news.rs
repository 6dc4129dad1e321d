//! Market-wide brief built from the recent Vital Knowledge reports.
//!
//! Shares the portal flow with [`super::vital_knowledge`]: log in, list the
//! reports inside the lookback window, read each one. Every report yields a
//! short summary and up to ten tagged bullets; bullets are weighted by report
//! recency and a final synthesis extract merges the summaries. A failed
//! synthesis keeps the newest report's summary and the weighted bullets.

use super::dates::DateWindow;
use super::vital_knowledge::{list_reports, login, open_everything, open_report, return_to_everything};
use super::weighting::{RecencyWeighting, top_weighted};
use super::{FetchContext, FetchOutcome, FetchTarget, SourceData, SourceFetcher, SourceKind, component_name};
use crate::error::{FailurePoint, Result};
use crate::models::{MacroNewsSummary, ReportSource, object_schema, string_list};
use crate::observability::ErrorRecord;
use crate::retry::extract_with_retry;
use crate::session::{self, BrowserSession, ExtractSchema};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

const BULLETS_PER_REPORT: usize = 10;
const BULLETS_KEPT: usize = 10;
/// Summaries handed to the synthesis extract, newest first.
const SYNTHESIS_INPUTS: usize = 5;

const MACRO_INSTRUCTION: &str = "You are a senior macro equity strategist writing a pre-market brief. \
Extract the most important market-moving information: global indices and asset classes, economic data \
and central banks, geopolitics with market impact, major sector moves, and single stocks big enough to \
move the tape. Focus on US equities. Include numbers whenever the text gives them and link every move \
to its driver. Return summary (2-3 sentences on the backdrop and main drivers) and bullets (7-10, \
ranked, each starting with a tag such as [MACRO], [CENTRAL BANK], [DATA], [GEOPOLITICS], [SECTOR], \
[STOCK] or [FLOW/SENTIMENT]). Use only information present in the text.";

#[derive(Debug, Clone, Default, Deserialize)]
struct MacroExtract {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    bullets: Vec<String>,
}

impl ExtractSchema for MacroExtract {
    const NAME: &'static str = "macro extract";

    fn schema() -> Value {
        object_schema(
            json!({
                "summary": { "type": "string", "description": "2-3 sentence overview of the market backdrop" },
                "bullets": string_list("7-10 tagged bullets ranked by market impact"),
            }),
            &["summary", "bullets"],
        )
    }
}

fn synthesis_instruction(summaries: &[String]) -> String {
    format!(
        "{MACRO_INSTRUCTION}\n\nYou are synthesizing multiple reports. Summaries, newest first:\n\n{}\n\n\
         Create one unified summary and ranked bullet list across all of them, merging duplicate themes.",
        summaries.join("\n\n")
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MacroNews {
    pub weighting: RecencyWeighting,
}

impl MacroNews {
    pub fn new(weighting: RecencyWeighting) -> Self {
        Self { weighting }
    }

    async fn read_report(
        &self,
        session: &dyn BrowserSession,
        report: &ReportSource,
        ctx: &FetchContext,
    ) -> Result<MacroExtract> {
        open_report(session, report).await?;
        extract_with_retry(session, MACRO_INSTRUCTION, None, &ctx.extraction).await
    }
}

#[async_trait]
impl SourceFetcher for MacroNews {
    fn kind(&self) -> SourceKind {
        SourceKind::MacroNews
    }

    fn module(&self) -> &'static str {
        module_path!()
    }

    #[instrument(level = "info", skip_all, fields(source = "MacroNews"))]
    async fn fetch(
        &self,
        session: &dyn BrowserSession,
        _target: &FetchTarget,
        ctx: &FetchContext,
    ) -> Result<FetchOutcome> {
        let window = DateWindow::lookback_from_now(ctx.lookback_days);

        login(session, ctx).await?;
        open_everything(session).await?;
        let reports = list_reports(session, &window).await?;
        if reports.is_empty() {
            return Ok(FetchOutcome::empty(format!("no reports between {}", window.describe())));
        }

        let mut summaries = Vec::new();
        let mut bullets = Vec::new();
        let mut sources = Vec::new();
        for (i, report) in reports.iter().enumerate() {
            info!(n = i + 1, of = reports.len(), title = %report.title, "Reading report");
            let weight = self.weighting.weight(i, reports.len());
            let read = match self.read_report(session, report, ctx).await {
                Ok(extract) if i + 1 < reports.len() => return_to_everything(session, ctx).await.map(|()| extract),
                other => other,
            };
            match read {
                Ok(extract) => {
                    if let Some(summary) = extract.summary.filter(|s| !s.trim().is_empty()) {
                        summaries.push(summary);
                    }
                    bullets.extend(
                        extract
                            .bullets
                            .into_iter()
                            .take(BULLETS_PER_REPORT)
                            .map(|b| (b, weight)),
                    );
                    sources.push(report.clone());
                }
                Err(e) => {
                    warn!(title = %report.title, error = %e, "Skipping report");
                    ctx.errors.record(
                        ErrorRecord::from_error(&e, component_name(self))
                            .with_failure_point(FailurePoint::ReportProcessing)
                            .with_context("report_title", report.title.as_str())
                            .with_context("report_index", i)
                            .with_session(session.id()),
                    );
                }
            }
        }

        let mut bullets = top_weighted(bullets, BULLETS_KEPT);
        let mut summary = summaries.first().cloned();
        if !summaries.is_empty() && !bullets.is_empty() {
            let inputs = &summaries[..summaries.len().min(SYNTHESIS_INPUTS)];
            match session::extract::<MacroExtract>(session, &synthesis_instruction(inputs), None).await {
                Ok(combined) => {
                    if let Some(text) = combined.summary.filter(|s| !s.trim().is_empty()) {
                        summary = Some(text);
                    }
                    if !combined.bullets.is_empty() {
                        bullets = combined.bullets.into_iter().take(BULLETS_KEPT).collect();
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Macro synthesis failed; keeping the newest summary");
                    ctx.errors.record(
                        ErrorRecord::from_error(&e, component_name(self))
                            .with_failure_point(FailurePoint::SummaryExtraction)
                            .with_context("phase", "macro_synthesis")
                            .with_session(session.id()),
                    );
                }
            }
        }

        let brief = MacroNewsSummary {
            report_count: sources.len(),
            date_range: window.describe(),
            summary,
            bullets,
            sources,
        };
        info!(reports = brief.report_count, bullets = brief.bullets.len(), "Macro news complete");
        if brief.is_empty() {
            return Ok(FetchOutcome::empty("no macro content in the listed reports"));
        }
        Ok(FetchOutcome::Data(SourceData::MacroNews(brief)))
    }
}
