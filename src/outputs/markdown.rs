//! Markdown rendering of the morning report.
//!
//! The report is a deterministic template over the merged records:
//!
//! ```text
//! # Morning Snapshot — 2025-12-03
//! _Auto-generated from ..._
//! ## Market Macro Overview        (only with a macro brief)
//! ### AAPL                        (one block per quoted ticker)
//! **Statistics:** / sentiment line / **Key Points:** / **Sources:**
//! ```
//!
//! Tickers without a quote never reach this module; the pipeline filters them
//! out before rendering.

use crate::models::{MacroNewsSummary, Outlook, QuoteSnapshot, TickerRecord};
use chrono::NaiveDate;
use std::fmt::{self, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, instrument};

const MAX_KEY_POINTS: usize = 4;
const POINTS_PER_SOURCE: usize = 2;

/// One ticker block: the quote that qualifies it plus the rest of its record.
#[derive(Debug, Clone, Copy)]
pub struct ReportItem<'a> {
    pub quote: &'a QuoteSnapshot,
    pub record: &'a TickerRecord,
}

impl<'a> ReportItem<'a> {
    /// `None` when the record has no quote.
    pub fn from_record(record: &'a TickerRecord) -> Option<Self> {
        record.quote.as_ref().map(|quote| Self { quote, record })
    }
}

/// Signed percentage with two decimals, `n/a` when missing.
pub fn fmt_pct(x: Option<f64>) -> String {
    match x {
        Some(v) if v.is_finite() => {
            let sign = if v >= 0.0 { "+" } else { "" };
            format!("{sign}{v:.2}%")
        }
        _ => "n/a".to_string(),
    }
}

/// Integer with thousands separators: `51234567` -> `51,234,567`.
pub fn fmt_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lean {
    Up,
    Down,
    Flat,
}

fn indicators(item: &ReportItem<'_>) -> Vec<(&'static str, Lean)> {
    let quote = item.quote;
    let change = quote.change_pct.unwrap_or(0.0);
    let mut out = Vec::new();

    out.push(match change {
        c if c > 1.0 => ("strongly bullish price action", Lean::Up),
        c if c > 0.3 => ("bullish price action", Lean::Up),
        c if c < -1.0 => ("strongly bearish price action", Lean::Down),
        c if c < -0.3 => ("bearish price action", Lean::Down),
        _ => ("neutral price action", Lean::Flat),
    });

    match quote.premarket_change_pct {
        Some(p) if p > 0.5 => out.push(("positive pre-market momentum", Lean::Up)),
        Some(p) if p < -0.5 => out.push(("negative pre-market momentum", Lean::Down)),
        _ => {}
    }
    match quote.after_hours_change_pct {
        Some(p) if p > 0.5 => out.push(("positive after-hours momentum", Lean::Up)),
        Some(p) if p < -0.5 => out.push(("negative after-hours momentum", Lean::Down)),
        _ => {}
    }

    let news = item
        .record
        .googlenews
        .as_ref()
        .and_then(|g| g.news_summary.as_ref())
        .and_then(|s| s.overall_sentiment);
    match news {
        Some(Outlook::Bullish) => out.push(("positive news sentiment", Lean::Up)),
        Some(Outlook::Bearish) => out.push(("negative news sentiment", Lean::Down)),
        _ => {}
    }

    let vital = item
        .record
        .vital_knowledge
        .as_ref()
        .and_then(|v| v.summary.as_ref())
        .and_then(|s| s.overall_sentiment);
    match vital {
        Some(Outlook::Bullish) => out.push(("bullish Vital Knowledge coverage", Lean::Up)),
        Some(Outlook::Bearish) => out.push(("bearish Vital Knowledge coverage", Lean::Down)),
        _ => {}
    }

    out
}

/// Label and one-sentence rationale, e.g. `("**Bullish**", "Price is up ...")`.
fn sentiment(item: &ReportItem<'_>) -> (&'static str, String) {
    let change = item.quote.change_pct.unwrap_or(0.0);
    let found = indicators(item);
    let ups = found.iter().filter(|(_, lean)| *lean == Lean::Up).count();
    let downs = found.iter().filter(|(_, lean)| *lean == Lean::Down).count();
    let lead = found
        .iter()
        .take(2)
        .map(|(text, _)| *text)
        .collect::<Vec<_>>()
        .join(", ");
    let pct = fmt_pct(Some(change));

    if ups > downs && change > 0.3 {
        ("**Bullish**", format!("Price is up {pct} with {ups} positive indicator(s). Key drivers include: {lead}."))
    } else if downs > ups && change < -0.3 {
        ("**Bearish**", format!("Price is down {pct} with {downs} negative indicator(s). Key concerns include: {lead}."))
    } else if change > 0.0 {
        ("**Slightly Bullish**", format!("Price is up {pct} with mixed signals. Notable factors: {lead}."))
    } else if change < 0.0 {
        ("**Slightly Bearish**", format!("Price is down {pct} with mixed signals. Notable factors: {lead}."))
    } else {
        ("**Neutral**", format!("Price is flat with {} indicator(s). Market factors: {lead}.", found.len()))
    }
}

fn first_non_blank<'s>(items: impl IntoIterator<Item = &'s String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .take(POINTS_PER_SOURCE)
        .map(str::to_string)
        .collect()
}

/// Up to four bullets: Yahoo drivers, Google News takeaways, Vital Knowledge
/// themes (or headlines when no themes were summarised), two of each.
fn key_points(record: &TickerRecord) -> Vec<String> {
    let mut points = Vec::new();

    if let Some(analysis) = &record.analysis {
        points.extend(first_non_blank(&analysis.bullets));
    }
    if let Some(summary) = record.googlenews.as_ref().and_then(|g| g.news_summary.as_ref()) {
        points.extend(first_non_blank(&summary.bullet_points));
    }
    if let Some(vk) = &record.vital_knowledge {
        let themes = vk
            .summary
            .as_ref()
            .map(|s| first_non_blank(&s.key_themes))
            .unwrap_or_default();
        let picked = if themes.is_empty() {
            first_non_blank(vk.headlines.iter().map(|h| &h.headline))
        } else {
            themes
        };
        points.extend(picked.into_iter().map(|p| format!("Vital Knowledge: {p}")));
    }

    points.truncate(MAX_KEY_POINTS);
    points
}

fn write_statistics(md: &mut String, q: &QuoteSnapshot) -> fmt::Result {
    writeln!(md, "**Statistics:**")?;
    if let Some(price) = q.last_price {
        writeln!(
            md,
            "- Price: **{price:.2}** ({:+.2}, {})",
            q.change_abs.unwrap_or(0.0),
            fmt_pct(q.change_pct)
        )?;
    }
    if let Some(prev) = q.previous_close {
        writeln!(md, "- Previous Close: {prev:.2}")?;
    }
    if let Some(open) = q.open_price {
        writeln!(md, "- Open: {open:.2}")?;
    }
    if let (Some(low), Some(high)) = (q.day_low, q.day_high) {
        writeln!(md, "- Day Range: {low:.2} - {high:.2}")?;
    }
    match (q.volume, q.avg_volume) {
        (Some(v), Some(avg)) => writeln!(md, "- Volume: {} (Avg: {})", fmt_count(v), fmt_count(avg))?,
        (Some(v), None) => writeln!(md, "- Volume: {}", fmt_count(v))?,
        _ => {}
    }

    let mut extended = Vec::new();
    if q.premarket_change_pct.is_some() {
        extended.push(format!("Pre-market: {}", fmt_pct(q.premarket_change_pct)));
    }
    if q.after_hours_change_pct.is_some() {
        extended.push(format!("After-hours: {}", fmt_pct(q.after_hours_change_pct)));
    }
    if !extended.is_empty() {
        writeln!(md, "- {}", extended.join(" | "))?;
    }
    Ok(())
}

fn write_sources(md: &mut String, r: &TickerRecord) -> fmt::Result {
    writeln!(md, "**Sources:**")?;
    match &r.analysis {
        Some(a) if !a.is_empty() => writeln!(md, "- Yahoo AI analysis: {} driver(s)", a.bullets.len())?,
        _ => writeln!(md, "- _No Yahoo AI analysis data available._")?,
    }
    match &r.marketwatch {
        Some(mw) if !mw.stories.is_empty() => writeln!(md, "- MarketWatch: {} stories", mw.stories.len())?,
        _ => writeln!(md, "- _No MarketWatch data available._")?,
    }
    match &r.googlenews {
        Some(g) if !g.stories.is_empty() => writeln!(md, "- Google News: {} stories", g.stories.len())?,
        _ => writeln!(md, "- _No Google News data available._")?,
    }
    match &r.vital_knowledge {
        Some(vk) if !vk.headlines.is_empty() => writeln!(
            md,
            "- Vital Knowledge: {} headline(s) from {}",
            vk.headlines.len(),
            vk.report_dates.join(", ")
        )?,
        _ => writeln!(md, "- _No Vital Knowledge data available._")?,
    }
    Ok(())
}

fn write_ticker_block(md: &mut String, item: &ReportItem<'_>) -> fmt::Result {
    writeln!(md, "### {}", item.record.ticker.to_uppercase())?;
    writeln!(md)?;
    write_statistics(md, item.quote)?;
    writeln!(md)?;

    let (label, why) = sentiment(item);
    writeln!(md, "{label}: {why}")?;

    let points = key_points(item.record);
    if !points.is_empty() {
        writeln!(md)?;
        writeln!(md, "**Key Points:**")?;
        for point in points {
            writeln!(md, "- {point}")?;
        }
    }

    writeln!(md)?;
    write_sources(md, item.record)
}

fn write_macro(md: &mut String, brief: &MacroNewsSummary) -> fmt::Result {
    writeln!(md, "## Market Macro Overview")?;
    writeln!(md)?;
    writeln!(md, "_{} report(s), {}_", brief.report_count, brief.date_range)?;
    writeln!(md)?;
    if let Some(summary) = brief.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        writeln!(md, "{}", summary.trim())?;
        writeln!(md)?;
    }
    if !brief.bullets.is_empty() {
        writeln!(md, "**Key Points:**")?;
        for bullet in &brief.bullets {
            writeln!(md, "- {bullet}")?;
        }
        writeln!(md)?;
    }
    writeln!(md, "---")?;
    writeln!(md)
}

fn write_report(
    md: &mut String,
    as_of: NaiveDate,
    items: &[ReportItem<'_>],
    macro_news: Option<&MacroNewsSummary>,
) -> fmt::Result {
    writeln!(md, "# Morning Snapshot — {}", as_of.format("%Y-%m-%d"))?;
    writeln!(md)?;
    writeln!(
        md,
        "_Auto-generated from Yahoo Finance, Google News, MarketWatch, Vital Knowledge, and Macro News_"
    )?;
    writeln!(md)?;

    if let Some(brief) = macro_news.filter(|b| !b.is_empty()) {
        write_macro(md, brief)?;
    }

    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            writeln!(md)?;
        }
        write_ticker_block(md, item)?;
    }
    Ok(())
}

/// Render the full report.
pub fn build_morning_report(
    as_of: NaiveDate,
    items: &[ReportItem<'_>],
    macro_news: Option<&MacroNewsSummary>,
) -> String {
    let mut md = String::new();
    // Writing into a String cannot fail.
    let _ = write_report(&mut md, as_of, items, macro_news);
    md
}

/// Write `morning_snapshot_{date}.md` into `reports_dir`.
#[instrument(level = "info", skip_all, fields(reports_dir = %reports_dir.display()))]
pub async fn write_report_file(reports_dir: &Path, as_of: NaiveDate, markdown: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(reports_dir).await?;
    let path = reports_dir.join(format!("morning_snapshot_{}.md", as_of.format("%Y-%m-%d")));
    fs::write(&path, markdown).await?;
    info!(path = %path.display(), "Wrote morning report");
    Ok(path)
}
