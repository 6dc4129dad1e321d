//! Records extracted from each source and the per-ticker aggregate.
//!
//! Every record a skill asks the model for implements [`ExtractSchema`], so
//! the JSON schema sent with `extract()` lives next to the type it
//! deserializes into. Fields the page may not show are `Option`s or default
//! to empty lists; an extract that comes back sparse still parses.
//!
//! - Yahoo: [`QuoteSnapshot`], [`AiAnalysis`]
//! - MarketWatch: [`MarketWatchTopStories`]
//! - Google News: [`GoogleNewsTopStories`]
//! - Vital Knowledge: [`VitalKnowledgeReport`] per ticker, [`MacroNewsSummary`] global
//! - [`TickerRecord`]: one row of the run, holding every source slot

use crate::session::ExtractSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;

/// Upper-cased stock symbol.
pub type Ticker = String;

/// Tone of a single article or headline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Positive,
    Negative,
    Neutral,
}

impl FromStr for Tone {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            "neutral" => Ok(Self::Neutral),
            _ => Err(()),
        }
    }
}

/// Overall read on a ticker across several items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outlook {
    Bullish,
    Bearish,
    Mixed,
    Neutral,
}

impl Outlook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
            Self::Mixed => "mixed",
            Self::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Outlook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outlook {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bullish" => Ok(Self::Bullish),
            "bearish" => Ok(Self::Bearish),
            "mixed" => Ok(Self::Mixed),
            "neutral" => Ok(Self::Neutral),
            _ => Err(()),
        }
    }
}

/// Accept any casing and turn unknown labels into `None` instead of failing
/// the whole record.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

pub(crate) fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

pub(crate) fn nullable(kind: &str, description: &str) -> Value {
    json!({ "type": [kind, "null"], "description": description })
}

pub(crate) fn string_list(description: &str) -> Value {
    json!({ "type": "array", "items": { "type": "string" }, "description": description })
}

/// Structured view of the Yahoo Finance quote panel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    #[serde(default)]
    pub ticker: Ticker,

    // Regular session
    #[serde(default, alias = "lastPrice")]
    pub last_price: Option<f64>,
    #[serde(default, alias = "changeAbs")]
    pub change_abs: Option<f64>,
    #[serde(default, alias = "changePct")]
    pub change_pct: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, alias = "openPrice")]
    pub open_price: Option<f64>,
    #[serde(default, alias = "previousClose")]
    pub previous_close: Option<f64>,
    #[serde(default, alias = "dayLow")]
    pub day_low: Option<f64>,
    #[serde(default, alias = "dayHigh")]
    pub day_high: Option<f64>,
    #[serde(default)]
    pub volume: Option<u64>,
    #[serde(default, alias = "avgVolume")]
    pub avg_volume: Option<u64>,

    // Extended-hours session
    #[serde(default)]
    pub premarket_change_pct: Option<f64>,
    #[serde(default)]
    pub after_hours_change_pct: Option<f64>,
}

impl ExtractSchema for QuoteSnapshot {
    const NAME: &'static str = "quote snapshot";

    fn schema() -> Value {
        object_schema(
            json!({
                "last_price": nullable("number", "Current price"),
                "change_abs": nullable("number", "Absolute change today"),
                "change_pct": nullable("number", "Percentage change today, e.g. -1.25"),
                "currency": nullable("string", "Quote currency"),
                "open_price": nullable("number", "Opening price"),
                "previous_close": nullable("number", "Previous close"),
                "day_low": nullable("number", "Low of the day range"),
                "day_high": nullable("number", "High of the day range"),
                "volume": nullable("integer", "Volume traded today"),
                "avg_volume": nullable("integer", "Average daily volume"),
                "premarket_change_pct": nullable("number", "Pre-market percentage change"),
                "after_hours_change_pct": nullable("number", "After-hours percentage change"),
            }),
            &[],
        )
    }
}

/// Yahoo's "Why is this stock moving?" panel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiAnalysis {
    #[serde(default)]
    pub ticker: Ticker,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "updatedAt")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub bullets: Vec<String>,
}

impl AiAnalysis {
    pub fn empty(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_uppercase(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.as_deref().is_none_or(|s| s.trim().is_empty()) && self.bullets.is_empty()
    }
}

impl ExtractSchema for AiAnalysis {
    const NAME: &'static str = "AI analysis";

    fn schema() -> Value {
        object_schema(
            json!({
                "title": nullable("string", "Heading of the AI analysis panel"),
                "updated_at": nullable("string", "Timestamp like 'Updated 2 hours ago'"),
                "summary": nullable("string", "2-4 sentence explanation of why the stock is moving"),
                "bullets": string_list("3-5 key drivers: news, earnings, macro events"),
            }),
            &[],
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketWatchStory {
    pub headline: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub age: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default, rename = "keyPoints", alias = "key_points")]
    pub key_points: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketWatchTopStories {
    #[serde(default)]
    pub ticker: Ticker,
    #[serde(default)]
    pub stories: Vec<MarketWatchStory>,
}

impl ExtractSchema for MarketWatchTopStories {
    const NAME: &'static str = "MarketWatch stories";

    fn schema() -> Value {
        object_schema(
            json!({
                "stories": {
                    "type": "array",
                    "items": object_schema(json!({
                        "headline": { "type": "string" },
                        "url": nullable("string", "Link to the full article"),
                        "source": nullable("string", "Publisher if visible"),
                        "age": nullable("string", "Time indicator like '2 hours ago'"),
                    }), &["headline"]),
                },
            }),
            &[],
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoogleNewsStory {
    pub headline: String,
    pub url: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub age: Option<String>,
    /// 2-3 sentence summary; `None` when the article could not be read.
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub sentiment: Option<Tone>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoogleNewsSummary {
    #[serde(default, deserialize_with = "lenient")]
    pub overall_sentiment: Option<Outlook>,
    #[serde(default)]
    pub bullet_points: Vec<String>,
}

impl ExtractSchema for GoogleNewsSummary {
    const NAME: &'static str = "news summary";

    fn schema() -> Value {
        object_schema(
            json!({
                "overall_sentiment": nullable("string", "One of bullish, bearish, mixed, neutral"),
                "bullet_points": string_list("3-5 key takeaways across the articles"),
            }),
            &[],
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoogleNewsTopStories {
    pub ticker: Ticker,
    #[serde(default)]
    pub stories: Vec<GoogleNewsStory>,
    #[serde(default)]
    pub news_summary: Option<GoogleNewsSummary>,
}

/// A report listed on Vital Knowledge, with the date it was published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSource {
    pub title: String,
    pub date_str: String,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VitalKnowledgeHeadline {
    pub headline: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub sentiment: Option<Tone>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VitalKnowledgeSummary {
    #[serde(default, deserialize_with = "lenient")]
    pub overall_sentiment: Option<Outlook>,
    #[serde(default)]
    pub key_themes: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl ExtractSchema for VitalKnowledgeSummary {
    const NAME: &'static str = "ticker summary";

    fn schema() -> Value {
        object_schema(
            json!({
                "overall_sentiment": nullable("string", "Exactly one of bullish, bearish, mixed, neutral"),
                "key_themes": string_list("2-3 main themes"),
                "summary": nullable("string", "1-2 sentence summary"),
            }),
            &[],
        )
    }
}

/// Ticker-specific news gathered across the recent Vital Knowledge reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VitalKnowledgeReport {
    pub ticker: Ticker,
    #[serde(default)]
    pub headlines: Vec<VitalKnowledgeHeadline>,
    /// `YYYY-MM-DD` dates of the reports that mentioned the ticker.
    #[serde(default)]
    pub report_dates: Vec<String>,
    #[serde(default)]
    pub summary: Option<VitalKnowledgeSummary>,
    #[serde(default)]
    pub sources: Vec<ReportSource>,
}

impl VitalKnowledgeReport {
    pub fn empty(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            ..Default::default()
        }
    }
}

/// Market-wide brief synthesised from the recent Vital Knowledge reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroNewsSummary {
    #[serde(default)]
    pub report_count: usize,
    #[serde(default)]
    pub date_range: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub bullets: Vec<String>,
    #[serde(default)]
    pub sources: Vec<ReportSource>,
}

impl MacroNewsSummary {
    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.bullets.is_empty()
    }
}

/// Everything collected for one ticker during a run.
///
/// `errors` holds one entry per failed source, e.g. `"YahooQuote failed"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickerRecord {
    pub ticker: Ticker,
    pub quote: Option<QuoteSnapshot>,
    pub analysis: Option<AiAnalysis>,
    pub marketwatch: Option<MarketWatchTopStories>,
    pub googlenews: Option<GoogleNewsTopStories>,
    pub vital_knowledge: Option<VitalKnowledgeReport>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl TickerRecord {
    pub fn new(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            ..Default::default()
        }
    }

    /// Errors joined the way snapshots store them, `None` when clean.
    pub fn error_line(&self) -> Option<String> {
        (!self.errors.is_empty()).then(|| self.errors.join("; "))
    }
}
