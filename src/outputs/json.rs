//! JSON snapshots of the merged run.
//!
//! One file per snapshot category, all under the snapshot directory:
//!
//! ```text
//! snapshot_dir/
//! ├── yahoo_snapshot_2025-12-03.json            {as_of, tickers: [{ticker, error, quote, analysis}]}
//! ├── marketwatch_snapshot_2025-12-03.json      {as_of, tickers: [{ticker, error, marketwatch}]}
//! ├── googlenews_snapshot_2025-12-03.json       {as_of, tickers: [{ticker, error, googlenews}]}
//! ├── vital_knowledge_snapshot_2025-12-03.json  {as_of, tickers: [{ticker, error, vital_knowledge}]}
//! └── macro_news_snapshot_2025-12-03.json       {as_of, macro_news}
//! ```
//!
//! `error` is the ticker's joined error list (`"YahooQuote failed; ..."`) or
//! `null`. Every category keeps every ticker so the files line up row by row.

use crate::error::Result;
use crate::models::{MacroNewsSummary, TickerRecord};
use crate::sources::Category;
use chrono::NaiveDate;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, instrument};

/// `{category}_snapshot_{date}.json`
pub fn snapshot_file_name(category: Category, as_of: NaiveDate) -> String {
    format!("{}_snapshot_{}.json", category.file_stem(), as_of.format("%Y-%m-%d"))
}

fn ticker_row(category: Category, record: &TickerRecord) -> Result<Value> {
    let mut row = Map::new();
    row.insert("ticker".into(), Value::from(record.ticker.as_str()));
    row.insert("error".into(), record.error_line().map_or(Value::Null, Value::from));
    match category {
        Category::Yahoo => {
            row.insert("quote".into(), serde_json::to_value(&record.quote)?);
            row.insert("analysis".into(), serde_json::to_value(&record.analysis)?);
        }
        Category::MarketWatch => {
            row.insert("marketwatch".into(), serde_json::to_value(&record.marketwatch)?);
        }
        Category::GoogleNews => {
            row.insert("googlenews".into(), serde_json::to_value(&record.googlenews)?);
        }
        Category::VitalKnowledge => {
            row.insert("vital_knowledge".into(), serde_json::to_value(&record.vital_knowledge)?);
        }
        Category::MacroNews => {}
    }
    Ok(Value::Object(row))
}

/// Snapshot document for a per-ticker category.
pub fn ticker_snapshot(category: Category, as_of: NaiveDate, records: &[TickerRecord]) -> Result<Value> {
    let rows = records
        .iter()
        .map(|r| ticker_row(category, r))
        .collect::<Result<Vec<_>>>()?;
    Ok(json!({
        "as_of": as_of.format("%Y-%m-%d").to_string(),
        "tickers": rows,
    }))
}

/// Snapshot document for the macro brief; `macro_news` is `null` when the
/// source produced nothing.
pub fn macro_snapshot(as_of: NaiveDate, brief: Option<&MacroNewsSummary>) -> Result<Value> {
    Ok(json!({
        "as_of": as_of.format("%Y-%m-%d").to_string(),
        "macro_news": serde_json::to_value(brief)?,
    }))
}

async fn write_json(path: &Path, doc: &Value) -> Result<()> {
    let body = serde_json::to_string_pretty(doc)?;
    if let Err(e) = fs::write(path, body).await {
        error!(path = %path.display(), error = %e, "Failed to write snapshot");
        return Err(e.into());
    }
    Ok(())
}

/// Write the snapshot of one category and return its path.
#[instrument(level = "info", skip_all, fields(snapshot_dir = %snapshot_dir.display(), category = category.file_stem()))]
pub async fn write_snapshot(
    snapshot_dir: &Path,
    category: Category,
    as_of: NaiveDate,
    records: &[TickerRecord],
    macro_news: Option<&MacroNewsSummary>,
) -> Result<PathBuf> {
    fs::create_dir_all(snapshot_dir).await?;
    let doc = match category {
        Category::MacroNews => macro_snapshot(as_of, macro_news)?,
        other => ticker_snapshot(other, as_of, records)?,
    };
    let path = snapshot_dir.join(snapshot_file_name(category, as_of));
    write_json(&path, &doc).await?;
    info!(path = %path.display(), rows = records.len(), "Wrote snapshot");
    Ok(path)
}
