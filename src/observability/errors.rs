//! Error tracking focused on *which component* failed and *where*.
//!
//! Every failure that a fetch, a batch task or the pipeline swallows is
//! recorded here so the run can finish while the operator still gets a full
//! account of what went wrong. Each [`ErrorTracker::record`] call writes:
//!
//! - `error_{YYYY-MM-DD_HH-MM-SS}_{component}_{seq}.json`: the record alone
//! - `errors_{day}.jsonl`: one line appended per record
//! - `error_summary_{day}.json` / `.txt`: regenerated from every record so far
//!
//! Artifact I/O is fire-and-forget: failures are logged and the record stays
//! in memory. A tracker wipes earlier `.json`, `.jsonl` and `.txt` files from
//! its directory on construction so every run starts from a clean slate.

use crate::error::{FailurePoint, SnapshotError};
use crate::utils::slugify;
use chrono::{DateTime, Local, Utc};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Free-form diagnostics captured around a failure (URLs, timings, probe
/// results).
pub type Diagnostics = Map<String, Value>;

const RECENT_ERRORS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub error_type: String,
    pub error_message: String,
    pub context: Map<String, Value>,
    pub failure_point: Option<FailurePoint>,
    pub diagnostics: Diagnostics,
    pub session_id: Option<String>,
    pub session_url: Option<String>,
    pub traceback: String,
}

impl ErrorRecord {
    pub fn new(component: impl Into<String>, error_type: &str, error_message: impl Into<String>) -> Self {
        let error_message = error_message.into();
        Self {
            timestamp: Utc::now(),
            component: component.into(),
            error_type: error_type.to_string(),
            traceback: error_message.clone(),
            error_message,
            context: Map::new(),
            failure_point: None,
            diagnostics: Diagnostics::new(),
            session_id: None,
            session_url: None,
        }
    }

    /// Build a record from an error, taking its type name, failure point and
    /// `source()` chain.
    pub fn from_error(err: &SnapshotError, component: impl Into<String>) -> Self {
        let mut record = Self::new(component, err.error_type(), err.to_string());
        record.failure_point = Some(err.failure_point());
        record.traceback = render_chain(err);
        record
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics.extend(diagnostics);
        self
    }

    pub fn with_failure_point(mut self, failure_point: FailurePoint) -> Self {
        self.failure_point = Some(failure_point);
        self
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_url = Some(session_url(session_id));
        self.session_id = Some(session_id.to_string());
        self
    }
}

pub fn session_url(session_id: &str) -> String {
    format!("https://www.browserbase.com/sessions/{session_id}")
}

fn render_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        let _ = write!(out, "\ncaused by: {cause}");
        current = cause.source();
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    NoErrors,
    ErrorsOccurred,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentCount {
    pub component: String,
    pub error_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorTypeCount {
    pub error_type: String,
    pub count: usize,
}

/// Grouped counts keep first-seen order and serialize as JSON objects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breakdown {
    #[serde(serialize_with = "ordered_map")]
    pub errors_by_component: Vec<(String, usize)>,
    #[serde(serialize_with = "ordered_map")]
    pub errors_by_type: Vec<(String, usize)>,
    pub most_problematic_component: Option<ComponentCount>,
    pub most_common_error_type: Option<ErrorTypeCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub total_errors: usize,
    pub status: SummaryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Breakdown>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorRecord>,
}

impl ErrorSummary {
    fn from_records(records: &[ErrorRecord]) -> Self {
        if records.is_empty() {
            return Self {
                total_errors: 0,
                status: SummaryStatus::NoErrors,
                message: Some("No errors occurred in this run.".to_string()),
                timestamp: None,
                summary: None,
                errors: Vec::new(),
            };
        }

        let by_component = first_seen_counts(records.iter().map(|r| r.component.as_str()));
        let by_type = first_seen_counts(records.iter().map(|r| r.error_type.as_str()));

        let most_problematic_component = leader(&by_component).map(|(component, error_count)| ComponentCount {
            component: component.clone(),
            error_count: *error_count,
        });
        let most_common_error_type = leader(&by_type).map(|(error_type, count)| ErrorTypeCount {
            error_type: error_type.clone(),
            count: *count,
        });

        Self {
            total_errors: records.len(),
            status: SummaryStatus::ErrorsOccurred,
            message: None,
            timestamp: Some(Utc::now()),
            summary: Some(Breakdown {
                errors_by_component: by_component,
                errors_by_type: by_type,
                most_problematic_component,
                most_common_error_type,
            }),
            errors: records[records.len().saturating_sub(RECENT_ERRORS)..].to_vec(),
        }
    }

    pub fn to_text(&self) -> String {
        let rule = "=".repeat(60);
        let mut out = String::new();
        let _ = writeln!(out, "{rule}\nERROR SUMMARY\n{rule}\n");
        let _ = writeln!(out, "Total Errors: {}", self.total_errors);
        let _ = writeln!(out, "Status: {}\n", status_label(self.status));

        let Some(breakdown) = &self.summary else {
            let _ = writeln!(out, "✅ No errors occurred in this run.");
            return out;
        };

        let _ = writeln!(out, "Errors by Component:");
        for (component, count) in &breakdown.errors_by_component {
            let _ = writeln!(out, "  - {component}: {count} error(s)");
        }
        out.push('\n');

        if let Some(top) = &breakdown.most_problematic_component {
            let _ = writeln!(
                out,
                "Most Problematic Component: {} ({} errors)\n",
                top.component, top.error_count
            );
        }

        let _ = writeln!(out, "Recent Errors:");
        for error in self.errors.iter().take(5) {
            let _ = writeln!(out, "\n  Component: {}", error.component);
            let _ = writeln!(out, "  Error: {}: {}", error.error_type, error.error_message);
            if !error.context.is_empty() {
                let ctx = error
                    .context
                    .iter()
                    .map(|(k, v)| match v {
                        Value::String(s) => format!("{k}={s}"),
                        other => format!("{k}={other}"),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = writeln!(out, "  Context: {ctx}");
            }
            if let Some(url) = &error.session_url {
                let _ = writeln!(out, "  Session: {url}");
            }
        }
        out
    }
}

fn status_label(status: SummaryStatus) -> &'static str {
    match status {
        SummaryStatus::NoErrors => "no_errors",
        SummaryStatus::ErrorsOccurred => "errors_occurred",
    }
}

fn first_seen_counts<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for key in keys {
        match counts.iter_mut().find(|(name, _)| name == key) {
            Some((_, n)) => *n += 1,
            None => counts.push((key.to_string(), 1)),
        }
    }
    counts
}

/// Highest count; ties go to the earliest entry.
fn leader(counts: &[(String, usize)]) -> Option<&(String, usize)> {
    counts.iter().fold(None, |best, entry| match best {
        Some(b) if b.1 >= entry.1 => Some(b),
        _ => Some(entry),
    })
}

fn ordered_map<S: Serializer>(entries: &[(String, usize)], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(entries.iter().map(|(k, v)| (k, v)))
}

#[derive(Debug, Default)]
struct TrackerState {
    records: Vec<ErrorRecord>,
    seq: usize,
}

#[derive(Debug)]
pub struct ErrorTracker {
    dir: PathBuf,
    day: String,
    state: Mutex<TrackerState>,
}

impl ErrorTracker {
    /// Create the artifact directory and delete the previous run's artifacts.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let cleared = clear_artifacts(&dir);
        if cleared > 0 {
            info!(dir = %dir.display(), cleared, "Cleared old error artifacts");
        }
        Ok(Self {
            dir,
            day: Local::now().format("%Y-%m-%d").to_string(),
            state: Mutex::new(TrackerState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, record: ErrorRecord) {
        warn!(
            component = %record.component,
            error_type = %record.error_type,
            failure_point = record.failure_point.map(|fp| fp.as_str()).unwrap_or("-"),
            session_id = record.session_id.as_deref().unwrap_or("-"),
            error = %record.error_message,
            "Recorded error"
        );

        let mut state = self.lock();
        state.seq += 1;
        let seq = state.seq;
        if let Err(e) = self.write_record(&record, seq) {
            warn!(error = %e, "Failed to write error artifact");
        }
        state.records.push(record);
        if let Err(e) = self.write_summary(&ErrorSummary::from_records(&state.records)) {
            warn!(error = %e, "Failed to write error summary");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        self.lock().records.clone()
    }

    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary::from_records(&self.lock().records)
    }

    /// Location of the JSON summary, meant for the operator (or an LLM) to read.
    pub fn summary_path(&self) -> PathBuf {
        self.dir.join(format!("error_summary_{}.json", self.day))
    }

    fn write_record(&self, record: &ErrorRecord, seq: usize) -> io::Result<()> {
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let path = self
            .dir
            .join(format!("error_{stamp}_{}_{seq}.json", slugify(&record.component)));
        fs::write(&path, serde_json::to_string_pretty(record)?)?;

        let mut daily = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(format!("errors_{}.jsonl", self.day)))?;
        writeln!(daily, "{}", serde_json::to_string(record)?)?;
        debug!(path = %path.display(), "Wrote error artifact");
        Ok(())
    }

    fn write_summary(&self, summary: &ErrorSummary) -> io::Result<()> {
        fs::write(self.summary_path(), serde_json::to_string_pretty(summary)?)?;
        fs::write(
            self.dir.join(format!("error_summary_{}.txt", self.day)),
            summary.to_text(),
        )
    }
}

fn clear_artifacts(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut cleared = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_artifact = path.is_file()
            && matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("json" | "jsonl" | "txt")
            );
        if !is_artifact {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => cleared += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Could not delete old error artifact"),
        }
    }
    cleared
}
