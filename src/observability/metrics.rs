//! Token, timing and success counters per browser session and per run.
//!
//! The runner reports every session it opened, successful or not, through
//! [`MetricsCollector::record_session`]. At the end of a run
//! [`MetricsCollector::save_run_metrics`] writes one JSON file with the
//! aggregate, the per-session rows and a per-source breakdown.

use crate::session::SessionUsage;
use chrono::{DateTime, Local};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// What the runner knows about a session once its fetch is over.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    pub source_name: String,
    pub ticker: Option<String>,
    pub session_id: String,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
    pub usage: Option<SessionUsage>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub source_name: String,
    pub ticker: Option<String>,
    pub session_id: String,
    pub duration_sec: f64,
    pub success: bool,
    pub error: Option<String>,
    #[serde(flatten)]
    pub usage: SessionUsage,
    pub region: Option<String>,
    pub proxy_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub timestamp: DateTime<Local>,
    pub sessions: Vec<SessionMetrics>,
    pub total_sessions: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_cached_tokens: u64,
    pub total_inference_time_ms: u64,
    pub total_duration_sec: f64,
    pub total_browser_minutes: f64,
}

impl RunMetrics {
    pub fn total_tokens(&self) -> u64 {
        self.total_prompt_tokens + self.total_completion_tokens
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_sessions == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_sessions as f64
        }
    }

    pub fn avg_session_duration_sec(&self) -> f64 {
        if self.total_sessions == 0 {
            0.0
        } else {
            self.total_duration_sec / self.total_sessions as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceTotals {
    pub count: usize,
    pub success_count: usize,
    pub total_tokens: u64,
    pub total_duration_sec: f64,
}

#[derive(Serialize)]
struct MetricsFile<'a> {
    run_id: &'a str,
    timestamp: DateTime<Local>,
    summary: SummarySection,
    llm_costs: LlmCosts,
    timing: Timing,
    per_session: &'a [SessionMetrics],
    #[serde(serialize_with = "ordered_sources")]
    by_source: Vec<(String, SourceTotals)>,
}

#[derive(Serialize)]
struct SummarySection {
    total_sessions: usize,
    success_count: usize,
    error_count: usize,
    success_rate: f64,
}

#[derive(Serialize)]
struct LlmCosts {
    total_prompt_tokens: u64,
    total_completion_tokens: u64,
    total_tokens: u64,
    total_cached_tokens: u64,
    total_inference_time_ms: u64,
}

#[derive(Serialize)]
struct Timing {
    total_duration_sec: f64,
    total_browser_minutes: f64,
    avg_session_duration_sec: f64,
}

fn ordered_sources<S: Serializer>(entries: &[(String, SourceTotals)], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(entries.iter().map(|(k, v)| (k, v)))
}

#[derive(Debug)]
pub struct MetricsCollector {
    run_id: String,
    dir: PathBuf,
    sessions: Mutex<Vec<SessionMetrics>>,
}

impl MetricsCollector {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_run_id(dir, Local::now().format("%Y%m%d_%H%M%S").to_string())
    }

    pub fn with_run_id(dir: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            dir: dir.into(),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SessionMetrics>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_session(&self, report: SessionReport) {
        let usage = match report.usage {
            Some(usage) => usage,
            None => {
                debug!(source = %report.source_name, session_id = %report.session_id, "Session exposed no usage counters");
                SessionUsage::default()
            }
        };

        let tokens = usage.total_tokens();
        let duration_sec = report.duration.as_secs_f64();
        if tokens > 0 {
            info!(
                source = %report.source_name,
                ticker = report.ticker.as_deref().unwrap_or("-"),
                tokens,
                duration_sec = %format!("{duration_sec:.1}"),
                "Session metrics"
            );
        }

        self.lock().push(SessionMetrics {
            source_name: report.source_name,
            ticker: report.ticker,
            session_id: report.session_id,
            duration_sec,
            success: report.success,
            error: report.error,
            usage,
            region: report.region,
            proxy_bytes: 0,
        });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn run_metrics(&self) -> RunMetrics {
        let sessions = self.lock().clone();
        let mut run = RunMetrics {
            run_id: self.run_id.clone(),
            timestamp: Local::now(),
            total_sessions: sessions.len(),
            success_count: sessions.iter().filter(|s| s.success).count(),
            error_count: sessions.iter().filter(|s| !s.success).count(),
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
            total_cached_tokens: 0,
            total_inference_time_ms: 0,
            total_duration_sec: 0.0,
            total_browser_minutes: 0.0,
            sessions,
        };
        for s in &run.sessions {
            run.total_prompt_tokens += s.usage.total_prompt_tokens;
            run.total_completion_tokens += s.usage.total_completion_tokens;
            run.total_cached_tokens += s.usage.total_cached_tokens;
            run.total_inference_time_ms += s.usage.total_inference_time_ms;
            run.total_duration_sec += s.duration_sec;
        }
        run.total_browser_minutes = run.total_duration_sec / 60.0;
        run
    }

    /// Write `{step_name}.json`, or `run_{run_id}.json` without a step name.
    pub fn save_run_metrics(&self, step_name: Option<&str>) -> io::Result<PathBuf> {
        let run = self.run_metrics();
        let file = MetricsFile {
            run_id: &run.run_id,
            timestamp: run.timestamp,
            summary: SummarySection {
                total_sessions: run.total_sessions,
                success_count: run.success_count,
                error_count: run.error_count,
                success_rate: run.success_rate(),
            },
            llm_costs: LlmCosts {
                total_prompt_tokens: run.total_prompt_tokens,
                total_completion_tokens: run.total_completion_tokens,
                total_tokens: run.total_tokens(),
                total_cached_tokens: run.total_cached_tokens,
                total_inference_time_ms: run.total_inference_time_ms,
            },
            timing: Timing {
                total_duration_sec: run.total_duration_sec,
                total_browser_minutes: run.total_browser_minutes,
                avg_session_duration_sec: run.avg_session_duration_sec(),
            },
            per_session: &run.sessions,
            by_source: by_source(&run.sessions),
        };

        let filename = match step_name {
            Some(step) => format!("{step}.json"),
            None => format!("run_{}.json", run.run_id),
        };
        let path = write_json(&self.dir, &filename, &file)?;

        info!(
            path = %path.display(),
            total_tokens = run.total_tokens(),
            total_duration_sec = %format!("{:.1}", run.total_duration_sec),
            browser_minutes = %format!("{:.2}", run.total_browser_minutes),
            success = run.success_count,
            sessions = run.total_sessions,
            "Saved run metrics"
        );
        Ok(path)
    }

    pub fn log_summary(&self) {
        let run = self.run_metrics();
        info!(
            run_id = %run.run_id,
            sessions = run.total_sessions,
            success = run.success_count,
            errors = run.error_count,
            prompt_tokens = run.total_prompt_tokens,
            completion_tokens = run.total_completion_tokens,
            cached_tokens = run.total_cached_tokens,
            total_tokens = run.total_tokens(),
            inference_ms = run.total_inference_time_ms,
            total_duration_sec = %format!("{:.1}", run.total_duration_sec),
            avg_session_sec = %format!("{:.1}", run.avg_session_duration_sec()),
            "Metrics summary"
        );
    }
}

fn by_source(sessions: &[SessionMetrics]) -> Vec<(String, SourceTotals)> {
    let mut out: Vec<(String, SourceTotals)> = Vec::new();
    for s in sessions {
        let idx = match out.iter().position(|(name, _)| *name == s.source_name) {
            Some(idx) => idx,
            None => {
                out.push((s.source_name.clone(), SourceTotals::default()));
                out.len() - 1
            }
        };
        let totals = &mut out[idx].1;
        totals.count += 1;
        if s.success {
            totals.success_count += 1;
        }
        totals.total_tokens += s.usage.total_tokens();
        totals.total_duration_sec += s.duration_sec;
    }
    out
}

fn write_json<T: Serialize>(dir: &Path, filename: &str, value: &T) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(filename);
    fs::write(&path, serde_json::to_string_pretty(value)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn report(source: &str, ticker: &str, secs: u64, success: bool, tokens: Option<(u64, u64)>) -> SessionReport {
        SessionReport {
            source_name: source.into(),
            ticker: Some(ticker.into()),
            session_id: format!("{source}-{ticker}"),
            duration: Duration::from_secs(secs),
            success,
            error: (!success).then(|| "failed".to_string()),
            usage: tokens.map(|(p, c)| SessionUsage {
                total_prompt_tokens: p,
                total_completion_tokens: c,
                ..Default::default()
            }),
            region: None,
        }
    }

    #[test]
    fn test_run_metrics_aggregates_sessions() {
        let collector = MetricsCollector::with_run_id(std::env::temp_dir(), "test");
        collector.record_session(report("YahooQuote", "AAPL", 30, true, Some((1000, 200))));
        collector.record_session(report("YahooQuote", "GOOGL", 90, false, None));

        let run = collector.run_metrics();
        assert_eq!(run.total_sessions, 2);
        assert_eq!(run.success_count, 1);
        assert_eq!(run.error_count, 1);
        assert_eq!(run.total_tokens(), 1200);
        assert_eq!(run.total_duration_sec, 120.0);
        assert_eq!(run.total_browser_minutes, 2.0);
        assert_eq!(run.success_rate(), 0.5);
        // missing usage counts as zero
        assert_eq!(run.sessions[1].usage, SessionUsage::default());
    }

    #[test]
    fn test_save_run_metrics_layout() {
        let dir = tempfile::tempdir().unwrap();
        let collector = MetricsCollector::with_run_id(dir.path(), "20251203_070000");
        collector.record_session(report("GoogleNews", "AAPL", 10, true, Some((50, 50))));
        collector.record_session(report("YahooQuote", "AAPL", 20, true, Some((10, 0))));
        collector.record_session(report("GoogleNews", "GOOGL", 30, false, None));

        let path = collector.save_run_metrics(None).unwrap();
        assert_eq!(path.file_name().unwrap(), "run_20251203_070000.json");

        let raw = fs::read_to_string(&path).unwrap();
        let json: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["summary"]["total_sessions"], 3);
        assert_eq!(json["llm_costs"]["total_tokens"], 110);
        assert_eq!(json["timing"]["avg_session_duration_sec"], 20.0);
        assert_eq!(json["per_session"][0]["total_prompt_tokens"], 50);
        assert_eq!(json["by_source"]["GoogleNews"]["count"], 2);
        assert_eq!(json["by_source"]["GoogleNews"]["success_count"], 1);
        assert_eq!(json["by_source"]["GoogleNews"]["total_duration_sec"], 40.0);
        // first-seen order in the written file
        assert!(raw.find("\"GoogleNews\": {").unwrap() < raw.find("\"YahooQuote\": {").unwrap());
    }

    #[test]
    fn test_save_with_step_name_and_empty_run() {
        let dir = tempfile::tempdir().unwrap();
        let collector = MetricsCollector::new(dir.path().join("metrics"));
        let path = collector.save_run_metrics(Some("000_baseline")).unwrap();
        assert_eq!(path.file_name().unwrap(), "000_baseline.json");

        let json: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["summary"]["success_rate"], 0.0);
        assert_eq!(json["timing"]["avg_session_duration_sec"], 0.0);
    }
}
