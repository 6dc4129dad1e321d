//! Pre-flight checks and timing diagnostics around a fetch.
//!
//! When enabled, every freshly created session is probed before it is handed
//! to a source skill. An unresponsive session is reported as a
//! `session_creation` failure carrying the probe result instead of surfacing
//! later as a confusing navigation error. Disabled guardrails produce empty
//! diagnostics and skip the probe.

use super::errors::Diagnostics;
use crate::error::SnapshotError;
use crate::session::BrowserSession;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guardrails {
    enabled: bool,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Guardrails {
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Probe a new session. Returns the diagnostics on success and a
    /// `SessionCreation` error plus the same diagnostics when the session is
    /// not usable.
    pub async fn check_session(
        &self,
        session: &dyn BrowserSession,
    ) -> Result<Diagnostics, (SnapshotError, Diagnostics)> {
        let mut diagnostics = Diagnostics::new();
        if !self.enabled {
            return Ok(diagnostics);
        }

        diagnostics.insert("session_created".into(), json!(true));
        diagnostics.insert("session_id".into(), json!(session.id()));

        let timer = GuardrailTimer::start("probe");
        let probe = session.probe().await;
        diagnostics.extend(timer.diagnostics());

        match probe {
            Ok(state) => {
                diagnostics.insert("page_accessible".into(), json!(state.page_accessible));
                if let Some(status) = &state.status {
                    diagnostics.insert("session_status".into(), json!(status));
                }
                if let Some(url) = &state.current_url {
                    diagnostics.insert("initial_url".into(), json!(url));
                }
                if state.page_accessible {
                    debug!(session_id = %session.id(), "Session passed pre-flight probe");
                    Ok(diagnostics)
                } else {
                    let status = state.status.unwrap_or_else(|| "unknown".into());
                    warn!(session_id = %session.id(), %status, "Session failed pre-flight probe");
                    Err((
                        SnapshotError::SessionCreation(format!("session is not running (status {status})")),
                        diagnostics,
                    ))
                }
            }
            Err(e) => {
                diagnostics.insert("page_accessible".into(), json!(false));
                diagnostics.insert("page_access_error".into(), json!(e.to_string()));
                Err((
                    SnapshotError::SessionCreation(format!("pre-flight probe failed: {e}")),
                    diagnostics,
                ))
            }
        }
    }

    /// Where the session ended up compared with where the skill sent it.
    pub fn navigation_diagnostics(&self, session: &dyn BrowserSession, expected_url: Option<&str>) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        if !self.enabled {
            return diagnostics;
        }
        let actual = session.current_url();
        if let Some(expected) = expected_url {
            diagnostics.insert("expected_url".into(), json!(expected));
            let success = actual.as_deref().is_some_and(|a| a.contains(expected));
            diagnostics.insert("navigation_success".into(), json!(success));
        }
        diagnostics.insert(
            "actual_url".into(),
            actual.map(Value::String).unwrap_or(Value::Null),
        );
        diagnostics
    }
}

/// Wall-clock timer reported as `{operation}_duration_ms`.
#[derive(Debug)]
pub struct GuardrailTimer {
    operation: &'static str,
    started: Instant,
}

impl GuardrailTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        diagnostics.insert(
            format!("{}_duration_ms", self.operation),
            json!(self.elapsed().as_millis() as u64),
        );
        diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::FakeProvider;
    use crate::session::{NavigateOptions, SessionLabels, SessionProvider};

    #[tokio::test]
    async fn test_healthy_session_passes_probe() {
        let provider = FakeProvider::new();
        let session = provider.create_session(&SessionLabels::default()).await.unwrap();
        let diagnostics = Guardrails::new(true).check_session(session.as_ref()).await.unwrap();
        assert_eq!(diagnostics["page_accessible"], true);
        assert_eq!(diagnostics["session_status"], "RUNNING");
        assert!(diagnostics.contains_key("probe_duration_ms"));
    }

    #[tokio::test]
    async fn test_unresponsive_session_is_session_creation_failure() {
        let provider = FakeProvider::new().unresponsive();
        let session = provider.create_session(&SessionLabels::default()).await.unwrap();
        let (err, diagnostics) = Guardrails::new(true).check_session(session.as_ref()).await.unwrap_err();
        assert!(matches!(err, SnapshotError::SessionCreation(_)));
        assert_eq!(diagnostics["page_accessible"], false);
    }

    #[tokio::test]
    async fn test_disabled_guardrails_skip_probe() {
        let provider = FakeProvider::new().unresponsive();
        let session = provider.create_session(&SessionLabels::default()).await.unwrap();
        let diagnostics = Guardrails::new(false).check_session(session.as_ref()).await.unwrap();
        assert!(diagnostics.is_empty());
        assert!(Guardrails::new(false).navigation_diagnostics(session.as_ref(), Some("x")).is_empty());
    }

    #[tokio::test]
    async fn test_navigation_diagnostics() {
        let provider = FakeProvider::new();
        let session = provider.create_session(&SessionLabels::default()).await.unwrap();
        session
            .goto("https://finance.yahoo.com/quote/AAPL/", NavigateOptions::default())
            .await
            .unwrap();
        let d = Guardrails::new(true).navigation_diagnostics(session.as_ref(), Some("finance.yahoo.com/quote/AAPL"));
        assert_eq!(d["navigation_success"], true);
        assert_eq!(d["actual_url"], "https://finance.yahoo.com/quote/AAPL/");
    }
}
