//! Error taxonomy for the snapshot pipeline.
//!
//! Every failure that can surface from a session, a source skill, or the
//! pipeline itself is a [`SnapshotError`]. Each variant maps onto a coarse
//! [`FailurePoint`] used in error artifacts and onto the retry predicates
//! consumed by [`crate::retry`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = SnapshotError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The remote session could not be established or is unresponsive.
    #[error("session creation failed: {0}")]
    SessionCreation(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("extraction failed: {0}")]
    Extraction(String),

    /// A cached locator no longer resolves on the page.
    #[error("cached selector `{key}` no longer resolves")]
    SelectorMiss { key: String },

    /// Payload did not match the expected record shape.
    #[error("unexpected {what} shape: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("session provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),

    /// A fetch or task panicked; the message is whatever the payload carried.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl SnapshotError {
    /// Stable name for the failure kind, used as `error_type` in artifacts.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::SessionCreation(_) => "SessionCreationError",
            Self::Navigation { .. } => "NavigationError",
            Self::Extraction(_) => "ExtractionError",
            Self::SelectorMiss { .. } => "SelectorMissError",
            Self::Parse { .. } => "ParseError",
            Self::Provider { .. } => "ProviderError",
            Self::Timeout(_) => "TimeoutError",
            Self::Http(_) => "HttpError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
            Self::Config(_) => "ConfigError",
            Self::MissingCredentials(_) => "MissingCredentialsError",
            Self::Panicked(_) => "PanicError",
        }
    }

    /// Coarse stage tag for diagnostics. Not used for control flow.
    pub fn failure_point(&self) -> FailurePoint {
        match self {
            Self::SessionCreation(_) => FailurePoint::SessionCreation,
            Self::Navigation { .. } => FailurePoint::Navigation,
            Self::Extraction(_) => FailurePoint::Extraction,
            Self::SelectorMiss { .. } => FailurePoint::SelectorMiss,
            Self::Parse { .. } | Self::Json(_) => FailurePoint::Parse,
            Self::Config(_) | Self::MissingCredentials(_) | Self::Io(_) => FailurePoint::Pipeline,
            Self::Panicked(_) => FailurePoint::Coordination,
            Self::Provider { .. } | Self::Timeout(_) | Self::Http(_) => FailurePoint::Fetch,
        }
    }

    /// Transport-level trouble that another attempt might clear.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Provider { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn parse(what: &'static str, source: serde_json::Error) -> Self {
        Self::Parse { what, source }
    }
}

/// Which stage of a fetch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePoint {
    SessionCreation,
    Navigation,
    Extraction,
    SelectorMiss,
    Parse,
    Fetch,
    ArticleProcessing,
    ReportProcessing,
    SummaryExtraction,
    Teardown,
    Coordination,
    Pipeline,
}

impl FailurePoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreation => "session_creation",
            Self::Navigation => "navigation",
            Self::Extraction => "extraction",
            Self::SelectorMiss => "selector_miss",
            Self::Parse => "parse",
            Self::Fetch => "fetch",
            Self::ArticleProcessing => "article_processing",
            Self::ReportProcessing => "report_processing",
            Self::SummaryExtraction => "summary_extraction",
            Self::Teardown => "teardown",
            Self::Coordination => "coordination",
            Self::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for FailurePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_points_follow_variant() {
        let nav = SnapshotError::Navigation {
            url: "https://example.com".into(),
            reason: "net::ERR_TIMED_OUT".into(),
        };
        assert_eq!(nav.failure_point(), FailurePoint::Navigation);
        assert_eq!(nav.error_type(), "NavigationError");

        let created = SnapshotError::SessionCreation("no slot".into());
        assert_eq!(created.failure_point().as_str(), "session_creation");
    }

    #[test]
    fn test_provider_status_transience() {
        let busy = SnapshotError::Provider { status: 503, body: String::new() };
        let denied = SnapshotError::Provider { status: 401, body: String::new() };
        assert!(busy.is_transient());
        assert!(!denied.is_transient());
        assert!(SnapshotError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!SnapshotError::Extraction("bad".into()).is_transient());
    }

    #[test]
    fn test_failure_point_serializes_snake_case() {
        let json = serde_json::to_string(&FailurePoint::SessionCreation).unwrap();
        assert_eq!(json, "\"session_creation\"");
    }
}
