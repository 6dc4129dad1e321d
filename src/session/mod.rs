//! Remote browser sessions driven by natural-language instructions.
//!
//! A [`SessionProvider`] creates isolated [`BrowserSession`]s. Each session
//! wraps one remote browser plus the LLM that plans its `observe`, `act` and
//! `extract` calls. Sessions are created per fetch, never shared between
//! concurrent fetches, and closed exactly once by [`crate::runner`].
//!
//! # Implementations
//!
//! - [`stagehand::StagehandProvider`]: Stagehand REST API over Browserbase
//! - `fake::FakeProvider` (tests only): scripted pages with open-session accounting

use crate::error::{Result, SnapshotError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[cfg(test)]
pub mod fake;
pub mod stagehand;

/// Labels attached to a session so it can be found in the provider dashboard.
#[derive(Debug, Clone, Default)]
pub struct SessionLabels {
    pub source: String,
    pub tickers: Vec<String>,
    pub run_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    Load,
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    #[serde(rename = "networkidle")]
    NetworkIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigateOptions {
    pub wait_until: WaitUntil,
    pub timeout: Duration,
}

impl NavigateOptions {
    pub const fn load(timeout: Duration) -> Self {
        Self { wait_until: WaitUntil::Load, timeout }
    }

    pub const fn network_idle(timeout: Duration) -> Self {
        Self { wait_until: WaitUntil::NetworkIdle, timeout }
    }
}

impl Default for NavigateOptions {
    fn default() -> Self {
        Self::load(Duration::from_secs(30))
    }
}

/// A page region located by `observe()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedElement {
    pub selector: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Action {
    /// Let the model plan the step from a sentence.
    Instruction(String),
    /// Replay an element returned by `observe()` without another planning call.
    Observed(ObservedElement),
}

impl From<&str> for Action {
    fn from(value: &str) -> Self {
        Self::Instruction(value.to_string())
    }
}

impl From<String> for Action {
    fn from(value: String) -> Self {
        Self::Instruction(value)
    }
}

#[derive(Debug, Clone)]
pub struct ExtractRequest<'a> {
    pub instruction: &'a str,
    pub schema: Value,
    /// Restrict extraction to this region.
    pub selector: Option<&'a str>,
    pub iframes: bool,
}

/// Result of a liveness probe right after session creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PageState {
    pub page_accessible: bool,
    pub current_url: Option<String>,
    pub status: Option<String>,
}

/// Cost and timing counters a session accumulated. Anything a provider does
/// not track stays zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUsage {
    pub act_prompt_tokens: u64,
    pub act_completion_tokens: u64,
    pub extract_prompt_tokens: u64,
    pub extract_completion_tokens: u64,
    pub observe_prompt_tokens: u64,
    pub observe_completion_tokens: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_cached_tokens: u64,
    pub total_inference_time_ms: u64,
}

impl SessionUsage {
    pub fn total_tokens(&self) -> u64 {
        self.total_prompt_tokens + self.total_completion_tokens
    }
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn create_session(&self, labels: &SessionLabels) -> Result<Box<dyn BrowserSession>>;
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    fn id(&self) -> &str;

    /// Link to a replay of this session, when the provider offers one.
    fn replay_url(&self) -> Option<String> {
        None
    }

    fn current_url(&self) -> Option<String>;

    async fn probe(&self) -> Result<PageState>;

    async fn goto(&self, url: &str, options: NavigateOptions) -> Result<()>;

    async fn observe(&self, instruction: &str) -> Result<Vec<ObservedElement>>;

    async fn act(&self, action: Action) -> Result<()>;

    async fn extract_raw(&self, request: ExtractRequest<'_>) -> Result<Value>;

    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// `None` when the provider exposes no counters at all.
    fn usage(&self) -> Option<SessionUsage> {
        None
    }

    /// Release the remote session. Calling it twice is a no-op.
    async fn close(&self) -> Result<()>;
}

/// A record that can be requested from `extract()` with a JSON schema.
pub trait ExtractSchema: DeserializeOwned + Send {
    const NAME: &'static str;

    fn schema() -> Value;
}

pub async fn extract<T: ExtractSchema>(
    session: &dyn BrowserSession,
    instruction: &str,
    selector: Option<&str>,
) -> Result<T> {
    let raw = session
        .extract_raw(ExtractRequest {
            instruction,
            schema: T::schema(),
            selector,
            iframes: false,
        })
        .await?;
    serde_json::from_value(raw).map_err(|e| SnapshotError::parse(T::NAME, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_serializes_untagged() {
        let plain = serde_json::to_value(Action::from("Click login")).unwrap();
        assert_eq!(plain, json!("Click login"));

        let observed = serde_json::to_value(Action::Observed(ObservedElement {
            selector: "xpath=/html/body/a".into(),
            description: "login link".into(),
            method: Some("click".into()),
            arguments: vec![],
        }))
        .unwrap();
        assert_eq!(observed["selector"], "xpath=/html/body/a");
        assert_eq!(observed["method"], "click");
        assert!(observed.get("arguments").is_none());
    }

    #[test]
    fn test_wait_until_names() {
        assert_eq!(serde_json::to_value(WaitUntil::NetworkIdle).unwrap(), json!("networkidle"));
        assert_eq!(serde_json::to_value(WaitUntil::Load).unwrap(), json!("load"));
    }

    #[test]
    fn test_usage_total_tokens() {
        let usage = SessionUsage {
            total_prompt_tokens: 1200,
            total_completion_tokens: 300,
            ..Default::default()
        };
        assert_eq!(usage.total_tokens(), 1500);
    }
}
