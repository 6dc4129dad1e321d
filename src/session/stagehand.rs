//! Stagehand REST client running sessions on Browserbase.
//!
//! Every session call is a `POST {api}/sessions/{id}/{op}` that answers with a
//! `{ "success": bool, "data": ... }` envelope. Streaming is disabled through
//! the `x-stream-response` header so each call returns one JSON document.
//! Token usage, when the service reports it, is accumulated per session and
//! exposed through [`BrowserSession::usage`].

use super::{
    Action, BrowserSession, ExtractRequest, NavigateOptions, ObservedElement, PageState,
    SessionLabels, SessionProvider, SessionUsage,
};
use crate::error::{Result, SnapshotError};
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const DEFAULT_API_URL: &str = "https://api.stagehand.browserbase.com/v1";
pub const DEFAULT_BROWSERBASE_API_URL: &str = "https://api.browserbase.com/v1";

#[derive(Debug, Clone)]
pub struct StagehandConfig {
    pub api_url: String,
    pub browserbase_api_url: String,
    pub api_key: String,
    pub project_id: String,
    pub model_name: String,
    pub model_api_key: String,
    pub region: String,
    pub keep_alive: bool,
    /// Browserbase session lifetime, in seconds.
    pub session_timeout_secs: u64,
    pub dom_settle_timeout_ms: u64,
    pub verbose: u8,
    pub proxies: bool,
    pub advanced_stealth: bool,
    pub solve_captchas: bool,
    /// Timeout for `act`, `observe` and `extract` calls.
    pub request_timeout: Duration,
}

impl Default for StagehandConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            browserbase_api_url: DEFAULT_BROWSERBASE_API_URL.to_string(),
            api_key: String::new(),
            project_id: String::new(),
            model_name: "gpt-4.1-mini".to_string(),
            model_api_key: String::new(),
            region: "us-west-2".to_string(),
            keep_alive: true,
            session_timeout_secs: 900,
            dom_settle_timeout_ms: 15_000,
            verbose: 0,
            proxies: true,
            advanced_stealth: false,
            solve_captchas: true,
            request_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallUsage {
    #[serde(default, alias = "prompt_tokens")]
    prompt_tokens: u64,
    #[serde(default, alias = "completion_tokens")]
    completion_tokens: u64,
    #[serde(default, alias = "cached_input_tokens", alias = "cachedInputTokens")]
    cached_tokens: u64,
    #[serde(default, alias = "inference_time_ms")]
    inference_time_ms: u64,
}

/// Parse an API root and drop the trailing slash so paths can be appended.
fn base_url(name: &str, raw: &str) -> Result<String> {
    let parsed = Url::parse(raw).map_err(|e| SnapshotError::Config(format!("{name} `{raw}`: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SnapshotError::Config(format!("{name} must be http(s), got `{raw}`")));
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

#[derive(Debug, Clone)]
pub struct StagehandProvider {
    http: reqwest::Client,
    config: Arc<StagehandConfig>,
}

impl StagehandProvider {
    pub fn new(mut config: StagehandConfig) -> Result<Self> {
        config.api_url = base_url("STAGEHAND_API_URL", &config.api_url)?;
        config.browserbase_api_url = base_url("BROWSERBASE_API_URL", &config.browserbase_api_url)?;
        if config.api_key.is_empty() {
            return Err(SnapshotError::MissingCredentials("BROWSERBASE_API_KEY"));
        }
        if config.project_id.is_empty() {
            return Err(SnapshotError::MissingCredentials("BROWSERBASE_PROJECT_ID"));
        }
        if config.model_api_key.is_empty() {
            return Err(SnapshotError::MissingCredentials("OPENAI_API_KEY"));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("x-bb-api-key", config.api_key.as_str()),
            ("x-bb-project-id", config.project_id.as_str()),
            ("x-model-api-key", config.model_api_key.as_str()),
            ("x-stream-response", "false"),
        ] {
            let value = HeaderValue::from_str(value)
                .map_err(|e| SnapshotError::Config(format!("invalid {name} header: {e}")))?;
            headers.insert(HeaderName::from_static(name), value);
        }

        let http = reqwest::Client::builder().default_headers(headers).build()?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    fn start_body(&self, labels: &SessionLabels) -> Value {
        let cfg = &self.config;

        let mut metadata = Map::new();
        if !labels.source.is_empty() {
            metadata.insert("source".into(), json!(labels.source));
        }
        if !labels.tickers.is_empty() {
            metadata.insert("ticker".into(), json!(labels.tickers.join(",")));
        }
        metadata.insert("run_id".into(), json!(labels.run_id));

        let mut browser_settings = Map::new();
        if cfg.advanced_stealth {
            browser_settings.insert("advancedStealth".into(), json!(true));
        }
        if !cfg.solve_captchas {
            browser_settings.insert("solveCaptchas".into(), json!(false));
        }

        let mut params = json!({
            "projectId": cfg.project_id,
            "region": cfg.region,
            "keepAlive": cfg.keep_alive,
            "timeout": cfg.session_timeout_secs,
            "userMetadata": metadata,
            "proxies": cfg.proxies,
        });
        if !browser_settings.is_empty() {
            params["browserSettings"] = Value::Object(browser_settings);
        }

        json!({
            "modelName": cfg.model_name,
            "domSettleTimeoutMs": cfg.dom_settle_timeout_ms,
            "verbose": cfg.verbose,
            "selfHeal": true,
            "browserbaseSessionCreateParams": params,
        })
    }
}

#[async_trait]
impl SessionProvider for StagehandProvider {
    #[instrument(level = "info", skip_all, fields(source = %labels.source))]
    async fn create_session(&self, labels: &SessionLabels) -> Result<Box<dyn BrowserSession>> {
        let url = format!("{}/sessions/start", self.config.api_url);
        let data = post_envelope(&self.http, &url, &self.start_body(labels), self.config.request_timeout)
            .await
            .map_err(|e| SnapshotError::SessionCreation(e.to_string()))?;

        if data.get("available").and_then(Value::as_bool) == Some(false) {
            return Err(SnapshotError::SessionCreation("no browser capacity available".into()));
        }
        let id = data
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| SnapshotError::SessionCreation("response carried no sessionId".into()))?
            .to_string();

        info!(session_id = %id, "Stagehand session started");
        Ok(Box::new(StagehandSession {
            http: self.http.clone(),
            config: Arc::clone(&self.config),
            id,
            state: Mutex::new(SessionState::default()),
        }))
    }
}

#[derive(Debug, Default)]
struct SessionState {
    current_url: Option<String>,
    usage: SessionUsage,
    closed: bool,
}

#[derive(Debug)]
pub struct StagehandSession {
    http: reqwest::Client,
    config: Arc<StagehandConfig>,
    id: String,
    state: Mutex<SessionState>,
}

impl StagehandSession {
    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn call(&self, op: &'static str, body: Value, timeout: Duration) -> Result<Value> {
        let url = format!("{}/sessions/{}/{}", self.config.api_url, self.id, op);
        let t0 = Instant::now();
        let mut data = post_envelope(&self.http, &url, &body, timeout).await?;
        self.record_usage(op, &data, t0.elapsed());

        if let Value::Object(map) = &mut data {
            if let Some(result) = map.remove("result") {
                return Ok(result);
            }
        }
        Ok(data)
    }

    fn record_usage(&self, op: &str, data: &Value, elapsed: Duration) {
        let reported: CallUsage = data
            .get("usage")
            .cloned()
            .and_then(|u| serde_json::from_value(u).ok())
            .unwrap_or_default();
        let inference_ms = if reported.inference_time_ms > 0 {
            reported.inference_time_ms
        } else {
            elapsed.as_millis() as u64
        };

        let mut state = self.state();
        let usage = &mut state.usage;
        match op {
            "act" => {
                usage.act_prompt_tokens += reported.prompt_tokens;
                usage.act_completion_tokens += reported.completion_tokens;
            }
            "extract" => {
                usage.extract_prompt_tokens += reported.prompt_tokens;
                usage.extract_completion_tokens += reported.completion_tokens;
            }
            "observe" => {
                usage.observe_prompt_tokens += reported.prompt_tokens;
                usage.observe_completion_tokens += reported.completion_tokens;
            }
            _ => return,
        }
        usage.total_prompt_tokens += reported.prompt_tokens;
        usage.total_completion_tokens += reported.completion_tokens;
        usage.total_cached_tokens += reported.cached_tokens;
        usage.total_inference_time_ms += inference_ms;
    }
}

#[async_trait]
impl BrowserSession for StagehandSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn replay_url(&self) -> Option<String> {
        Some(format!("https://www.browserbase.com/sessions/{}", self.id))
    }

    fn current_url(&self) -> Option<String> {
        self.state().current_url.clone()
    }

    async fn probe(&self) -> Result<PageState> {
        let url = format!("{}/sessions/{}", self.config.browserbase_api_url, self.id);
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(15))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(SnapshotError::Provider {
                status: status.as_u16(),
                body: truncate_for_log(&body, 500),
            });
        }
        let info: Value = serde_json::from_str(&body).map_err(|e| SnapshotError::parse("session status", e))?;
        let remote_status = info.get("status").and_then(Value::as_str).map(str::to_string);

        Ok(PageState {
            page_accessible: remote_status.as_deref() == Some("RUNNING"),
            current_url: self.current_url(),
            status: remote_status,
        })
    }

    #[instrument(level = "info", skip(self, options), fields(session_id = %self.id))]
    async fn goto(&self, url: &str, options: NavigateOptions) -> Result<()> {
        let body = json!({
            "url": url,
            "options": {
                "waitUntil": options.wait_until,
                "timeout": options.timeout.as_millis() as u64,
            },
        });
        // the remote side enforces `options.timeout`; leave headroom for the round trip
        let http_timeout = options.timeout + Duration::from_secs(10);
        match self.call("navigate", body, http_timeout).await {
            Ok(_) => {
                self.state().current_url = Some(url.to_string());
                Ok(())
            }
            Err(e) => Err(SnapshotError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn observe(&self, instruction: &str) -> Result<Vec<ObservedElement>> {
        let result = self
            .call("observe", json!({ "instruction": instruction }), self.config.request_timeout)
            .await?;
        serde_json::from_value(result).map_err(|e| SnapshotError::parse("observe result", e))
    }

    async fn act(&self, action: Action) -> Result<()> {
        debug!(session_id = %self.id, ?action, "act");
        self.call("act", json!({ "action": action }), self.config.request_timeout)
            .await
            .map(|_| ())
    }

    async fn extract_raw(&self, request: ExtractRequest<'_>) -> Result<Value> {
        let mut body = json!({
            "instruction": request.instruction,
            "schemaDefinition": request.schema,
            "iframes": request.iframes,
        });
        if let Some(selector) = request.selector {
            body["selector"] = json!(selector);
        }
        match self.call("extract", body, self.config.request_timeout).await {
            Ok(value) => Ok(value),
            Err(e @ SnapshotError::Parse { .. }) => Err(e),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => Err(SnapshotError::Extraction(e.to_string())),
        }
    }

    fn usage(&self) -> Option<SessionUsage> {
        Some(self.state().usage)
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        let url = format!("{}/sessions/{}/end", self.config.api_url, self.id);
        match post_envelope(&self.http, &url, &json!({}), Duration::from_secs(30)).await {
            Ok(_) => {
                debug!(session_id = %self.id, "Stagehand session ended");
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Ending Stagehand session failed");
                Err(e)
            }
        }
    }
}

async fn post_envelope(http: &reqwest::Client, url: &str, body: &Value, timeout: Duration) -> Result<Value> {
    let resp = http.post(url).timeout(timeout).json(body).send().await?;
    let status = resp.status();
    let text = resp.text().await?;

    if !status.is_success() {
        return Err(SnapshotError::Provider {
            status: status.as_u16(),
            body: truncate_for_log(&text, 500),
        });
    }

    let envelope: Envelope = serde_json::from_str(&text).map_err(|e| SnapshotError::parse("stagehand response", e))?;
    if !envelope.success {
        return Err(SnapshotError::Provider {
            status: status.as_u16(),
            body: envelope.message.unwrap_or_else(|| truncate_for_log(&text, 500)),
        });
    }
    Ok(envelope.data)
}
