//! Scripted in-process sessions for tests.
//!
//! Replies are matched against the extract instruction by substring, first
//! rule wins. The provider counts created, open and closed sessions and keeps
//! the peak number of sessions open at once.

use super::{
    Action, BrowserSession, ExtractRequest, NavigateOptions, ObservedElement, PageState,
    SessionLabels, SessionProvider, SessionUsage,
};
use crate::error::{Result, SnapshotError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    Fail(String),
}

#[derive(Debug, Clone)]
struct ExtractRule {
    needle: String,
    /// `Some(true)` only matches scoped extracts, `Some(false)` only unscoped.
    scoped: Option<bool>,
    reply: Reply,
}

#[derive(Debug, Default)]
struct Script {
    extract: Vec<ExtractRule>,
    observe: Vec<ObservedElement>,
    goto_failures: Vec<String>,
    failing_sources: Vec<String>,
    latency: Duration,
    unresponsive: bool,
    usage: Option<SessionUsage>,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicUsize,
    open: AtomicUsize,
    peak: AtomicUsize,
    closed: AtomicUsize,
}

#[derive(Debug, Default)]
pub struct FakeProvider {
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn on_extract(self, needle: &str, value: Value) -> Self {
        self.rule(needle, None, Reply::Json(value))
    }

    pub fn on_scoped_extract(self, needle: &str, reply: Reply) -> Self {
        self.rule(needle, Some(true), reply)
    }

    pub fn fail_extract(self, needle: &str, message: &str) -> Self {
        self.rule(needle, None, Reply::Fail(message.to_string()))
    }

    fn rule(self, needle: &str, scoped: Option<bool>, reply: Reply) -> Self {
        self.script().extract.push(ExtractRule {
            needle: needle.to_string(),
            scoped,
            reply,
        });
        self
    }

    pub fn with_observed(self, elements: Vec<ObservedElement>) -> Self {
        self.script().observe = elements;
        self
    }

    /// Every navigation to a URL containing `needle` fails.
    pub fn fail_goto(self, needle: &str) -> Self {
        self.script().goto_failures.push(needle.to_string());
        self
    }

    /// Session creation fails for sessions labelled with this source.
    pub fn fail_creation_for(self, source: &str) -> Self {
        self.script().failing_sources.push(source.to_string());
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.script().latency = latency;
        self
    }

    pub fn unresponsive(self) -> Self {
        self.script().unresponsive = true;
        self
    }

    pub fn with_usage(self, usage: SessionUsage) -> Self {
        self.script().usage = Some(usage);
        self
    }

    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn open(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    /// Log of `goto`/`observe`/`act`/`extract` calls across every session.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    async fn create_session(&self, labels: &SessionLabels) -> Result<Box<dyn BrowserSession>> {
        let (latency, fails) = {
            let script = self.script();
            (script.latency, script.failing_sources.contains(&labels.source))
        };
        if fails {
            return Err(SnapshotError::SessionCreation(format!("scripted failure for {}", labels.source)));
        }
        tokio::time::sleep(latency / 4).await;

        let n = self.counters.created.fetch_add(1, Ordering::SeqCst) + 1;
        let open = self.counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(open, Ordering::SeqCst);

        Ok(Box::new(FakeSession {
            id: format!("fake-{n}"),
            script: Arc::clone(&self.script),
            counters: Arc::clone(&self.counters),
            calls: Arc::clone(&self.calls),
            current_url: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
pub struct FakeSession {
    id: String,
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
    calls: Arc<Mutex<Vec<String>>>,
    current_url: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl FakeSession {
    fn log(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }

    async fn pause(&self) {
        let latency = self.script.lock().unwrap().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn replay_url(&self) -> Option<String> {
        Some(format!("https://www.browserbase.com/sessions/{}", self.id))
    }

    fn current_url(&self) -> Option<String> {
        self.current_url.lock().unwrap().clone()
    }

    async fn probe(&self) -> Result<PageState> {
        let unresponsive = self.script.lock().unwrap().unresponsive;
        Ok(PageState {
            page_accessible: !unresponsive,
            current_url: self.current_url(),
            status: Some(if unresponsive { "ERROR" } else { "RUNNING" }.to_string()),
        })
    }

    async fn goto(&self, url: &str, _options: NavigateOptions) -> Result<()> {
        self.log(format!("goto {url}"));
        self.pause().await;
        let fails = self
            .script
            .lock()
            .unwrap()
            .goto_failures
            .iter()
            .any(|needle| url.contains(needle.as_str()));
        if fails {
            return Err(SnapshotError::Navigation {
                url: url.to_string(),
                reason: "net::ERR_CONNECTION_RESET".into(),
            });
        }
        *self.current_url.lock().unwrap() = Some(url.to_string());
        Ok(())
    }

    async fn observe(&self, instruction: &str) -> Result<Vec<ObservedElement>> {
        self.log(format!("observe {instruction}"));
        Ok(self.script.lock().unwrap().observe.clone())
    }

    async fn act(&self, action: Action) -> Result<()> {
        self.log(format!("act {action:?}"));
        Ok(())
    }

    async fn extract_raw(&self, request: ExtractRequest<'_>) -> Result<Value> {
        self.log(format!(
            "extract {} selector={}",
            request.instruction,
            request.selector.unwrap_or("-")
        ));
        self.pause().await;

        let scoped = request.selector.is_some();
        let reply = self
            .script
            .lock()
            .unwrap()
            .extract
            .iter()
            .find(|rule| {
                request.instruction.contains(rule.needle.as_str())
                    && rule.scoped.is_none_or(|want| want == scoped)
            })
            .map(|rule| rule.reply.clone());

        match reply {
            Some(Reply::Json(value)) => Ok(value),
            Some(Reply::Fail(message)) => Err(SnapshotError::Extraction(message)),
            None => Err(SnapshotError::Extraction(format!(
                "no scripted reply for `{}`",
                request.instruction
            ))),
        }
    }

    async fn wait(&self, _duration: Duration) {}

    fn usage(&self) -> Option<SessionUsage> {
        self.script.lock().unwrap().usage
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.open.fetch_sub(1, Ordering::SeqCst);
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
