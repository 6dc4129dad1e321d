//! Source skills: one [`SourceFetcher`] per website section we read.
//!
//! A fetcher receives a live session, a [`FetchTarget`] and the shared
//! [`FetchContext`], and returns a [`FetchOutcome`]. Producing nothing is a
//! legitimate answer (`FetchOutcome::Empty`); only genuine failures are
//! errors, and those are recorded by the runner, not by the fetcher.
//!
//! # Shapes
//!
//! | Kind             | Shape       | Snapshot category  |
//! |------------------|-------------|--------------------|
//! | `YahooQuote`     | per ticker  | `yahoo`            |
//! | `YahooAnalysis`  | per ticker  | `yahoo`            |
//! | `MarketWatch`    | per ticker  | `marketwatch`      |
//! | `GoogleNews`     | per ticker  | `googlenews`       |
//! | `VitalKnowledge` | batch       | `vital_knowledge`  |
//! | `MacroNews`      | global      | `macro_news`       |

use crate::cache::SelectorCache;
use crate::config::SourceToggles;
use crate::error::{Result, SnapshotError};
use crate::models::{
    AiAnalysis, GoogleNewsTopStories, MacroNewsSummary, MarketWatchTopStories, QuoteSnapshot, Ticker,
    VitalKnowledgeReport,
};
use crate::observability::ErrorTracker;
use crate::retry::RetryPolicy;
use crate::session::BrowserSession;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub mod dates;
pub mod google_news;
pub mod macro_news;
pub mod marketwatch;
pub mod vital_knowledge;
pub mod weighting;
pub mod yahoo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    YahooQuote,
    YahooAnalysis,
    MarketWatch,
    GoogleNews,
    VitalKnowledge,
    MacroNews,
}

impl SourceKind {
    pub const ALL: [Self; 6] = [
        Self::YahooQuote,
        Self::YahooAnalysis,
        Self::MarketWatch,
        Self::GoogleNews,
        Self::VitalKnowledge,
        Self::MacroNews,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::YahooQuote => "YahooQuote",
            Self::YahooAnalysis => "YahooAI",
            Self::MarketWatch => "MarketWatch",
            Self::GoogleNews => "GoogleNews",
            Self::VitalKnowledge => "VitalKnowledge",
            Self::MacroNews => "MacroNews",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Self::YahooQuote | Self::YahooAnalysis => Category::Yahoo,
            Self::MarketWatch => Category::MarketWatch,
            Self::GoogleNews => Category::GoogleNews,
            Self::VitalKnowledge => Category::VitalKnowledge,
            Self::MacroNews => Category::MacroNews,
        }
    }

    pub fn shape(&self) -> FetchShape {
        match self {
            Self::VitalKnowledge => FetchShape::Batch,
            Self::MacroNews => FetchShape::Global,
            _ => FetchShape::PerTicker,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot file a source's results land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Yahoo,
    MarketWatch,
    GoogleNews,
    VitalKnowledge,
    MacroNews,
}

impl Category {
    pub fn file_stem(&self) -> &'static str {
        match self {
            Self::Yahoo => "yahoo",
            Self::MarketWatch => "marketwatch",
            Self::GoogleNews => "googlenews",
            Self::VitalKnowledge => "vital_knowledge",
            Self::MacroNews => "macro_news",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchShape {
    /// One task per ticker.
    PerTicker,
    /// One task covering every ticker.
    Batch,
    /// One task, no ticker at all.
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchTarget {
    Ticker(Ticker),
    Tickers(Vec<Ticker>),
    Global,
}

impl FetchTarget {
    pub fn tickers(&self) -> Vec<Ticker> {
        match self {
            Self::Ticker(t) => vec![t.clone()],
            Self::Tickers(ts) => ts.clone(),
            Self::Global => Vec::new(),
        }
    }

    /// Ticker label for logs and metrics: `AAPL`, `AAPL,GOOGL` or `None`.
    pub fn label(&self) -> Option<String> {
        match self {
            Self::Ticker(t) => Some(t.clone()),
            Self::Tickers(ts) => Some(ts.join(",")),
            Self::Global => None,
        }
    }

    pub fn single(&self) -> Result<&str> {
        match self {
            Self::Ticker(t) => Ok(t),
            other => Err(SnapshotError::Config(format!("expected a single ticker, got {other:?}"))),
        }
    }

    pub fn many(&self) -> Result<&[Ticker]> {
        match self {
            Self::Tickers(ts) => Ok(ts),
            other => Err(SnapshotError::Config(format!("expected a ticker batch, got {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceData {
    Quote(QuoteSnapshot),
    Analysis(AiAnalysis),
    MarketWatch(MarketWatchTopStories),
    GoogleNews(GoogleNewsTopStories),
    VitalKnowledgeBatch(BTreeMap<Ticker, VitalKnowledgeReport>),
    MacroNews(MacroNewsSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Data(SourceData),
    /// The source ran fine and had nothing to report.
    Empty { reason: String },
}

impl FetchOutcome {
    pub fn empty(reason: impl Into<String>) -> Self {
        Self::Empty { reason: reason.into() }
    }

    pub fn into_data(self) -> Option<SourceData> {
        match self {
            Self::Data(data) => Some(data),
            Self::Empty { .. } => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub vital_login: Option<String>,
    pub vital_password: Option<String>,
}

impl Credentials {
    /// Both Vital Knowledge credentials, or a `MissingCredentials` error.
    pub fn vital(&self) -> Result<(&str, &str)> {
        let login = self
            .vital_login
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(SnapshotError::MissingCredentials("VITAL_LOGIN"))?;
        let password = self
            .vital_password
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(SnapshotError::MissingCredentials("VITAL_PASSWORD"))?;
        Ok((login, password))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("vital_login", &self.vital_login)
            .field("vital_password", &self.vital_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Shared state and knobs handed to every fetch.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub cache: Arc<SelectorCache>,
    pub errors: Arc<ErrorTracker>,
    pub lookback_days: u32,
    pub max_stories: usize,
    pub max_cards: usize,
    pub navigation: RetryPolicy,
    pub extraction: RetryPolicy,
    pub credentials: Credentials,
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Rust module implementing the skill, used in error components.
    fn module(&self) -> &'static str;

    async fn fetch(
        &self,
        session: &dyn BrowserSession,
        target: &FetchTarget,
        ctx: &FetchContext,
    ) -> Result<FetchOutcome>;

    /// Whether a one-off warm-up session should run before dispatch.
    fn needs_warm_up(&self, _ctx: &FetchContext) -> bool {
        false
    }

    async fn warm_up(&self, _session: &dyn BrowserSession, _ctx: &FetchContext) -> Result<()> {
        Ok(())
    }
}

/// Component name used in error artifacts: `"{source} ({module})"`.
pub fn component_name(fetcher: &dyn SourceFetcher) -> String {
    format!("{} ({})", fetcher.kind().name(), fetcher.module())
}

/// The fetchers enabled for a run, in dispatch order.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    fetchers: Vec<Arc<dyn SourceFetcher>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in skills filtered by the toggles.
    pub fn from_toggles(toggles: &SourceToggles) -> Self {
        let mut registry = Self::new();
        for kind in SourceKind::ALL {
            if !toggles.is_enabled(kind) {
                continue;
            }
            let fetcher: Arc<dyn SourceFetcher> = match kind {
                SourceKind::YahooQuote => Arc::new(yahoo::YahooQuote),
                SourceKind::YahooAnalysis => Arc::new(yahoo::YahooAnalysis),
                SourceKind::MarketWatch => Arc::new(marketwatch::MarketWatch),
                SourceKind::GoogleNews => Arc::new(google_news::GoogleNews),
                SourceKind::VitalKnowledge => Arc::new(vital_knowledge::VitalKnowledge::default()),
                SourceKind::MacroNews => Arc::new(macro_news::MacroNews::default()),
            };
            registry.register(fetcher);
        }
        registry
    }

    pub fn register(&mut self, fetcher: Arc<dyn SourceFetcher>) {
        self.fetchers.push(fetcher);
    }

    pub fn fetchers(&self) -> &[Arc<dyn SourceFetcher>] {
        &self.fetchers
    }

    pub fn is_enabled(&self, kind: SourceKind) -> bool {
        self.fetchers.iter().any(|f| f.kind() == kind)
    }

    /// Snapshot categories that have at least one enabled source.
    pub fn categories(&self) -> Vec<Category> {
        let mut categories: Vec<Category> = self.fetchers.iter().map(|f| f.kind().category()).collect();
        categories.sort();
        categories.dedup();
        categories
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.fetchers.iter().map(|s| s.kind().name()))
            .finish()
    }
}

/// Context with an in-memory cache and a throwaway error directory.
#[cfg(test)]
pub(crate) fn test_context() -> (FetchContext, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let errors = ErrorTracker::new(dir.path().join("errors")).unwrap();
    let ctx = FetchContext {
        cache: Arc::new(SelectorCache::in_memory()),
        errors: Arc::new(errors),
        lookback_days: 2,
        max_stories: 5,
        max_cards: 3,
        navigation: RetryPolicy::new(2, std::time::Duration::ZERO),
        extraction: RetryPolicy::new(1, std::time::Duration::ZERO),
        credentials: Credentials {
            vital_login: Some("analyst@example.com".into()),
            vital_password: Some("hunter2".into()),
        },
    };
    (ctx, dir)
}
