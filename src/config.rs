//! Run settings, layered: defaults, then an optional YAML file, then the
//! environment.
//!
//! Environment lookups go through a closure so callers (and tests) decide
//! where values come from; `main` passes `std::env::var`.
//!
//! ```yaml
//! # config.yaml, every field optional
//! max_concurrent_browsers: 3
//! lookback_days: 1
//! sources:
//!   marketwatch: false
//! retry:
//!   navigation: { max_retries: 3, base_delay_ms: 500 }
//! run_timeout_secs: 1800
//! ```

use crate::models::Ticker;
use crate::retry::RetryPolicy;
use crate::sources::SourceKind;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_WATCHLIST: [&str; 2] = ["AAPL", "GOOGL"];

static TICKER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9.\-]{0,9}$").expect("valid ticker regex"));

/// Which sources run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SourceToggles {
    pub yahoo_quote: bool,
    pub yahoo_analysis: bool,
    pub marketwatch: bool,
    pub google_news: bool,
    pub vital_knowledge: bool,
    pub macro_news: bool,
}

impl Default for SourceToggles {
    fn default() -> Self {
        Self {
            yahoo_quote: true,
            yahoo_analysis: true,
            marketwatch: true,
            google_news: true,
            vital_knowledge: true,
            macro_news: true,
        }
    }
}

impl SourceToggles {
    pub fn is_enabled(&self, kind: SourceKind) -> bool {
        match kind {
            SourceKind::YahooQuote => self.yahoo_quote,
            SourceKind::YahooAnalysis => self.yahoo_analysis,
            SourceKind::MarketWatch => self.marketwatch,
            SourceKind::GoogleNews => self.google_news,
            SourceKind::VitalKnowledge => self.vital_knowledge,
            SourceKind::MacroNews => self.macro_news,
        }
    }

    fn flag_mut(&mut self, kind: SourceKind) -> &mut bool {
        match kind {
            SourceKind::YahooQuote => &mut self.yahoo_quote,
            SourceKind::YahooAnalysis => &mut self.yahoo_analysis,
            SourceKind::MarketWatch => &mut self.marketwatch,
            SourceKind::GoogleNews => &mut self.google_news,
            SourceKind::VitalKnowledge => &mut self.vital_knowledge,
            SourceKind::MacroNews => &mut self.macro_news,
        }
    }
}

fn toggle_env_name(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::YahooQuote => "ENABLE_YAHOO_QUOTE",
        SourceKind::YahooAnalysis => "ENABLE_YAHOO_ANALYSIS",
        SourceKind::MarketWatch => "ENABLE_MARKETWATCH",
        SourceKind::GoogleNews => "ENABLE_GOOGLE_NEWS",
        SourceKind::VitalKnowledge => "ENABLE_VITAL_NEWS",
        SourceKind::MacroNews => "ENABLE_MACRO_NEWS",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub sources: SourceToggles,
    pub max_concurrent_browsers: usize,
    /// Days of news to consider (Google News and Vital Knowledge).
    pub lookback_days: u32,
    pub watchlist: Vec<Ticker>,
    pub guardrails: bool,
    /// Google News articles visited per ticker.
    pub max_stories: usize,
    /// MarketWatch story cards kept per ticker.
    pub max_cards: usize,
    pub navigation: RetryPolicy,
    pub extraction: RetryPolicy,
    pub run_timeout: Option<Duration>,
    pub memory_cache: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sources: SourceToggles::default(),
            max_concurrent_browsers: 2,
            lookback_days: 2,
            watchlist: default_watchlist(),
            guardrails: true,
            max_stories: 5,
            max_cards: 3,
            navigation: RetryPolicy::NAVIGATION,
            extraction: RetryPolicy::EXTRACTION,
            run_timeout: None,
            memory_cache: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PolicyFile {
    max_retries: Option<usize>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    jitter_ms: Option<u64>,
}

impl PolicyFile {
    fn apply(&self, policy: &mut RetryPolicy) {
        if let Some(n) = self.max_retries {
            policy.max_retries = n;
        }
        if let Some(ms) = self.base_delay_ms {
            policy.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_delay_ms {
            policy.max_delay = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = self.jitter_ms {
            policy.jitter = Duration::from_millis(ms);
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetryFile {
    navigation: PolicyFile,
    extraction: PolicyFile,
}

/// YAML layer. Everything is optional; absent keys keep the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    sources: Option<SourceToggles>,
    max_concurrent_browsers: Option<usize>,
    lookback_days: Option<u32>,
    guardrails: Option<bool>,
    max_stories: Option<usize>,
    max_cards: Option<usize>,
    retry: RetryFile,
    run_timeout_secs: Option<u64>,
    memory_cache: Option<bool>,
}

impl Settings {
    /// Defaults, then `config_path` if given, then the environment.
    pub fn load<F>(config_path: Option<&Path>, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(path) = config_path {
            settings.apply_file(path);
        }
        settings.apply_env(env);
        settings.max_concurrent_browsers = settings.max_concurrent_browsers.max(1);
        info!(
            max_concurrent_browsers = settings.max_concurrent_browsers,
            lookback_days = settings.lookback_days,
            guardrails = settings.guardrails,
            sources = ?settings.sources,
            "Settings loaded"
        );
        settings
    }

    fn apply_file(&mut self, path: &Path) {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read config file; using defaults");
                return;
            }
        };
        let file: SettingsFile = match serde_yaml::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed config file; using defaults");
                return;
            }
        };

        if let Some(sources) = file.sources {
            self.sources = sources;
        }
        if let Some(n) = file.max_concurrent_browsers {
            self.max_concurrent_browsers = n;
        }
        if let Some(days) = file.lookback_days.and_then(|n| positive("lookback_days", n)) {
            self.lookback_days = days;
        }
        if let Some(on) = file.guardrails {
            self.guardrails = on;
        }
        if let Some(n) = file.max_stories.and_then(|n| positive("max_stories", n)) {
            self.max_stories = n;
        }
        if let Some(n) = file.max_cards.and_then(|n| positive("max_cards", n)) {
            self.max_cards = n;
        }
        file.retry.navigation.apply(&mut self.navigation);
        file.retry.extraction.apply(&mut self.extraction);
        if let Some(secs) = file.run_timeout_secs {
            self.run_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(on) = file.memory_cache {
            self.memory_cache = on;
        }
        debug!(path = %path.display(), "Applied config file");
    }

    fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for kind in SourceKind::ALL {
            if let Some(raw) = env(toggle_env_name(kind)) {
                *self.sources.flag_mut(kind) = is_truthy(&raw);
            }
        }
        if let Some(n) = parse_env(&env, "MAX_CONCURRENT_BROWSERS") {
            self.max_concurrent_browsers = n;
        }
        if let Some(days) = parse_env(&env, "VITAL_DAYS_BACK")
            .or_else(|| parse_env(&env, "Vital_Days_Back"))
            .and_then(|n| positive("VITAL_DAYS_BACK", n))
        {
            self.lookback_days = days;
        }
        if let Some(raw) = env("ENABLE_GUARDRAILS") {
            self.guardrails = is_truthy(&raw);
        }
        if let Some(secs) = parse_env::<u64, _>(&env, "RUN_TIMEOUT_SECS") {
            self.run_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
    }
}

fn parse_env<T, F>(env: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring malformed number");
            None
        }
    }
}

/// `None` (keep the lower layer) for a zero count.
fn positive<T>(key: &str, value: T) -> Option<T>
where
    T: Default + PartialEq + std::fmt::Display,
{
    if value == T::default() {
        warn!(key, value = %value, "Ignoring zero; value must be positive");
        return None;
    }
    Some(value)
}

/// `1`, `true`, `yes`, `y`, `on` in any case; anything else is false.
pub fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on")
}

pub fn default_watchlist() -> Vec<Ticker> {
    DEFAULT_WATCHLIST.iter().map(|t| t.to_string()).collect()
}

/// Tickers from a JSON array file. Entries are upper-cased, invalid ones
/// dropped, repeats removed. A missing, malformed or empty list gives the
/// default watchlist.
pub fn load_watchlist(path: &Path) -> Vec<Ticker> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Watchlist not readable; using default");
            return default_watchlist();
        }
    };
    let entries: Vec<String> = match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Watchlist is not a JSON array of strings; using default");
            return default_watchlist();
        }
    };

    let tickers: Vec<Ticker> = entries
        .iter()
        .map(|t| t.trim().to_uppercase())
        .filter(|t| {
            let ok = TICKER_RE.is_match(t);
            if !ok {
                warn!(ticker = %t, "Dropping invalid ticker");
            }
            ok
        })
        .unique()
        .collect();

    if tickers.is_empty() {
        warn!(path = %path.display(), "Watchlist is empty; using default");
        return default_watchlist();
    }
    info!(count = tickers.len(), "Watchlist loaded");
    tickers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::load(None, env_from(&[]));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.max_concurrent_browsers, 2);
        assert_eq!(settings.watchlist, vec!["AAPL", "GOOGL"]);
        assert!(SourceKind::ALL.iter().all(|k| settings.sources.is_enabled(*k)));
    }

    #[test]
    fn test_truthy_values() {
        for raw in ["1", "true", "YES", "y", " On "] {
            assert!(is_truthy(raw), "{raw}");
        }
        for raw in ["0", "false", "no", "", "enabled"] {
            assert!(!is_truthy(raw), "{raw}");
        }
    }

    #[test]
    fn test_env_overrides() {
        let settings = Settings::load(
            None,
            env_from(&[
                ("ENABLE_MARKETWATCH", "false"),
                ("ENABLE_VITAL_NEWS", "0"),
                ("MAX_CONCURRENT_BROWSERS", "0"),
                ("Vital_Days_Back", "3"),
                ("ENABLE_GUARDRAILS", "no"),
                ("RUN_TIMEOUT_SECS", "600"),
            ]),
        );
        assert!(!settings.sources.marketwatch);
        assert!(!settings.sources.vital_knowledge);
        assert!(settings.sources.yahoo_quote);
        // clamped to at least one browser
        assert_eq!(settings.max_concurrent_browsers, 1);
        assert_eq!(settings.lookback_days, 3);
        assert!(!settings.guardrails);
        assert_eq!(settings.run_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_malformed_number_keeps_lower_layer() {
        let settings = Settings::load(None, env_from(&[("MAX_CONCURRENT_BROWSERS", "lots")]));
        assert_eq!(settings.max_concurrent_browsers, 2);
    }

    #[test]
    fn test_yaml_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "max_concurrent_browsers: 4\nlookback_days: 1\nsources:\n  google_news: false\n\
             retry:\n  navigation:\n    max_retries: 5\n    base_delay_ms: 250\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path), env_from(&[("MAX_CONCURRENT_BROWSERS", "3")]));
        assert_eq!(settings.max_concurrent_browsers, 3);
        assert_eq!(settings.lookback_days, 1);
        assert!(!settings.sources.google_news);
        assert!(settings.sources.yahoo_analysis);
        assert_eq!(settings.navigation.max_retries, 5);
        assert_eq!(settings.navigation.base_delay, Duration::from_millis(250));
        assert_eq!(settings.extraction, RetryPolicy::EXTRACTION);
    }

    #[test]
    fn test_zero_counts_keep_lower_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "lookback_days: 0\nmax_stories: 0\nmax_cards: 0\n").unwrap();
        let settings = Settings::load(Some(&path), env_from(&[]));
        assert_eq!(settings.lookback_days, 2);
        assert_eq!(settings.max_stories, 5);
        assert_eq!(settings.max_cards, 3);

        fs::write(&path, "lookback_days: 4\n").unwrap();
        let settings = Settings::load(Some(&path), env_from(&[("VITAL_DAYS_BACK", "0")]));
        assert_eq!(settings.lookback_days, 4);

        let settings = Settings::load(None, env_from(&[("Vital_Days_Back", "0")]));
        assert_eq!(settings.lookback_days, 2);
    }

    #[test]
    fn test_malformed_yaml_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "max_concurrent_browsers: [oops").unwrap();
        assert_eq!(Settings::load(Some(&path), env_from(&[])), Settings::default());
    }

    #[test]
    fn test_watchlist_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchlist.json");
        fs::write(&path, r#"["msft", "BRK.B", "1BAD", "MSFT", "waytoolongticker"]"#).unwrap();
        assert_eq!(load_watchlist(&path), vec!["MSFT", "BRK.B"]);

        fs::write(&path, "[]").unwrap();
        assert_eq!(load_watchlist(&path), default_watchlist());

        fs::write(&path, "{not json").unwrap();
        assert_eq!(load_watchlist(&path), default_watchlist());

        assert_eq!(load_watchlist(&dir.path().join("missing.json")), default_watchlist());
    }
}
