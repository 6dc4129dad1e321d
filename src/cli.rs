//! Command-line interface definitions for the morning snapshot.
//!
//! Output locations are plain flags. Credentials and Stagehand/Browserbase
//! options can also come from the environment (or a `.env` file), which is how
//! scheduled runs are usually configured.

use crate::session::stagehand::{DEFAULT_API_URL, DEFAULT_BROWSERBASE_API_URL, StagehandConfig};
use crate::sources::Credentials;
use clap::{ArgAction, Parser};
use clap::builder::BoolishValueParser;
use std::path::PathBuf;

/// Command-line arguments for one morning run.
///
/// # Examples
///
/// ```sh
/// # Defaults: data/ for artifacts, config/watchlist.json for tickers
/// morning_snapshot
///
/// # Custom watchlist and settings file, metrics saved as nightly.json
/// morning_snapshot -w ./tickers.json -c ./snapshot.yaml --metrics-step nightly
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Output directory for the JSON snapshots
    #[arg(long, default_value = "data/snapshots")]
    pub snapshot_dir: PathBuf,

    /// Output directory for the Markdown report
    #[arg(long, default_value = "data/reports")]
    pub reports_dir: PathBuf,

    /// Directory for error artifacts (cleared at start)
    #[arg(long, default_value = "data/errors")]
    pub errors_dir: PathBuf,

    /// Directory for run metrics
    #[arg(long, default_value = "data/metrics")]
    pub metrics_dir: PathBuf,

    /// Persistent selector cache
    #[arg(long, default_value = "data/cache/selectors.json")]
    pub cache_file: PathBuf,

    /// Keep discovered selectors for this run only
    #[arg(long)]
    pub memory_cache: bool,

    /// Optional path to a YAML settings file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// JSON array of ticker symbols
    #[arg(short, long, default_value = "config/watchlist.json")]
    pub watchlist: PathBuf,

    /// Save metrics as `{name}.json` instead of `run_{run_id}.json`
    #[arg(long)]
    pub metrics_step: Option<String>,

    #[arg(long, env = "BROWSERBASE_API_KEY", hide_env_values = true)]
    pub browserbase_api_key: Option<String>,

    #[arg(long, env = "BROWSERBASE_PROJECT_ID")]
    pub browserbase_project_id: Option<String>,

    /// Model provider key used by Stagehand
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "STAGEHAND_MODEL_NAME", default_value = "gpt-4.1-mini")]
    pub model_name: String,

    #[arg(long, env = "STAGEHAND_API_URL", default_value = DEFAULT_API_URL)]
    pub stagehand_api_url: String,

    #[arg(long, env = "BROWSERBASE_API_URL", default_value = DEFAULT_BROWSERBASE_API_URL)]
    pub browserbase_api_url: String,

    #[arg(long, env = "BROWSERBASE_REGION", default_value = "us-west-2")]
    pub region: String,

    /// Browserbase session lifetime in seconds
    #[arg(long, env = "BROWSERBASE_TIMEOUT", default_value_t = 900)]
    pub session_timeout: u64,

    #[arg(long, env = "BROWSERBASE_KEEP_ALIVE", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub keep_alive: bool,

    #[arg(long, env = "BROWSERBASE_USE_PROXIES", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub use_proxies: bool,

    #[arg(long, env = "BROWSERBASE_ADVANCED_STEALTH", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub advanced_stealth: bool,

    #[arg(long, env = "BROWSERBASE_SOLVE_CAPTCHAS", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub solve_captchas: bool,

    #[arg(long, env = "STAGEHAND_DOM_SETTLE_TIMEOUT_MS", default_value_t = 15_000)]
    pub dom_settle_timeout_ms: u64,

    /// Stagehand log verbosity (0-2)
    #[arg(long, env = "STAGEHAND_VERBOSE", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub verbose: u8,

    #[arg(long, env = "VITAL_LOGIN")]
    pub vital_login: Option<String>,

    #[arg(long, env = "VITAL_PASSWORD", hide_env_values = true)]
    pub vital_password: Option<String>,
}

impl Cli {
    /// Client settings for the Stagehand provider. Missing keys become empty
    /// strings; the provider rejects them when it is built.
    pub fn stagehand_config(&self) -> StagehandConfig {
        StagehandConfig {
            api_url: self.stagehand_api_url.clone(),
            browserbase_api_url: self.browserbase_api_url.clone(),
            api_key: self.browserbase_api_key.clone().unwrap_or_default(),
            project_id: self.browserbase_project_id.clone().unwrap_or_default(),
            model_name: self.model_name.clone(),
            model_api_key: self.openai_api_key.clone().unwrap_or_default(),
            region: self.region.clone(),
            keep_alive: self.keep_alive,
            session_timeout_secs: self.session_timeout,
            dom_settle_timeout_ms: self.dom_settle_timeout_ms,
            verbose: self.verbose,
            proxies: self.use_proxies,
            advanced_stealth: self.advanced_stealth,
            solve_captchas: self.solve_captchas,
            ..StagehandConfig::default()
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            vital_login: self.vital_login.clone(),
            vital_password: self.vital_password.clone(),
        }
    }

    /// Every directory the run writes into.
    pub fn output_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![
            self.snapshot_dir.clone(),
            self.reports_dir.clone(),
            self.errors_dir.clone(),
            self.metrics_dir.clone(),
        ];
        if !self.memory_cache {
            if let Some(parent) = self.cache_file.parent().filter(|p| !p.as_os_str().is_empty()) {
                dirs.push(parent.to_path_buf());
            }
        }
        dirs
    }
}
