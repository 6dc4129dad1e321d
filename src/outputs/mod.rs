//! Run artifacts: JSON snapshots and the Markdown report.
//!
//! # Submodules
//!
//! - [`json`]: one `{category}_snapshot_{date}.json` per enabled category
//! - [`markdown`]: the `morning_snapshot_{date}.md` report
//!
//! # Output Structure
//!
//! ```text
//! snapshot_dir/
//! ├── yahoo_snapshot_2025-12-03.json
//! ├── googlenews_snapshot_2025-12-03.json
//! └── ...
//!
//! reports_dir/
//! └── morning_snapshot_2025-12-03.md
//! ```

pub mod json;
pub mod markdown;
