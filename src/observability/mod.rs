//! Run observability: error artifacts, session metrics and pre-flight checks.
//!
//! - [`errors::ErrorTracker`]: every swallowed failure, grouped per component
//! - [`metrics::MetricsCollector`]: token and timing counters per session
//! - [`guardrails::Guardrails`]: session probes and timing diagnostics
//!
//! Both collectors are created once per run and shared through `Arc`.

pub mod errors;
pub mod guardrails;
pub mod metrics;

pub use errors::{Diagnostics, ErrorRecord, ErrorSummary, ErrorTracker};
pub use guardrails::{GuardrailTimer, Guardrails};
pub use metrics::{MetricsCollector, RunMetrics, SessionReport};
