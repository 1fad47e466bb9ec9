//! Shared ambient stack for the vagent workspace: logging setup, error
//! context helpers, and the process-wide metrics registry. Adapted from the
//! teacher stack's `infra-common` crate, trimmed to the pieces this workspace
//! actually needs (no event bus, no deployment planes — this agent is a
//! single per-call state machine, not a distributed control plane).

pub mod errors;
pub mod logging;
pub mod metrics;

pub use errors::{ErrorContext, ErrorExt, Severity};
pub use logging::{setup_logging, LoggingConfig};
pub use metrics::MetricsCollector;
