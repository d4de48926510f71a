//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (logging.rs installs the subscriber)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout (pretty or JSON lines)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Metric updates are cheap and unconditional; without an installed
//!   recorder they are dropped
//! - Key material never appears in fields

pub mod logging;
pub mod metrics;
