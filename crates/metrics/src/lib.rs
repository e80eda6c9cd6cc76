//! Metrics for chatrelay.
//!
//! Recording goes through the `metrics` crate facade, so it is a no-op until a
//! recorder is installed. With the `prometheus` feature, [`init_metrics`]
//! installs a Prometheus recorder whose output [`MetricsHandle::render`] returns.
//!
//! ```rust,ignore
//! use chatrelay_metrics::{counter, dispatch};
//!
//! counter!(dispatch::JOBS_ENQUEUED_TOTAL, "kind" => "text").increment(1);
//! ```

mod definitions;
pub mod error;
mod recorder;

pub use {
    definitions::*,
    error::{Error, Result},
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

pub use metrics::{counter, gauge, histogram};
