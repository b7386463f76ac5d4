//! Metrics collection and export for switchboard.
//!
//! Component crates record through the `metrics` facade using the names in
//! [`definitions`]. With the `prometheus` feature the binary installs an
//! exporter and can render the text format; otherwise recording is a no-op.
//!
//! ```rust,ignore
//! use switchboard_metrics::{counter, queue};
//!
//! counter!(queue::ENQUEUED_TOTAL).increment(1);
//! ```

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

pub use metrics::{counter, gauge, histogram};
