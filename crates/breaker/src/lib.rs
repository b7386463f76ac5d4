//! Circuit breaker for calls to the downstream processing dependency.
//!
//! Outcomes are tallied in a rolling window of time buckets. When enough
//! calls have been seen and the failure share crosses the threshold the
//! circuit opens and calls fail fast. After the reset timeout a limited
//! number of probes are let through; one success closes the circuit, one
//! failure opens it again. Every call runs under a hard timeout and a
//! timeout counts as a failure.

pub mod breaker;
pub mod error;
pub mod registry;
pub mod window;

pub use {
    breaker::{BreakerOptions, BreakerSnapshot, CircuitBreaker, CircuitState},
    error::BreakerError,
    registry::BreakerRegistry,
    window::{RollingWindow, WindowCounts},
};
