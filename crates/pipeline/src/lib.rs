//! Inbound event ingestion and the worker pool that drives each job through
//! the session lock, the downstream processor, the rate limiter and the
//! reply sender.

pub mod error;
pub mod ingress;
pub mod services;
pub mod traits;
pub mod worker;

pub use {
    error::{Error, Result},
    ingress::{Admission, Ingress},
    services::{Services, run_migrations},
    traits::{Processor, ReplySender},
    worker::{JobOutcome, PROCESSOR_BREAKER, PoolHandle, WorkerOptions, WorkerPool},
};
