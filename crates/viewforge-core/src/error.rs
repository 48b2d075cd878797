//! Typed errors for things a caller or embedder must be able to match on.

use thiserror::Error;

/// Failures that can occur while assembling a [`crate::dispatcher::Dispatcher`] from
/// configuration. All variants are fatal at startup.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A pool was configured with `concurrency == 0`.
    #[error("transformation type {type_name:?} has concurrency 0")]
    ZeroConcurrency {
        /// The offending transformation type.
        type_name: String,
    },

    /// A configured transformation type has no registered [`crate::driver::DriverFactory`].
    #[error("transformation type {type_name:?} has no driver factory")]
    MissingFactory {
        /// The offending transformation type.
        type_name: String,
    },
}

/// Failures a [`crate::driver::Driver`] implementation reports while running or
/// initialising a transformation.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver's execution environment is transiently unhealthy. The worker
    /// hosting this driver must be restarted and the work retried.
    #[error("retryable driver fault: {0}")]
    Retryable(String),

    /// The driver ran the transformation and decided the work cannot succeed.
    /// The worker stays alive; the caller is told.
    #[error("transformation failed: {0}")]
    RunFailed(String),

    /// Driver construction itself failed. Treated the same as a retryable
    /// fault by the worker's supervisor.
    #[error("driver initialisation failed: {0}")]
    InitFailed(String),
}
