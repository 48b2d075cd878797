#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Transformation dispatcher and driver-pool supervisor for a data-warehouse
//! view scheduler.
//!
//! Views declare a *transformation* (HiveQL, MapReduce, a filesystem
//! operation, ...). When a view needs to be (re)materialized, the request is
//! submitted to a [`dispatcher::DispatcherHandle`], which routes it to a pool
//! of identically-typed [`driver::Driver`]s, load-balances among them, tracks
//! liveness, restarts failed workers with exponential backoff, and reports
//! status back to callers.
//!
//! Driver business logic and configuration loading are left to the embedder;
//! this crate implements the supervision tree, routing table, and backoff
//! controller. See `viewforge-drivers` for two reference `Driver`s.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod messages;
pub mod pool;
pub mod worker;

pub use backoff::{Backoff, BackoffState, CEILING};
pub use config::{DeploySettings, DispatcherConfig, TransformationTypeConfig};
pub use dispatcher::{bootstrap, DispatcherEvent, DispatcherHandle};
pub use driver::{BoxFuture, Driver, DriverFactory, RunHandle, RunState};
pub use error::{BootstrapError, DriverError};
pub use messages::{
    CallerHandle, DriverCommand, DriverPayload, Transformation, TransformationFailure,
    TransformationReply, TransformationSuccess, View, WorkerId, WorkerMessage, WorkerStatus,
};
