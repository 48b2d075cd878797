//! The `Driver` contract: executes one transformation at a time.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::DeploySettings;
use crate::error::DriverError;
use crate::messages::Transformation;

/// Opaque handle to an in-flight run, carrying a completion future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunHandle {
    /// Driver-assigned id, unique among the driver's concurrently active runs.
    pub id: u64,
}

/// Non-terminal vs. terminal outcome of a run, as observed by `poll`.
#[derive(Debug, Clone)]
pub enum RunState {
    /// Still executing.
    Ongoing,
    /// Finished successfully; carries a driver-defined comment (e.g. checksum).
    Succeeded(String),
    /// Finished, but the work cannot succeed. Not a `RetryableFailure`.
    Failed {
        /// Human-readable reason.
        reason: String,
        /// Optional underlying cause, for logging.
        cause: Option<String>,
    },
}

/// A boxed, `Send` future, for object-safe async trait methods.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Executes one Transformation at a time. Implementations must classify
/// every failure as either [`DriverError::Retryable`] (worker restarts) or a
/// terminal [`RunState::Failed`] / [`DriverError::RunFailed`] (worker survives).
#[async_trait]
pub trait Driver: Send + Sync {
    /// Stable type name used for routing (e.g. `"hive"`, `"filesystem"`).
    fn name(&self) -> &str;

    /// Begin executing `transformation`; returns immediately.
    async fn run(&self, transformation: &Transformation) -> Result<RunHandle, DriverError>;

    /// Non-blocking poll of a run started with [`Driver::run`].
    async fn poll(&self, handle: &RunHandle) -> Result<RunState, DriverError>;

    /// Convenience: run and cooperatively await a terminal state.
    async fn run_and_wait(&self, transformation: &Transformation) -> Result<RunState, DriverError> {
        let handle = self.run(transformation).await?;
        loop {
            match self.poll(&handle).await? {
                RunState::Ongoing => tokio::task::yield_now().await,
                terminal => return Ok(terminal),
            }
        }
    }

    /// Best-effort cancellation; idempotent.
    async fn kill(&self, handle: &RunHandle);

    /// Stage all configured libraries into the driver's working area.
    /// Returns whether every stage-step succeeded.
    async fn deploy_all(&self, settings: &DeploySettings) -> bool;
}

/// Constructs a fresh `Driver` for one worker slot.
///
/// Supplied by the embedder at bootstrap, one per transformation type;
/// driver business logic is otherwise out of scope for this crate.
pub type DriverFactory =
    Arc<dyn Fn() -> BoxFuture<Result<Box<dyn Driver>, DriverError>> + Send + Sync>;
