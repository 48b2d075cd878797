//! Wire types: transformations, commands, statuses and reply channels.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::config::DeploySettings;

/// A tagged transformation request: a type name plus type-specific parameters.
///
/// `type_name` must be drawn from the closed set of configured transformation
/// types (enforced at bootstrap, see [`crate::error::BootstrapError`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transformation {
    /// Routing key, e.g. `"hive"` or `"filesystem"`.
    pub type_name: String,
    /// Type-specific parameters, opaque to the core.
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl Transformation {
    /// Construct a bare transformation with no parameters.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            params: HashMap::new(),
        }
    }

    /// Attach a parameter, builder-style.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// A materialized view: opaque to the core beyond its transformation and id.
pub trait View: fmt::Debug + Send + Sync {
    /// The transformation that (re)materializes this view.
    fn transformation(&self) -> Transformation;
    /// Stable identifier, echoed back in replies.
    fn id(&self) -> String;
}

/// The payload carried by a [`DriverCommand`].
#[derive(Debug, Clone)]
pub enum DriverPayload {
    /// A bare transformation, not bound to any view.
    Transformation(Transformation),
    /// A transformation bound to the view it materializes.
    TransformView(Transformation, Arc<dyn View>),
    /// Stage libraries into the driver's working area.
    Deploy(DeploySettings),
}

impl DriverPayload {
    /// The routing key for this payload, used to pick a pool.
    pub fn type_name(&self) -> Option<&str> {
        match self {
            DriverPayload::Transformation(t) => Some(&t.type_name),
            DriverPayload::TransformView(t, _) => Some(&t.type_name),
            DriverPayload::Deploy(_) => None,
        }
    }
}

/// A command routed to exactly one Worker (or broadcast, for deploys).
///
/// Invariant: `reply_to` is always set and the worker delivers exactly one
/// terminal response to it.
#[derive(Debug)]
pub struct DriverCommand {
    /// What to do.
    pub payload: DriverPayload,
    /// Where the terminal result goes.
    pub reply_to: CallerHandle,
}

/// Successful terminal result of a transformation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransformationSuccess {
    /// Id of the view that was materialized, if the command was view-bound.
    pub view_id: Option<String>,
    /// Driver-reported checksum or comment describing the result.
    pub checksum: String,
    /// When the transformation completed.
    pub timestamp: DateTime<Utc>,
}

/// Failed terminal result of a transformation. The worker that produced this
/// remains alive for its next command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransformationFailure {
    /// Id of the view that was being materialized, if the command was view-bound.
    pub view_id: Option<String>,
    /// Human-readable failure reason.
    pub reason: String,
}

/// The exactly-one reply a worker delivers for a terminal driver state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransformationReply {
    /// The transformation succeeded.
    Success(TransformationSuccess),
    /// The transformation failed; the worker is still alive.
    Failure(TransformationFailure),
}

/// A one-shot reply channel handed to whoever submitted a [`DriverCommand`].
///
/// Never carries an ambient "current sender" — every command owns its own
/// reply path.
#[derive(Debug)]
pub struct CallerHandle(oneshot::Sender<TransformationReply>);

impl CallerHandle {
    /// Create a fresh reply pair: a handle to hand to a command, and the
    /// receiver the original caller awaits.
    pub fn new() -> (Self, oneshot::Receiver<TransformationReply>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Deliver the terminal reply. Silently dropped if the caller stopped
    /// listening (e.g. it already timed out).
    pub fn reply(self, reply: TransformationReply) {
        let _ = self.0.send(reply);
    }
}

/// Stable identity of a Worker: its pool and its index within that pool.
/// Survives restarts — identity is positional, not per-incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId {
    /// Owning pool's name (`"{type_name}-pool"`).
    pub pool: String,
    /// Index within the pool.
    pub index: usize,
}

impl WorkerId {
    /// Construct an id for a given pool name and index.
    pub fn new(pool: impl Into<String>, index: usize) -> Self {
        Self {
            pool: pool.into(),
            index,
        }
    }

    /// Render as the stable string carried in [`WorkerStatus`].
    pub fn as_string(&self) -> String {
        format!("{}/{}", self.pool, self.index)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

/// A Worker's lifecycle message, as seen by the Dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Just finished driver initialisation; awaiting its first `tick`.
    Booted,
    /// Waiting for the next command.
    Idle,
    /// Executing a transformation.
    Running,
    /// Terminal; the supervisor is restarting this worker.
    Failed,
}

/// Latest observed state of one Worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Stable worker identity (string form of [`WorkerId`]).
    pub worker_id: String,
    /// What the worker is doing.
    pub message: WorkerMessage,
    /// The transformation it is currently running, if any.
    pub current: Option<Transformation>,
    /// When this status was recorded.
    pub timestamp: DateTime<Utc>,
}
