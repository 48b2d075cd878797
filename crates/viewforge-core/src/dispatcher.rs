//! Singleton front door: owns all Pools, routes commands, tracks worker
//! status and backoff, and supervises Pools.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backoff::{Backoff, BackoffState};
use crate::config::{DeploySettings, DispatcherConfig};
use crate::driver::DriverFactory;
use crate::error::BootstrapError;
use crate::messages::{
    CallerHandle, DriverCommand, DriverPayload, Transformation, TransformationReply, View,
    WorkerId, WorkerMessage, WorkerStatus,
};
use crate::pool::{run_pool, PoolCommand, PoolFault};

/// Size of the dispatcher's own inbox and the status/fault funnels shared by
/// every pool.
const DISPATCHER_INBOX_CAPACITY: usize = 256;
const STATUS_FUNNEL_CAPACITY: usize = 1024;
const FAULT_FUNNEL_CAPACITY: usize = 64;

/// Programmatic observers' view of dispatcher activity, alongside whatever
/// `tracing` emits at the same call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DispatcherEvent {
    /// A worker booted for the first time and was activated immediately.
    WorkerBooted {
        /// The worker's stable id.
        worker_id: String,
    },
    /// A worker rebooted after a restart; its next tick is paced by backoff.
    WorkerRestarting {
        /// The worker's stable id.
        worker_id: String,
        /// How long until its next tick.
        #[serde(with = "humantime_serde")]
        wait: Duration,
    },
    /// Forwarded verbatim from a worker's status emission.
    WorkerStatus(WorkerStatus),
    /// A deploy command was broadcast.
    DeployBroadcast {
        /// How many workers (across all pools) were notified.
        workers_notified: usize,
    },
    /// A fault escalated out of a pool with no recognised retry policy.
    Escalation {
        /// The pool the fault escalated from.
        pool: String,
        /// Description of the fault.
        reason: String,
    },
}

enum Inbound {
    Route(DriverCommand),
    RouteFilesystem(DriverCommand),
    Deploy(DeploySettings, oneshot::Sender<usize>),
    GetTransformations(oneshot::Sender<Vec<WorkerStatus>>),
}

struct PoolHandle {
    command_tx: mpsc::Sender<PoolCommand>,
    backoff_slot: Duration,
    backoff_floor: Duration,
}

#[derive(Default)]
struct DispatcherState {
    driver_states: HashMap<String, WorkerStatus>,
    backoff: HashMap<String, Backoff>,
}

/// Handle to a running Dispatcher. `inbox` and `events` may be cloned
/// independently via their own `clone()` if an embedder needs to hand out
/// more senders; the handle itself owns the background task's `JoinHandle`.
pub struct DispatcherHandle {
    inbox: mpsc::Sender<Inbound>,
    events: broadcast::Sender<DispatcherEvent>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Submit a bare transformation, routed by its `type_name`.
    pub async fn submit(&self, transformation: Transformation) -> oneshot::Receiver<TransformationReply> {
        let (caller, reply_rx) = CallerHandle::new();
        let command = DriverCommand {
            payload: DriverPayload::Transformation(transformation),
            reply_to: caller,
        };
        let _ = self.inbox.send(Inbound::Route(command)).await;
        reply_rx
    }

    /// Submit a view for (re)materialization.
    pub async fn submit_view(&self, view: Arc<dyn View>) -> oneshot::Receiver<TransformationReply> {
        let (caller, reply_rx) = CallerHandle::new();
        let transformation = view.transformation();
        let command = DriverCommand {
            payload: DriverPayload::TransformView(transformation, view),
            reply_to: caller,
        };
        let _ = self.inbox.send(Inbound::Route(command)).await;
        reply_rx
    }

    /// Submit a filesystem transformation; always routed to `"filesystem-pool"`
    /// regardless of the transformation's own `type_name`.
    pub async fn submit_filesystem(&self, transformation: Transformation) -> oneshot::Receiver<TransformationReply> {
        let (caller, reply_rx) = CallerHandle::new();
        let command = DriverCommand {
            payload: DriverPayload::Transformation(transformation),
            reply_to: caller,
        };
        let _ = self.inbox.send(Inbound::RouteFilesystem(command)).await;
        reply_rx
    }

    /// Already-wrapped form: caller supplies its own `reply_to`.
    pub async fn submit_command(&self, command: DriverCommand) {
        let _ = self.inbox.send(Inbound::Route(command)).await;
    }

    /// Broadcast a deploy to every Worker in every Pool. Returns how many
    /// workers accepted the command.
    pub async fn deploy(&self, settings: DeploySettings) -> usize {
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self.inbox.send(Inbound::Deploy(settings, ack_tx)).await;
        ack_rx.await.unwrap_or(0)
    }

    /// A snapshot of every configured worker's latest status.
    pub async fn get_transformations(&self) -> Vec<WorkerStatus> {
        let (tx, rx) = oneshot::channel();
        let _ = self.inbox.send(Inbound::GetTransformations(tx)).await;
        rx.await.unwrap_or_default()
    }

    /// Subscribe to the dispatcher's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.events.subscribe()
    }

    /// Wait for the dispatcher's background task to stop. Under normal
    /// operation this only returns once every pool task has also stopped,
    /// since the dispatcher loop exits when its inbox and status funnel are
    /// both closed.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.join
            .await
            .map_err(|err| anyhow::anyhow!("dispatcher task panicked: {err}"))
    }
}

/// Assemble a Dispatcher from configuration: one Pool per configured
/// transformation type, each with its configured concurrency.
///
/// `factories` must contain an entry for every `type_name` in `config.types`;
/// driver business logic is supplied by the embedder, not this crate.
pub fn bootstrap(
    config: DispatcherConfig,
    factories: HashMap<String, DriverFactory>,
) -> Result<DispatcherHandle, BootstrapError> {
    for (type_name, type_config) in &config.types {
        if type_config.concurrency == 0 {
            return Err(BootstrapError::ZeroConcurrency {
                type_name: type_name.clone(),
            });
        }
        if !factories.contains_key(type_name) {
            return Err(BootstrapError::MissingFactory {
                type_name: type_name.clone(),
            });
        }
    }

    let (inbox_tx, inbox_rx) = mpsc::channel(DISPATCHER_INBOX_CAPACITY);
    let (status_tx, status_rx) = mpsc::channel(STATUS_FUNNEL_CAPACITY);
    let (fault_tx, fault_rx) = mpsc::channel(FAULT_FUNNEL_CAPACITY);
    let (events_tx, _events_rx) = broadcast::channel(STATUS_FUNNEL_CAPACITY);

    let mut pools = HashMap::with_capacity(config.types.len());
    for (type_name, type_config) in config.types {
        let factory = factories
            .get(&type_name)
            .cloned()
            .expect("checked for presence above");
        let (pool_tx, pool_rx) = mpsc::channel(type_config.concurrency.max(1) * 4);
        tokio::spawn(run_pool(
            type_name.clone(),
            type_config.concurrency,
            factory,
            pool_rx,
            status_tx.clone(),
            fault_tx.clone(),
        ));
        pools.insert(
            type_name,
            PoolHandle {
                command_tx: pool_tx,
                backoff_slot: type_config.backoff_slot_time,
                backoff_floor: type_config.backoff_minimum_delay,
            },
        );
    }

    let events_for_task = events_tx.clone();
    let join = tokio::spawn(run_dispatcher(
        pools,
        inbox_rx,
        status_rx,
        fault_rx,
        events_for_task,
    ));

    Ok(DispatcherHandle {
        inbox: inbox_tx,
        events: events_tx,
        join,
    })
}

async fn run_dispatcher(
    pools: HashMap<String, PoolHandle>,
    mut inbox: mpsc::Receiver<Inbound>,
    mut status_rx: mpsc::Receiver<WorkerStatus>,
    mut fault_rx: mpsc::Receiver<PoolFault>,
    events: broadcast::Sender<DispatcherEvent>,
) {
    let mut state = DispatcherState::default();

    loop {
        tokio::select! {
            Some(inbound) = inbox.recv() => {
                handle_inbound(inbound, &pools, &state, &events).await;
            }
            Some(status) = status_rx.recv() => {
                manage_driver_lifecycle(status, &mut state, &pools, &events).await;
            }
            Some(fault) = fault_rx.recv() => {
                tracing::error!(pool = %fault.pool, reason = %fault.error, "unrecoverable pool fault");
                let _ = events.send(DispatcherEvent::Escalation { pool: fault.pool, reason: fault.error });
            }
            else => break,
        }
    }
}

async fn handle_inbound(
    inbound: Inbound,
    pools: &HashMap<String, PoolHandle>,
    state: &DispatcherState,
    events: &broadcast::Sender<DispatcherEvent>,
) {
    match inbound {
        Inbound::Route(command) => {
            let Some(type_name) = command.payload.type_name().map(str::to_owned) else {
                return;
            };
            route_to(pools, &type_name, command).await;
        }
        Inbound::RouteFilesystem(command) => {
            route_to(pools, "filesystem", command).await;
        }
        Inbound::Deploy(settings, ack) => {
            let mut total = 0usize;
            for pool in pools.values() {
                let (pool_ack_tx, pool_ack_rx) = oneshot::channel();
                if pool
                    .command_tx
                    .send(PoolCommand::Broadcast(settings.clone(), pool_ack_tx))
                    .await
                    .is_ok()
                {
                    total += pool_ack_rx.await.unwrap_or(0);
                }
            }
            let _ = events.send(DispatcherEvent::DeployBroadcast { workers_notified: total });
            let _ = ack.send(total);
        }
        Inbound::GetTransformations(tx) => {
            let snapshot = state.driver_states.values().cloned().collect();
            let _ = tx.send(snapshot);
        }
    }
}

async fn route_to(pools: &HashMap<String, PoolHandle>, type_name: &str, command: DriverCommand) {
    match pools.get(type_name) {
        Some(pool) => {
            if pool.command_tx.send(PoolCommand::Route(command)).await.is_err() {
                tracing::error!(type_name, "pool task is gone, dropping command");
            }
        }
        None => {
            tracing::error!(type_name, "no pool configured for transformation type");
        }
    }
}

/// The heart of the backoff loop: record a worker's status and, on `booted`,
/// gate its activation behind a `tick` paced by backoff.
async fn manage_driver_lifecycle(
    status: WorkerStatus,
    state: &mut DispatcherState,
    pools: &HashMap<String, PoolHandle>,
    events: &broadcast::Sender<DispatcherEvent>,
) {
    let worker_id = status.worker_id.clone();
    let message = status.message;
    let _ = events.send(DispatcherEvent::WorkerStatus(status.clone()));
    state.driver_states.insert(worker_id.clone(), status);

    if message != WorkerMessage::Booted {
        return;
    }

    let Some(type_name) = type_name_of(&worker_id) else {
        return;
    };
    let Some(pool) = pools.get(type_name) else {
        return;
    };

    match state.backoff.get_mut(&worker_id) {
        None => {
            state
                .backoff
                .insert(worker_id.clone(), Backoff::new(pool.backoff_slot, pool.backoff_floor));
            let _ = events.send(DispatcherEvent::WorkerBooted { worker_id: worker_id.clone() });
            send_tick(pools, type_name, &worker_id, Duration::ZERO);
        }
        Some(backoff) => {
            let next: BackoffState = backoff.next(&mut rand::rng());
            let _ = events.send(DispatcherEvent::WorkerRestarting {
                worker_id: worker_id.clone(),
                wait: next.current_wait,
            });
            send_tick(pools, type_name, &worker_id, next.current_wait);
        }
    }
}

fn type_name_of(worker_id: &str) -> Option<&str> {
    let pool_part = worker_id.split('/').next()?;
    pool_part.strip_suffix("-pool")
}

fn send_tick(pools: &HashMap<String, PoolHandle>, type_name: &str, worker_id: &str, wait: Duration) {
    let Some(pool) = pools.get(type_name) else { return };
    let Some(index) = worker_id.rsplit('/').next().and_then(|i| i.parse::<usize>().ok()) else {
        return;
    };
    let pool_name = format!("{type_name}-pool");
    let id = WorkerId::new(pool_name, index);
    let command_tx = pool.command_tx.clone();
    tokio::spawn(async move {
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        let _ = command_tx.send(PoolCommand::Tick(id)).await;
    });
}
