//! A fixed-size group of Workers for one transformation type.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::config::DeploySettings;
use crate::driver::DriverFactory;
use crate::messages::{CallerHandle, DriverCommand, DriverPayload, WorkerId, WorkerStatus};
use crate::worker::{run_worker, WorkerControl, WorkerExit, WorkerHandles};

/// Bound on a worker's command mailbox; also the unit the smallest-mailbox
/// router compares across workers via `Sender::capacity`.
const COMMAND_MAILBOX_CAPACITY: usize = 64;
const CONTROL_MAILBOX_CAPACITY: usize = 8;

/// Messages a Pool accepts on its own inbox.
pub enum PoolCommand {
    /// Route to exactly one Worker, smallest-mailbox first.
    Route(DriverCommand),
    /// Broadcast a deploy to every Worker; the ack carries how many were notified.
    Broadcast(DeploySettings, oneshot::Sender<usize>),
    /// Deliver a `tick` to one specific Worker (Dispatcher-gated activation).
    Tick(WorkerId),
    /// Drain and stop every Worker, then return.
    Stop,
}

/// An unknown fault escalated out of a Worker's event loop (a panic or a
/// dropped task), as opposed to a recognised `RetryableFailure`.
#[derive(Debug)]
pub struct PoolFault {
    /// The pool this fault occurred in.
    pub pool: String,
    /// Description of the join failure.
    pub error: String,
}

struct WorkerSlot {
    command_tx: mpsc::Sender<DriverCommand>,
    control_tx: mpsc::Sender<WorkerControl>,
}

/// Run one Pool's event loop: owns its Workers, load-balances commands among
/// them, and supervises them one-for-one.
pub async fn run_pool(
    type_name: String,
    concurrency: usize,
    factory: DriverFactory,
    mut inbox: mpsc::Receiver<PoolCommand>,
    status_tx: mpsc::Sender<WorkerStatus>,
    fault_tx: mpsc::Sender<PoolFault>,
) {
    let pool_name = format!("{type_name}-pool");
    let mut slots = Vec::with_capacity(concurrency);
    let mut workers: JoinSet<(WorkerId, WorkerExit)> = JoinSet::new();

    for index in 0..concurrency {
        let id = WorkerId::new(pool_name.clone(), index);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_MAILBOX_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_MAILBOX_CAPACITY);
        slots.push(WorkerSlot { command_tx, control_tx });
        spawn_worker(
            &mut workers,
            id,
            factory.clone(),
            WorkerHandles { command_rx, control_rx },
            status_tx.clone(),
            None,
        );
    }

    loop {
        tokio::select! {
            biased;
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                match joined {
                    Ok((id, WorkerExit::Retry { handles, pending })) => {
                        tracing::warn!(worker = %id, retrying = pending.is_some(), "restarting worker after retryable failure");
                        spawn_worker(&mut workers, id, factory.clone(), handles, status_tx.clone(), pending);
                    }
                    Ok((_id, WorkerExit::Stopped)) => {}
                    Err(join_err) => {
                        tracing::error!(pool = %pool_name, error = %join_err, "worker task panicked, escalating");
                        let _ = fault_tx
                            .send(PoolFault { pool: pool_name.clone(), error: join_err.to_string() })
                            .await;
                    }
                }
            }
            command = inbox.recv() => {
                match command {
                    None | Some(PoolCommand::Stop) => {
                        for slot in &slots {
                            let _ = slot.control_tx.send(WorkerControl::Stop).await;
                        }
                        while workers.join_next().await.is_some() {}
                        return;
                    }
                    Some(PoolCommand::Route(command)) => {
                        if let Some(slot) = smallest_mailbox(&slots) {
                            if slot.command_tx.send(command).await.is_err() {
                                tracing::error!(pool = %pool_name, "worker mailbox closed while routing");
                            }
                        }
                    }
                    Some(PoolCommand::Tick(id)) => {
                        if let Some(slot) = slots.get(id.index) {
                            let _ = slot.control_tx.send(WorkerControl::Tick).await;
                        }
                    }
                    Some(PoolCommand::Broadcast(settings, ack)) => {
                        let mut notified = 0usize;
                        for slot in &slots {
                            let (caller, _reply_rx) = CallerHandle::new();
                            let command = DriverCommand {
                                payload: DriverPayload::Deploy(settings.clone()),
                                reply_to: caller,
                            };
                            if slot.command_tx.send(command).await.is_ok() {
                                notified += 1;
                            }
                        }
                        let _ = ack.send(notified);
                    }
                }
            }
        }
    }
}

fn spawn_worker(
    workers: &mut JoinSet<(WorkerId, WorkerExit)>,
    id: WorkerId,
    factory: DriverFactory,
    handles: WorkerHandles,
    status_tx: mpsc::Sender<WorkerStatus>,
    pending: Option<DriverCommand>,
) {
    workers.spawn(async move {
        let exit = run_worker(id.clone(), factory, handles, status_tx, pending).await;
        (id, exit)
    });
}

/// Pick the worker with the fewest pending messages, ties broken toward the
/// lowest index.
fn smallest_mailbox(slots: &[WorkerSlot]) -> Option<&WorkerSlot> {
    let mut best: Option<&WorkerSlot> = None;
    let mut best_capacity = -1i64;
    for slot in slots {
        let capacity = slot.command_tx.capacity() as i64;
        if capacity > best_capacity {
            best = Some(slot);
            best_capacity = capacity;
        }
    }
    best
}
