//! Single-threaded event loop owning one Driver and one mailbox.

use chrono::Utc;
use tokio::sync::mpsc;

use crate::driver::{DriverFactory, RunState};
use crate::error::DriverError;
use crate::messages::{
    DriverCommand, DriverPayload, TransformationFailure, TransformationReply, TransformationSuccess,
    WorkerId, WorkerMessage, WorkerStatus,
};

/// Control-plane messages delivered outside the regular command mailbox.
#[derive(Debug, Clone)]
pub enum WorkerControl {
    /// Pull the next command from the mailbox and start running it.
    Tick,
    /// Drain the mailbox and return.
    Stop,
}

/// The two channels a Worker's event loop consumes from. Returned intact on
/// a retryable failure so a respawned worker resumes the same mailbox.
pub struct WorkerHandles {
    /// Transformation and deploy commands, FIFO.
    pub command_rx: mpsc::Receiver<DriverCommand>,
    /// Ticks and shutdown requests from the Pool/Dispatcher.
    pub control_rx: mpsc::Receiver<WorkerControl>,
}

/// Why a worker's event loop returned.
pub enum WorkerExit {
    /// A `RetryableFailure` (or driver init failure) occurred. The supervisor
    /// must respawn a worker reusing these handles.
    Retry {
        /// The mailboxes to hand to the replacement worker.
        handles: WorkerHandles,
        /// The command that was in flight when the fault was raised, if any.
        /// The respawned worker runs this first, before pulling anything new
        /// off `command_rx`, so a `RetryableFailure` never loses work — it
        /// only delays the reply until the command reaches a terminal state.
        pending: Option<DriverCommand>,
    },
    /// Cooperative shutdown; no respawn.
    Stopped,
}

/// Run one Worker's event loop to completion (or failure).
///
/// Boots the driver, emits `booted`, waits for the first `tick`, then
/// alternates pulling a command and running it to a terminal state.
/// `pending`, if set, is a command handed back from a previous incarnation
/// after a `RetryableFailure`; it is retried before anything new is pulled
/// from the mailbox. A fresh `RetryableFailure` (or driver init failure)
/// propagates out as [`WorkerExit::Retry`] carrying that same command so the
/// supervisor's respawn retries it again, indefinitely, until it reaches a
/// terminal state.
pub async fn run_worker(
    id: WorkerId,
    factory: DriverFactory,
    mut handles: WorkerHandles,
    status_tx: mpsc::Sender<WorkerStatus>,
    mut pending: Option<DriverCommand>,
) -> WorkerExit {
    let driver = match factory().await {
        Ok(driver) => driver,
        Err(err) => {
            tracing::warn!(worker = %id, error = %err, "driver initialisation failed, restarting");
            return WorkerExit::Retry { handles, pending };
        }
    };

    send_status(&status_tx, &id, WorkerMessage::Booted, None).await;

    loop {
        match handles.control_rx.recv().await {
            Some(WorkerControl::Tick) => break,
            Some(WorkerControl::Stop) | None => return WorkerExit::Stopped,
        }
    }

    loop {
        let command = loop {
            if let Some(command) = pending.take() {
                break command;
            }
            tokio::select! {
                biased;
                control = handles.control_rx.recv() => {
                    match control {
                        Some(WorkerControl::Stop) | None => return WorkerExit::Stopped,
                        Some(WorkerControl::Tick) => {
                            // Already active; a stray tick while idle-between-ticks is harmless.
                            continue;
                        }
                    }
                }
                command = handles.command_rx.recv() => {
                    match command {
                        Some(command) => break command,
                        None => return WorkerExit::Stopped,
                    }
                }
            }
        };

        let type_name = command.payload.type_name().map(str::to_owned);
        send_status(
            &status_tx,
            &id,
            WorkerMessage::Running,
            transformation_of(&command.payload),
        ).await;

        match execute(driver.as_ref(), command).await {
            Ok(()) => {}
            Err((reason, command)) => {
                tracing::error!(worker = %id, type_name = ?type_name, error = %reason, "driver fault, restarting worker and retrying its command");
                return WorkerExit::Retry { handles, pending: Some(command) };
            }
        }

        send_status(&status_tx, &id, WorkerMessage::Idle, None).await;
    }
}

fn transformation_of(payload: &DriverPayload) -> Option<crate::messages::Transformation> {
    match payload {
        DriverPayload::Transformation(t) => Some(t.clone()),
        DriverPayload::TransformView(t, _) => Some(t.clone()),
        DriverPayload::Deploy(_) => None,
    }
}

/// Runs one command to completion. On a non-terminal driver error
/// (`Retryable` or `InitFailed`) the original command is handed back inside
/// the `Err` so the caller can stash it for a retry after restart; the
/// command itself is never dropped without a reply unless its reply channel
/// was already consumed by a terminal outcome.
async fn execute(
    driver: &(dyn crate::driver::Driver),
    command: DriverCommand,
) -> Result<(), (DriverError, DriverCommand)> {
    match command.payload {
        DriverPayload::Deploy(settings) => {
            let ok = driver.deploy_all(&settings).await;
            let reply = if ok {
                TransformationReply::Success(TransformationSuccess {
                    view_id: None,
                    checksum: "deployed".to_string(),
                    timestamp: Utc::now(),
                })
            } else {
                TransformationReply::Failure(TransformationFailure {
                    view_id: None,
                    reason: "one or more libraries failed to stage".to_string(),
                })
            };
            command.reply_to.reply(reply);
            Ok(())
        }
        DriverPayload::Transformation(transformation) => {
            run_and_reply(driver, transformation, None, command.reply_to).await
        }
        DriverPayload::TransformView(transformation, view) => {
            run_and_reply(driver, transformation, Some(view), command.reply_to).await
        }
    }
}

async fn run_and_reply(
    driver: &(dyn crate::driver::Driver),
    transformation: crate::messages::Transformation,
    view: Option<std::sync::Arc<dyn crate::messages::View>>,
    reply_to: crate::messages::CallerHandle,
) -> Result<(), (DriverError, DriverCommand)> {
    let view_id = view.as_ref().map(|v| v.id());
    match driver.run_and_wait(&transformation).await {
        Ok(RunState::Succeeded(comment)) => {
            reply_to.reply(TransformationReply::Success(TransformationSuccess {
                view_id,
                checksum: comment,
                timestamp: Utc::now(),
            }));
            Ok(())
        }
        Ok(RunState::Failed { reason, .. }) => {
            reply_to.reply(TransformationReply::Failure(TransformationFailure {
                view_id,
                reason,
            }));
            Ok(())
        }
        Ok(RunState::Ongoing) => unreachable!("run_and_wait only returns terminal states"),
        Err(DriverError::RunFailed(reason)) => {
            // The driver rejected the work outright (e.g. bad parameters).
            // Terminal for this command; the worker stays alive.
            reply_to.reply(TransformationReply::Failure(TransformationFailure {
                view_id,
                reason,
            }));
            Ok(())
        }
        Err(err) => {
            let payload = match view {
                Some(view) => DriverPayload::TransformView(transformation, view),
                None => DriverPayload::Transformation(transformation),
            };
            Err((err, DriverCommand { payload, reply_to }))
        }
    }
}

async fn send_status(
    status_tx: &mpsc::Sender<WorkerStatus>,
    id: &WorkerId,
    message: WorkerMessage,
    current: Option<crate::messages::Transformation>,
) {
    let status = WorkerStatus {
        worker_id: id.as_string(),
        message,
        current,
        timestamp: Utc::now(),
    };
    // A full status channel would mean the Dispatcher is wedged; drop rather
    // than block the worker loop on it.
    let _ = status_tx.try_send(status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploySettings;
    use crate::driver::{Driver, RunHandle};
    use crate::messages::{CallerHandle, Transformation};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingDriver {
        fail_times: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Driver for CountingDriver {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self, _t: &Transformation) -> Result<RunHandle, DriverError> {
            Ok(RunHandle { id: 0 })
        }

        async fn poll(&self, _handle: &RunHandle) -> Result<RunState, DriverError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_times {
                Err(DriverError::Retryable("not ready".to_string()))
            } else {
                Ok(RunState::Succeeded("ok".to_string()))
            }
        }

        async fn kill(&self, _handle: &RunHandle) {}

        async fn deploy_all(&self, _settings: &DeploySettings) -> bool {
            true
        }
    }

    fn factory(fail_times: u32) -> DriverFactory {
        Arc::new(move || {
            let driver = CountingDriver {
                fail_times,
                attempts: AtomicU32::new(0),
            };
            Box::pin(async move { Ok(Box::new(driver) as Box<dyn Driver>) })
        })
    }

    #[tokio::test]
    async fn boots_then_waits_for_tick_before_pulling_work() {
        let (command_tx, command_rx) = mpsc::channel(4);
        let (control_tx, control_rx) = mpsc::channel(4);
        let (status_tx, mut status_rx) = mpsc::channel(16);
        let id = WorkerId::new("hive-pool", 0);
        let handles = WorkerHandles { command_rx, control_rx };

        let task = tokio::spawn(run_worker(id, factory(0), handles, status_tx, None));

        let booted = status_rx.recv().await.unwrap();
        assert_eq!(booted.message, WorkerMessage::Booted);

        let (caller, reply_rx) = CallerHandle::new();
        command_tx
            .send(DriverCommand {
                payload: DriverPayload::Transformation(Transformation::new("hive")),
                reply_to: caller,
            })
            .await
            .unwrap();

        // No tick yet: the command should sit in the mailbox, unobserved.
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), status_rx.recv())
            .await
            .is_err());

        control_tx.send(WorkerControl::Tick).await.unwrap();

        let running = status_rx.recv().await.unwrap();
        assert_eq!(running.message, WorkerMessage::Running);
        let idle = status_rx.recv().await.unwrap();
        assert_eq!(idle.message, WorkerMessage::Idle);

        let reply = reply_rx.await.unwrap();
        assert!(matches!(reply, TransformationReply::Success(_)));

        control_tx.send(WorkerControl::Stop).await.unwrap();
        matches!(task.await.unwrap(), WorkerExit::Stopped);
    }

    #[tokio::test]
    async fn retryable_failure_returns_mailboxes_and_command_for_restart() {
        let (command_tx, command_rx) = mpsc::channel(4);
        let (control_tx, control_rx) = mpsc::channel(4);
        let (status_tx, mut status_rx) = mpsc::channel(16);
        let id = WorkerId::new("hive-pool", 0);
        let handles = WorkerHandles { command_rx, control_rx };

        control_tx.send(WorkerControl::Tick).await.unwrap();
        let (caller, _reply_rx) = CallerHandle::new();
        command_tx
            .send(DriverCommand {
                payload: DriverPayload::Transformation(Transformation::new("hive")),
                reply_to: caller,
            })
            .await
            .unwrap();

        let exit = run_worker(id, factory(1), handles, status_tx.clone(), None).await;
        let _ = status_rx.recv().await; // booted

        match exit {
            WorkerExit::Retry { handles, pending } => {
                assert_eq!(handles.command_rx.capacity(), 4);
                let pending = pending.expect("the in-flight command must survive the restart");
                assert!(matches!(pending.payload, DriverPayload::Transformation(_)));
            }
            WorkerExit::Stopped => panic!("expected a retry exit"),
        }
    }

    #[tokio::test]
    async fn pending_command_is_retried_before_new_mailbox_work() {
        let (command_tx, command_rx) = mpsc::channel(4);
        let (control_tx, control_rx) = mpsc::channel(4);
        let (status_tx, mut status_rx) = mpsc::channel(16);
        let id = WorkerId::new("hive-pool", 0);
        let handles = WorkerHandles { command_rx, control_rx };

        control_tx.send(WorkerControl::Tick).await.unwrap();
        let (caller, reply_rx) = CallerHandle::new();
        command_tx
            .send(DriverCommand {
                payload: DriverPayload::Transformation(Transformation::new("hive")),
                reply_to: caller,
            })
            .await
            .unwrap();

        let exit = run_worker(id.clone(), factory(1), handles, status_tx.clone(), None).await;
        let WorkerExit::Retry { handles, pending } = exit else {
            panic!("expected a retry exit");
        };

        // Respawn with a driver that now succeeds immediately; the pending
        // command must run to completion without a second mailbox send.
        control_tx.send(WorkerControl::Tick).await.unwrap();
        let task = tokio::spawn(run_worker(id, factory(0), handles, status_tx, pending));

        let reply = reply_rx.await.expect("retried command eventually replies");
        assert!(matches!(reply, TransformationReply::Success(_)));

        control_tx.send(WorkerControl::Stop).await.unwrap();
        matches!(task.await.unwrap(), WorkerExit::Stopped);
    }
}
