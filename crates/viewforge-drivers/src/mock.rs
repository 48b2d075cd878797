//! A fully scriptable driver used to drive the supervision and backoff test
//! suites without a real transformation engine attached.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use viewforge_core::{
    BoxFuture, DeploySettings, Driver, DriverError, DriverFactory, RunHandle, RunState,
    Transformation,
};

/// One canned outcome the mock driver yields the next time it is polled.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// The run succeeds with the given comment.
    Succeed(String),
    /// The run fails terminally; the worker survives.
    Fail(String),
    /// The run raises a `RetryableFailure`; the worker's supervisor restarts it.
    Retryable(String),
}

/// A driver whose outcomes are a pre-scripted queue, consumed one per `run`.
pub struct MockDriver {
    name: String,
    outcomes: Arc<Mutex<VecDeque<ScriptedOutcome>>>,
    next_id: AtomicU64,
}

impl MockDriver {
    /// Construct a driver named `name` that yields `outcomes` in order, one
    /// per completed run. Once exhausted, every further run succeeds.
    pub fn new(name: impl Into<String>, outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        Self::with_shared_outcomes(name, Arc::new(Mutex::new(outcomes.into_iter().collect())))
    }

    /// Construct a driver sharing its outcome queue with other instances, so
    /// the script keeps advancing across a `scripted_factory`'s reboots
    /// instead of restarting from the front each time.
    fn with_shared_outcomes(
        name: impl Into<String>,
        outcomes: Arc<Mutex<VecDeque<ScriptedOutcome>>>,
    ) -> Self {
        Self {
            name: name.into(),
            outcomes,
            next_id: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _transformation: &Transformation) -> Result<RunHandle, DriverError> {
        Ok(RunHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn poll(&self, _handle: &RunHandle) -> Result<RunState, DriverError> {
        let next = self.outcomes.lock().await.pop_front();
        match next {
            Some(ScriptedOutcome::Succeed(comment)) => Ok(RunState::Succeeded(comment)),
            Some(ScriptedOutcome::Fail(reason)) => Ok(RunState::Failed { reason, cause: None }),
            Some(ScriptedOutcome::Retryable(reason)) => Err(DriverError::Retryable(reason)),
            None => Ok(RunState::Succeeded("exhausted script".to_string())),
        }
    }

    async fn kill(&self, _handle: &RunHandle) {}

    async fn deploy_all(&self, _settings: &DeploySettings) -> bool {
        true
    }
}

/// Build a [`DriverFactory`] that fails driver construction `init_failures`
/// times (as [`DriverError::InitFailed`]) before succeeding. Every
/// `MockDriver` this factory produces shares one outcome queue, so a
/// restarted worker's fresh driver instance resumes the same script where
/// the previous incarnation left off rather than starting over.
pub fn scripted_factory(
    name: impl Into<String>,
    init_failures: u32,
    outcomes: Vec<ScriptedOutcome>,
) -> DriverFactory {
    let name = name.into();
    let attempts = Arc::new(AtomicU32::new(0));
    let outcomes = Arc::new(Mutex::new(outcomes.into_iter().collect::<VecDeque<_>>()));
    Arc::new(move || -> BoxFuture<Result<Box<dyn Driver>, DriverError>> {
        let name = name.clone();
        let outcomes = outcomes.clone();
        let attempts = attempts.clone();
        Box::pin(async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < init_failures {
                return Err(DriverError::InitFailed(format!(
                    "{name} driver not ready (attempt {attempt})"
                )));
            }
            Ok(Box::new(MockDriver::with_shared_outcomes(name, outcomes)) as Box<dyn Driver>)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consumes_outcomes_in_order() {
        let driver = MockDriver::new(
            "mock",
            vec![ScriptedOutcome::Retryable("warming up".to_string()), ScriptedOutcome::Succeed("done".to_string())],
        );
        let t = Transformation::new("mock");

        let first = driver.run_and_wait(&t).await;
        assert!(matches!(first, Err(DriverError::Retryable(_))));

        let second = driver.run_and_wait(&t).await.unwrap();
        assert!(matches!(second, RunState::Succeeded(_)));
    }

    #[tokio::test]
    async fn factory_fails_init_before_succeeding() {
        let factory = scripted_factory("mock", 2, vec![ScriptedOutcome::Succeed("ok".to_string())]);
        assert!(factory().await.is_err());
        assert!(factory().await.is_err());
        assert!(factory().await.is_ok());
    }

    #[tokio::test]
    async fn each_reboot_gets_a_fresh_driver_sharing_one_script() {
        let factory = scripted_factory(
            "mock",
            0,
            vec![
                ScriptedOutcome::Retryable("fault".to_string()),
                ScriptedOutcome::Succeed("done".to_string()),
            ],
        );
        let t = Transformation::new("mock");

        let first_boot = factory().await.unwrap();
        assert!(matches!(
            first_boot.run_and_wait(&t).await,
            Err(DriverError::Retryable(_))
        ));

        // A brand new driver instance (as a respawned worker would get) must
        // pick up where the previous one left off, not replay from the front.
        let second_boot = factory().await.unwrap();
        let result = second_boot.run_and_wait(&t).await.unwrap();
        assert!(matches!(result, RunState::Succeeded(_)));
    }
}
