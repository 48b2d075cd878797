//! The `"filesystem"` reference driver: simple file operations against local disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use viewforge_core::{DeploySettings, Driver, DriverError, RunHandle, RunState, Transformation};

use crate::deploy;

/// Executes copy/move/remove operations against `view.transformation().params`.
///
/// Expected params: `op` (`"copy"`, `"move"`, or `"remove"`), `source`, and
/// `dest` (unused for `"remove"`).
pub struct FilesystemDriver {
    inner: Arc<Inner>,
}

struct Inner {
    runs: Mutex<HashMap<u64, RunState>>,
    next_id: AtomicU64,
}

impl FilesystemDriver {
    /// Construct a fresh driver with no in-flight runs.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                runs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl Default for FilesystemDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for FilesystemDriver {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn run(&self, transformation: &Transformation) -> Result<RunHandle, DriverError> {
        let op = parse_op(transformation)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.runs.lock().await.insert(id, RunState::Ongoing);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = execute(op).await;
            inner.runs.lock().await.insert(id, result);
        });

        Ok(RunHandle { id })
    }

    async fn poll(&self, handle: &RunHandle) -> Result<RunState, DriverError> {
        Ok(self
            .inner
            .runs
            .lock()
            .await
            .get(&handle.id)
            .cloned()
            .unwrap_or(RunState::Ongoing))
    }

    async fn kill(&self, handle: &RunHandle) {
        let mut runs = self.inner.runs.lock().await;
        if matches!(runs.get(&handle.id), Some(RunState::Ongoing)) {
            runs.insert(
                handle.id,
                RunState::Failed {
                    reason: "killed".to_string(),
                    cause: None,
                },
            );
        }
    }

    async fn deploy_all(&self, settings: &DeploySettings) -> bool {
        deploy::deploy_all(settings).await
    }
}

enum FsOp {
    Copy { source: PathBuf, dest: PathBuf },
    Move { source: PathBuf, dest: PathBuf },
    Remove { source: PathBuf },
}

fn parse_op(transformation: &Transformation) -> Result<FsOp, DriverError> {
    let param = |key: &str| {
        transformation
            .params
            .get(key)
            .cloned()
            .ok_or_else(|| DriverError::RunFailed(format!("missing required param {key:?}")))
    };

    match transformation.params.get("op").map(String::as_str) {
        Some("copy") => Ok(FsOp::Copy {
            source: PathBuf::from(param("source")?),
            dest: PathBuf::from(param("dest")?),
        }),
        Some("move") => Ok(FsOp::Move {
            source: PathBuf::from(param("source")?),
            dest: PathBuf::from(param("dest")?),
        }),
        Some("remove") => Ok(FsOp::Remove {
            source: PathBuf::from(param("source")?),
        }),
        other => Err(DriverError::RunFailed(format!(
            "unsupported filesystem op: {other:?}"
        ))),
    }
}

async fn execute(op: FsOp) -> RunState {
    let result = match op {
        FsOp::Copy { source, dest } => tokio::fs::copy(&source, &dest).await.map(|_| ()),
        FsOp::Move { source, dest } => tokio::fs::rename(&source, &dest).await,
        FsOp::Remove { source } => tokio::fs::remove_file(&source).await,
    };

    match result {
        // A missing/unreadable path is a fact about this one file, not the
        // driver's environment, so it is a terminal RunState::Failed rather
        // than a RetryableFailure.
        Ok(()) => RunState::Succeeded("ok".to_string()),
        Err(err) => RunState::Failed {
            reason: err.to_string(),
            cause: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_reports_success() {
        let dir = std::env::temp_dir().join(format!("viewforge-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let source = dir.join("source.txt");
        let dest = dir.join("dest.txt");
        tokio::fs::write(&source, b"hello").await.unwrap();

        let driver = FilesystemDriver::new();
        let transformation = Transformation::new("filesystem")
            .with_param("op", "copy")
            .with_param("source", source.to_string_lossy())
            .with_param("dest", dest.to_string_lossy());

        let state = driver.run_and_wait(&transformation).await.unwrap();
        assert!(matches!(state, RunState::Succeeded(_)));
        assert!(tokio::fs::try_exists(&dest).await.unwrap());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn missing_param_fails_fast() {
        let driver = FilesystemDriver::new();
        let transformation = Transformation::new("filesystem").with_param("op", "copy");
        let err = driver.run(&transformation).await.unwrap_err();
        assert!(matches!(err, DriverError::RunFailed(_)));
    }
}
