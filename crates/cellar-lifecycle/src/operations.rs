//! Background operations.
//!
//! Every mutating request is submitted as an [`Operation`]: the caller gets a
//! handle back immediately while the work runs on the tokio runtime. Handles
//! can be polled for status, awaited, and looked up again by id. A semaphore
//! bounds how many operations execute at once; the rest wait as `Pending`.

use cellar_common::{CellarError, ErrorKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl OperationStatus {
    pub fn is_final(self) -> bool {
        matches!(self, OperationStatus::Success | OperationStatus::Failure)
    }
}

/// Terminal error of a failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&CellarError> for OperationError {
    fn from(err: &CellarError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

/// Point-in-time view of an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationState {
    pub id: Uuid,
    pub description: String,
    pub resources: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: OperationStatus,
    pub progress: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub error: Option<OperationError>,
}

/// Lets a unit of work publish best-effort progress.
#[derive(Clone)]
pub struct Progress {
    tx: Arc<watch::Sender<OperationState>>,
}

impl Progress {
    pub fn update(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|state| {
            debug!(operation = %state.id, progress = %message, "Operation progress");
            state.progress = Some(message);
            state.updated_at = Utc::now();
        });
    }
}

/// Handle to a submitted operation. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Operation {
    id: Uuid,
    rx: watch::Receiver<OperationState>,
}

impl Operation {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn url(&self) -> String {
        format!("/1.0/operations/{}", self.id)
    }

    pub fn state(&self) -> OperationState {
        self.rx.borrow().clone()
    }

    /// Waits for the terminal state.
    pub async fn wait(&self) -> OperationState {
        let mut rx = self.rx.clone();
        let finished = rx.wait_for(|s| s.status.is_final()).await;
        match finished {
            Ok(state) => state.clone(),
            // Sender gone (runtime shutting down): report the last published state.
            Err(_) => self.rx.borrow().clone(),
        }
    }

    /// Waits and turns the outcome into a `Result`.
    pub async fn outcome(&self) -> Result<Option<serde_json::Value>, OperationError> {
        let state = self.wait().await;
        match state.error {
            Some(err) => Err(err),
            None => Ok(state.metadata),
        }
    }
}

/// Registry and scheduler for operations.
#[derive(Clone)]
pub struct Operations {
    ops: Arc<DashMap<Uuid, Operation>>,
    permits: Arc<Semaphore>,
}

impl Operations {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            ops: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Submits `work` and returns without waiting for it.
    /// Must be called from within a tokio runtime.
    pub fn submit<F, Fut, T>(
        &self,
        description: impl Into<String>,
        resources: Vec<String>,
        work: F,
    ) -> Operation
    where
        F: FnOnce(Progress) -> Fut + Send + 'static,
        Fut: Future<Output = cellar_common::Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let (tx, rx) = watch::channel(OperationState {
            id,
            description: description.into(),
            resources,
            created_at: now,
            updated_at: now,
            status: OperationStatus::Pending,
            progress: None,
            metadata: None,
            error: None,
        });
        let tx = Arc::new(tx);
        let op = Operation { id, rx };
        self.ops.insert(id, op.clone());

        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    finish(&tx, Err(OperationError::from(&closed_error())));
                    return;
                }
            };
            tx.send_modify(|s| {
                s.status = OperationStatus::Running;
                s.updated_at = Utc::now();
            });

            let progress = Progress { tx: tx.clone() };
            let result = AssertUnwindSafe(work(progress)).catch_unwind().await;
            let outcome = match result {
                Ok(Ok(value)) => serde_json::to_value(value).map_err(|e| OperationError {
                    kind: ErrorKind::Internal,
                    message: format!("unserializable operation result: {e}"),
                }),
                Ok(Err(err)) => Err(OperationError::from(&err)),
                Err(_) => Err(OperationError {
                    kind: ErrorKind::Internal,
                    message: "operation panicked".to_string(),
                }),
            };
            finish(&tx, outcome);
        });

        info!(operation = %id, "Operation submitted");
        op
    }

    pub fn get(&self, id: &Uuid) -> Option<Operation> {
        self.ops.get(id).map(|op| op.clone())
    }

    pub fn list(&self) -> Vec<OperationState> {
        self.ops.iter().map(|op| op.state()).collect()
    }

    /// Forgets finished operations last updated before `cutoff`.
    pub fn prune_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.ops.len();
        self.ops.retain(|_, op| {
            let state = op.rx.borrow();
            !(state.status.is_final() && state.updated_at < cutoff)
        });
        before - self.ops.len()
    }

    /// Stops admitting queued operations. Running ones finish normally.
    pub fn close(&self) {
        self.permits.close();
    }
}

fn closed_error() -> CellarError {
    CellarError::InvalidState("daemon is shutting down".to_string())
}

fn finish(
    tx: &watch::Sender<OperationState>,
    outcome: Result<serde_json::Value, OperationError>,
) {
    tx.send_modify(|s| {
        s.updated_at = Utc::now();
        match outcome {
            Ok(value) => {
                s.status = OperationStatus::Success;
                s.metadata = (!value.is_null()).then_some(value);
                info!(operation = %s.id, description = %s.description, "Operation succeeded");
            }
            Err(err) => {
                s.status = OperationStatus::Failure;
                if err.kind == ErrorKind::Internal {
                    error!(operation = %s.id, error = %err, "Operation failed");
                } else {
                    warn!(operation = %s.id, error = %err, "Operation failed");
                }
                s.error = Some(err);
            }
        }
    });
}
