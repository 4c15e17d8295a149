//! Active-run bookkeeping.
//!
//! Only one run may be in flight per registry. The process-wide registry
//! backs the top-level `stop()`; engines built for tests can carry their own.
//! Every run owns its `CancellationToken`; the registry only keeps a clone so
//! `stop()` can reach the active run without a handle.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::models::Session;
use crate::error::AppError;

use super::types::ProgressEvent;

struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct RunRegistry {
    active: Mutex<Option<ActiveRun>>,
}

static GLOBAL: OnceLock<Arc<RunRegistry>> = OnceLock::new();

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<RunRegistry> {
        GLOBAL.get_or_init(|| Arc::new(RunRegistry::new())).clone()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<ActiveRun>>, AppError> {
        self.active
            .lock()
            .map_err(|_| AppError::Internal("Run registry lock poisoned".into()))
    }

    /// Claim the registry for `run_id`. Fails if another run is active.
    pub fn begin(self: &Arc<Self>, run_id: &str, cancel: CancellationToken) -> Result<RunGuard, AppError> {
        let mut active = self.lock()?;
        if let Some(ref existing) = *active {
            return Err(AppError::Validation(format!(
                "A run is already in progress ({})",
                existing.run_id
            )));
        }
        *active = Some(ActiveRun {
            run_id: run_id.to_string(),
            cancel,
        });
        Ok(RunGuard {
            registry: Arc::clone(self),
            run_id: run_id.to_string(),
            released: false,
        })
    }

    fn release(&self, run_id: &str) {
        if let Ok(mut active) = self.lock() {
            if active.as_ref().is_some_and(|a| a.run_id == run_id) {
                *active = None;
            }
        }
    }

    /// Signal the active run to stop. Idempotent; returns whether a run was
    /// active.
    pub fn stop(&self) -> bool {
        match self.lock() {
            Ok(active) => match *active {
                Some(ref run) => {
                    tracing::info!(run_id = %run.run_id, "Stop requested");
                    run.cancel.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn active_run_id(&self) -> Option<String> {
        self.lock().ok()?.as_ref().map(|a| a.run_id.clone())
    }

    pub fn is_running(&self) -> bool {
        self.active_run_id().is_some()
    }
}

/// Holds a run's claim on the registry. Released explicitly before the
/// terminal event is sent, or on drop if the run task dies early.
pub struct RunGuard {
    registry: Arc<RunRegistry>,
    run_id: String,
    released: bool,
}

impl RunGuard {
    pub fn release(&mut self) {
        if !self.released {
            self.registry.release(&self.run_id);
            self.released = true;
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// ProgressStream
// ============================================================================

/// Forward-only, finite sequence of a single run's events. Ends after the
/// terminal `Run*` event.
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressStream {
    pub fn channel() -> (mpsc::UnboundedSender<ProgressEvent>, ProgressStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ProgressStream { rx })
    }

    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// An already-buffered event, without waiting.
    pub fn try_next_event(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ============================================================================
// RunHandle
// ============================================================================

pub struct RunHandle {
    run_id: String,
    cancel: CancellationToken,
    events: ProgressStream,
    task: JoinHandle<Session>,
}

impl RunHandle {
    pub(crate) fn new(
        run_id: String,
        cancel: CancellationToken,
        events: ProgressStream,
        task: JoinHandle<Session>,
    ) -> Self {
        Self {
            run_id,
            cancel,
            events,
            task,
        }
    }

    pub fn id(&self) -> &str {
        &self.run_id
    }

    /// Cancel this run. Pairs already dispatched may still finish.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// A token that stops this run when cancelled, for use from other tasks.
    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn events(&mut self) -> &mut ProgressStream {
        &mut self.events
    }

    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.next_event().await
    }

    /// Detach the event stream; the run keeps going in the background.
    pub fn into_events(self) -> ProgressStream {
        self.events
    }

    /// Wait for the run to reach a terminal state and return its session.
    pub async fn wait(self) -> Result<Session, AppError> {
        self.task
            .await
            .map_err(|e| AppError::Internal(format!("Run task failed: {e}")))
    }
}
