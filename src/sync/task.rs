//! Cancellable asynchronous tasks.
//!
//! [`run`] spawns a unit of work on the tokio runtime and hands back a [`Task`]
//! handle. Awaiting the handle yields the work's result. Cancellation is
//! cooperative: [`Task::cancel`] trips a [`CancellationToken`] that the work
//! observes through its [`TaskContext`]. Once the body calls
//! [`TaskContext::enable_propagation`], every sub-operation it awaits through the
//! context is abandoned as soon as the task is cancelled, so one `cancel()` at the
//! top unwinds the whole call chain.
//!
//! A failure nobody awaited is logged exactly once: by the handle's `Drop` if the
//! outcome was already delivered, or by the spawned wrapper if the handle was
//! gone by the time the work finished.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::instrument::WithSubscriber;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Completion state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TaskState::Succeeded,
            2 => TaskState::Failed,
            3 => TaskState::Cancelled,
            _ => TaskState::Pending,
        }
    }

    fn of<T>(outcome: &Result<T>) -> Self {
        match outcome {
            Ok(_) => TaskState::Succeeded,
            Err(Error::Cancelled) => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != TaskState::Pending
    }
}

#[derive(Default)]
struct StateCell(AtomicU8);

impl StateCell {
    fn get(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn complete(&self, state: TaskState) {
        let code = match state {
            TaskState::Pending => return,
            TaskState::Succeeded => 1,
            TaskState::Failed => 2,
            TaskState::Cancelled => 3,
        };
        let previous = self
            .0
            .compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(previous.is_ok(), "task completed twice");
    }
}

/// Handle to work started with [`run`].
///
/// Awaiting the handle resolves to the work's result. Dropping it detaches the
/// work; it keeps running and any failure it produces is logged.
#[must_use = "dropping a Task detaches it; await it or call cancel()"]
pub struct Task<T> {
    token: CancellationToken,
    state: Arc<StateCell>,
    outcome: Option<oneshot::Receiver<Result<T>>>,
}

/// Starts `work` on the current tokio runtime.
///
/// Must be called from within a runtime. The work inherits the tracing
/// subscriber that is current at the call site.
pub fn run<T, F, Fut>(work: F) -> Task<T>
where
    T: Send + 'static,
    F: FnOnce(TaskContext) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    spawn_with_token(CancellationToken::new(), work)
}

fn spawn_with_token<T, F, Fut>(token: CancellationToken, work: F) -> Task<T>
where
    T: Send + 'static,
    F: FnOnce(TaskContext) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let ctx = TaskContext {
        token: token.clone(),
        propagate: false,
    };
    let body = work(ctx);
    let state = Arc::new(StateCell::default());
    let (tx, rx) = oneshot::channel();

    let wrapper_state = state.clone();
    let wrapper = async move {
        let outcome = match AssertUnwindSafe(body).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => Err(Error::Panicked(panic_message(payload.as_ref()))),
        };
        wrapper_state.complete(TaskState::of(&outcome));
        if let Err(Err(err)) = tx.send(outcome) {
            report_unobserved(&err);
        }
    };
    tokio::spawn(wrapper.with_current_subscriber());

    Task {
        token,
        state,
        outcome: Some(rx),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn report_unobserved(err: &Error) {
    match err {
        Error::Cancelled => debug!("Detached task was cancelled"),
        err => warn!(error = %err, "Detached task failed"),
    }
}

impl<T> Task<T> {
    /// Requests cancellation. Idempotent; a no-op once the task has finished.
    pub fn cancel(&self) {
        if !self.state.get().is_terminal() {
            self.token.cancel();
        }
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.state.get().is_terminal()
    }

    /// A token that is cancelled together with this task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.outcome.as_mut() else {
            panic!("Task polled after completion");
        };
        let outcome = match Pin::new(rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            // The wrapper never ran to completion: the runtime is shutting down.
            Poll::Ready(Err(_)) => {
                if !self.state.get().is_terminal() {
                    self.state.complete(TaskState::Cancelled);
                }
                Err(Error::Cancelled)
            }
        };
        self.outcome = None;
        Poll::Ready(outcome)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        let Some(mut rx) = self.outcome.take() else {
            return;
        };
        // After close() the wrapper's send fails and it reports the error itself.
        rx.close();
        if let Ok(Err(err)) = rx.try_recv() {
            report_unobserved(&err);
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handed to the body of a task to observe and forward cancellation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    token: CancellationToken,
    propagate: bool,
}

impl TaskContext {
    /// From now on, cancelling this task abandons whatever it is awaiting
    /// through [`guard`](Self::guard), [`join`](Self::join) or
    /// [`spawn`](Self::spawn).
    pub fn enable_propagation(&mut self) {
        self.propagate = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the task is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fails with [`Error::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Awaits a sub-operation. With propagation enabled, cancellation drops
    /// `fut` and yields [`Error::Cancelled`].
    pub async fn guard<U, F>(&self, fut: F) -> Result<U>
    where
        F: Future<Output = Result<U>>,
    {
        if !self.propagate {
            return fut.await;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            out = fut => out,
        }
    }

    /// Awaits a sub-task. With propagation enabled, cancellation of this task is
    /// forwarded to `task` and its (usually cancelled) outcome is returned.
    pub async fn join<U>(&self, mut task: Task<U>) -> Result<U> {
        if !self.propagate {
            return task.await;
        }
        tokio::select! {
            out = &mut task => return out,
            _ = self.token.cancelled() => {}
        }
        task.cancel();
        task.await
    }

    /// Starts a sub-task. With propagation enabled its cancellation is linked
    /// to this task's.
    pub fn spawn<U, F, Fut>(&self, work: F) -> Task<U>
    where
        U: Send + 'static,
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        let token = if self.propagate {
            self.token.child_token()
        } else {
            CancellationToken::new()
        };
        spawn_with_token(token, work)
    }
}
