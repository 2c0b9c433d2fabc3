// Task queue
//
// One sequential worker per workspace runs scan and install tasks in FIFO
// order. Sharing the worker is what keeps a scan from executing a binary that
// is halfway through being replaced.

use crate::cancel::CancellationToken;
use crate::models::ScanCategory;
use crate::progress::{Progress, ProgressReporter};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

pub type TaskId = u64;

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Scan(ScanCategory),
    Install,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Scan(category) => write!(f, "scan:{}", category),
            TaskKind::Install => f.write_str("install"),
        }
    }
}

/// Lifecycle: `Queued -> Running -> {Succeeded, Failed, Cancelled}`.
///
/// A queued task that is stopped goes straight to `Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed(_) | TaskState::Cancelled
        )
    }
}

/// How a task body finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    Succeeded,
    Failed(String),
    Cancelled,
}

impl From<TaskExit> for TaskState {
    fn from(exit: TaskExit) -> Self {
        match exit {
            TaskExit::Succeeded => TaskState::Succeeded,
            TaskExit::Failed(message) => TaskState::Failed(message),
            TaskExit::Cancelled => TaskState::Cancelled,
        }
    }
}

/// Handed to a task body when it starts running.
pub struct TaskContext {
    pub id: TaskId,
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Task queue {0} is shut down")]
    Closed(String),
}

/// Observer side of an enqueued task.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    id: TaskId,
    kind: TaskKind,
    title: Arc<str>,
    state: watch::Receiver<TaskState>,
    progress: watch::Receiver<Progress>,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn state(&self) -> TaskState {
        self.state.borrow().clone()
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TaskState> {
        self.state.clone()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation of this task only.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to reach a terminal state.
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.state.clone();
        match rx.wait_for(TaskState::is_terminal).await {
            Ok(state) => state.clone(),
            // Sender gone without a terminal state: the worker was torn down
            Err(_) => TaskState::Cancelled,
        }
    }
}

type TaskFn = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, TaskExit> + Send>;

struct QueuedTask {
    handle: TaskHandle,
    state_tx: watch::Sender<TaskState>,
    progress: ProgressReporter,
    run: TaskFn,
}

#[derive(Default)]
struct Slots {
    pending: VecDeque<QueuedTask>,
    current: Option<TaskHandle>,
}

struct Shared {
    name: String,
    slots: Mutex<Slots>,
    notify: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
}

/// FIFO task queue with a single worker.
///
/// At most one task is `Running` at any instant. [`TaskQueue::stop`] cancels
/// the running task and drops everything pending; the queue stays usable.
/// [`TaskQueue::shutdown`] additionally closes it and joins the worker.
pub struct TaskQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Create the queue and spawn its worker on the current tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            slots: Mutex::new(Slots::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        });

        let worker = tokio::spawn(run_worker(Arc::clone(&shared)));

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Append a task. `run` is only invoked once the task reaches the worker.
    pub fn enqueue<F, Fut>(
        &self,
        kind: TaskKind,
        title: impl Into<String>,
        run: F,
    ) -> Result<TaskHandle, QueueError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = TaskExit> + Send + 'static,
    {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(self.shared.name.clone()));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(TaskState::Queued);
        let (progress, progress_rx) = ProgressReporter::new();
        let handle = TaskHandle {
            id,
            kind,
            title: Arc::from(title.into()),
            state: state_rx,
            progress: progress_rx,
            cancel: CancellationToken::new(),
        };

        let task = QueuedTask {
            handle: handle.clone(),
            state_tx,
            progress,
            run: Box::new(move |ctx| run(ctx).boxed()),
        };

        self.shared.slots.lock().unwrap().pending.push_back(task);
        self.shared.notify.notify_one();
        tracing::debug!("[{}] Queued task {} ({}): {}", self.shared.name, id, kind, handle.title);

        Ok(handle)
    }

    /// The running task, if any.
    pub fn current_task(&self) -> Option<TaskHandle> {
        self.shared.slots.lock().unwrap().current.clone()
    }

    /// Handles of the tasks waiting to run, in order.
    pub fn pending(&self) -> Vec<TaskHandle> {
        self.shared
            .slots
            .lock()
            .unwrap()
            .pending
            .iter()
            .map(|t| t.handle.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.slots.lock().unwrap().pending.len()
    }

    /// `true` if a task of `kind` is queued or running.
    pub fn contains(&self, kind: TaskKind) -> bool {
        let slots = self.shared.slots.lock().unwrap();
        slots.current.as_ref().is_some_and(|h| h.kind == kind)
            || slots.pending.iter().any(|t| t.handle.kind == kind)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Cancel the running task, drop all pending ones and wait until idle.
    ///
    /// On return the queue is empty and [`current_task`](Self::current_task)
    /// is `None`.
    pub async fn stop(&self) {
        let (current, drained) = {
            let mut slots = self.shared.slots.lock().unwrap();
            let drained: Vec<QueuedTask> = slots.pending.drain(..).collect();
            (slots.current.clone(), drained)
        };

        if !drained.is_empty() {
            tracing::info!(
                "[{}] Dropping {} pending task(s)",
                self.shared.name,
                drained.len()
            );
        }
        for task in drained {
            task.handle.cancel.cancel();
            task.state_tx.send_replace(TaskState::Cancelled);
        }

        if let Some(current) = current {
            tracing::info!(
                "[{}] Cancelling running task {}: {}",
                self.shared.name,
                current.id,
                current.title
            );
            current.cancel();
            current.wait().await;
        }
    }

    /// Stop, refuse further tasks and join the worker.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.stop().await;
        self.shared.notify.notify_one();

        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!("[{}] Worker ended abnormally: {}", self.shared.name, e);
            }
        }
        tracing::debug!("[{}] Task queue shut down", self.shared.name);
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // Let the worker exit once it runs dry
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut slots = shared.slots.lock().unwrap();
            let next = slots.pending.pop_front();
            slots.current = next.as_ref().map(|t| t.handle.clone());
            next
        };

        match next {
            Some(task) => run_task(&shared, task).await,
            None if shared.closed.load(Ordering::SeqCst) => break,
            None => shared.notify.notified().await,
        }
    }
}

async fn run_task(shared: &Shared, task: QueuedTask) {
    let QueuedTask {
        handle,
        state_tx,
        progress,
        run,
    } = task;

    let final_state = if handle.cancel.is_cancelled() {
        TaskState::Cancelled
    } else {
        state_tx.send_replace(TaskState::Running);
        tracing::debug!("[{}] Running task {}: {}", shared.name, handle.id, handle.title);

        let ctx = TaskContext {
            id: handle.id,
            cancel: handle.cancel.clone(),
            progress,
        };

        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| run(ctx))) {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(payload) => Err(payload),
        };

        match outcome {
            Ok(exit) => TaskState::from(exit),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(
                    "[{}] Task {} ({}) panicked: {}",
                    shared.name,
                    handle.id,
                    handle.title,
                    message
                );
                TaskState::Failed(format!("task panicked: {}", message))
            }
        }
    };

    shared.slots.lock().unwrap().current = None;
    tracing::debug!(
        "[{}] Task {} finished: {:?}",
        shared.name,
        handle.id,
        final_state
    );
    state_tx.send_replace(final_state);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tasks_run_in_fifo_order() {
        let queue = TaskQueue::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let order = order.clone();
            handles.push(
                queue
                    .enqueue(TaskKind::Install, format!("task {}", i), move |_| async move {
                        order.lock().unwrap().push(i);
                        TaskExit::Succeeded
                    })
                    .unwrap(),
            );
        }

        for handle in &handles {
            assert_eq!(handle.wait().await, TaskState::Succeeded);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_task_fails_without_killing_worker() {
        let queue = TaskQueue::new("test");
        let bad = queue
            .enqueue(TaskKind::Scan(ScanCategory::Oss), "bad", |_| async {
                panic!("boom");
            })
            .unwrap();
        let good = queue
            .enqueue(TaskKind::Scan(ScanCategory::Iac), "good", |_| async {
                TaskExit::Succeeded
            })
            .unwrap();

        assert!(matches!(bad.wait().await, TaskState::Failed(m) if m.contains("boom")));
        assert_eq!(good.wait().await, TaskState::Succeeded);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_never_two_running_tasks() {
        let queue = TaskQueue::new("test");
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for category in ScanCategory::ALL {
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(
                queue
                    .enqueue(TaskKind::Scan(category), category.as_str(), move |_| async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        TaskExit::Succeeded
                    })
                    .unwrap(),
            );
        }

        for handle in &handles {
            handle.wait().await;
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_running_and_drains_pending() {
        let queue = TaskQueue::new("test");
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let running = queue
            .enqueue(TaskKind::Install, "long", move |ctx| async move {
                let _ = started_tx.send(());
                ctx.cancel.cancelled().await;
                TaskExit::Cancelled
            })
            .unwrap();
        let pending = queue
            .enqueue(TaskKind::Scan(ScanCategory::Oss), "never", |_| async {
                TaskExit::Succeeded
            })
            .unwrap();

        started_rx.await.unwrap();
        assert_eq!(queue.current_task().map(|h| h.id()), Some(running.id()));
        assert_eq!(running.state(), TaskState::Running);

        queue.stop().await;

        assert!(queue.current_task().is_none());
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(running.state(), TaskState::Cancelled);
        assert_eq!(pending.state(), TaskState::Cancelled);

        // still usable after stop
        let after = queue
            .enqueue(TaskKind::Install, "after", |_| async { TaskExit::Succeeded })
            .unwrap();
        assert_eq!(after.wait().await, TaskState::Succeeded);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_progress_is_visible_on_handle() {
        let queue = TaskQueue::new("test");
        let handle = queue
            .enqueue(TaskKind::Install, "download", |ctx| async move {
                ctx.progress.set_text("Downloading");
                ctx.progress.set_fraction(0.5);
                TaskExit::Succeeded
            })
            .unwrap();

        handle.wait().await;
        let progress = handle.progress();
        assert_eq!(progress.text, "Downloading");
        assert_eq!(progress.fraction, Some(0.5));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let queue = TaskQueue::new("closed");
        queue.shutdown().await;
        let result = queue.enqueue(TaskKind::Install, "late", |_| async { TaskExit::Succeeded });
        assert_eq!(result.unwrap_err(), QueueError::Closed("closed".into()));
    }
}
