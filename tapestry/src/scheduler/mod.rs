//! Single-writer cooperative scheduler, one per arc
//!
//! Work arrives as agendas: batches of [`Task`]s that run back to back on
//! one tokio task, so no two tasks of the same arc ever overlap. Within an
//! agenda processors run first, then listeners grouped by namespace and
//! name. Schedulers for different arcs run in parallel on a shared runtime.
//!
//! Store round trips started through [`Scheduler::spawn_io`] count as
//! outstanding work, so [`Scheduler::wait_for_idle`] returns only once every
//! reply has been handled.

mod completion;
mod provider;

pub use completion::Completion;
pub use provider::SchedulerProvider;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

type Job = Box<dyn FnOnce() + Send>;

/// A unit of work
pub enum Task {
    /// Storage-level work: applying store traffic to a proxy
    Processor(Job),
    /// Callback delivery, ordered by namespace then name
    Listener {
        namespace: String,
        name: String,
        run: Job,
    },
}

impl Task {
    pub fn processor(run: impl FnOnce() + Send + 'static) -> Self {
        Task::Processor(Box::new(run))
    }

    pub fn listener(
        namespace: impl Into<String>,
        name: impl Into<String>,
        run: impl FnOnce() + Send + 'static,
    ) -> Self {
        Task::Listener {
            namespace: namespace.into(),
            name: name.into(),
            run: Box::new(run),
        }
    }

    fn into_job(self) -> Job {
        match self {
            Task::Processor(run) => run,
            Task::Listener { run, .. } => run,
        }
    }
}

/// Processors first, then listeners by (namespace, name); stable otherwise
fn order_agenda(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(|a, b| match (a, b) {
        (Task::Processor(_), Task::Processor(_)) => std::cmp::Ordering::Equal,
        (Task::Processor(_), Task::Listener { .. }) => std::cmp::Ordering::Less,
        (Task::Listener { .. }, Task::Processor(_)) => std::cmp::Ordering::Greater,
        (
            Task::Listener {
                namespace: na,
                name: a,
                ..
            },
            Task::Listener {
                namespace: nb,
                name: b,
                ..
            },
        ) => (na, a).cmp(&(nb, b)),
    });
    tasks
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Running,
    Cancelled,
    Failed(String),
}

/// Counters reported by a scheduler
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub agendas: AtomicU64,
    pub tasks: AtomicU64,
    pub slow_agendas: AtomicU64,
}

struct SchedulerInner {
    name: String,
    runtime: Handle,
    tx: mpsc::UnboundedSender<Vec<Task>>,
    status: Mutex<Status>,
    /// Outstanding tasks and I/O; the idle flag is updated under this lock
    pending: Mutex<usize>,
    idle: watch::Sender<bool>,
    agenda_timeout: Duration,
    stats: SchedulerStats,
}

impl SchedulerInner {
    fn check_running(&self) -> Result<(), SchedulerError> {
        match &*self.status.lock() {
            Status::Running => Ok(()),
            Status::Cancelled => Err(SchedulerError::Cancelled(self.name.clone())),
            Status::Failed(cause) => Err(SchedulerError::Failed {
                name: self.name.clone(),
                cause: cause.clone(),
            }),
        }
    }

    fn begin(&self, count: usize) {
        let mut pending = self.pending.lock();
        *pending += count;
        if *pending > 0 {
            self.idle.send_replace(false);
        }
    }

    fn finish(&self, count: usize) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(count);
        if *pending == 0 {
            self.idle.send_replace(true);
        }
    }

    fn stop(&self, status: Status) {
        {
            let mut current = self.status.lock();
            if *current != Status::Running {
                return;
            }
            *current = status;
        }
        *self.pending.lock() = 0;
        self.idle.send_replace(true);
    }

    fn run_agenda(&self, agenda: Vec<Task>) {
        let started = Instant::now();
        let count = agenda.len();
        self.stats.agendas.fetch_add(1, Ordering::Relaxed);
        for task in order_agenda(agenda) {
            if self.check_running().is_err() {
                break;
            }
            self.stats.tasks.fetch_add(1, Ordering::Relaxed);
            if let Err(panic) = catch_unwind(AssertUnwindSafe(task.into_job())) {
                let cause = panic_message(panic.as_ref());
                error!(scheduler = %self.name, cause = %cause, "Task panicked, failing scheduler");
                self.stop(Status::Failed(cause));
            }
        }
        let elapsed = started.elapsed();
        if elapsed > self.agenda_timeout {
            self.stats.slow_agendas.fetch_add(1, Ordering::Relaxed);
            warn!(
                scheduler = %self.name,
                tasks = count,
                elapsed_ms = elapsed.as_millis() as u64,
                "Agenda exceeded its time budget"
            );
        }
        self.finish(count);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn worker(inner: Weak<SchedulerInner>, mut rx: mpsc::UnboundedReceiver<Vec<Task>>) {
    while let Some(agenda) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.check_running().is_err() {
            let count = agenda.len();
            drop(agenda);
            inner.finish(count);
            continue;
        }
        trace!(scheduler = %inner.name, tasks = agenda.len(), "Running agenda");
        inner.run_agenda(agenda);
    }
}

/// Handle to an arc's scheduler; clones share the same worker
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Start a scheduler on `runtime`
    pub fn new(name: impl Into<String>, runtime: Handle, config: &SchedulerConfig) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (idle, _) = watch::channel(true);
        let inner = Arc::new(SchedulerInner {
            name: name.clone(),
            runtime: runtime.clone(),
            tx,
            status: Mutex::new(Status::Running),
            pending: Mutex::new(0),
            idle,
            agenda_timeout: Duration::from_millis(config.agenda_timeout_ms),
            stats: SchedulerStats::default(),
        });
        runtime.spawn(worker(Arc::downgrade(&inner), rx));
        debug!(scheduler = %name, "Scheduler started");
        Self { inner }
    }

    /// Start a scheduler on the current tokio runtime with default settings
    ///
    /// Panics outside a runtime, like `tokio::spawn`.
    pub fn current(name: impl Into<String>) -> Self {
        Self::new(name, Handle::current(), &SchedulerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.inner.stats
    }

    pub fn is_active(&self) -> bool {
        self.inner.check_running().is_ok()
    }

    /// Failure cause if a task panicked
    pub fn failure(&self) -> Option<String> {
        match &*self.inner.status.lock() {
            Status::Failed(cause) => Some(cause.clone()),
            _ => None,
        }
    }

    /// Queue one task as its own agenda
    pub fn schedule(&self, task: Task) -> Result<(), SchedulerError> {
        self.schedule_all(vec![task])
    }

    /// Queue tasks as one agenda
    pub fn schedule_all(&self, tasks: Vec<Task>) -> Result<(), SchedulerError> {
        self.inner.check_running()?;
        if tasks.is_empty() {
            return Ok(());
        }
        let count = tasks.len();
        self.inner.begin(count);
        if self.inner.tx.send(tasks).is_err() {
            self.inner.finish(count);
            return Err(SchedulerError::Cancelled(self.inner.name.clone()));
        }
        Ok(())
    }

    /// Run `f` on the scheduler and complete with its result
    pub fn run<T, F>(&self, f: F) -> Result<Completion<T>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, completion) = Completion::channel();
        self.schedule(Task::processor(move || {
            let _ = tx.send(f());
        }))?;
        Ok(completion)
    }

    /// Drive `future` on the runtime, counting it as outstanding work
    pub fn spawn_io<F>(&self, future: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.check_running()?;
        self.inner.begin(1);
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            future.await;
            inner.finish(1);
        });
        Ok(())
    }

    /// Resolve once no task or I/O is outstanding
    pub async fn wait_for_idle(&self) -> Result<(), SchedulerError> {
        let mut idle = self.inner.idle.subscribe();
        idle.wait_for(|idle| *idle)
            .await
            .map_err(|_| SchedulerError::Cancelled(self.inner.name.clone()))?;
        Ok(())
    }

    /// Stop running tasks; queued work is dropped and later scheduling fails
    pub fn cancel(&self) {
        debug!(scheduler = %self.inner.name, "Scheduler cancelled");
        self.inner.stop(Status::Cancelled);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("status", &*self.inner.status.lock())
            .finish()
    }
}
