//! Execution Contexts
//!
//! A context is a single-threaded cooperative execution lane. Every task
//! submitted with [`Context::run_on_context`] lands in one FIFO queue that is
//! drained by exactly one worker thread, so tasks of one context never overlap.
//!
//! Each worker thread drives a current-thread tokio runtime. The runtime is
//! only used for the queue receiver and for timers; tasks themselves are
//! plain closures executed to completion.
//!
//! ```text
//!  any thread ──run_on_context──▶ [ FIFO queue ] ──▶ worker thread
//!  timer ─────(expiry)─────────────────────────────▶ (next quantum boundary)
//!                                      └── discarded after close()
//! ```
//!
//! Expired timers do not queue behind the backlog: the worker runs them at the
//! next quantum boundary, so a timer fires at most one quantum late.
//!
//! Pool contexts share a [`LiveDeployments`] set. A task submitted on behalf of
//! a deployment that has since been undeployed is discarded instead of run.

use crate::deployment::DeploymentId;
use crate::error::{BusError, Result};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::ops::ControlFlow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Tasks executed back to back before the worker yields to its timer driver.
///
/// An expired timer waits for at most this many queued tasks.
pub const SCHEDULING_QUANTUM: usize = 64;

const STATE_ACTIVE: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Context>> = RefCell::new(None);
    static CURRENT_OWNER: RefCell<Option<DeploymentId>> = RefCell::new(None);
}

/// Context identifier, unique within one context pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(usize);

impl ContextId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context-{}", self.0)
    }
}

/// Context lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Active,
    Closing,
    Closed,
}

impl ContextState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_ACTIVE => ContextState::Active,
            STATE_CLOSING => ContextState::Closing,
            _ => ContextState::Closed,
        }
    }
}

/// Deployments whose tasks may still run; shared by a pool and its contexts
#[derive(Debug, Default)]
pub struct LiveDeployments {
    ids: RwLock<HashSet<DeploymentId>>,
}

impl LiveDeployments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_live(&self, id: DeploymentId) -> bool {
        self.ids.read().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }

    pub(crate) fn admit(&self, id: DeploymentId) {
        self.ids.write().insert(id);
    }

    /// Once this returns, no [`LiveDeployments::while_live`] section for `id`
    /// is running or will run
    pub(crate) fn retire(&self, id: DeploymentId) -> bool {
        self.ids.write().remove(&id)
    }

    /// Run `f` only while `id` is live; retirement waits for it
    pub(crate) fn while_live<R>(&self, id: DeploymentId, f: impl FnOnce() -> R) -> Option<R> {
        let ids = self.ids.read();
        if ids.contains(&id) {
            Some(f())
        } else {
            None
        }
    }
}

struct Task {
    run: Box<dyn FnOnce() + Send + 'static>,
    /// Deployment on whose behalf the task runs
    owner: Option<DeploymentId>,
    /// Discard the task if `owner` is no longer live
    owner_checked: bool,
}

enum Command {
    Run(Task),
    Close,
}

#[derive(Debug, Default)]
struct ContextCounters {
    submitted: AtomicU64,
    executed: AtomicU64,
    discarded: AtomicU64,
    panics: AtomicU64,
    busy_ns: AtomicU64,
}

/// Context statistics snapshot
#[derive(Debug, Clone)]
pub struct ContextStats {
    pub id: ContextId,
    pub name: String,
    pub state: ContextState,
    pub tasks_submitted: u64,
    pub tasks_executed: u64,
    pub tasks_discarded: u64,
    pub panics: u64,
    pub busy_time: Duration,
}

impl ContextStats {
    /// Tasks accepted but not yet executed or discarded
    pub fn pending(&self) -> u64 {
        self.tasks_submitted
            .saturating_sub(self.tasks_executed)
            .saturating_sub(self.tasks_discarded)
    }
}

struct ContextInner {
    id: ContextId,
    name: String,
    sender: mpsc::UnboundedSender<Command>,
    handle: Handle,
    state: AtomicU8,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: ContextCounters,
    deployments: Option<Arc<LiveDeployments>>,
}

/// Single-threaded execution context
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl Context {
    /// Start a new context with its own worker thread
    pub fn spawn(id: ContextId, name: impl Into<String>) -> Result<Context> {
        Self::spawn_inner(id, name.into(), None)
    }

    /// Start a context that discards tasks of deployments missing from `deployments`
    pub fn spawn_tracked(
        id: ContextId,
        name: impl Into<String>,
        deployments: Arc<LiveDeployments>,
    ) -> Result<Context> {
        Self::spawn_inner(id, name.into(), Some(deployments))
    }

    fn spawn_inner(id: ContextId, name: String, deployments: Option<Arc<LiveDeployments>>) -> Result<Context> {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| BusError::system(format!("Failed to build runtime for {}: {}", name, e)))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let context = Context {
            inner: Arc::new(ContextInner {
                id,
                name: name.clone(),
                sender,
                handle: runtime.handle().clone(),
                state: AtomicU8::new(STATE_ACTIVE),
                worker: Mutex::new(None),
                counters: ContextCounters::default(),
                deployments,
            }),
        };

        let worker_context = context.clone();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_context.run_worker(runtime, receiver))
            .map_err(|e| BusError::system(format!("Failed to spawn context thread {}: {}", name, e)))?;
        *context.inner.worker.lock() = Some(worker);

        debug!(context_id = %id, name = %context.inner.name, "Context started");
        Ok(context)
    }

    /// The context whose worker thread is calling, if any
    pub fn current() -> Option<Context> {
        CURRENT_CONTEXT.with(|current| current.borrow().clone())
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ContextState {
        ContextState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ContextState::Active
    }

    /// Whether the calling thread is this context's worker
    pub fn is_current(&self) -> bool {
        CURRENT_CONTEXT.with(|current| {
            current
                .borrow()
                .as_ref()
                .map(|c| Arc::ptr_eq(&c.inner, &self.inner))
                .unwrap_or(false)
        })
    }

    /// Enqueue a task from any thread; never blocks
    pub fn run_on_context<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_on_context_as(current_owner(), task)
    }

    /// Enqueue a task that runs on behalf of `owner`
    pub(crate) fn run_on_context_as<F>(&self, owner: Option<DeploymentId>, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task {
            run: Box::new(task),
            owner,
            owner_checked: true,
        })
    }

    /// Like [`Context::run_on_context_as`], but runs even after `owner` is
    /// retired; the task must check liveness itself
    pub(crate) fn run_on_context_unchecked<F>(&self, owner: Option<DeploymentId>, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task {
            run: Box::new(task),
            owner,
            owner_checked: false,
        })
    }

    fn submit(&self, task: Task) -> Result<()> {
        if !self.is_active() {
            return Err(BusError::context_closed(self.inner.id));
        }
        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.inner
            .sender
            .send(Command::Run(task))
            .map_err(|_| BusError::context_closed(self.inner.id))
    }

    /// Arm a one-shot timer; on expiry `task` runs on this context's worker
    /// ahead of the queue backlog
    pub fn set_timer<F>(&self, delay: Duration, task: F) -> Result<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_active() {
            return Err(BusError::context_closed(self.inner.id));
        }

        let owner = current_owner();
        let cancelled = Arc::new(AtomicBool::new(false));
        let fire_cancelled = Arc::clone(&cancelled);
        let context = self.clone();
        let deadline = tokio::time::Instant::now() + delay;

        let join = self.inner.handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if fire_cancelled.load(Ordering::Acquire) {
                return;
            }
            context.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
            context.run_task(Task {
                run: Box::new(task),
                owner,
                owner_checked: true,
            });
        });

        Ok(TimerHandle { join, cancelled })
    }

    /// Run `step` repeatedly, one queue entry per iteration, until it breaks
    /// or the context closes.
    pub fn run_repeatedly<F>(&self, step: F) -> Result<()>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        self.resubmit(current_owner(), Box::new(step))
    }

    fn resubmit(
        &self,
        owner: Option<DeploymentId>,
        mut step: Box<dyn FnMut() -> ControlFlow<()> + Send + 'static>,
    ) -> Result<()> {
        let context = self.clone();
        self.submit(Task {
            owner,
            owner_checked: true,
            run: Box::new(move || {
                if step().is_continue() {
                    if let Err(e) = context.resubmit(owner, step) {
                        trace!(error = %e, "Repeating task stopped");
                    }
                }
            }),
        })
    }

    /// Signal the context to close.
    ///
    /// The task in progress completes; everything still queued is discarded
    /// and timers are dropped with the runtime.
    pub fn close(&self) {
        let switched = self
            .inner
            .state
            .compare_exchange(STATE_ACTIVE, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if switched {
            if self.inner.sender.send(Command::Close).is_err() {
                warn!(context_id = %self.inner.id, "Context worker already gone");
            }
            debug!(context_id = %self.inner.id, "Context closing");
        }
    }

    /// Wait for the worker thread to exit; must not be called from the context itself
    pub fn join(&self) -> Result<()> {
        if self.is_current() {
            return Err(BusError::system(format!(
                "{} cannot join its own worker thread",
                self.inner.id
            )));
        }
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker
                .join()
                .map_err(|_| BusError::system(format!("{} worker thread panicked", self.inner.id)))?;
        }
        Ok(())
    }

    pub fn stats(&self) -> ContextStats {
        let counters = &self.inner.counters;
        ContextStats {
            id: self.inner.id,
            name: self.inner.name.clone(),
            state: self.state(),
            tasks_submitted: counters.submitted.load(Ordering::Relaxed),
            tasks_executed: counters.executed.load(Ordering::Relaxed),
            tasks_discarded: counters.discarded.load(Ordering::Relaxed),
            panics: counters.panics.load(Ordering::Relaxed),
            busy_time: Duration::from_nanos(counters.busy_ns.load(Ordering::Relaxed)),
        }
    }

    fn run_worker(self, runtime: Runtime, mut receiver: mpsc::UnboundedReceiver<Command>) {
        CURRENT_CONTEXT.with(|current| *current.borrow_mut() = Some(self.clone()));

        let context = self.clone();
        runtime.block_on(async move {
            let mut since_yield = 0usize;
            while let Some(command) = receiver.recv().await {
                match command {
                    Command::Run(task) => {
                        context.run_task(task);
                        since_yield += 1;
                        if since_yield >= SCHEDULING_QUANTUM {
                            since_yield = 0;
                            // the first yield lets the driver observe expired
                            // timers, the second runs them
                            tokio::task::yield_now().await;
                            tokio::task::yield_now().await;
                        }
                    }
                    Command::Close => break,
                }
            }

            receiver.close();
            while let Ok(command) = receiver.try_recv() {
                if matches!(command, Command::Run(_)) {
                    context.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        drop(runtime);

        self.inner.state.store(STATE_CLOSED, Ordering::Release);
        CURRENT_CONTEXT.with(|current| current.borrow_mut().take());

        let stats = self.stats();
        info!(
            context_id = %stats.id,
            tasks_executed = stats.tasks_executed,
            tasks_discarded = stats.tasks_discarded,
            busy_ms = stats.busy_time.as_millis(),
            "Context closed"
        );
    }

    /// Execute `task` unless the context is closing or its owner was retired
    fn run_task(&self, task: Task) {
        if !self.is_active() {
            self.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if task.owner_checked && self.owner_retired(task.owner) {
            self.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
            trace!(context_id = %self.inner.id, deployment_id = ?task.owner, "Task of undeployed deployment discarded");
            return;
        }
        self.execute(task);
    }

    fn owner_retired(&self, owner: Option<DeploymentId>) -> bool {
        match (owner, &self.inner.deployments) {
            (Some(id), Some(deployments)) => !deployments.is_live(id),
            _ => false,
        }
    }

    fn execute(&self, task: Task) {
        let started = Instant::now();
        let previous = CURRENT_OWNER.with(|owner| owner.replace(task.owner));
        let outcome = catch_unwind(AssertUnwindSafe(task.run));
        CURRENT_OWNER.with(|owner| *owner.borrow_mut() = previous);

        let counters = &self.inner.counters;
        if let Err(panic) = outcome {
            counters.panics.fetch_add(1, Ordering::Relaxed);
            error!(
                context_id = %self.inner.id,
                panic = %panic_message(panic.as_ref()),
                "Task panicked; context keeps running"
            );
        }
        counters.executed.fetch_add(1, Ordering::Relaxed);
        counters
            .busy_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}

/// Deployment the currently executing task belongs to
pub(crate) fn current_owner() -> Option<DeploymentId> {
    CURRENT_OWNER.with(|owner| *owner.borrow())
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to a pending timer
#[derive(Debug)]
pub struct TimerHandle {
    join: tokio::task::JoinHandle<()>,
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Cancel the timer; a no-op once its task has run
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.join.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
