//! Deployment Manager
//!
//! Creates verticle instances, binds each to a context and drives their
//! start/stop lifecycle. A deployment is `Running` only once every instance's
//! start [`Completion`] has succeeded; any failure rolls the partial
//! deployment back.
//!
//! A deployment is admitted to the pool's live set before its first start
//! task and retired before its consumers are removed. From then on its
//! queued tasks, timers and repeating loops are discarded and its
//! registrations refused.
//!
//! ```text
//! deploy ─▶ Deploying ──all starts ok──▶ Running ──undeploy──▶ Undeploying ─▶ Undeployed
//!              │                                                   ▲
//!              └──── factory/start failure: consumers removed ─────┘
//! ```

use crate::bus::EventBus;
use crate::context::{current_owner, panic_message, Context};
use crate::error::{BusError, Result};
use crate::pool::ContextPool;
use crate::registry::ConsumerHandle;
use crate::verticle::{Completion, Verticle, VerticleContext};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Unique deployment identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeploymentId {
    id: Uuid,
}

impl DeploymentId {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self { id }
    }

    pub fn uuid(&self) -> Uuid {
        self.id
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deployment-{}", self.id.simple())
    }
}

impl Default for DeploymentId {
    fn default() -> Self {
        Self::new()
    }
}

/// Deployment lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    Deploying,
    Running,
    Undeploying,
    Undeployed,
}

/// How a verticle is deployed
#[derive(Debug, Clone)]
pub struct DeploymentOptions {
    /// Number of verticle instances, each on its own assigned context
    pub instances: usize,
    /// Give every instance a fresh context instead of a pooled one
    pub dedicated_context: bool,
    /// Handed to each instance through [`VerticleContext::config`]
    pub config: serde_json::Value,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            instances: 1,
            dedicated_context: false,
            config: serde_json::Value::Null,
        }
    }
}

impl DeploymentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_dedicated_context(mut self, dedicated: bool) -> Self {
        self.dedicated_context = dedicated;
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.instances == 0 {
            return Err(BusError::configuration(
                "Deployment must create at least one instance",
                Some("instances"),
            ));
        }

        if !(self.config.is_null() || self.config.is_object()) {
            return Err(BusError::configuration(
                "Deployment config must be a JSON object",
                Some("config"),
            ));
        }

        Ok(())
    }
}

type SharedFactory = Arc<dyn Fn() -> anyhow::Result<Box<dyn Verticle>> + Send + Sync + 'static>;
type DeployCallback = Box<dyn FnOnce(Result<DeploymentId>) + Send + 'static>;
type UndeployCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// One verticle instance and the context it is bound to
#[derive(Clone)]
struct InstanceSlot {
    context: Context,
    dedicated: bool,
    verticle: Arc<Mutex<Option<Box<dyn Verticle>>>>,
    verticle_context: VerticleContext,
}

struct DeploymentRecord {
    state: DeploymentState,
    instances: Vec<InstanceSlot>,
    options: DeploymentOptions,
    deployed_at: Instant,
}

/// Summary of a live deployment
#[derive(Debug, Clone)]
pub struct DeploymentInfo {
    pub id: DeploymentId,
    pub state: DeploymentState,
    pub instances: usize,
    pub dedicated_context: bool,
    pub contexts: Vec<String>,
    pub uptime: std::time::Duration,
}

/// Counts instance lifecycle signals and fires one callback when all are in
struct Barrier<C> {
    remaining: AtomicUsize,
    failure: Mutex<Option<BusError>>,
    callback: Mutex<Option<C>>,
}

impl<C> Barrier<C> {
    fn new(instances: usize, callback: C) -> Self {
        Self {
            remaining: AtomicUsize::new(instances),
            failure: Mutex::new(None),
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Record one instance; returns the callback and first failure once the
    /// last instance reports
    fn arrive(&self, outcome: Result<()>) -> Option<(C, Option<BusError>)> {
        if let Err(e) = outcome {
            self.failure.lock().get_or_insert(e);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return None;
        }
        let callback = self.callback.lock().take()?;
        Some((callback, self.failure.lock().take()))
    }
}

struct ManagerInner {
    bus: EventBus,
    pool: Arc<ContextPool>,
    records: DashMap<DeploymentId, DeploymentRecord>,
}

/// Deploys and undeploys verticles
#[derive(Clone)]
pub struct DeploymentManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentManager")
            .field("deployments", &self.inner.records.len())
            .finish()
    }
}

impl DeploymentManager {
    pub fn new(bus: EventBus, pool: Arc<ContextPool>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                bus,
                pool,
                records: DashMap::new(),
            }),
        }
    }

    /// Deploy and wait for every instance to start
    pub async fn deploy<F, V>(&self, factory: F, options: DeploymentOptions) -> Result<DeploymentId>
    where
        F: Fn() -> anyhow::Result<V> + Send + Sync + 'static,
        V: Verticle,
    {
        let (tx, rx) = oneshot::channel();
        self.deploy_with(factory, options, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await
            .map_err(|_| BusError::system("Deployment callback dropped before completion"))?
    }

    /// Deploy one already-built verticle
    pub async fn deploy_verticle<V: Verticle>(&self, verticle: V) -> Result<DeploymentId> {
        let slot = Mutex::new(Some(verticle));
        self.deploy(
            move || {
                slot.lock()
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("verticle instance already deployed"))
            },
            DeploymentOptions::default(),
        )
        .await
    }

    /// Callback form of [`DeploymentManager::deploy`]. The callback re-enters
    /// the caller's context when the caller runs on one.
    pub fn deploy_with<F, V, C>(&self, factory: F, options: DeploymentOptions, callback: C)
    where
        F: Fn() -> anyhow::Result<V> + Send + Sync + 'static,
        V: Verticle,
        C: FnOnce(Result<DeploymentId>) + Send + 'static,
    {
        let callback: DeployCallback = Box::new(reenter_caller(callback));
        if let Err(e) = options.validate() {
            callback(Err(e));
            return;
        }

        let id = DeploymentId::new();
        let factory: SharedFactory = Arc::new(move || {
            factory().map(|verticle| Box::new(verticle) as Box<dyn Verticle>)
        });

        let slots = match self.allocate(id, &options) {
            Ok(slots) => slots,
            Err(e) => {
                callback(Err(BusError::deployment_failed(id, e.to_string())));
                return;
            }
        };

        info!(
            deployment_id = %id,
            instances = options.instances,
            dedicated = options.dedicated_context,
            "Deploying verticle"
        );
        self.inner.pool.deployments().admit(id);
        self.inner.records.insert(
            id,
            DeploymentRecord {
                state: DeploymentState::Deploying,
                instances: slots.clone(),
                options,
                deployed_at: Instant::now(),
            },
        );

        let barrier = Arc::new(Barrier::new(slots.len(), callback));
        for slot in slots {
            let manager = self.clone();
            let factory = Arc::clone(&factory);
            let task_barrier = Arc::clone(&barrier);
            let context = slot.context.clone();
            let scheduled = context.run_on_context_as(Some(id), move || {
                manager.start_instance(id, slot, factory, task_barrier)
            });
            if let Err(e) = scheduled {
                self.instance_started(id, &barrier, Err(e));
            }
        }
    }

    fn allocate(&self, id: DeploymentId, options: &DeploymentOptions) -> Result<Vec<InstanceSlot>> {
        let config = Arc::new(options.config.clone());
        let mut slots: Vec<InstanceSlot> = Vec::with_capacity(options.instances);

        for instance in 0..options.instances {
            let context = if options.dedicated_context {
                match self.inner.pool.dedicated() {
                    Ok(context) => context,
                    Err(e) => {
                        self.release_contexts(&slots);
                        return Err(e);
                    }
                }
            } else {
                self.inner.pool.assign()
            };

            slots.push(InstanceSlot {
                verticle_context: VerticleContext::new(
                    id,
                    instance,
                    self.inner.bus.clone(),
                    context.clone(),
                    Arc::clone(&config),
                ),
                context,
                dedicated: options.dedicated_context,
                verticle: Arc::new(Mutex::new(None)),
            });
        }
        Ok(slots)
    }

    /// Runs on the instance's context
    fn start_instance(
        &self,
        id: DeploymentId,
        slot: InstanceSlot,
        factory: SharedFactory,
        barrier: Arc<Barrier<DeployCallback>>,
    ) {
        let mut verticle = match catch_unwind(AssertUnwindSafe(|| factory())) {
            Ok(Ok(verticle)) => verticle,
            Ok(Err(e)) => {
                let reason = format!("verticle factory failed: {:#}", e);
                self.instance_started(id, &barrier, Err(BusError::deployment_failed(id, reason)));
                return;
            }
            Err(panic) => {
                let reason = format!("verticle factory panicked: {}", panic_message(panic.as_ref()));
                self.instance_started(id, &barrier, Err(BusError::deployment_failed(id, reason)));
                return;
            }
        };

        let manager = self.clone();
        let done = Completion::new("start", move |outcome| {
            manager.instance_started(id, &barrier, outcome)
        });
        let started = catch_unwind(AssertUnwindSafe(|| {
            verticle.start(&slot.verticle_context, done)
        }));
        if let Err(panic) = started {
            error!(
                deployment_id = %id,
                instance = slot.verticle_context.instance(),
                panic = %panic_message(panic.as_ref()),
                "Verticle start panicked"
            );
        }
        *slot.verticle.lock() = Some(verticle);
    }

    fn instance_started(
        &self,
        id: DeploymentId,
        barrier: &Barrier<DeployCallback>,
        outcome: Result<()>,
    ) {
        let Some((callback, failure)) = barrier.arrive(outcome) else {
            return;
        };

        match failure {
            None => {
                if let Some(mut record) = self.inner.records.get_mut(&id) {
                    record.state = DeploymentState::Running;
                }
                info!(deployment_id = %id, "Deployment running");
                callback(Ok(id));
            }
            Some(failure) => {
                let failure = match failure {
                    e @ BusError::DeploymentFailed { .. } => e,
                    other => BusError::deployment_failed(id, other.to_string()),
                };
                warn!(deployment_id = %id, error = %failure, "Deployment failed; rolling back");
                self.roll_back(id);
                callback(Err(failure));
            }
        }
    }

    /// Remove a failed deployment's consumers and return its contexts
    fn roll_back(&self, id: DeploymentId) {
        let removed = self.retire(id);
        if let Some((_, record)) = self.inner.records.remove(&id) {
            self.release_contexts(&record.instances);
        }
        debug!(deployment_id = %id, consumers = removed.len(), "Partial deployment removed");
    }

    /// Stop every instance, then unregister the deployment's consumers and
    /// release its contexts
    pub async fn undeploy(&self, id: DeploymentId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.undeploy_with(id, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await
            .map_err(|_| BusError::system("Undeploy callback dropped before completion"))?
    }

    pub fn undeploy_with<C>(&self, id: DeploymentId, callback: C)
    where
        C: FnOnce(Result<()>) + Send + 'static,
    {
        let callback = reenter_caller(callback);

        let slots = match self.inner.records.get_mut(&id) {
            None => {
                callback(Err(BusError::unknown_deployment(id)));
                return;
            }
            Some(mut record) => {
                if record.state != DeploymentState::Running {
                    let state = record.state;
                    drop(record);
                    callback(Err(BusError::system(format!(
                        "{} cannot be undeployed while {:?}",
                        id, state
                    ))));
                    return;
                }
                record.state = DeploymentState::Undeploying;
                record.instances.clone()
            }
        };

        info!(deployment_id = %id, instances = slots.len(), "Undeploying");
        let callback: UndeployCallback = Box::new(callback);
        let barrier = Arc::new(Barrier::new(slots.len(), callback));

        for slot in slots {
            let manager = self.clone();
            let task_barrier = Arc::clone(&barrier);
            let context = slot.context.clone();
            let scheduled = context.run_on_context_as(Some(id), move || {
                manager.stop_instance(id, slot, task_barrier)
            });
            if let Err(e) = scheduled {
                self.instance_stopped(id, &barrier, Err(e));
            }
        }
    }

    /// Runs on the instance's context
    fn stop_instance(&self, id: DeploymentId, slot: InstanceSlot, barrier: Arc<Barrier<UndeployCallback>>) {
        let verticle = slot.verticle.lock().take();
        let Some(mut verticle) = verticle else {
            self.instance_stopped(id, &barrier, Ok(()));
            return;
        };

        let manager = self.clone();
        let done = Completion::new("stop", move |outcome| {
            manager.instance_stopped(id, &barrier, outcome)
        });
        let stopped = catch_unwind(AssertUnwindSafe(|| {
            verticle.stop(&slot.verticle_context, done)
        }));
        if let Err(panic) = stopped {
            error!(
                deployment_id = %id,
                instance = slot.verticle_context.instance(),
                panic = %panic_message(panic.as_ref()),
                "Verticle stop panicked"
            );
        }
    }

    fn instance_stopped(
        &self,
        id: DeploymentId,
        barrier: &Barrier<UndeployCallback>,
        outcome: Result<()>,
    ) {
        let Some((callback, failure)) = barrier.arrive(outcome) else {
            return;
        };

        let removed = self.retire(id);
        if let Some((_, mut record)) = self.inner.records.remove(&id) {
            record.state = DeploymentState::Undeployed;
            self.release_contexts(&record.instances);
        }
        info!(deployment_id = %id, consumers = removed.len(), "Deployment undeployed");

        match failure {
            None => callback(Ok(())),
            Some(e) => {
                warn!(deployment_id = %id, error = %e, "Verticle stop failed; deployment removed anyway");
                callback(Err(e));
            }
        }
    }

    /// Undeploy every running deployment; the first failure is returned after
    /// all have been attempted
    pub async fn undeploy_all(&self) -> Result<()> {
        let mut first_failure = None;
        for id in self.deployments() {
            if let Err(e) = self.undeploy(id).await {
                if !matches!(e, BusError::UnknownDeployment { .. }) {
                    first_failure.get_or_insert(e);
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Live deployments, oldest first
    pub fn deployments(&self) -> Vec<DeploymentId> {
        let mut live: Vec<(Instant, DeploymentId)> = self
            .inner
            .records
            .iter()
            .map(|record| (record.deployed_at, *record.key()))
            .collect();
        live.sort();
        live.into_iter().map(|(_, id)| id).collect()
    }

    /// `None` once a deployment is undeployed or was never known
    pub fn state(&self, id: DeploymentId) -> Option<DeploymentState> {
        self.inner.records.get(&id).map(|record| record.state)
    }

    pub fn info(&self, id: DeploymentId) -> Option<DeploymentInfo> {
        self.inner.records.get(&id).map(|record| DeploymentInfo {
            id,
            state: record.state,
            instances: record.instances.len(),
            dedicated_context: record.options.dedicated_context,
            contexts: record
                .instances
                .iter()
                .map(|slot| slot.context.name().to_string())
                .collect(),
            uptime: record.deployed_at.elapsed(),
        })
    }

    /// Stop running the deployment's tasks, then remove its consumers.
    /// Registrations racing with this are refused by the bus.
    fn retire(&self, id: DeploymentId) -> Vec<Arc<ConsumerHandle>> {
        self.inner.pool.deployments().retire(id);
        self.inner.bus.registry().unregister_owned_by(id)
    }

    fn release_contexts(&self, slots: &[InstanceSlot]) {
        for slot in slots {
            if slot.dedicated {
                self.inner.pool.close_dedicated(&slot.context);
            } else {
                self.inner.pool.release(&slot.context);
            }
        }
    }
}

/// Wrap `callback` so it runs as a fresh task on the caller's context, if
/// there is one
fn reenter_caller<T, C>(callback: C) -> impl FnOnce(T) + Send + 'static
where
    T: Send + 'static,
    C: FnOnce(T) + Send + 'static,
{
    let caller = Context::current();
    let owner = current_owner();
    move |outcome: T| match caller {
        Some(context) => {
            let target = context.id();
            if context.run_on_context_as(owner, move || callback(outcome)).is_err() {
                warn!(context_id = %target, "Caller context closed; deployment callback dropped");
            }
        }
        _ => callback(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_id_display() {
        let id = DeploymentId::new();
        assert!(id.to_string().starts_with("deployment-"));
        assert_eq!(id, DeploymentId::from_uuid(id.uuid()));
        assert_ne!(id, DeploymentId::new());
    }

    #[test]
    fn test_options_validation() {
        assert!(DeploymentOptions::default().validate().is_ok());

        let err = DeploymentOptions::new().with_instances(0).validate().unwrap_err();
        assert_eq!(err.category(), "configuration");

        let err = DeploymentOptions::new()
            .with_config(serde_json::json!([1, 2, 3]))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("JSON object"));

        assert!(DeploymentOptions::new()
            .with_config(serde_json::json!({"port": 8080}))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_barrier_reports_first_failure_after_last_arrival() {
        let barrier = Barrier::new(3, "callback");
        assert!(barrier.arrive(Ok(())).is_none());
        assert!(barrier.arrive(Err(BusError::system("first"))).is_none());

        let (callback, failure) = barrier.arrive(Err(BusError::system("second"))).unwrap();
        assert_eq!(callback, "callback");
        assert_eq!(failure, Some(BusError::system("first")));
    }
}
