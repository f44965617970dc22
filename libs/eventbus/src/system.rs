//! Actor System
//!
//! Top-level handle that owns the context pool, the event bus and the
//! deployment manager for one node.
//!
//! # Shutdown order
//!
//! 1. Undeploy every deployment (stop callbacks run on their contexts)
//! 2. Clear the address registry
//! 3. Close and join every context; queued tasks and timers are discarded
//!
//! Dropping the last handle of a system that was never shut down closes its
//! contexts without waiting for them.

use crate::bus::EventBus;
use crate::context::{Context, ContextStats, TimerHandle};
use crate::deployment::{DeploymentId, DeploymentManager, DeploymentOptions, DeploymentState};
use crate::error::{BusError, Result};
use crate::metrics::BusStats;
use crate::pool::ContextPool;
use crate::verticle::Verticle;
use bus_config::BusConfig;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// One node: pool, bus and deployments
#[derive(Debug, Clone)]
pub struct ActorSystem {
    config: Arc<BusConfig>,
    pool: Arc<ContextPool>,
    bus: EventBus,
    deployments: DeploymentManager,
    system_id: String,
    guard: Arc<ShutdownGuard>,
}

/// Shared by every clone of one system
#[derive(Debug)]
struct ShutdownGuard {
    pool: Arc<ContextPool>,
    shut_down: AtomicBool,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire) {
            warn!("Actor system dropped without shutdown; closing its contexts");
            self.pool.close();
        }
    }
}

/// System statistics snapshot
#[derive(Debug, Clone)]
pub struct SystemStats {
    pub system_id: String,
    pub deployments: usize,
    pub consumers: usize,
    pub bus: BusStats,
    pub contexts: Vec<ContextStats>,
}

impl SystemStats {
    pub fn tasks_executed(&self) -> u64 {
        self.contexts.iter().map(|c| c.tasks_executed).sum()
    }
}

impl ActorSystem {
    /// Start the context pool described by `config`
    pub fn new(config: BusConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| BusError::configuration(format!("{:#}", e), None))?;

        let system_id = if config.node_id.is_empty() {
            format!("system-{}", Uuid::new_v4().simple())
        } else {
            config.node_id.clone()
        };
        info!(
            system_id = %system_id,
            pool_size = config.pool_size,
            policy = ?config.assignment_policy,
            "Creating actor system"
        );

        let pool = Arc::new(ContextPool::new(
            config.pool_size,
            config.assignment_policy,
            &config.context_name_prefix,
        )?);
        let bus = EventBus::new(system_id.clone(), Arc::clone(&pool), config.default_request_timeout());
        let deployments = DeploymentManager::new(bus.clone(), Arc::clone(&pool));

        Ok(Self {
            config: Arc::new(config),
            guard: Arc::new(ShutdownGuard {
                pool: Arc::clone(&pool),
                shut_down: AtomicBool::new(false),
            }),
            pool,
            bus,
            deployments,
            system_id,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(BusConfig::default())
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn deployments(&self) -> &DeploymentManager {
        &self.deployments
    }

    pub fn pool(&self) -> &Arc<ContextPool> {
        &self.pool
    }

    /// Deploy with `default_instances` from the configuration
    pub async fn deploy<F, V>(&self, factory: F) -> Result<DeploymentId>
    where
        F: Fn() -> anyhow::Result<V> + Send + Sync + 'static,
        V: Verticle,
    {
        let options = DeploymentOptions::new().with_instances(self.config.default_instances);
        self.deployments.deploy(factory, options).await
    }

    pub async fn deploy_with_options<F, V>(&self, factory: F, options: DeploymentOptions) -> Result<DeploymentId>
    where
        F: Fn() -> anyhow::Result<V> + Send + Sync + 'static,
        V: Verticle,
    {
        self.deployments.deploy(factory, options).await
    }

    pub async fn deploy_verticle<V: Verticle>(&self, verticle: V) -> Result<DeploymentId> {
        self.deployments.deploy_verticle(verticle).await
    }

    pub async fn undeploy(&self, id: DeploymentId) -> Result<()> {
        self.deployments.undeploy(id).await
    }

    pub fn deployment_state(&self, id: DeploymentId) -> Option<DeploymentState> {
        self.deployments.state(id)
    }

    /// Context tasks land on: the caller's own, else one from the pool
    fn target_context(&self) -> Context {
        Context::current().unwrap_or_else(|| self.pool.external_context())
    }

    pub fn run_on_context<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.target_context().run_on_context(task)
    }

    pub fn run_repeatedly<F>(&self, step: F) -> Result<()>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        self.target_context().run_repeatedly(step)
    }

    pub fn set_timer<F>(&self, delay: Duration, task: F) -> Result<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.target_context().set_timer(delay, task)
    }

    pub fn stats(&self) -> SystemStats {
        SystemStats {
            system_id: self.system_id.clone(),
            deployments: self.deployments.deployments().len(),
            consumers: self.bus.registry().len(),
            bus: self.bus.stats(),
            contexts: self.pool.stats(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.guard.shut_down.load(Ordering::Acquire)
    }

    /// Undeploy everything, then close and join every context
    pub async fn shutdown(&self) -> Result<()> {
        if self.guard.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(system_id = %self.system_id, "Shutting down actor system");

        let ids = self.deployments.deployments();
        let undeploys: Vec<_> = ids.iter().map(|id| self.deployments.undeploy(*id)).collect();
        for (id, result) in ids.iter().zip(futures::future::join_all(undeploys).await) {
            if let Err(e) = result {
                warn!(deployment_id = %id, error = %e, "Undeploy failed during shutdown");
            }
        }

        self.bus.registry().clear();

        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || pool.shutdown())
            .await
            .map_err(|e| BusError::system(format!("Context pool shutdown task failed: {}", e)))??;

        info!(system_id = %self.system_id, "Actor system shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextState;

    fn small_config() -> BusConfig {
        BusConfig {
            pool_size: 2,
            ..BusConfig::default()
        }
    }

    #[tokio::test]
    async fn test_system_lifecycle() {
        let system = ActorSystem::new(small_config()).unwrap();
        assert_eq!(system.pool().size(), 2);
        assert!(system.system_id().starts_with("system-"));

        let (tx, rx) = tokio::sync::oneshot::channel();
        system.run_on_context(move || {
            let _ = tx.send(Context::current().is_some());
        })
        .unwrap();
        assert!(rx.await.unwrap());

        system.shutdown().await.unwrap();
        assert!(system.is_shut_down());
        assert!(system
            .stats()
            .contexts
            .iter()
            .all(|c| c.state == ContextState::Closed));
        // second shutdown is a no-op
        system.shutdown().await.unwrap();
    }

    #[test]
    fn test_dropping_last_handle_closes_contexts() {
        let system = ActorSystem::new(small_config()).unwrap();
        let contexts: Vec<Context> = system.pool().contexts().to_vec();
        let clone = system.clone();

        drop(system);
        assert!(contexts.iter().all(Context::is_active));

        drop(clone);
        for context in &contexts {
            context.join().unwrap();
            assert_eq!(context.state(), ContextState::Closed);
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = BusConfig {
            default_request_timeout_ms: 0,
            ..small_config()
        };
        let err = ActorSystem::new(config).unwrap_err();
        assert_eq!(err.category(), "configuration");
    }
}
