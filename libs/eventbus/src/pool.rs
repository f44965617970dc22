//! Context Pool
//!
//! Fixed set of contexts created at startup, each bound to one worker thread.
//! Deployments are assigned a context for their whole lifetime. Every context
//! of the pool, dedicated ones included, shares the pool's [`LiveDeployments`].

use crate::context::{Context, ContextId, ContextStats, LiveDeployments};
use crate::error::{BusError, Result};
use bus_config::AssignmentPolicy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fixed pool of event-loop contexts
#[derive(Debug)]
pub struct ContextPool {
    contexts: Vec<Context>,
    /// Live assignments per pooled context
    load: Vec<AtomicUsize>,
    policy: AssignmentPolicy,
    assign_cursor: AtomicUsize,
    external_cursor: AtomicUsize,
    /// Contexts created for a single deployment
    dedicated: Mutex<Vec<Context>>,
    next_dedicated_id: AtomicUsize,
    name_prefix: String,
    deployments: Arc<LiveDeployments>,
}

impl ContextPool {
    /// Start `size` contexts named `<prefix>-<n>`
    pub fn new(size: usize, policy: AssignmentPolicy, name_prefix: &str) -> Result<Self> {
        if size == 0 {
            return Err(BusError::configuration(
                "Context pool must contain at least one context",
                Some("pool_size"),
            ));
        }

        let deployments = Arc::new(LiveDeployments::new());
        let mut contexts = Vec::with_capacity(size);
        for index in 0..size {
            let name = format!("{}-{}", name_prefix, index);
            match Context::spawn_tracked(ContextId::new(index), name, Arc::clone(&deployments)) {
                Ok(context) => contexts.push(context),
                Err(e) => {
                    for started in &contexts {
                        started.close();
                    }
                    return Err(e);
                }
            }
        }

        info!(pool_size = size, policy = ?policy, "Context pool started");

        Ok(Self {
            load: (0..size).map(|_| AtomicUsize::new(0)).collect(),
            contexts,
            policy,
            assign_cursor: AtomicUsize::new(0),
            external_cursor: AtomicUsize::new(0),
            dedicated: Mutex::new(Vec::new()),
            next_dedicated_id: AtomicUsize::new(size),
            name_prefix: name_prefix.to_string(),
            deployments,
        })
    }

    pub fn size(&self) -> usize {
        self.contexts.len()
    }

    pub fn policy(&self) -> AssignmentPolicy {
        self.policy
    }

    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    /// Deployments whose tasks the pool's contexts still run
    pub fn deployments(&self) -> &Arc<LiveDeployments> {
        &self.deployments
    }

    /// Assign a pooled context to a deployment instance.
    ///
    /// `RoundRobin` hands out context `k mod N` to the k-th assignment.
    /// `LeastLoaded` picks the fewest live assignments, lowest index on ties.
    pub fn assign(&self) -> Context {
        let index = match self.policy {
            AssignmentPolicy::RoundRobin => {
                self.assign_cursor.fetch_add(1, Ordering::Relaxed) % self.contexts.len()
            }
            AssignmentPolicy::LeastLoaded => self
                .load
                .iter()
                .enumerate()
                .min_by_key(|(index, load)| (load.load(Ordering::Relaxed), *index))
                .map(|(index, _)| index)
                .unwrap_or(0),
        };

        self.load[index].fetch_add(1, Ordering::Relaxed);
        let context = self.contexts[index].clone();
        debug!(context_id = %context.id(), "Assigned pooled context");
        context
    }

    /// Return an assignment made by [`ContextPool::assign`]
    pub fn release(&self, context: &Context) {
        if let Some(index) = self.pooled_index(context) {
            let released = self.load[index].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                n.checked_sub(1)
            });
            if released.is_err() {
                warn!(context_id = %context.id(), "Released a context with no live assignments");
            }
        }
    }

    /// Create an extra context owned by one deployment
    pub fn dedicated(&self) -> Result<Context> {
        let index = self.next_dedicated_id.fetch_add(1, Ordering::Relaxed);
        let context = Context::spawn_tracked(
            ContextId::new(index),
            format!("{}-dedicated-{}", self.name_prefix, index),
            Arc::clone(&self.deployments),
        )?;
        self.dedicated.lock().push(context.clone());
        Ok(context)
    }

    /// Close a dedicated context and forget it
    pub fn close_dedicated(&self, context: &Context) {
        self.dedicated.lock().retain(|c| c != context);
        context.close();
    }

    /// Context used for callbacks of senders that are not on a context
    pub fn external_context(&self) -> Context {
        let index = self.external_cursor.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        self.contexts[index].clone()
    }

    pub fn is_pooled(&self, context: &Context) -> bool {
        self.pooled_index(context).is_some()
    }

    /// Live assignments of each pooled context, by index
    pub fn loads(&self) -> Vec<usize> {
        self.load.iter().map(|l| l.load(Ordering::Relaxed)).collect()
    }

    pub fn stats(&self) -> Vec<ContextStats> {
        let dedicated = self.dedicated.lock().clone();
        self.contexts
            .iter()
            .chain(dedicated.iter())
            .map(Context::stats)
            .collect()
    }

    /// Signal every context to close without waiting for the workers
    pub fn close(&self) {
        for context in self.contexts.iter().chain(self.dedicated.lock().iter()) {
            context.close();
        }
    }

    /// Close every context and wait for the worker threads
    pub fn shutdown(&self) -> Result<()> {
        let dedicated: Vec<Context> = self.dedicated.lock().drain(..).collect();
        let all: Vec<&Context> = self.contexts.iter().chain(dedicated.iter()).collect();

        for context in &all {
            context.close();
        }
        for context in &all {
            if context.is_current() {
                warn!(context_id = %context.id(), "Pool shut down from its own context; not joining");
                continue;
            }
            context.join()?;
        }
        info!(pool_size = self.contexts.len(), "Context pool shut down");
        Ok(())
    }

    fn pooled_index(&self, context: &Context) -> Option<usize> {
        self.contexts.iter().position(|c| c == context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_assignment() {
        let pool = ContextPool::new(3, AssignmentPolicy::RoundRobin, "rr").unwrap();

        let ids: Vec<usize> = (0..6).map(|_| pool.assign().id().index()).collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(pool.loads(), vec![2, 2, 2]);

        pool.shutdown().unwrap();
    }

    #[test]
    fn test_least_loaded_assignment() {
        let pool = ContextPool::new(3, AssignmentPolicy::LeastLoaded, "ll").unwrap();

        let first = pool.assign();
        let second = pool.assign();
        let third = pool.assign();
        assert_eq!(
            vec![first.id().index(), second.id().index(), third.id().index()],
            vec![0, 1, 2]
        );

        pool.release(&second);
        assert_eq!(pool.assign().id().index(), 1);
        assert_eq!(pool.loads(), vec![1, 1, 1]);

        pool.shutdown().unwrap();
    }

    #[test]
    fn test_dedicated_context_lifecycle() {
        let pool = ContextPool::new(1, AssignmentPolicy::RoundRobin, "ded").unwrap();

        let dedicated = pool.dedicated().unwrap();
        assert!(!pool.is_pooled(&dedicated));
        assert_eq!(dedicated.id().index(), 1);
        assert_eq!(pool.stats().len(), 2);

        pool.close_dedicated(&dedicated);
        dedicated.join().unwrap();
        assert!(!dedicated.is_active());
        assert_eq!(pool.stats().len(), 1);

        pool.shutdown().unwrap();
    }

    #[test]
    fn test_empty_pool_rejected() {
        let err = ContextPool::new(0, AssignmentPolicy::RoundRobin, "empty").unwrap_err();
        assert_eq!(err.category(), "configuration");
    }
}
