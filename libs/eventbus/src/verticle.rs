//! Verticle contract
//!
//! A verticle is the unit of deployment. All of its lifecycle callbacks and
//! every consumer it registers run on the one context it was assigned.

use crate::bus::EventBus;
use crate::context::Context;
use crate::deployment::DeploymentId;
use crate::error::{BusError, Result};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

/// Deployable actor
///
/// ```rust,no_run
/// use eventbus::{Completion, Verticle, VerticleContext};
///
/// struct Echo;
///
/// impl Verticle for Echo {
///     fn start(&mut self, ctx: &VerticleContext, done: Completion) {
///         match ctx.bus().consumer("echo", |msg| {
///             msg.reply(msg.body().clone())?;
///             Ok(())
///         }) {
///             Ok(consumer) => consumer.completion_handler(move |r| done.resolve(r)),
///             Err(e) => done.resolve(Err(e)),
///         }
///     }
/// }
/// ```
pub trait Verticle: Send + 'static {
    /// Signal `done` once the verticle is ready, typically after its
    /// consumers report registration
    fn start(&mut self, ctx: &VerticleContext, done: Completion);

    fn stop(&mut self, ctx: &VerticleContext, done: Completion) {
        let _ = ctx;
        done.complete();
    }
}

type CompletionCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Single-use success/failure signal for a lifecycle callback.
///
/// Dropping it without signalling counts as a failure.
pub struct Completion {
    phase: &'static str,
    callback: Option<CompletionCallback>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("phase", &self.phase)
            .field("signalled", &self.callback.is_none())
            .finish()
    }
}

impl Completion {
    pub(crate) fn new<F>(phase: &'static str, callback: F) -> Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        Self {
            phase,
            callback: Some(Box::new(callback)),
        }
    }

    pub fn complete(self) {
        self.resolve(Ok(()));
    }

    pub fn fail(self, reason: impl fmt::Display) {
        let error = BusError::system(format!("{} failed: {}", self.phase, reason));
        self.resolve(Err(error));
    }

    pub fn resolve(mut self, outcome: Result<()>) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(BusError::system(format!(
                "{} ended without signalling completion",
                self.phase
            ))));
        }
    }
}

/// What a verticle instance sees of its deployment
#[derive(Debug, Clone)]
pub struct VerticleContext {
    deployment_id: DeploymentId,
    instance: usize,
    bus: EventBus,
    context: Context,
    config: Arc<serde_json::Value>,
}

impl VerticleContext {
    pub(crate) fn new(
        deployment_id: DeploymentId,
        instance: usize,
        bus: EventBus,
        context: Context,
        config: Arc<serde_json::Value>,
    ) -> Self {
        Self {
            deployment_id,
            instance,
            bus,
            context,
            config,
        }
    }

    pub fn deployment_id(&self) -> DeploymentId {
        self.deployment_id
    }

    /// Index of this instance within its deployment
    pub fn instance(&self) -> usize {
        self.instance
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The context every callback of this instance runs on
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    /// Deserialize the deployment config into a typed struct
    pub fn config_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.config.as_ref().clone()).map_err(|e| {
            BusError::configuration(
                format!("Invalid config for {}: {}", self.deployment_id, e),
                Some("config"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording(phase: &'static str) -> (Completion, Arc<Mutex<Vec<Result<()>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Completion::new(phase, move |r| sink.lock().push(r)), seen)
    }

    #[test]
    fn test_completion_signals_once() {
        let (done, seen) = recording("start");
        done.complete();
        assert_eq!(seen.lock().as_slice(), &[Ok(())]);
    }

    #[test]
    fn test_dropped_completion_fails() {
        let (done, seen) = recording("start");
        drop(done);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let err = seen[0].clone().unwrap_err();
        assert!(err.to_string().contains("start ended without signalling completion"));
    }

    #[test]
    fn test_fail_carries_reason() {
        let (done, seen) = recording("stop");
        done.fail("disk full");
        let err = seen.lock()[0].clone().unwrap_err();
        assert!(err.to_string().contains("stop failed: disk full"));
    }
}
