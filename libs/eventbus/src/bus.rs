//! Event Bus
//!
//! Addressed messaging between contexts: fire-and-forget send, publish to
//! every consumer, and request/reply with timeouts.
//!
//! A send never runs a handler inline. The bus resolves the address in the
//! registry, then enqueues a delivery task on the owning context of each
//! chosen consumer. Reply and timeout handlers always run on the sender's
//! context; senders that are not on a context get one from the pool.
//!
//! # Example
//!
//! ```rust,no_run
//! use eventbus::{ActorSystem, BusConfig};
//! use std::time::Duration;
//!
//! # async fn demo() -> eventbus::Result<()> {
//! let system = ActorSystem::new(BusConfig::default())?;
//! let bus = system.event_bus();
//!
//! bus.consumer("echo", |msg| {
//!     msg.reply(msg.body().clone())?;
//!     Ok(())
//! })?;
//!
//! let reply = bus.request("echo", "ping", Duration::from_secs(1)).await?;
//! assert_eq!(reply.body().downcast_ref::<String>().map(String::as_str), Some("ping"));
//! # Ok(())
//! # }
//! ```

use crate::cluster::{ClusterGateway, NoopGateway};
use crate::context::{current_owner, panic_message, Context};
use crate::error::{BusError, Result};
use crate::message::{Address, Body, DeliveryMode, DeliveryOptions, Envelope, Message};
use crate::metrics::{BusMetrics, BusStats};
use crate::pool::ContextPool;
use crate::registry::{AddressRegistry, ConsumerHandle, HandlerResult};
use crate::reply::{PendingReply, ReplyFuture, ReplyHandler};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

struct BusInner {
    node_id: String,
    registry: AddressRegistry,
    pool: Arc<ContextPool>,
    gateway: RwLock<Arc<dyn ClusterGateway>>,
    metrics: BusMetrics,
    default_timeout: Duration,
}

/// Handle to one event bus; cheap to clone
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("node_id", &self.inner.node_id)
            .field("consumers", &self.inner.registry.len())
            .field("default_timeout", &self.inner.default_timeout)
            .finish()
    }
}

/// Non-owning bus handle, held by cluster gateways
#[derive(Clone)]
pub struct WeakEventBus {
    inner: Weak<BusInner>,
}

impl WeakEventBus {
    pub fn upgrade(&self) -> Option<EventBus> {
        self.inner.upgrade().map(|inner| EventBus { inner })
    }
}

impl fmt::Debug for WeakEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEventBus")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl EventBus {
    pub fn new(node_id: impl Into<String>, pool: Arc<ContextPool>, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                node_id: node_id.into(),
                registry: AddressRegistry::new(),
                pool,
                gateway: RwLock::new(Arc::new(NoopGateway)),
                metrics: BusMetrics::default(),
                default_timeout,
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.inner.registry
    }

    pub fn pool(&self) -> &Arc<ContextPool> {
        &self.inner.pool
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    pub(crate) fn metrics(&self) -> &BusMetrics {
        &self.inner.metrics
    }

    pub fn stats(&self) -> BusStats {
        self.inner.metrics.snapshot()
    }

    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Install the gateway consulted when no local consumer exists
    pub fn set_cluster_gateway(&self, gateway: Arc<dyn ClusterGateway>) {
        *self.inner.gateway.write() = gateway;
    }

    pub fn has_local_consumers(&self, address: &str) -> bool {
        self.inner.registry.has_local_consumers(address)
    }

    /// Register a consumer of `address`.
    ///
    /// The handler runs on the calling context (or a pool context for external
    /// callers). Registration is marshalled onto that context, so the consumer
    /// is advertised only once the registration task has run; use
    /// [`MessageConsumer::completion_handler`] to observe it. Registration
    /// fails if the calling deployment is undeployed before it commits.
    pub fn consumer<F>(&self, address: impl AsRef<str>, handler: F) -> Result<MessageConsumer>
    where
        F: FnMut(Message) -> HandlerResult + Send + 'static,
    {
        let address = Address::new(address)?;
        let context = self.calling_context();
        let owner = current_owner();
        let handle = Arc::new(ConsumerHandle::new(
            self.inner.registry.next_consumer_id(),
            address,
            context.clone(),
            owner,
            false,
            Box::new(handler),
        ));

        let registration = Arc::new(Registration::default());
        let bus = self.clone();
        let task_handle = Arc::clone(&handle);
        let task_registration = Arc::clone(&registration);
        context.run_on_context_unchecked(owner, move || {
            let outcome = if task_registration.cancelled.load(Ordering::Acquire) {
                Err(BusError::system(format!(
                    "Consumer on {} was unregistered before registration completed",
                    task_handle.address()
                )))
            } else {
                bus.register_owned(&task_handle)
            };
            if let Err(e) = &outcome {
                debug!(address = %task_handle.address(), error = %e, "Consumer registration refused");
            }
            task_registration.settle(outcome);
        })?;

        Ok(MessageConsumer {
            handle,
            bus: self.clone(),
            registration,
        })
    }

    /// Fire-and-forget point-to-point send
    pub fn send(&self, address: impl AsRef<str>, body: impl Into<Body>) -> Result<()> {
        self.send_with_options(address, body, DeliveryOptions::default())
    }

    pub fn send_with_options(
        &self,
        address: impl AsRef<str>,
        body: impl Into<Body>,
        options: DeliveryOptions,
    ) -> Result<()> {
        let address = Address::new(address)?;
        self.inner.metrics.record_send();

        let envelope = Envelope::point_to_point(address.clone(), body.into())
            .with_sender_context(Context::current().map(|c| c.id()))
            .with_headers(options.headers);

        if !self.dispatch_point_to_point(envelope) {
            self.inner.metrics.record_no_handlers();
            debug!(address = %address, "No handlers; message dropped");
        }
        Ok(())
    }

    /// Point-to-point send whose reply (or failure) is passed to `handler` on
    /// the sender's context.
    ///
    /// Fails fast with `NO_HANDLERS` when nobody local or remote accepts the
    /// message; otherwise `REPLY_TIMEOUT` after the options' timeout or the
    /// bus default.
    pub fn send_with_reply<H>(
        &self,
        address: impl AsRef<str>,
        body: impl Into<Body>,
        options: DeliveryOptions,
        handler: H,
    ) -> Result<()>
    where
        H: FnOnce(Result<Message>) + Send + 'static,
    {
        let address = Address::new(address)?;
        self.request_inner(address, body.into(), options, Box::new(handler))
    }

    /// Request/reply as a future
    pub fn request(
        &self,
        address: impl AsRef<str>,
        body: impl Into<Body>,
        timeout: Duration,
    ) -> ReplyFuture {
        self.request_with_options(address, body, DeliveryOptions::new().with_timeout(timeout))
    }

    pub fn request_with_options(
        &self,
        address: impl AsRef<str>,
        body: impl Into<Body>,
        options: DeliveryOptions,
    ) -> ReplyFuture {
        let address = match Address::new(address) {
            Ok(address) => address,
            Err(e) => return ReplyFuture::failed(e),
        };

        let (tx, rx) = oneshot::channel();
        let handler: ReplyHandler = Box::new(move |outcome| {
            // receiver gone means the caller stopped waiting
            let _ = tx.send(outcome);
        });
        match self.request_inner(address, body.into(), options, handler) {
            Ok(()) => ReplyFuture::waiting(rx),
            Err(e) => ReplyFuture::failed(e),
        }
    }

    /// Deliver to every active consumer of `address`
    pub fn publish(&self, address: impl AsRef<str>, body: impl Into<Body>) -> Result<()> {
        self.publish_with_options(address, body, DeliveryOptions::default())
    }

    pub fn publish_with_options(
        &self,
        address: impl AsRef<str>,
        body: impl Into<Body>,
        options: DeliveryOptions,
    ) -> Result<()> {
        let address = Address::new(address)?;
        self.inner.metrics.record_publish();

        let envelope = Envelope::publish(address.clone(), body.into())
            .with_sender_context(Context::current().map(|c| c.id()))
            .with_headers(options.headers);

        let handles = self.inner.registry.resolve(address.as_str());
        if handles.is_empty() {
            if !self.try_remote(&envelope) {
                trace!(address = %address, "Published with no consumers");
            }
            return Ok(());
        }

        let envelope = Arc::new(envelope);
        for handle in handles {
            self.deliver(handle, Arc::clone(&envelope));
        }
        Ok(())
    }

    /// Inbound path for envelopes arriving from a cluster gateway; only local
    /// consumers are considered
    pub fn on_remote_envelope(&self, envelope: Envelope) {
        self.inner.metrics.record_remote_inbound();
        let address = envelope.address().clone();

        match envelope.mode() {
            DeliveryMode::Publish => {
                let envelope = Arc::new(envelope);
                for handle in self.inner.registry.resolve(address.as_str()) {
                    self.deliver(handle, Arc::clone(&envelope));
                }
            }
            DeliveryMode::PointToPoint => match self.inner.registry.next_round_robin(address.as_str()) {
                Some(handle) => {
                    self.deliver(handle, Arc::new(envelope));
                }
                None => {
                    debug!(
                        node_id = %self.inner.node_id,
                        address = %address,
                        "Remote envelope has no local consumer; dropped"
                    );
                }
            },
        }
    }

    fn request_inner(
        &self,
        address: Address,
        body: Body,
        options: DeliveryOptions,
        handler: ReplyHandler,
    ) -> Result<()> {
        self.inner.metrics.record_request();

        let sender = self.calling_context();
        let owner = current_owner();
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);
        let reply_address = Address::generate_reply();
        let pending = Arc::new(PendingReply::new(
            address.clone(),
            reply_address.clone(),
            timeout,
            handler,
        ));

        // Private reply consumer on the sender's context, advertised right
        // away so a fast reply can never miss it
        let weak_pending = Arc::downgrade(&pending);
        let bus = self.clone();
        let reply_consumer = Arc::new(ConsumerHandle::new(
            self.inner.registry.next_consumer_id(),
            reply_address.clone(),
            sender.clone(),
            owner,
            true,
            Box::new(move |reply: Message| {
                if let Some(pending) = weak_pending.upgrade() {
                    let outcome = match reply.envelope().failure() {
                        Some(failure) => Err(failure.clone()),
                        None => Ok(reply),
                    };
                    pending.complete(&bus.inner.registry, outcome);
                }
                Ok(())
            }),
        ));
        self.register_owned(&reply_consumer)?;
        pending.attach_consumer(Arc::clone(&reply_consumer));

        let bus = self.clone();
        let timer_pending = Arc::clone(&pending);
        let timer = sender.set_timer(timeout, move || {
            let error = timer_pending.timeout_error();
            if timer_pending.complete(&bus.inner.registry, Err(error)) {
                bus.inner.metrics.record_reply_timeout();
                debug!(
                    address = %timer_pending.target(),
                    timeout_ms = timer_pending.timeout().as_millis() as u64,
                    "Request timed out"
                );
            }
        });
        match timer {
            Ok(timer) => pending.attach_timer(timer),
            Err(e) => {
                self.inner.registry.unregister(&reply_consumer);
                return Err(e);
            }
        }

        let envelope = Envelope::point_to_point(address.clone(), body)
            .with_reply_address(reply_address)
            .with_timeout(timeout)
            .with_sender_context(Some(sender.id()))
            .with_headers(options.headers);

        if !self.dispatch_point_to_point(envelope) {
            self.inner.metrics.record_no_handlers();
            let bus = self.clone();
            let scheduled = sender.run_on_context_as(owner, move || {
                let error = BusError::no_handlers(pending.target().as_str());
                pending.complete(&bus.inner.registry, Err(error));
            });
            if let Err(e) = scheduled {
                warn!(address = %address, error = %e, "Sender context closed before NO_HANDLERS could be reported");
            }
        }
        Ok(())
    }

    /// Commit `handle` unless the deployment that owns it has been undeployed.
    /// Undeploy retires the deployment before sweeping its consumers, so a
    /// handle committed here is either swept or never committed.
    fn register_owned(&self, handle: &Arc<ConsumerHandle>) -> Result<()> {
        let Some(owner) = handle.owner() else {
            self.inner.registry.register(Arc::clone(handle));
            return Ok(());
        };
        self.inner
            .pool
            .deployments()
            .while_live(owner, || self.inner.registry.register(Arc::clone(handle)))
            .map(|_| ())
            .ok_or_else(|| BusError::unknown_deployment(owner))
    }

    /// Round robin over local consumers, then the gateway
    fn dispatch_point_to_point(&self, envelope: Envelope) -> bool {
        match self.inner.registry.next_round_robin(envelope.address().as_str()) {
            Some(handle) => self.deliver(handle, Arc::new(envelope)),
            None => self.try_remote(&envelope),
        }
    }

    fn try_remote(&self, envelope: &Envelope) -> bool {
        let gateway = Arc::clone(&*self.inner.gateway.read());
        let delivered = gateway.try_remote_deliver(envelope);
        if delivered {
            self.inner.metrics.record_remote_delivery();
        }
        delivered
    }

    /// Enqueue one delivery task on the consumer's context
    fn deliver(&self, handle: Arc<ConsumerHandle>, envelope: Arc<Envelope>) -> bool {
        let bus = self.clone();
        let context = handle.context().clone();
        let owner = handle.owner();
        match context.run_on_context_as(owner, move || bus.invoke_consumer(&handle, envelope)) {
            Ok(()) => true,
            Err(e) => {
                warn!(context_id = %context.id(), error = %e, "Consumer context closed; delivery dropped");
                false
            }
        }
    }

    /// Runs on the consumer's context
    fn invoke_consumer(&self, handle: &ConsumerHandle, envelope: Arc<Envelope>) {
        let message = Message::new(envelope, self.clone());
        let outcome = catch_unwind(AssertUnwindSafe(|| handle.invoke(message.clone())));
        self.inner.metrics.record_delivery();

        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
        };

        self.inner.metrics.record_handler_failure();
        error!(
            address = %handle.address(),
            consumer_id = handle.id(),
            context_id = %handle.context().id(),
            error = %failure,
            "Consumer handler failed"
        );

        if message.reply_address().is_some() && !message.has_replied() {
            let reply = BusError::handler_failure(handle.address().as_str(), failure);
            if let Err(e) = message.fail_with(reply) {
                debug!(error = %e, "Could not report handler failure to sender");
            }
        }
    }

    /// Internal send of a reply envelope
    pub(crate) fn send_reply(&self, envelope: Envelope) {
        self.inner.metrics.record_reply();
        let reply_address = envelope.address().clone();
        if !self.dispatch_point_to_point(envelope) {
            self.inner.metrics.record_dropped_reply();
            debug!(reply_address = %reply_address, "Reply has no receiver (settled or timed out); dropped");
        }
    }

    fn calling_context(&self) -> Context {
        Context::current()
            .filter(|c| c.is_active())
            .unwrap_or_else(|| self.inner.pool.external_context())
    }
}

type RegistrationWaiter = Box<dyn FnOnce(Result<()>) + Send + 'static>;

#[derive(Default)]
struct Registration {
    cancelled: AtomicBool,
    state: Mutex<RegistrationState>,
}

#[derive(Default)]
enum RegistrationState {
    #[default]
    Pending,
    Waiting(RegistrationWaiter),
    Done(Result<()>),
}

impl Registration {
    /// Runs on the owning context once the registration task is done
    fn settle(&self, outcome: Result<()>) {
        let previous = std::mem::replace(&mut *self.state.lock(), RegistrationState::Done(outcome.clone()));
        if let RegistrationState::Waiting(waiter) = previous {
            waiter(outcome);
        }
    }
}

/// Handle returned by [`EventBus::consumer`]; dropping it does not unregister
pub struct MessageConsumer {
    handle: Arc<ConsumerHandle>,
    bus: EventBus,
    registration: Arc<Registration>,
}

impl fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("handle", &self.handle)
            .finish()
    }
}

impl MessageConsumer {
    pub fn address(&self) -> &Address {
        self.handle.address()
    }

    pub fn context(&self) -> &Context {
        self.handle.context()
    }

    pub fn is_registered(&self) -> bool {
        self.handle.is_active()
    }

    /// Called on the owning context once registration has completed; runs
    /// right away (still on that context) if it already has. Handlers added
    /// before completion all run, in the order they were added.
    pub fn completion_handler<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let mut state = self.registration.state.lock();
        match std::mem::take(&mut *state) {
            RegistrationState::Done(outcome) => {
                *state = RegistrationState::Done(outcome.clone());
                drop(state);
                if let Err(e) = self.handle.context().run_on_context(move || callback(outcome)) {
                    warn!(address = %self.address(), error = %e, "Registration completion lost; context closed");
                }
            }
            RegistrationState::Pending => {
                *state = RegistrationState::Waiting(Box::new(callback));
            }
            RegistrationState::Waiting(earlier) => {
                *state = RegistrationState::Waiting(Box::new(move |outcome: Result<()>| {
                    earlier(outcome.clone());
                    callback(outcome);
                }));
            }
        }
    }

    /// Withdraw the consumer; deliveries already enqueued still run
    pub fn unregister(&self) -> bool {
        self.registration.cancelled.store(true, Ordering::Release);
        self.bus.inner.registry.unregister(&self.handle)
    }
}
