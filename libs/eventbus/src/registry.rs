//! Address Registry
//!
//! Maps each address to its ordered list of consumer handles. Mutated from
//! any thread, read on every dispatch.
//!
//! Handler lists are copy-on-write: a dispatch takes a cheap `Arc` snapshot
//! and never observes a half-applied registration.

use crate::context::Context;
use crate::deployment::DeploymentId;
use crate::message::{Address, Message};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Registration sequence number
pub type ConsumerId = u64;

/// Result type of user message handlers
pub type HandlerResult = anyhow::Result<()>;

/// Boxed message handler stored in a consumer handle
pub type HandlerFn = Box<dyn FnMut(Message) -> HandlerResult + Send + 'static>;

/// One registered consumer of an address
pub struct ConsumerHandle {
    id: ConsumerId,
    address: Address,
    context: Context,
    owner: Option<DeploymentId>,
    private: bool,
    active: AtomicBool,
    handler: Mutex<HandlerFn>,
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("context", &self.context.id())
            .field("owner", &self.owner)
            .field("private", &self.private)
            .field("active", &self.is_active())
            .finish()
    }
}

impl ConsumerHandle {
    pub(crate) fn new(
        id: ConsumerId,
        address: Address,
        context: Context,
        owner: Option<DeploymentId>,
        private: bool,
        handler: HandlerFn,
    ) -> Self {
        Self {
            id,
            address,
            context,
            owner,
            private,
            active: AtomicBool::new(false),
            handler: Mutex::new(handler),
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Owning context; fixed for the handle's lifetime
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn owner(&self) -> Option<DeploymentId> {
        self.owner
    }

    /// Reply consumers are private
    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Advertised in the registry
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Run the handler; only ever called from the owning context
    pub(crate) fn invoke(&self, message: Message) -> HandlerResult {
        let mut handler = self.handler.lock();
        (*handler)(message)
    }
}

#[derive(Debug, Default)]
struct AddressEntry {
    handlers: Arc<Vec<Arc<ConsumerHandle>>>,
    cursor: AtomicUsize,
}

/// Concurrent address → consumers map
#[derive(Debug, Default)]
pub struct AddressRegistry {
    entries: DashMap<Address, AddressEntry>,
    next_id: AtomicU64,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_consumer_id(&self) -> ConsumerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Advertise a handle; returns false if it was already registered
    pub fn register(&self, handle: Arc<ConsumerHandle>) -> bool {
        let mut entry = self.entries.entry(handle.address.clone()).or_default();
        if entry.handlers.iter().any(|h| h.id == handle.id) {
            return false;
        }

        handle.active.store(true, Ordering::Release);
        debug!(
            address = %handle.address,
            consumer_id = handle.id,
            context_id = %handle.context.id(),
            "Consumer registered"
        );
        Arc::make_mut(&mut entry.handlers).push(handle);
        true
    }

    /// Withdraw a handle; the removal is the commit point after which no new
    /// delivery selects it
    pub fn unregister(&self, handle: &ConsumerHandle) -> bool {
        let mut entry = match self.entries.get_mut(handle.address.as_str()) {
            Some(entry) => entry,
            None => return false,
        };

        let handlers = Arc::make_mut(&mut entry.handlers);
        let before = handlers.len();
        handlers.retain(|h| h.id != handle.id);
        let removed = handlers.len() != before;
        drop(entry);

        if removed {
            handle.active.store(false, Ordering::Release);
            self.entries
                .remove_if(handle.address.as_str(), |_, e| e.handlers.is_empty());
            debug!(address = %handle.address, consumer_id = handle.id, "Consumer unregistered");
        }
        removed
    }

    /// Snapshot of the active handles of `address`, in registration order
    pub fn resolve(&self, address: &str) -> Vec<Arc<ConsumerHandle>> {
        self.entries
            .get(address)
            .map(|entry| entry.handlers.as_ref().clone())
            .unwrap_or_default()
    }

    /// Next recipient for a point-to-point send.
    ///
    /// The per-address cursor only grows; the handle at `cursor mod len` is
    /// chosen, so a size change simply rewraps.
    pub fn next_round_robin(&self, address: &str) -> Option<Arc<ConsumerHandle>> {
        let entry = self.entries.get(address)?;
        let len = entry.handlers.len();
        if len == 0 {
            return None;
        }
        let index = entry.cursor.fetch_add(1, Ordering::Relaxed) % len;
        entry.handlers.get(index).cloned()
    }

    /// Remove every handle registered on behalf of `owner`
    pub fn unregister_owned_by(&self, owner: DeploymentId) -> Vec<Arc<ConsumerHandle>> {
        let owned: Vec<Arc<ConsumerHandle>> = self
            .entries
            .iter()
            .flat_map(|entry| {
                entry
                    .handlers
                    .iter()
                    .filter(|h| h.owner == Some(owner))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        owned
            .into_iter()
            .filter(|handle| self.unregister(handle))
            .collect()
    }

    pub fn has_local_consumers(&self, address: &str) -> bool {
        self.entries
            .get(address)
            .map(|entry| !entry.handlers.is_empty())
            .unwrap_or(false)
    }

    pub fn consumer_count(&self, address: &str) -> usize {
        self.entries
            .get(address)
            .map(|entry| entry.handlers.len())
            .unwrap_or(0)
    }

    /// Addresses with at least one consumer, private reply addresses excluded
    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self
            .entries
            .iter()
            .filter(|entry| !entry.key().is_reply_address())
            .map(|entry| entry.key().clone())
            .collect();
        addresses.sort();
        addresses
    }

    /// Total registered handles
    pub fn len(&self) -> usize {
        self.entries.iter().map(|entry| entry.handlers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration
    pub fn clear(&self) {
        for entry in self.entries.iter() {
            for handle in entry.handlers.iter() {
                handle.active.store(false, Ordering::Release);
            }
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextId;
    use proptest::prelude::*;

    fn handle(
        registry: &AddressRegistry,
        context: &Context,
        address: &str,
        owner: Option<DeploymentId>,
    ) -> Arc<ConsumerHandle> {
        Arc::new(ConsumerHandle::new(
            registry.next_consumer_id(),
            Address::new(address).unwrap(),
            context.clone(),
            owner,
            false,
            Box::new(|_| Ok(())),
        ))
    }

    fn test_context() -> Context {
        Context::spawn(ContextId::new(0), "registry-test").unwrap()
    }

    #[test]
    fn test_register_and_resolve_in_order() {
        let ctx = test_context();
        let registry = AddressRegistry::new();

        let a = handle(&registry, &ctx, "orders", None);
        let b = handle(&registry, &ctx, "orders", None);
        assert!(registry.register(a.clone()));
        assert!(registry.register(b.clone()));
        assert!(!registry.register(a.clone()));

        let ids: Vec<ConsumerId> = registry.resolve("orders").iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id()]);
        assert!(a.is_active());
        assert_eq!(registry.len(), 2);
        assert!(registry.resolve("missing").is_empty());

        ctx.close();
    }

    #[test]
    fn test_unregister_removes_empty_entries() {
        let ctx = test_context();
        let registry = AddressRegistry::new();

        let a = handle(&registry, &ctx, "orders", None);
        registry.register(a.clone());
        let snapshot = registry.resolve("orders");

        assert!(registry.unregister(&a));
        assert!(!registry.unregister(&a));
        assert!(!a.is_active());
        assert!(!registry.has_local_consumers("orders"));
        assert!(registry.addresses().is_empty());
        // earlier snapshots are unaffected
        assert_eq!(snapshot.len(), 1);

        ctx.close();
    }

    #[test]
    fn test_unregister_owned_by() {
        let ctx = test_context();
        let registry = AddressRegistry::new();
        let owner = DeploymentId::new();

        registry.register(handle(&registry, &ctx, "a", Some(owner)));
        registry.register(handle(&registry, &ctx, "b", Some(owner)));
        registry.register(handle(&registry, &ctx, "b", None));

        let removed = registry.unregister_owned_by(owner);
        assert_eq!(removed.len(), 2);
        assert!(!registry.has_local_consumers("a"));
        assert_eq!(registry.consumer_count("b"), 1);
        assert_eq!(registry.addresses(), vec![Address::new("b").unwrap()]);

        ctx.close();
    }

    #[test]
    fn test_round_robin_rewraps_after_removal() {
        let ctx = test_context();
        let registry = AddressRegistry::new();
        let handles: Vec<_> = (0..3).map(|_| handle(&registry, &ctx, "rr", None)).collect();
        for h in &handles {
            registry.register(h.clone());
        }

        let picks: Vec<ConsumerId> = (0..3)
            .filter_map(|_| registry.next_round_robin("rr"))
            .map(|h| h.id())
            .collect();
        assert_eq!(picks, handles.iter().map(|h| h.id()).collect::<Vec<_>>());

        registry.unregister(&handles[1]);
        let picks: Vec<ConsumerId> = (0..4)
            .filter_map(|_| registry.next_round_robin("rr"))
            .map(|h| h.id())
            .collect();
        // cursor is 3, list is [h0, h2]
        assert_eq!(
            picks,
            vec![handles[2].id(), handles[0].id(), handles[2].id(), handles[0].id()]
        );

        registry.clear();
        assert!(registry.next_round_robin("rr").is_none());
        assert!(!handles[0].is_active());
        ctx.close();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_round_robin_visits_each_once_per_cycle(consumers in 1usize..12, cycles in 1usize..6) {
            let ctx = test_context();
            let registry = AddressRegistry::new();
            let handles: Vec<_> = (0..consumers)
                .map(|_| handle(&registry, &ctx, "prop", None))
                .collect();
            for h in &handles {
                registry.register(h.clone());
            }

            for _ in 0..cycles {
                let picked: Vec<ConsumerId> = (0..consumers)
                    .filter_map(|_| registry.next_round_robin("prop"))
                    .map(|h| h.id())
                    .collect();
                let expected: Vec<ConsumerId> = handles.iter().map(|h| h.id()).collect();
                prop_assert_eq!(picked, expected);
            }
            ctx.close();
        }
    }
}
