//! Addresses, Bodies and Envelopes
//!
//! Bodies are passed between local consumers as `Arc<dyn Any>` with no
//! serialization; only a cluster gateway ever runs a [`crate::codec::BodyCodec`].

use crate::bus::EventBus;
use crate::context::ContextId;
use crate::error::{BusError, Result};
use bytes::Bytes;
use std::any::Any;
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Prefix of generated single-use reply addresses
pub const REPLY_ADDRESS_PREFIX: &str = "__bus.reply.";

/// Opaque, non-empty routing key; equality is exact match
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(Arc<str>);

impl Address {
    pub fn new(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        if address.is_empty() {
            return Err(BusError::invalid_address("address must not be empty"));
        }
        Ok(Self(Arc::from(address)))
    }

    /// Fresh private address for one request's reply
    pub(crate) fn generate_reply() -> Self {
        Self(Arc::from(format!(
            "{}{}",
            REPLY_ADDRESS_PREFIX,
            Uuid::new_v4().simple()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_reply_address(&self) -> bool {
        self.0.starts_with(REPLY_ADDRESS_PREFIX)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Address {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Address {
    type Error = BusError;

    fn try_from(value: &str) -> Result<Self> {
        Address::new(value)
    }
}

impl TryFrom<String> for Address {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self> {
        Address::new(value)
    }
}

/// Opaque message payload shared by `Arc` between consumers
#[derive(Clone, Default)]
pub struct Body {
    value: Option<Arc<dyn Any + Send + Sync>>,
    type_name: Option<&'static str>,
}

impl Body {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            value: Some(value as Arc<dyn Any + Send + Sync>),
            type_name: Some(std::any::type_name::<T>()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.as_ref().map(|v| v.is::<T>()).unwrap_or(false)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|v| v.downcast_ref::<T>())
    }

    /// Name of the carried type, for diagnostics
    pub fn type_name(&self) -> Option<&'static str> {
        self.type_name
    }

    /// Whether both bodies share the same allocation
    pub fn ptr_eq(&self, other: &Body) -> bool {
        match (&self.value, &other.value) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.type_name {
            Some(name) => write!(f, "Body({})", name),
            None => f.write_str("Body(empty)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Body::new(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::new(value)
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::new(value)
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::new(value.to_string())
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Body::empty()
    }
}

/// How an envelope is routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Exactly one consumer, chosen round robin
    PointToPoint,
    /// Every consumer of the address
    Publish,
}

/// Per-send options
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    pub timeout: Option<Duration>,
    pub headers: BTreeMap<String, String>,
}

impl DeliveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// The unit exchanged between sender and consumers; immutable once dispatched
#[derive(Debug, Clone)]
pub struct Envelope {
    address: Address,
    body: Body,
    reply_address: Option<Address>,
    timeout: Option<Duration>,
    sender_context: Option<ContextId>,
    mode: DeliveryMode,
    headers: BTreeMap<String, String>,
    failure: Option<BusError>,
}

impl Envelope {
    pub fn point_to_point(address: Address, body: Body) -> Self {
        Self::new(address, body, DeliveryMode::PointToPoint)
    }

    pub fn publish(address: Address, body: Body) -> Self {
        Self::new(address, body, DeliveryMode::Publish)
    }

    fn new(address: Address, body: Body, mode: DeliveryMode) -> Self {
        Self {
            address,
            body,
            reply_address: None,
            timeout: None,
            sender_context: None,
            mode,
            headers: BTreeMap::new(),
            failure: None,
        }
    }

    pub fn with_reply_address(mut self, reply_address: Address) -> Self {
        self.reply_address = Some(reply_address);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_sender_context(mut self, context: Option<ContextId>) -> Self {
        self.sender_context = context;
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Replace the body, e.g. after a gateway decoded it
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub(crate) fn with_failure(mut self, failure: BusError) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn reply_address(&self) -> Option<&Address> {
        self.reply_address.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn sender_context(&self) -> Option<ContextId> {
        self.sender_context
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Failure carried by a failure reply
    pub fn failure(&self) -> Option<&BusError> {
        self.failure.as_ref()
    }
}

/// A delivered envelope as seen by one consumer
#[derive(Clone)]
pub struct Message {
    envelope: Arc<Envelope>,
    bus: EventBus,
    replied: Arc<AtomicBool>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("envelope", &self.envelope)
            .field("replied", &self.has_replied())
            .finish()
    }
}

impl Message {
    pub(crate) fn new(envelope: Arc<Envelope>, bus: EventBus) -> Self {
        Self {
            envelope,
            bus,
            replied: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn address(&self) -> &Address {
        self.envelope.address()
    }

    pub fn body(&self) -> &Body {
        self.envelope.body()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        self.envelope.headers()
    }

    pub fn reply_address(&self) -> Option<&Address> {
        self.envelope.reply_address()
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn has_replied(&self) -> bool {
        self.replied.load(Ordering::Acquire)
    }

    /// Reply to the sender; valid once per message
    pub fn reply(&self, body: impl Into<Body>) -> Result<()> {
        self.reply_with(body, DeliveryOptions::default())
    }

    pub fn reply_with(&self, body: impl Into<Body>, options: DeliveryOptions) -> Result<()> {
        let reply_address = self.claim_reply()?;
        let envelope = Envelope::point_to_point(reply_address, body.into()).with_headers(options.headers);
        self.bus.send_reply(envelope);
        Ok(())
    }

    /// Fail the request; the sender observes `HANDLER_FAILURE`
    pub fn fail(&self, reason: impl Into<String>) -> Result<()> {
        let failure = BusError::handler_failure(self.address().as_str(), reason);
        self.fail_with(failure)
    }

    pub(crate) fn fail_with(&self, failure: BusError) -> Result<()> {
        let reply_address = self.claim_reply()?;
        let envelope = Envelope::point_to_point(reply_address, Body::empty()).with_failure(failure);
        self.bus.send_reply(envelope);
        Ok(())
    }

    fn claim_reply(&self) -> Result<Address> {
        let reply_address = self
            .envelope
            .reply_address()
            .cloned()
            .ok_or_else(|| BusError::no_reply_address(self.address().as_str()))?;

        if self.replied.swap(true, Ordering::AcqRel) {
            warn!(
                address = %self.address(),
                reply_address = %reply_address,
                "Second reply on one message rejected"
            );
            self.bus.metrics().record_already_replied();
            return Err(BusError::already_replied(self.address().as_str()));
        }
        Ok(reply_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_validation() {
        assert!(Address::new("").is_err());
        let address = Address::new("orders").unwrap();
        assert_eq!(address.as_str(), "orders");
        assert_eq!(address, Address::try_from("orders".to_string()).unwrap());
        assert!(!address.is_reply_address());
    }

    #[test]
    fn test_reply_addresses_are_unique() {
        let a = Address::generate_reply();
        let b = Address::generate_reply();
        assert_ne!(a, b);
        assert!(a.is_reply_address());
    }

    #[test]
    fn test_body_downcast() {
        let body = Body::from(vec![0u8; 16]);
        assert!(body.is::<Vec<u8>>());
        assert_eq!(body.downcast_ref::<Vec<u8>>().map(Vec::len), Some(16));
        assert!(body.downcast_ref::<String>().is_none());

        let copy = body.clone();
        assert!(copy.ptr_eq(&body));
        assert!(Body::empty().is_empty());
        assert_eq!(format!("{:?}", Body::empty()), "Body(empty)");
    }

    #[test]
    fn test_envelope_builder() {
        let envelope = Envelope::point_to_point(Address::new("a").unwrap(), Body::from("hi"))
            .with_reply_address(Address::new("r").unwrap())
            .with_timeout(Duration::from_millis(5))
            .with_sender_context(Some(ContextId::new(3)));

        assert_eq!(envelope.mode(), DeliveryMode::PointToPoint);
        assert_eq!(envelope.reply_address().map(Address::as_str), Some("r"));
        assert_eq!(envelope.timeout(), Some(Duration::from_millis(5)));
        assert_eq!(envelope.sender_context(), Some(ContextId::new(3)));
        assert!(envelope.failure().is_none());
    }
}
