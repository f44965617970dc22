//! Body Codecs
//!
//! Local delivery passes bodies as `Arc<dyn Any>` and never serializes.
//! Codecs are only used by cluster gateways when an envelope leaves the node.
//!
//! Every encoding starts with a one-byte tag so an empty body survives the
//! round trip distinctly from an empty payload.

use crate::error::{BusError, Result};
use crate::message::Body;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

const TAG_EMPTY: u8 = 0;
const TAG_VALUE: u8 = 1;

/// Turns bodies into bytes and back for transport between nodes
pub trait BodyCodec: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn encode(&self, body: &Body) -> Result<Bytes>;

    fn decode(&self, bytes: &[u8]) -> Result<Body>;
}

fn empty_frame() -> Bytes {
    Bytes::from_static(&[TAG_EMPTY])
}

fn value_frame(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 1);
    frame.put_u8(TAG_VALUE);
    frame.put_slice(payload);
    frame.freeze()
}

/// Split a frame into its payload, `None` for an empty body
fn split_frame<'a>(codec: &str, bytes: &'a [u8]) -> Result<Option<&'a [u8]>> {
    match bytes.split_first() {
        Some((&TAG_EMPTY, [])) => Ok(None),
        Some((&TAG_VALUE, payload)) => Ok(Some(payload)),
        Some((tag, _)) => Err(BusError::codec(codec, format!("unknown frame tag {}", tag))),
        None => Err(BusError::codec(codec, "empty frame")),
    }
}

fn wrong_type<T: Any>(codec: &str, body: &Body) -> BusError {
    BusError::codec(
        codec,
        format!(
            "expected {}, body holds {}",
            std::any::type_name::<T>(),
            body.type_name().unwrap_or("nothing")
        ),
    )
}

/// Raw bytes; accepts `Bytes` or `Vec<u8>` bodies and always decodes to `Bytes`
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl BodyCodec for BytesCodec {
    fn name(&self) -> &str {
        "bytes"
    }

    fn encode(&self, body: &Body) -> Result<Bytes> {
        if body.is_empty() {
            return Ok(empty_frame());
        }
        if let Some(bytes) = body.downcast_ref::<Bytes>() {
            return Ok(value_frame(bytes));
        }
        if let Some(bytes) = body.downcast_ref::<Vec<u8>>() {
            return Ok(value_frame(bytes));
        }
        Err(wrong_type::<Bytes>(self.name(), body))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Body> {
        Ok(match split_frame(self.name(), bytes)? {
            None => Body::empty(),
            Some(payload) => Body::new(Bytes::copy_from_slice(payload)),
        })
    }
}

/// JSON via serde_json for bodies of type `T`
pub struct JsonCodec<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            name: format!("json<{}>", std::any::type_name::<T>()),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCodec").field("name", &self.name).finish()
    }
}

impl<T> BodyCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, body: &Body) -> Result<Bytes> {
        if body.is_empty() {
            return Ok(empty_frame());
        }
        let value = body
            .downcast_ref::<T>()
            .ok_or_else(|| wrong_type::<T>(&self.name, body))?;
        let json = serde_json::to_vec(value).map_err(|e| BusError::codec(&self.name, e.to_string()))?;
        Ok(value_frame(&json))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Body> {
        match split_frame(&self.name, bytes)? {
            None => Ok(Body::empty()),
            Some(payload) => serde_json::from_slice::<T>(payload)
                .map(Body::new)
                .map_err(|e| BusError::codec(&self.name, e.to_string())),
        }
    }
}

/// Compact binary encoding via bincode for bodies of type `T`
pub struct BincodeCodec<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self {
            name: format!("bincode<{}>", std::any::type_name::<T>()),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BincodeCodec").field("name", &self.name).finish()
    }
}

impl<T> BodyCodec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, body: &Body) -> Result<Bytes> {
        if body.is_empty() {
            return Ok(empty_frame());
        }
        let value = body
            .downcast_ref::<T>()
            .ok_or_else(|| wrong_type::<T>(&self.name, body))?;
        let payload = bincode::serialize(value).map_err(|e| BusError::codec(&self.name, e.to_string()))?;
        Ok(value_frame(&payload))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Body> {
        match split_frame(&self.name, bytes)? {
            None => Ok(Body::empty()),
            Some(payload) => bincode::deserialize::<T>(payload)
                .map(Body::new)
                .map_err(|e| BusError::codec(&self.name, e.to_string())),
        }
    }
}
