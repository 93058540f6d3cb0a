//! Pluggable object serialization seam.
//!
//! The core never interprets object payloads itself: senders supply
//! `bytes + type tag`, and the receive path hands both to an
//! [`ObjectCodec`] to rebuild a value. [`BincodeRegistry`] is the
//! bundled implementation — register the concrete types a peer may
//! send and it decodes them with bincode.

use std::any::Any;
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::TetherError;

/// A decoded object, downcast by the receiver to its concrete type.
pub type DynObject = Box<dyn Any + Send>;

/// Decodes an object payload from its type tag and bytes.
pub trait ObjectCodec: Send + Sync {
    fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<DynObject, TetherError>;
}

type DecodeFn = Box<dyn Fn(&[u8]) -> Result<DynObject, TetherError> + Send + Sync>;

/// An [`ObjectCodec`] backed by bincode and an explicit type registry.
#[derive(Default)]
pub struct BincodeRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl BincodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decodable type under the tag peers will send.
    pub fn register<T>(&mut self, type_name: impl Into<String>)
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.decoders.insert(
            type_name.into(),
            Box::new(|bytes| {
                bincode::deserialize::<T>(bytes)
                    .map(|v| Box::new(v) as DynObject)
                    .map_err(|e| TetherError::Deserialization(e.to_string()))
            }),
        );
    }

    /// Serialize a value for sending as an object payload.
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TetherError> {
        bincode::serialize(value).map_err(|e| TetherError::Deserialization(e.to_string()))
    }
}

impl ObjectCodec for BincodeRegistry {
    fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<DynObject, TetherError> {
        match self.decoders.get(type_name) {
            Some(decode) => decode(bytes),
            None => Err(TetherError::Deserialization(format!(
                "no decoder registered for type '{type_name}'"
            ))),
        }
    }
}
