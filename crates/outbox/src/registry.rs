//! Message type registry.
//!
//! Maps stable string type tags to deserialization functions, populated at
//! startup. This is how payload types are resolved on replay/consumption —
//! there is no runtime reflection anywhere in the subsystem.

use std::any::Any;
use std::collections::HashMap;

use serde::de::DeserializeOwned;

type DecodeFn = Box<dyn Fn(&str) -> Result<Box<dyn Any + Send>, serde_json::Error> + Send + Sync>;

/// Registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown message type tag: '{0}'")]
    UnknownType(String),
    #[error("failed to decode payload for type '{message_type}': {source}")]
    Decode {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload for type '{0}' decoded to an unexpected Rust type")]
    TypeMismatch(String),
}

/// Tag → deserializer registry.
#[derive(Default)]
pub struct MessageTypeRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder for `tag`. Later registrations replace earlier ones.
    pub fn register<M>(&mut self, tag: impl Into<String>)
    where
        M: DeserializeOwned + Send + 'static,
    {
        self.decoders.insert(
            tag.into(),
            Box::new(|payload| {
                serde_json::from_str::<M>(payload).map(|m| Box::new(m) as Box<dyn Any + Send>)
            }),
        );
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    pub fn registered_types(&self) -> impl Iterator<Item = &str> {
        self.decoders.keys().map(String::as_str)
    }

    /// Decode a payload to the type registered for `tag`.
    pub fn decode(&self, tag: &str, payload: &str) -> Result<Box<dyn Any + Send>, RegistryError> {
        let decoder = self
            .decoders
            .get(tag)
            .ok_or_else(|| RegistryError::UnknownType(tag.to_string()))?;
        decoder(payload).map_err(|source| RegistryError::Decode {
            message_type: tag.to_string(),
            source,
        })
    }

    /// Decode a payload and downcast to a concrete type.
    pub fn decode_as<M: 'static>(&self, tag: &str, payload: &str) -> Result<M, RegistryError> {
        let decoded = self.decode(tag, payload)?;
        decoded
            .downcast::<M>()
            .map(|boxed| *boxed)
            .map_err(|_| RegistryError::TypeMismatch(tag.to_string()))
    }
}
