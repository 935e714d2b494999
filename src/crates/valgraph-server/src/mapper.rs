//! Outbound state normalization.
//!
//! Internal channel values never reach the wire verbatim. Each channel a
//! deployment streams registers a [`StateMapper`] that builds the
//! client-facing view; a mapper that cannot produce its required fields
//! fails loudly and the boundary emits an `error` event instead of partial
//! JSON. Channels without a registered mapper pass through unchanged.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Mapper failure: surfaced as a `validation` error event
#[derive(Debug, Error)]
#[error("Mapper for channel '{channel}' failed: {message}")]
pub struct MapperError {
    /// The channel whose mapper failed
    pub channel: String,
    /// What went wrong
    pub message: String,
}

/// Builds the normalized outbound view of one channel's value
pub trait StateMapper: Send + Sync {
    /// Map an internal value to its wire shape
    fn map(&self, value: &Value) -> Result<Value, String>;
}

impl<F> StateMapper for F
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync,
{
    fn map(&self, value: &Value) -> Result<Value, String> {
        self(value)
    }
}

/// A mapper that projects named fields and requires them to exist
pub struct FieldProjection {
    required: Vec<String>,
    optional: Vec<String>,
}

impl FieldProjection {
    /// Project the given required fields
    pub fn required<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: fields.into_iter().map(Into::into).collect(),
            optional: Vec::new(),
        }
    }

    /// Additionally project these fields when present
    pub fn with_optional<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional = fields.into_iter().map(Into::into).collect();
        self
    }
}

impl StateMapper for FieldProjection {
    fn map(&self, value: &Value) -> Result<Value, String> {
        let Some(object) = value.as_object() else {
            return Err("expected an object".to_string());
        };
        let mut out = serde_json::Map::new();
        for field in &self.required {
            let Some(v) = object.get(field) else {
                return Err(format!("required field '{}' missing", field));
            };
            out.insert(field.clone(), v.clone());
        }
        for field in &self.optional {
            if let Some(v) = object.get(field) {
                out.insert(field.clone(), v.clone());
            }
        }
        Ok(Value::Object(out))
    }
}

/// Channel name to mapper registry, fixed per deployment
#[derive(Clone, Default)]
pub struct MapperRegistry {
    mappers: HashMap<String, Arc<dyn StateMapper>>,
}

impl MapperRegistry {
    /// Empty registry: every channel passes through
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapper for a channel
    pub fn register(
        mut self,
        channel: impl Into<String>,
        mapper: impl StateMapper + 'static,
    ) -> Self {
        self.mappers.insert(channel.into(), Arc::new(mapper));
        self
    }

    /// Normalize a channel value for the wire
    pub fn normalize(&self, channel: &str, value: &Value) -> Result<Value, MapperError> {
        match self.mappers.get(channel) {
            Some(mapper) => mapper.map(value).map_err(|message| MapperError {
                channel: channel.to_string(),
                message,
            }),
            None => Ok(value.clone()),
        }
    }
}
