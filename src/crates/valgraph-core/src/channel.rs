//! Typed state channels and their reducers.
//!
//! A graph's state is a mapping from named channels to JSON values. Each
//! channel declares how concurrent writes combine ([`Reducer`]) and what
//! shape its values take ([`ValueType`]); both are declared explicitly at
//! build time - the runtime never infers reducer intent from data.

use crate::error::{GraphError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use valgraph_checkpoint::serializer;

/// How writes to a channel combine within one superstep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    /// Last write wins; concurrent writes from different nodes are an error
    Overwrite,
    /// Values concatenate, ordered by writer node name
    Append,
}

/// Declared value shape of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Any JSON value
    Any,
    /// Boolean
    Bool,
    /// String
    String,
    /// JSON number
    Number,
    /// High-precision decimal in its tagged envelope
    Decimal,
    /// RFC 3339 timestamp in its tagged envelope
    Timestamp,
    /// Array
    Array,
    /// Object
    Object,
}

impl ValueType {
    /// Whether `value` conforms to this type
    pub fn conforms(&self, value: &Value) -> bool {
        match self {
            ValueType::Any => true,
            ValueType::Bool => value.is_boolean(),
            ValueType::String => value.is_string(),
            ValueType::Number => value.is_number(),
            ValueType::Decimal => matches!(
                serializer::decode_tagged(value),
                Ok(Some(serializer::TaggedValue::Decimal(_)))
            ),
            ValueType::Timestamp => matches!(
                serializer::decode_tagged(value),
                Ok(Some(serializer::TaggedValue::Timestamp(_)))
            ),
            ValueType::Array => value.is_array(),
            ValueType::Object => value.is_object(),
        }
    }
}

/// Declaration of a single state channel
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    /// Channel name
    pub name: String,
    /// Write-combination rule
    pub reducer: Reducer,
    /// Declared value shape; append channels type their elements
    pub value_type: ValueType,
}

/// The typed schema of a graph's state
///
/// Channels are held in a `BTreeMap` so every iteration over the schema is
/// deterministic.
#[derive(Debug, Clone, Default)]
pub struct StateSchema {
    channels: BTreeMap<String, ChannelSpec>,
}

impl StateSchema {
    /// Create an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an overwrite channel
    pub fn overwrite(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        let name = name.into();
        self.channels.insert(
            name.clone(),
            ChannelSpec {
                name,
                reducer: Reducer::Overwrite,
                value_type,
            },
        );
        self
    }

    /// Declare an append channel; elements must conform to `value_type`
    pub fn append(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        let name = name.into();
        self.channels.insert(
            name.clone(),
            ChannelSpec {
                name,
                reducer: Reducer::Append,
                value_type,
            },
        );
        self
    }

    /// Look up a channel declaration
    pub fn channel(&self, name: &str) -> Option<&ChannelSpec> {
        self.channels.get(name)
    }

    /// Iterate channels in name order
    pub fn channels(&self) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.values()
    }

    /// Whether the schema declares `name`
    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Initial channel values: append channels start as empty arrays
    pub fn initial_values(&self) -> HashMap<String, Value> {
        self.channels
            .values()
            .filter(|spec| spec.reducer == Reducer::Append)
            .map(|spec| (spec.name.clone(), Value::Array(Vec::new())))
            .collect()
    }

    /// Validate one write against the schema
    pub fn validate_write(&self, channel: &str, value: &Value) -> Result<()> {
        let spec = self.channel(channel).ok_or_else(|| {
            GraphError::Validation(format!("write to undeclared channel '{}'", channel))
        })?;
        let conforms = match spec.reducer {
            Reducer::Overwrite => spec.value_type.conforms(value),
            // An append write may carry a single element or a batch.
            Reducer::Append => match value {
                Value::Array(items) => items.iter().all(|v| spec.value_type.conforms(v)),
                single => spec.value_type.conforms(single),
            },
        };
        if !conforms {
            return Err(GraphError::Validation(format!(
                "value for channel '{}' does not conform to {:?}",
                channel, spec.value_type
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use valgraph_checkpoint::serializer::tag_decimal;

    fn schema() -> StateSchema {
        StateSchema::new()
            .overwrite("thesis", ValueType::String)
            .overwrite("fair_value", ValueType::Decimal)
            .append("messages", ValueType::Object)
    }

    #[test]
    fn test_conformance() {
        let schema = schema();
        assert!(schema.validate_write("thesis", &json!("buy")).is_ok());
        assert!(schema.validate_write("thesis", &json!(42)).is_err());
        assert!(schema.validate_write("unknown", &json!(1)).is_err());
    }

    #[test]
    fn test_decimal_channel() {
        let schema = schema();
        let tagged = tag_decimal(rust_decimal::Decimal::new(10150, 2));
        assert!(schema.validate_write("fair_value", &tagged).is_ok());
        assert!(schema.validate_write("fair_value", &json!(101.50)).is_err());
    }

    #[test]
    fn test_append_accepts_element_or_batch() {
        let schema = schema();
        assert!(schema
            .validate_write("messages", &json!({"role": "analyst"}))
            .is_ok());
        assert!(schema
            .validate_write("messages", &json!([{"role": "a"}, {"role": "b"}]))
            .is_ok());
        assert!(schema.validate_write("messages", &json!("plain")).is_err());
    }

    #[test]
    fn test_initial_values() {
        let initial = schema().initial_values();
        assert_eq!(initial.get("messages"), Some(&json!([])));
        assert!(!initial.contains_key("thesis"));
    }
}
