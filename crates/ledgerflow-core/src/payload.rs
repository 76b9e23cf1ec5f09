// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payload typing.
//!
//! Anything a flow sends or expects to receive implements [`FlowPayload`], which gives it
//! a stable [`TypeTag`]. Tags travel with every message inside an [`Envelope`] and are
//! persisted in checkpoints as the "expected type" of a suspended receive. A closed
//! [`PayloadRegistry`] resolves tags back to decodable types at resume and restore time.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable name of a payload type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(String);

impl TypeTag {
    /// Create a tag from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The tag of a payload type.
    pub fn of<T: FlowPayload>() -> Self {
        Self(T::TYPE_TAG.to_string())
    }

    /// The tag name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value that can be exchanged between flows.
///
/// The tag must be unique across every payload type a node registers.
pub trait FlowPayload: Serialize + DeserializeOwned + Send + 'static {
    /// Stable type name carried on the wire and in checkpoints.
    const TYPE_TAG: &'static str;
}

macro_rules! builtin_payloads {
    ($($ty:ty => $tag:literal),* $(,)?) => {
        $(impl FlowPayload for $ty {
            const TYPE_TAG: &'static str = $tag;
        })*

        fn register_builtins(registry: &mut PayloadRegistry) {
            $(registry.register::<$ty>();)*
        }
    };
}

builtin_payloads! {
    () => "unit",
    bool => "bool",
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
    u64 => "u64",
    f64 => "f64",
    String => "string",
    Vec<u8> => "bytes",
}

/// A tagged payload: the unit of data on the wire and in a flow's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Declared type of `body`.
    pub type_tag: TypeTag,
    /// Serialized value.
    pub body: Value,
}

impl Envelope {
    /// Tag and serialize a payload.
    pub fn wrap<T: FlowPayload>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            type_tag: TypeTag::of::<T>(),
            body: serde_json::to_value(value)?,
        })
    }

    /// Whether the envelope claims to carry a `T`.
    pub fn is<T: FlowPayload>(&self) -> bool {
        self.type_tag.as_str() == T::TYPE_TAG
    }

    /// Decode the body as a `T`, ignoring the tag.
    pub fn decode_body<T: FlowPayload>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }
}

impl Hash for Envelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_tag.hash(state);
        self.body.to_string().hash(state);
    }
}

type DecodeCheck = fn(&Value) -> Result<(), serde_json::Error>;

fn decode_check<T: FlowPayload>(value: &Value) -> Result<(), serde_json::Error> {
    T::deserialize(value).map(|_| ())
}

/// Closed set of payload types a node knows how to decode.
#[derive(Clone)]
pub struct PayloadRegistry {
    decoders: HashMap<TypeTag, DecodeCheck>,
}

impl PayloadRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// A registry holding the built-in scalar, string and byte payloads.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        register_builtins(&mut registry);
        registry
    }

    /// Add a payload type.
    pub fn register<T: FlowPayload>(&mut self) -> &mut Self {
        self.decoders
            .insert(TypeTag::of::<T>(), decode_check::<T> as DecodeCheck);
        self
    }

    /// Whether the tag names a known type.
    pub fn resolve(&self, tag: &TypeTag) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Check that the envelope's body decodes as the type its tag names.
    ///
    /// Returns `Ok(false)` when the tag is unknown.
    pub fn validate(&self, envelope: &Envelope) -> Result<bool, serde_json::Error> {
        match self.decoders.get(&envelope.type_tag) {
            Some(check) => check(&envelope.body).map(|_| true),
            None => Ok(false),
        }
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether no types are registered.
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl Default for PayloadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().map(TypeTag::as_str).collect();
        tags.sort_unstable();
        f.debug_struct("PayloadRegistry").field("types", &tags).finish()
    }
}

/// Data that came from a counterparty and has not been checked yet.
///
/// The only way to get at the value is [`validate`](Self::validate), which keeps the
/// check next to the use. Things worth checking: is it the object you asked for, does
/// it uphold its own invariants, is it suspiciously large or small.
#[must_use = "data from a counterparty must be validated before use"]
pub struct UntrustworthyData<T>(T);

impl<T> UntrustworthyData<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(value)
    }

    /// Run a validator over the data and return what it produces.
    pub fn validate<R, E>(self, validator: impl FnOnce(T) -> Result<R, E>) -> Result<R, E> {
        validator(self.0)
    }
}

impl<T> fmt::Debug for UntrustworthyData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UntrustworthyData(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Quote {
        price: u64,
        currency: String,
    }

    impl FlowPayload for Quote {
        const TYPE_TAG: &'static str = "test.quote";
    }

    #[test]
    fn test_wrap_tags_with_type() {
        let env = Envelope::wrap(&"hello".to_string()).unwrap();
        assert_eq!(env.type_tag.as_str(), "string");
        assert!(env.is::<String>());
        assert!(!env.is::<i32>());
        assert_eq!(env.decode_body::<String>().unwrap(), "hello");
    }

    #[test]
    fn test_registry_builtins_resolve() {
        let registry = PayloadRegistry::new();
        for tag in ["unit", "bool", "i32", "i64", "u32", "u64", "f64", "string", "bytes"] {
            assert!(registry.resolve(&TypeTag::new(tag)), "{} should resolve", tag);
        }
        assert!(!registry.resolve(&TypeTag::new("test.quote")));
        assert!(PayloadRegistry::empty().is_empty());
    }

    #[test]
    fn test_registry_custom_type() {
        let mut registry = PayloadRegistry::new();
        registry.register::<Quote>();
        let env = Envelope::wrap(&Quote {
            price: 10,
            currency: "GBP".to_string(),
        })
        .unwrap();
        assert!(registry.validate(&env).unwrap());
    }

    #[test]
    fn test_validate_rejects_lying_tag() {
        let registry = PayloadRegistry::new();
        let env = Envelope {
            type_tag: TypeTag::new("i32"),
            body: Value::String("not a number".to_string()),
        };
        assert!(registry.validate(&env).is_err());

        let unknown = Envelope {
            type_tag: TypeTag::new("mystery"),
            body: Value::Null,
        };
        assert!(!registry.validate(&unknown).unwrap());
    }

    #[test]
    fn test_untrustworthy_data_validate() {
        let data = UntrustworthyData::new(150u64);
        let checked: Result<u64, String> = data.validate(|price| {
            if price > 100 {
                Err(format!("price {} too high", price))
            } else {
                Ok(price)
            }
        });
        assert_eq!(checked.unwrap_err(), "price 150 too high");
    }
}
