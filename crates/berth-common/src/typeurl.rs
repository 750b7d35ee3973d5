//! Opaque typed payloads.
//!
//! Container specs, runtime options and extensions are stored as [`Any`]: a
//! type url plus encoded bytes. The store never looks inside; callers that
//! need the value decode it through a [`TypeRegistry`] built at startup.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any as StdAny;
use std::collections::HashMap;

/// Tagged payload: type identifier plus encoded bytes
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Any {
    pub type_url: String,
    pub value: Vec<u8>,
}

impl Any {
    /// Wrap already-encoded bytes
    pub fn new(type_url: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            type_url: type_url.into(),
            value: value.into(),
        }
    }

    /// Encode a serializable value under `type_url`
    pub fn pack<T: Serialize>(type_url: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self {
            type_url: type_url.into(),
            value: serde_json::to_vec(value)?,
        })
    }
}

type DecodeFn = fn(&[u8]) -> Result<Box<dyn StdAny + Send>>;

fn decode_json<T: DeserializeOwned + Send + 'static>(bytes: &[u8]) -> Result<Box<dyn StdAny + Send>> {
    let value: T = serde_json::from_slice(bytes)?;
    Ok(Box::new(value))
}

/// Maps type urls to decoders
#[derive(Default)]
pub struct TypeRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl TypeRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `type_url`.
    ///
    /// # Panics
    ///
    /// Registering the same url twice is a programming error.
    pub fn register<T: DeserializeOwned + Send + 'static>(&mut self, type_url: impl Into<String>) {
        let type_url = type_url.into();
        assert!(
            !self.decoders.contains_key(&type_url),
            "type url {type_url:?} registered twice"
        );
        self.decoders.insert(type_url, decode_json::<T>);
    }

    /// Whether a decoder exists for `type_url`
    #[must_use]
    pub fn contains(&self, type_url: &str) -> bool {
        self.decoders.contains_key(type_url)
    }

    /// Decode into the registered type, type-erased
    pub fn decode(&self, any: &Any) -> Result<Box<dyn StdAny + Send>> {
        let decode = self.decoders.get(&any.type_url).ok_or_else(|| {
            Error::not_found(format!("type url {:?} is not registered", any.type_url))
        })?;
        decode(&any.value)
    }

    /// Decode and downcast to `T`
    pub fn decode_as<T: 'static>(&self, any: &Any) -> Result<T> {
        self.decode(any)?
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| {
                Error::invalid_argument(format!(
                    "type url {:?} does not decode to {}",
                    any.type_url,
                    std::any::type_name::<T>()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct RuntimeOptions {
        binary: String,
        systemd_cgroup: bool,
    }

    #[test]
    fn test_pack_and_decode() {
        let mut registry = TypeRegistry::new();
        registry.register::<RuntimeOptions>("berth.test/RuntimeOptions");

        let opts = RuntimeOptions {
            binary: "runc".into(),
            systemd_cgroup: true,
        };
        let any = Any::pack("berth.test/RuntimeOptions", &opts).unwrap();
        let decoded: RuntimeOptions = registry.decode_as(&any).unwrap();
        assert_eq!(decoded, opts);
    }

    #[test]
    fn test_decode_unknown_type() {
        let registry = TypeRegistry::new();
        let err = registry.decode(&Any::new("unknown", b"{}".to_vec())).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_decode_wrong_type() {
        let mut registry = TypeRegistry::new();
        registry.register::<RuntimeOptions>("opts");
        let any = Any::pack(
            "opts",
            &RuntimeOptions {
                binary: "crun".into(),
                systemd_cgroup: false,
            },
        )
        .unwrap();
        assert!(registry.decode_as::<String>(&any).unwrap_err().is_invalid_argument());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_register_twice_panics() {
        let mut registry = TypeRegistry::new();
        registry.register::<RuntimeOptions>("opts");
        registry.register::<RuntimeOptions>("opts");
    }
}
