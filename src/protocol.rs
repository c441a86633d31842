//! Serialization protocols for entity values.
//!
//! A [`Protocol`] validates the values a task returns and, for persisted
//! entities, turns them into bytes and back. The engine never looks inside a
//! value; whatever a protocol decodes is what callers receive.

use std::any::type_name;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::Dynamic;

pub trait Protocol: Send + Sync {
    /// Human readable name, used in diagnostics.
    fn name(&self) -> &'static str;

    fn validate(&self, value: &Dynamic) -> anyhow::Result<()>;

    fn encode(&self, value: &Dynamic) -> anyhow::Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Dynamic>;

    /// Whether values can be written to the persistent cache at all.
    fn can_persist(&self) -> bool {
        true
    }
}

fn downcast<T: 'static>(value: &Dynamic) -> anyhow::Result<&T> {
    value
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("expected a value of type {}", type_name::<T>()))
}

/// CBOR encoding for any serde-compatible type.
pub struct Cbor<T>(PhantomData<fn() -> T>);

impl<T> Cbor<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self(PhantomData)
    }

    pub fn shared() -> Arc<dyn Protocol> {
        Arc::new(Self::new())
    }
}

impl<T> Default for Cbor<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Protocol for Cbor<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        type_name::<T>()
    }

    fn validate(&self, value: &Dynamic) -> anyhow::Result<()> {
        downcast::<T>(value).map(|_| ())
    }

    fn encode(&self, value: &Dynamic) -> anyhow::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        ciborium::into_writer(downcast::<T>(value)?, &mut buffer)?;
        Ok(buffer)
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Dynamic> {
        let value: T = ciborium::from_reader(bytes)?;
        Ok(Arc::new(value))
    }
}

/// Type check only, for values that live in memory and are never persisted.
pub struct Opaque<T>(PhantomData<fn() -> T>);

impl<T> Opaque<T>
where
    T: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self(PhantomData)
    }

    pub fn shared() -> Arc<dyn Protocol> {
        Arc::new(Self::new())
    }
}

impl<T> Default for Opaque<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Protocol for Opaque<T>
where
    T: Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        type_name::<T>()
    }

    fn validate(&self, value: &Dynamic) -> anyhow::Result<()> {
        downcast::<T>(value).map(|_| ())
    }

    fn encode(&self, _: &Dynamic) -> anyhow::Result<Vec<u8>> {
        bail!("values of type {} cannot be serialized", type_name::<T>())
    }

    fn can_persist(&self) -> bool {
        false
    }

    fn decode(&self, _: &[u8]) -> anyhow::Result<Dynamic> {
        bail!("values of type {} cannot be deserialized", type_name::<T>())
    }
}

/// Accepts any value and never serializes it.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unchecked;

impl Unchecked {
    pub fn shared() -> Arc<dyn Protocol> {
        Arc::new(Unchecked)
    }
}

impl Protocol for Unchecked {
    fn name(&self) -> &'static str {
        "unchecked"
    }

    fn validate(&self, _: &Dynamic) -> anyhow::Result<()> {
        Ok(())
    }

    fn encode(&self, _: &Dynamic) -> anyhow::Result<Vec<u8>> {
        bail!("unchecked values cannot be serialized")
    }

    fn can_persist(&self) -> bool {
        false
    }

    fn decode(&self, _: &[u8]) -> anyhow::Result<Dynamic> {
        bail!("unchecked values cannot be deserialized")
    }
}
