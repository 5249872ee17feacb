//! Codec bridge between payload types and the RPC framing layer.
//!
//! Payloads cross the wire as bincode. The two pointer containers used to
//! move payloads between owners encode as the plain inner value; the wrapper
//! is invisible on the wire and gets reconstructed on the receiving side.

use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| Error::Codec(format!("payload serialization failed: {e}")))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| Error::Codec(format!("payload deserialization failed: {e}")))
}

/// Ownership-transfer payload container. Encodes as the inner `T`; decoding
/// re-boxes the value on the receiving side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForeignPtr<T>(Box<T>);

impl<T> ForeignPtr<T> {
    pub fn new(value: T) -> Self {
        ForeignPtr(Box::new(value))
    }

    pub fn into_inner(self) -> T {
        *self.0
    }
}

impl<T> Deref for ForeignPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// Reference-counted shared payload container. Encodes as the inner `T`;
/// decoding produces a fresh reference count of one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedPtr<T>(Arc<T>);

impl<T> SharedPtr<T> {
    pub fn new(value: T) -> Self {
        SharedPtr(Arc::new(value))
    }
}

impl<T> Deref for SharedPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}
