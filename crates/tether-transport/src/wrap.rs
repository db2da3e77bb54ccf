//! Packet-body wrappers.
//!
//! A wrapper transforms the serialized packet body before it hits the
//! wire: compression, ciphers, encodings. Wrappers compose into a stack
//! applied outermost-first on write and innermost-first on read. The
//! interface is deliberately open so hosts can supply their own layers;
//! the runtime only ships the XOR layer it needs for profiles.

use std::sync::Arc;

use tether_crypto::Xor;

use crate::error::TransportError;

/// One body-transform layer.
pub trait Wrap: Send + Sync {
    /// Transform an outgoing body.
    fn wrap(&self, body: Vec<u8>) -> Result<Vec<u8>, TransportError>;

    /// Reverse [`Wrap::wrap`] on an incoming body.
    fn unwrap(&self, body: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

/// An ordered stack of wrappers.
///
/// Cloning is cheap: layers are shared.
#[derive(Clone, Default)]
pub struct WrapStack {
    layers: Vec<Arc<dyn Wrap>>,
}

impl WrapStack {
    /// An empty (identity) stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer at the outermost position.
    #[must_use]
    pub fn with(mut self, layer: Arc<dyn Wrap>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Append a layer in place.
    pub fn push(&mut self, layer: Arc<dyn Wrap>) {
        self.layers.push(layer);
    }

    /// True when the stack performs no transformation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Apply all layers to an outgoing body, innermost-first.
    pub fn apply(&self, mut body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        for layer in &self.layers {
            body = layer.wrap(body)?;
        }
        Ok(body)
    }

    /// Strip all layers from an incoming body, outermost-first.
    pub fn strip(&self, mut body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        for layer in self.layers.iter().rev() {
            body = layer.unwrap(body)?;
        }
        Ok(body)
    }
}

impl std::fmt::Debug for WrapStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WrapStack({} layers)", self.layers.len())
    }
}

/// The built-in XOR masking layer.
#[derive(Clone)]
pub struct XorWrap {
    key: Xor,
}

impl XorWrap {
    /// Build a layer from raw key bytes.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Xor::new(key),
        }
    }

    /// The key bytes, for profile serialization.
    #[must_use]
    pub fn key_bytes(&self) -> &[u8] {
        self.key.as_bytes()
    }
}

impl Wrap for XorWrap {
    fn wrap(&self, mut body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        self.key.mask(&mut body);
        Ok(body)
    }

    fn unwrap(&self, mut body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        self.key.mask(&mut body);
        Ok(body)
    }
}
