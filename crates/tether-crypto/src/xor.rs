//! Cyclic XOR masking keys.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cfb::Block;

/// A variable-length XOR key.
///
/// Masking is an involution: applying the same key twice restores the
/// input. An empty key is a no-op, which lets callers treat "no mask"
/// and "masked" uniformly.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Xor(Vec<u8>);

impl Xor {
    /// Create a key from raw bytes.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self(key.into())
    }

    /// Key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the key is empty (masking is a no-op).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Apply the key in place, cycling over the key bytes.
    pub fn mask(&self, data: &mut [u8]) {
        self.mask_at(data, 0);
    }

    /// Apply the key in place as if `data` started at stream offset
    /// `offset`. Lets callers mask a contiguous stream in arbitrary
    /// chunks.
    pub fn mask_at(&self, data: &mut [u8], offset: usize) {
        if self.0.is_empty() {
            return;
        }
        for (i, v) in data.iter_mut().enumerate() {
            *v ^= self.0[(offset + i) % self.0.len()];
        }
    }
}

impl std::fmt::Debug for Xor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        write!(f, "Xor({} bytes)", self.0.len())
    }
}

impl Block for Xor {
    fn block_size(&self) -> usize {
        self.0.len()
    }

    fn permute(&self, block: &mut [u8]) {
        self.mask(block);
    }
}
