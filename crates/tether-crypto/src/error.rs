//! Cryptographic error types.

use thiserror::Error;

/// Errors raised by the masking and ratchet primitives.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// IV length does not match the block size of the permutation.
    #[error("iv length must equal block size: expected {expected}, got {actual}")]
    InvalidIvLength {
        /// Block size of the permutation.
        expected: usize,
        /// Length of the supplied IV.
        actual: usize,
    },

    /// The block permutation reports a zero block size.
    #[error("block permutation has zero block size")]
    EmptyBlock,

    /// Key material has the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// The OS random source failed.
    #[error("random number generation failed")]
    RandomFailed,
}
