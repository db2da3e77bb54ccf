//! # TETHER Crypto
//!
//! Lightweight symmetric primitives for the TETHER wire protocol.
//!
//! This crate provides:
//! - Cyclic XOR masking keys (the wire-level packet mask)
//! - A byte-wise CFB stream mode over a pluggable block permutation
//! - The per-session rolling key ratchet with rollback on send failure
//! - An XOR-keyed stream shim for the handoff pipe
//! - OS CSPRNG helpers
//!
//! None of these are intended to provide confidentiality against a
//! cryptanalyst; they mask traffic the same way the wire format does,
//! cheaply and symmetrically. Stronger layers belong in a wrapper stack
//! above the packet codec.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cfb;
pub mod error;
pub mod random;
pub mod ratchet;
pub mod stream;
pub mod xor;

pub use cfb::{Block, Cfb};
pub use error::CryptoError;
pub use ratchet::{KeyRatchet, SessionKey};
pub use stream::XorStream;
pub use xor::Xor;

/// Session ratchet key size in bytes.
pub const KEY_SIZE: usize = 32;
