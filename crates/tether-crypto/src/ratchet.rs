//! The per-session rolling key and its rotation state.
//!
//! Every session masks non-hello packet payloads with its current key.
//! Rotation is two-phase: a pending key is staged, announced to the peer
//! inside a key-exchange packet, and promoted only once the carrying
//! write has succeeded. A failed write discards the pending key, so both
//! ends stay on the old key. The ratchet never rolls backwards.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::random::fill_random;
use crate::{CryptoError, KEY_SIZE};

/// A fixed-size session masking key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Generate a fresh random key.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut k = [0u8; KEY_SIZE];
        fill_random(&mut k)?;
        Ok(Self(k))
    }

    /// Wrap existing key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a key from a byte slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut k = [0u8; KEY_SIZE];
        k.copy_from_slice(bytes);
        Ok(Self(k))
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Apply the key in place, cycling over the key bytes.
    pub fn mask(&self, data: &mut [u8]) {
        for (i, v) in data.iter_mut().enumerate() {
            *v ^= self.0[i % KEY_SIZE];
        }
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Current + pending key pair for one session.
pub struct KeyRatchet {
    current: SessionKey,
    pending: Option<SessionKey>,
}

impl KeyRatchet {
    /// Start a ratchet on an initial shared key.
    #[must_use]
    pub fn new(initial: SessionKey) -> Self {
        Self {
            current: initial,
            pending: None,
        }
    }

    /// The key packets are currently masked with.
    #[must_use]
    pub fn current(&self) -> &SessionKey {
        &self.current
    }

    /// Stage `next` for announcement on the next outgoing packet.
    ///
    /// A pending key that was never committed is replaced.
    pub fn propose(&mut self, next: SessionKey) {
        self.pending = Some(next);
    }

    /// True when a staged key is waiting to be announced.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Bytes of the staged key, if any.
    #[must_use]
    pub fn pending_bytes(&self) -> Option<[u8; KEY_SIZE]> {
        self.pending.as_ref().map(|k| *k.as_bytes())
    }

    /// Promote the pending key after the announcing write succeeded.
    ///
    /// Returns true when a swap actually happened.
    pub fn commit(&mut self) -> bool {
        match self.pending.take() {
            Some(k) => {
                self.current = k;
                true
            }
            None => false,
        }
    }

    /// Discard the pending key after the announcing write failed.
    pub fn revert(&mut self) {
        self.pending = None;
    }

    /// Install a key received from the peer as the current key.
    pub fn install(&mut self, key: SessionKey) {
        self.current = key;
        self.pending = None;
    }

    /// Mask `data` with the current key.
    pub fn mask(&self, data: &mut [u8]) {
        self.current.mask(data);
    }
}

impl std::fmt::Debug for KeyRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyRatchet {{ pending: {} }}", self.pending.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_involution() {
        let key = SessionKey::generate().unwrap();
        let original = vec![7u8; 100];
        let mut data = original.clone();
        key.mask(&mut data);
        assert_ne!(data, original);
        key.mask(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_commit_promotes_pending() {
        let first = SessionKey::from_bytes([1u8; KEY_SIZE]);
        let second = SessionKey::from_bytes([2u8; KEY_SIZE]);
        let mut r = KeyRatchet::new(first.clone());

        assert!(!r.commit());
        r.propose(second.clone());
        assert!(r.has_pending());
        assert_eq!(r.current(), &first);

        assert!(r.commit());
        assert_eq!(r.current(), &second);
        assert!(!r.has_pending());
    }

    #[test]
    fn test_revert_keeps_current() {
        let first = SessionKey::from_bytes([1u8; KEY_SIZE]);
        let mut r = KeyRatchet::new(first.clone());
        r.propose(SessionKey::from_bytes([2u8; KEY_SIZE]));
        r.revert();
        assert_eq!(r.current(), &first);
        assert!(!r.commit());
    }

    #[test]
    fn test_from_slice_length_checked() {
        assert!(SessionKey::from_slice(&[0u8; 16]).is_err());
        assert!(SessionKey::from_slice(&[0u8; KEY_SIZE]).is_ok());
    }
}
