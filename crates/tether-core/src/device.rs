//! Device identity.
//!
//! Every process carries a 16-byte fingerprint derived once from
//! platform entropy, so a respawned agent on the same host keeps the
//! same identity while two hosts never collide.

use std::sync::OnceLock;

/// A 16-byte session/device identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceId([u8; 16]);

impl DeviceId {
    /// Size of the identifier in bytes.
    pub const SIZE: usize = 16;

    /// The all-zero identifier, used as "unset".
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; 16])
    }

    /// Wrap raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// True for the all-zero identifier.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceId({self})")
    }
}

/// The local device fingerprint, generated once per process.
pub fn local_id() -> DeviceId {
    static ID: OnceLock<DeviceId> = OnceLock::new();
    *ID.get_or_init(generate)
}

fn generate() -> DeviceId {
    for path in ["/etc/machine-id", "/etc/hostid", "/var/lib/dbus/machine-id"] {
        if let Ok(seed) = std::fs::read(path) {
            if !seed.is_empty() {
                return fold(&seed);
            }
        }
    }
    // No stable host entropy; a random identity is still unique.
    let mut bytes = [0u8; 16];
    tether_crypto::random::fill_random(&mut bytes).expect("random source unavailable");
    DeviceId(bytes)
}

fn fold(seed: &[u8]) -> DeviceId {
    let digest = blake3::derive_key("tether device fingerprint v1", seed);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    DeviceId(bytes)
}
