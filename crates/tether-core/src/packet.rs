//! The atomic wire message and its codec.
//!
//! Wire layout, all integers big-endian:
//!
//! ```text
//! id:u8  flags:u16  [group:u16 total:u16 position:u16]  job:u16
//! device:[u8;16]  [count:u8 count*tag:u32]  payload-chunk
//! ```
//!
//! The fragment trio is present only when the `FRAG` or `MULTI` flag is
//! set; the tag block only when `PROXY` is set. The payload chunk is
//! length-prefixed with a width tag so small payloads cost two bytes and
//! large ones five.

use tether_crypto::SessionKey;

use crate::device::DeviceId;
use crate::error::{CoreError, Result};

/// Well-known system packet identifiers.
pub mod ids {
    /// Session registration request, sent once per connect.
    pub const HELLO: u8 = 0x01;
    /// Registration acknowledgement.
    pub const REGISTERED: u8 = 0x02;
    /// Session shutdown indication and acknowledgement.
    pub const SHUTDOWN: u8 = 0x03;
}

/// Wire flag bits.
pub mod flags {
    /// Begin/participate in streaming (channel) mode.
    pub const CHANNEL: u16 = 0x0001;
    /// Terminate streaming mode after this packet.
    pub const CHANNEL_END: u16 = 0x0002;
    /// One packet of a multi-packet logical message.
    pub const FRAG: u16 = 0x0004;
    /// Carrier of several grouped sub-packets.
    pub const MULTI: u16 = 0x0008;
    /// Routed via an intermediate session; tags populated.
    pub const PROXY: u16 = 0x0010;
    /// Payload describes a failure.
    pub const ERROR: u16 = 0x0020;
    /// Payload carries new ratchet key material.
    pub const CRYPT: u16 = 0x0040;
    /// Single unregistered exchange.
    pub const ONESHOT: u16 = 0x0080;
    /// Hello payload carries a nested packet.
    pub const DATA: u16 = 0x0100;
}

/// Packet flags plus fragment metadata, packed into one value.
///
/// The low 16 bits are the wire bitfield; the upper 48 hold the
/// fragment group, total and position, which only reach the wire when
/// `FRAG` or `MULTI` is set.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u64);

impl Flags {
    /// Empty flags.
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// The 16-bit wire bitfield.
    #[must_use]
    pub const fn wire(self) -> u16 {
        self.0 as u16
    }

    /// True when every bit of `mask` is set.
    #[must_use]
    pub const fn contains(self, mask: u16) -> bool {
        (self.0 as u16) & mask == mask
    }

    /// Set the given wire bits.
    pub fn set(&mut self, mask: u16) {
        self.0 |= mask as u64;
    }

    /// Clear the given wire bits.
    pub fn unset(&mut self, mask: u16) {
        self.0 &= !(mask as u64);
    }

    /// Fragment-set identifier (0 = none).
    #[must_use]
    pub const fn group(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Total fragments (or sub-packets) in the set.
    #[must_use]
    pub const fn total(self) -> u16 {
        (self.0 >> 32) as u16
    }

    /// 0-based index of this fragment within the set.
    #[must_use]
    pub const fn position(self) -> u16 {
        (self.0 >> 48) as u16
    }

    /// Set the fragment-set identifier.
    pub fn set_group(&mut self, group: u16) {
        self.0 = (self.0 & !(0xFFFF << 16)) | ((group as u64) << 16);
    }

    /// Set the total fragment count.
    pub fn set_total(&mut self, total: u16) {
        self.0 = (self.0 & !(0xFFFF << 32)) | ((total as u64) << 32);
    }

    /// Set the fragment position.
    pub fn set_position(&mut self, position: u16) {
        self.0 = (self.0 & !(0xFFFF << 48)) | ((position as u64) << 48);
    }

    /// Drop fragmentation state entirely.
    pub fn clear_frag(&mut self) {
        self.0 &= 0xFFFF;
        self.unset(flags::FRAG);
    }

    const fn has_meta(self) -> bool {
        self.contains(flags::FRAG) || self.contains(flags::MULTI)
    }
}

impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(u16, char); 9] = [
            (flags::CHANNEL, 'C'),
            (flags::CHANNEL_END, 'K'),
            (flags::FRAG, 'F'),
            (flags::MULTI, 'M'),
            (flags::PROXY, 'P'),
            (flags::ERROR, 'E'),
            (flags::CRYPT, 'Z'),
            (flags::ONESHOT, 'O'),
            (flags::DATA, 'D'),
        ];
        let mut any = false;
        for (bit, c) in NAMES {
            if self.contains(bit) {
                write!(f, "{c}")?;
                any = true;
            }
        }
        if !any {
            write!(f, "-")?;
        }
        if self.has_meta() {
            write!(f, "[{}:{}/{}]", self.group(), self.position(), self.total())?;
        }
        Ok(())
    }
}

/// The atomic protocol unit.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// Task or system identifier.
    pub id: u8,
    /// Correlation identifier.
    pub job: u16,
    /// Flag bits plus fragment metadata.
    pub flags: Flags,
    /// Owning session identifier.
    pub device: DeviceId,
    /// Proxy route identifiers.
    pub tags: Vec<u32>,
    /// Opaque payload.
    pub data: Vec<u8>,
}

impl Packet {
    /// A packet with the given identifier and no payload.
    #[must_use]
    pub fn new(id: u8) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// A packet bound to a device.
    #[must_use]
    pub fn with_device(id: u8, device: DeviceId) -> Self {
        Self {
            id,
            device,
            ..Self::default()
        }
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// True when the packet carries nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id == 0 && self.flags.wire() == 0 && self.data.is_empty()
    }

    /// Mask the payload with a session key (involution).
    pub fn mask(&mut self, key: &SessionKey) {
        key.mask(&mut self.data);
    }

    /// Serialize into wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(24 + self.data.len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut flags = self.flags;
        if !self.tags.is_empty() {
            flags.set(flags::PROXY);
        }
        if flags.has_meta() && flags.total() == 0 {
            return Err(CoreError::InvalidPacketCount);
        }
        out.push(self.id);
        out.extend_from_slice(&flags.wire().to_be_bytes());
        if flags.has_meta() {
            out.extend_from_slice(&flags.group().to_be_bytes());
            out.extend_from_slice(&flags.total().to_be_bytes());
            out.extend_from_slice(&flags.position().to_be_bytes());
        }
        out.extend_from_slice(&self.job.to_be_bytes());
        out.extend_from_slice(self.device.as_bytes());
        if flags.contains(flags::PROXY) {
            if self.tags.len() > 0xFF {
                return Err(CoreError::Malformed("more than 255 route tags"));
            }
            out.push(self.tags.len() as u8);
            for t in &self.tags {
                out.extend_from_slice(&t.to_be_bytes());
            }
        }
        encode_chunk(out, &self.data);
        Ok(())
    }

    /// Parse one packet, requiring the buffer to be fully consumed.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let p = Self::decode_from(&mut r)?;
        if !r.is_empty() {
            return Err(CoreError::Malformed("trailing bytes after packet"));
        }
        Ok(p)
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self> {
        let id = r.take_u8()?;
        let wire = r.take_u16()?;
        let mut flags = Flags::new();
        flags.set(wire);
        if flags.has_meta() {
            flags.set_group(r.take_u16()?);
            let total = r.take_u16()?;
            if total == 0 {
                return Err(CoreError::InvalidPacketCount);
            }
            flags.set_total(total);
            let position = r.take_u16()?;
            if flags.contains(flags::FRAG) && position >= total {
                return Err(CoreError::Malformed("fragment position out of range"));
            }
            flags.set_position(position);
        }
        let job = r.take_u16()?;
        let mut device = [0u8; DeviceId::SIZE];
        device.copy_from_slice(r.take(DeviceId::SIZE)?);
        let mut tags = Vec::new();
        if flags.contains(flags::PROXY) {
            let count = r.take_u8()? as usize;
            tags.reserve(count);
            for _ in 0..count {
                tags.push(r.take_u32()?);
            }
        }
        let data = decode_chunk(r)?;
        Ok(Self {
            id,
            job,
            flags,
            device: DeviceId::from_bytes(device),
            tags,
            data,
        })
    }

    /// Bundle several packets into one `MULTI` carrier.
    pub fn pack_multi(device: DeviceId, parts: &[Packet]) -> Result<Packet> {
        if parts.is_empty() || parts.len() > u16::MAX as usize {
            return Err(CoreError::InvalidPacketCount);
        }
        let mut data = Vec::new();
        for p in parts {
            p.encode_into(&mut data)?;
        }
        let mut flags = Flags::new();
        flags.set(flags::MULTI);
        flags.set_total(parts.len() as u16);
        Ok(Packet {
            id: 0,
            job: 0,
            flags,
            device,
            tags: Vec::new(),
            data,
        })
    }

    /// Unpack a `MULTI` carrier into its sub-packets.
    pub fn unpack_multi(&self) -> Result<Vec<Packet>> {
        if !self.flags.contains(flags::MULTI) {
            return Err(CoreError::Malformed("not a multi packet"));
        }
        let total = self.flags.total() as usize;
        if total == 0 {
            return Err(CoreError::InvalidPacketCount);
        }
        let mut r = Reader::new(&self.data);
        let mut parts = Vec::with_capacity(total);
        for _ in 0..total {
            parts.push(Self::decode_from(&mut r)?);
        }
        if !r.is_empty() {
            return Err(CoreError::Malformed("trailing bytes after sub-packets"));
        }
        Ok(parts)
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "0x{:02X}/{} job={} {}b",
            self.id,
            self.flags,
            self.job,
            self.data.len()
        )
    }
}

/// Merge `src` into `dst` as a set union, preserving first-seen order.
///
/// The result is capped at 255 tags, the wire limit.
pub fn merge_tags(dst: &mut Vec<u32>, src: &[u32]) {
    for t in src {
        if dst.len() >= 0xFF {
            return;
        }
        if !dst.contains(t) {
            dst.push(*t);
        }
    }
}

fn encode_chunk(out: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => out.push(0),
        n if n <= 0xFF => {
            out.push(1);
            out.push(n as u8);
        }
        n if n <= 0xFFFF => {
            out.push(2);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(3);
            out.extend_from_slice(&(n as u32).to_be_bytes());
        }
    }
    out.extend_from_slice(data);
}

fn decode_chunk(r: &mut Reader<'_>) -> Result<Vec<u8>> {
    let n = match r.take_u8()? {
        0 => return Ok(Vec::new()),
        1 => r.take_u8()? as usize,
        2 => r.take_u16()? as usize,
        3 => r.take_u32()? as usize,
        _ => return Err(CoreError::Malformed("invalid chunk width tag")),
    };
    Ok(r.take(n)?.to_vec())
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(CoreError::Malformed("truncated packet"));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}
