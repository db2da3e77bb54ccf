//! Payload fragmentation and reassembly.
//!
//! Oversized payloads are split into fragments sharing one freshly
//! generated group id; the receive side stashes fragments by
//! `(device, job, group)` until every position has arrived.

use std::collections::HashMap;

use tracing::warn;

use crate::device::DeviceId;
use crate::error::{CoreError, Result};
use crate::packet::{Packet, flags};

/// Split `p` into fragments of at most `limit` payload bytes.
///
/// A limit of zero disables fragmentation. Packets that already fit are
/// returned unchanged as a single element.
pub fn split(p: Packet, limit: usize) -> Result<Vec<Packet>> {
    if limit == 0 || p.data.len() <= limit {
        return Ok(vec![p]);
    }
    let count = p.data.len().div_ceil(limit);
    if count > u16::MAX as usize {
        return Err(CoreError::Malformed("payload needs too many fragments"));
    }
    let group = loop {
        let g = tether_crypto::random::random_u16()?;
        if g != 0 {
            break g;
        }
    };
    let mut parts = Vec::with_capacity(count);
    for (i, chunk) in p.data.chunks(limit).enumerate() {
        let mut c = Packet {
            id: p.id,
            job: p.job,
            flags: p.flags,
            device: p.device,
            tags: Vec::new(),
            data: chunk.to_vec(),
        };
        c.flags.set(flags::FRAG);
        c.flags.set_group(group);
        c.flags.set_total(count as u16);
        c.flags.set_position(i as u16);
        parts.push(c);
    }
    Ok(parts)
}

#[derive(PartialEq, Eq, Hash)]
struct Key(DeviceId, u16, u16);

struct Entry {
    id: u8,
    wire: u16,
    total: u16,
    received: usize,
    parts: Vec<Option<Vec<u8>>>,
}

/// Receive-side fragment stash.
#[derive(Default)]
pub struct Assembler {
    groups: HashMap<Key, Entry>,
}

impl Assembler {
    /// A fresh, empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of incomplete fragment groups currently stashed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    /// Feed one received packet through the assembler.
    ///
    /// Non-fragment packets pass through unchanged. Fragments are
    /// stashed until their group completes, at which point the
    /// reassembled packet is returned. Duplicate positions overwrite.
    pub fn offer(&mut self, p: Packet) -> Result<Option<Packet>> {
        if !p.flags.contains(flags::FRAG) {
            return Ok(Some(p));
        }
        let total = p.flags.total();
        if total == 0 {
            return Err(CoreError::InvalidPacketCount);
        }
        let position = p.flags.position();
        if position >= total {
            return Err(CoreError::Malformed("fragment position out of range"));
        }
        if total == 1 {
            let mut whole = p;
            whole.flags.clear_frag();
            return Ok(Some(whole));
        }
        let (device, job, group) = (p.device, p.job, p.flags.group());
        let entry = self
            .groups
            .entry(Key(device, job, group))
            .or_insert_with(|| Entry {
                id: p.id,
                wire: p.flags.wire() & !flags::FRAG,
                total,
                received: 0,
                parts: vec![None; total as usize],
            });
        if entry.total != total {
            return Err(CoreError::Malformed("fragment total mismatch"));
        }
        if entry.parts[position as usize].is_none() {
            entry.received += 1;
        }
        entry.parts[position as usize] = Some(p.data);
        if entry.received < entry.total as usize {
            return Ok(None);
        }

        let entry = self
            .groups
            .remove(&Key(device, job, group))
            .expect("group present");
        let mut data = Vec::new();
        for part in entry.parts {
            data.extend_from_slice(&part.expect("all positions received"));
        }
        let mut flags_out = crate::packet::Flags::new();
        flags_out.set(entry.wire);
        Ok(Some(Packet {
            id: entry.id,
            job,
            flags: flags_out,
            device,
            tags: Vec::new(),
            data,
        }))
    }

    /// Drop all incomplete groups, warning about each.
    pub fn clear(&mut self) {
        for (Key(device, job, group), e) in self.groups.drain() {
            warn!(
                %device,
                job,
                group,
                "dropping incomplete fragment group ({}/{} received)",
                e.received,
                e.total
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_packet(len: usize) -> Packet {
        let mut p = Packet::with_device(0x2A, DeviceId::from_bytes([1u8; 16]));
        p.job = 77;
        p.data = (0..len).map(|i| (i % 251) as u8).collect();
        p
    }

    #[test]
    fn test_exact_limit_is_one_packet() {
        let p = payload_packet(4096);
        let parts = split(p, 4096).unwrap();
        assert_eq!(parts.len(), 1);
        assert!(!parts[0].flags.contains(flags::FRAG));
    }

    #[test]
    fn test_one_past_limit_is_two() {
        let p = payload_packet(4097);
        let parts = split(p, 4096).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].flags.total(), 2);
        assert_eq!(parts[1].flags.position(), 1);
    }

    #[test]
    fn test_ten_kib_makes_three() {
        let p = payload_packet(10 * 1024);
        let parts = split(p.clone(), 4096).unwrap();
        assert_eq!(parts.len(), 3);
        let group = parts[0].flags.group();
        assert_ne!(group, 0);
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.flags.group(), group);
            assert_eq!(part.flags.total(), 3);
            assert_eq!(part.flags.position(), i as u16);
        }

        let mut asm = Assembler::new();
        assert!(asm.offer(parts[0].clone()).unwrap().is_none());
        assert!(asm.offer(parts[1].clone()).unwrap().is_none());
        let whole = asm.offer(parts[2].clone()).unwrap().unwrap();
        assert_eq!(whole.data, p.data);
        assert_eq!(whole.id, p.id);
        assert!(!whole.flags.contains(flags::FRAG));
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn test_out_of_order_and_duplicates() {
        let parts = split(payload_packet(9000), 4096).unwrap();
        let mut asm = Assembler::new();
        assert!(asm.offer(parts[2].clone()).unwrap().is_none());
        assert!(asm.offer(parts[0].clone()).unwrap().is_none());
        // Duplicate of an already-seen position just overwrites.
        assert!(asm.offer(parts[0].clone()).unwrap().is_none());
        let whole = asm.offer(parts[1].clone()).unwrap().unwrap();
        assert_eq!(whole.data, payload_packet(9000).data);
    }

    #[test]
    fn test_zero_total_is_rejected() {
        let mut p = payload_packet(10);
        p.flags.set(flags::FRAG);
        p.flags.set_group(5);
        let mut asm = Assembler::new();
        assert!(matches!(
            asm.offer(p).unwrap_err(),
            CoreError::InvalidPacketCount
        ));
    }

    #[test]
    fn test_groups_do_not_mix() {
        let a = split(payload_packet(9000), 4096).unwrap();
        let mut b_src = payload_packet(9000);
        b_src.job = 78; // different job, same device
        let b = split(b_src, 4096).unwrap();

        let mut asm = Assembler::new();
        for part in a.iter().take(2).chain(b.iter().take(2)) {
            assert!(asm.offer(part.clone()).unwrap().is_none());
        }
        assert_eq!(asm.pending(), 2);
        assert!(asm.offer(a[2].clone()).unwrap().is_some());
        assert!(asm.offer(b[2].clone()).unwrap().is_some());
    }
}
