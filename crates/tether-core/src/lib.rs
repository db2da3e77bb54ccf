//! # TETHER Core
//!
//! The session runtime: framed packets, profile-directed scheduling,
//! the transaction loop, and process handoff.
//!
//! This crate provides:
//! - The packet codec with fragmentation and tag-based routing
//! - The profile engine (host/sleep/jitter selection, failover)
//! - The session state machine and its transaction loop
//! - Channel (streaming) mode on a single connection
//! - Spawn/migrate handoff over a local pipe
//! - A listener + registry for the accepting side
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                         Session                             │
//! │   (queues, state flags, ratchet, transaction loop)          │
//! ├────────────────────────────────────────────────────────────┤
//! │                  Profile  │  Handoff  │  Listener           │
//! ├────────────────────────────────────────────────────────────┤
//! │                  Packets (codec, fragments, tags)           │
//! ├────────────────────────────────────────────────────────────┤
//! │          tether-transport  │  tether-crypto                 │
//! └────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod device;
pub mod error;
pub mod frag;
pub mod options;
pub mod packet;
pub mod profile;
pub mod server;
pub mod session;
pub mod state;

pub use device::{DeviceId, local_id};
pub use error::{CoreError, Result};
pub use frag::Assembler;
pub use options::Options;
pub use packet::{Flags, Packet, flags, ids, merge_tags};
pub use profile::{
    DEFAULT_JITTER, DEFAULT_SLEEP, Group, Profile, Selector, TransportKind, WrapSpec,
};
pub use server::{ListenerHandle, Registry, listen};
pub use session::{
    Config, HandoffOp, Handler, Inherited, MAX_ERRORS, Process, ProxyEntry, QUEUE_CAPACITY,
    QueueHandler, Runnable, Session, accept, connect, connect_with, oneshot,
};
pub use state::State;
