//! Atomic session state flags.
//!
//! A session's lifecycle is a set of independent bits manipulated with
//! atomic set/unset; readers tolerate stale views. `CLOSED` is terminal
//! and reached exactly once, entry to `CLOSING` is idempotent and
//! irreversible. A separate slot remembers the last-observed fragment
//! group for the transmit selection invariant.

use std::sync::atomic::{AtomicU32, Ordering};

/// The session state flag word.
#[derive(Debug, Default)]
pub struct State {
    bits: AtomicU32,
    last: AtomicU32,
}

impl State {
    /// Session close requested; irreversible.
    pub const CLOSING: u32 = 1 << 0;
    /// Terminal: all resources released.
    pub const CLOSED: u32 = 1 << 1;
    /// Transaction loop is exiting.
    pub const SHUTDOWN: u32 = 1 << 2;
    /// Send queue no longer accepts packets.
    pub const SEND_CLOSED: u32 = 1 << 3;
    /// Receive queue torn down.
    pub const RECV_CLOSED: u32 = 1 << 4;
    /// Wake signal torn down.
    pub const WAKE_CLOSED: u32 = 1 << 5;
    /// Host opened the receive channel.
    pub const CAN_RECV: u32 = 1 << 6;
    /// Currently inside channel mode.
    pub const CHANNEL: u32 = 1 << 7;
    /// Host-requested channel setting.
    pub const CHANNEL_VALUE: u32 = 1 << 8;
    /// Channel setting changed since last observed.
    pub const CHANNEL_UPDATED: u32 = 1 << 9;
    /// Identity handoff in progress.
    pub const MOVING: u32 = 1 << 10;
    /// Server-side close staged, waiting for the client ack.
    pub const SHUTDOWN_WAIT: u32 = 1 << 11;

    /// Fresh state with no flags set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `mask`; returns true when at least one bit was newly set.
    pub fn set(&self, mask: u32) -> bool {
        self.bits.fetch_or(mask, Ordering::SeqCst) & mask != mask
    }

    /// Clear `mask`; returns true when at least one bit was previously set.
    pub fn unset(&self, mask: u32) -> bool {
        self.bits.fetch_and(!mask, Ordering::SeqCst) & mask != 0
    }

    /// True when every bit of `mask` is set.
    #[must_use]
    pub fn contains(&self, mask: u32) -> bool {
        self.bits.load(Ordering::SeqCst) & mask == mask
    }

    /// Shorthand for [`State::CLOSING`].
    #[must_use]
    pub fn closing(&self) -> bool {
        self.contains(Self::CLOSING)
    }

    /// Shorthand for [`State::CLOSED`].
    #[must_use]
    pub fn closed(&self) -> bool {
        self.contains(Self::CLOSED)
    }

    /// Shorthand for [`State::SHUTDOWN`].
    #[must_use]
    pub fn shutdown(&self) -> bool {
        self.contains(Self::SHUTDOWN)
    }

    /// Shorthand for [`State::SEND_CLOSED`].
    #[must_use]
    pub fn send_closed(&self) -> bool {
        self.contains(Self::SEND_CLOSED)
    }

    /// Shorthand for [`State::CAN_RECV`].
    #[must_use]
    pub fn can_recv(&self) -> bool {
        self.contains(Self::CAN_RECV)
    }

    /// Shorthand for [`State::CHANNEL`].
    #[must_use]
    pub fn channel(&self) -> bool {
        self.contains(Self::CHANNEL)
    }

    /// Shorthand for [`State::CHANNEL_VALUE`].
    #[must_use]
    pub fn channel_value(&self) -> bool {
        self.contains(Self::CHANNEL_VALUE)
    }

    /// Shorthand for [`State::MOVING`].
    #[must_use]
    pub fn moving(&self) -> bool {
        self.contains(Self::MOVING)
    }

    /// Shorthand for [`State::SHUTDOWN_WAIT`].
    #[must_use]
    pub fn shutdown_wait(&self) -> bool {
        self.contains(Self::SHUTDOWN_WAIT)
    }

    /// Record the host's requested channel setting.
    ///
    /// Returns false when the request changes nothing (already at the
    /// requested value), true when it was recorded; the updated marker
    /// is set so the running exchange notices.
    pub fn set_channel(&self, on: bool) -> bool {
        if on {
            if self.channel_value() {
                return false;
            }
            self.set(Self::CHANNEL_VALUE);
        } else {
            if !self.channel_value() {
                return false;
            }
            self.unset(Self::CHANNEL_VALUE);
        }
        self.set(Self::CHANNEL_UPDATED);
        true
    }

    /// Should the next exchange request channel mode?
    #[must_use]
    pub fn channel_can_start(&self) -> bool {
        self.channel() || self.channel_value()
    }

    /// Should a running channel stop now?
    ///
    /// Consumes the updated marker: the first caller after a
    /// `set_channel(false)` observes the stop request.
    #[must_use]
    pub fn channel_can_stop(&self) -> bool {
        if self.unset(Self::CHANNEL_UPDATED) {
            return !self.channel_value() || self.closing();
        }
        !self.channel() || self.closing()
    }

    /// The last-observed fragment group (0 = none).
    #[must_use]
    pub fn last(&self) -> u16 {
        self.last.load(Ordering::SeqCst) as u16
    }

    /// Record the last-observed fragment group.
    pub fn set_last(&self, group: u16) {
        self.last.store(group as u32, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reports_transition() {
        let s = State::new();
        assert!(s.set(State::CLOSING));
        assert!(!s.set(State::CLOSING));
        assert!(s.closing());
        assert!(s.unset(State::CLOSING));
        assert!(!s.unset(State::CLOSING));
    }

    #[test]
    fn test_bits_are_independent() {
        let s = State::new();
        s.set(State::CHANNEL | State::MOVING);
        assert!(s.channel());
        assert!(s.moving());
        assert!(!s.closing());
        s.unset(State::CHANNEL);
        assert!(!s.channel());
        assert!(s.moving());
    }

    #[test]
    fn test_set_channel_tracks_value() {
        let s = State::new();
        assert!(s.set_channel(true));
        assert!(!s.set_channel(true));
        assert!(s.channel_can_start());
        assert!(s.set_channel(false));
        assert!(!s.set_channel(false));
        assert!(!s.channel_can_start());
    }

    #[test]
    fn test_channel_stop_consumes_marker() {
        let s = State::new();
        s.set_channel(true);
        s.set(State::CHANNEL);
        // Request recorded but value still on: keep running.
        assert!(!s.channel_can_stop());
        s.set_channel(false);
        // First observer sees the stop request.
        assert!(s.channel_can_stop());
    }

    #[test]
    fn test_closing_stops_channel() {
        let s = State::new();
        s.set_channel(true);
        s.set(State::CHANNEL);
        let _ = s.channel_can_stop(); // drain the update marker
        assert!(!s.channel_can_stop());
        s.set(State::CLOSING);
        assert!(s.channel_can_stop());
    }

    #[test]
    fn test_last_group_slot() {
        let s = State::new();
        assert_eq!(s.last(), 0);
        s.set_last(0x1234);
        assert_eq!(s.last(), 0x1234);
        s.set_last(0);
        assert_eq!(s.last(), 0);
    }
}
