//! The transaction loop: one sleep, one connect, one exchange.
//!
//! The loop is the session's only long-lived task. Each iteration
//! computes a jittered sleep, honors staged profile swaps and the
//! selector's switch decision, connects, and runs exactly one
//! request/response exchange. An exchange that observes the channel
//! flag extends into streaming mode: a sibling reader task drains the
//! connection while the loop's writer keeps feeding it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use tether_crypto::SessionKey;
use tether_transport::{Connection, RecvHalf, SendHalf, WrapStack};

use crate::error::{CoreError, Result};
use crate::packet::{Packet, flags, ids, merge_tags};
use crate::state::State;

use super::{MAX_ERRORS, SLEEP_MULTIPLIER, Session};

/// Serialize, wrap and frame one packet onto a send half.
pub(crate) async fn write_packet(
    tx: &mut SendHalf,
    wrap: &WrapStack,
    p: &Packet,
) -> Result<()> {
    let body = wrap.apply(p.encode()?)?;
    tx.write_frame(&body).await?;
    Ok(())
}

/// Read one framed packet from a receive half.
pub(crate) async fn read_packet(rx: &mut RecvHalf, wrap: &WrapStack) -> Result<Packet> {
    let body = wrap.strip(rx.read_frame().await?)?;
    Packet::decode(&body)
}

/// [`write_packet`] over an unsplit connection.
pub(crate) async fn write_packet_conn(
    conn: &mut Connection,
    wrap: &WrapStack,
    p: &Packet,
) -> Result<()> {
    let body = wrap.apply(p.encode()?)?;
    conn.write_frame(&body).await?;
    Ok(())
}

/// [`read_packet`] over an unsplit connection.
pub(crate) async fn read_packet_conn(conn: &mut Connection, wrap: &WrapStack) -> Result<Packet> {
    let body = wrap.strip(conn.read_frame().await?)?;
    Packet::decode(&body)
}

/// Compute one jittered sleep interval.
///
/// With probability `jitter`/100 a uniform delta in ±`base` is applied;
/// the result is the absolute value, clamped back to `base` when it
/// lands on zero.
fn jittered<R: Rng>(base: Duration, jitter: u8, rng: &mut R) -> Duration {
    if jitter == 0 || jitter > 100 || base <= Duration::from_millis(1) {
        return base;
    }
    if jitter != 100 && rng.gen_range(0u8..100) >= jitter {
        return base;
    }
    let span = base.as_millis() as i64;
    let mut delta = rng.gen_range(0..span);
    if rng.gen_bool(0.5) {
        delta = -delta;
    }
    match (span + delta).abs() {
        0 => base,
        ms => Duration::from_millis(ms as u64),
    }
}

impl Session {
    /// Sleep one (jittered) interval, or until woken.
    pub(crate) async fn wait_interval(&self) {
        let base = self.interval();
        if base < Duration::from_millis(1) || self.state.closing() {
            return;
        }
        let wait = jittered(base, self.jitter(), &mut rand::thread_rng());
        trace!(session = %self.id, "sleeping for {:?}", wait);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.wake.notified() => {}
        }
    }

    /// Pull the raw transmit candidate.
    ///
    /// Priority: peek slot, then the queue. In channel mode with an
    /// empty queue a helper posts a best-effort filler after one sleep
    /// interval so the writer always has something to send; outside
    /// channel mode an empty exchange sends a key announcement or an
    /// empty keep-alive instead.
    pub(crate) async fn pick(&self, only_queued: bool) -> Option<Packet> {
        if let Some(p) = self.peek.lock().expect("peek lock").take() {
            return Some(p);
        }
        {
            let mut rx = self.send_rx.lock().await;
            if let Ok(p) = rx.try_recv() {
                return Some(p);
            }
        }
        if !self.client && self.state.channel() {
            // Server-side channel writer: block until work or a wake.
            let mut rx = self.send_rx.lock().await;
            tokio::select! {
                _ = self.wake.notified() => return None,
                p = rx.recv() => return p,
            }
        }
        if !only_queued && self.client && self.parent.is_none() && self.state.channel() {
            let cancelled = Arc::new(AtomicBool::new(false));
            if let Some(me) = self.strong() {
                let flag = Arc::clone(&cancelled);
                tokio::spawn(async move {
                    me.wait_interval().await;
                    if !flag.load(Ordering::SeqCst) {
                        me.queue(me.announce_or_ping());
                    }
                });
            }
            let p = {
                let mut rx = self.send_rx.lock().await;
                rx.recv().await
            };
            cancelled.store(true, Ordering::SeqCst);
            return p;
        }
        if only_queued {
            return None;
        }
        Some(self.announce_or_ping())
    }

    /// Build the next outgoing packet per the selection invariant.
    ///
    /// Packets belonging to the last abandoned fragment group are
    /// dropped as stale; a second immediate candidate is stashed into
    /// the peek slot; pending route tags are merged in.
    pub(crate) async fn next(&self, only_queued: bool) -> Option<Packet> {
        let mut n = self.pick(only_queued).await?;
        let tags = self.take_tags();
        let last = self.state.last();
        if last != 0 {
            if n.flags.group() == last {
                let mut rx = self.send_rx.lock().await;
                loop {
                    match rx.try_recv() {
                        Ok(p) if p.flags.group() == last => continue,
                        Ok(p) => {
                            n = p;
                            break;
                        }
                        Err(_) => {
                            n = Packet::with_device(0, self.id);
                            break;
                        }
                    }
                }
            }
            self.state.set_last(0);
        }
        if self.peek.lock().expect("peek lock").is_none() {
            let mut rx = self.send_rx.lock().await;
            if let Ok(second) = rx.try_recv() {
                *self.peek.lock().expect("peek lock") = Some(second);
            }
        }
        if n.device.is_empty() {
            n.device = self.id;
        }
        if !tags.is_empty() {
            merge_tags(&mut n.tags, &tags);
        }
        Some(n)
    }

    /// Process one decrypted inbound packet.
    ///
    /// Handles key installs, fragment reassembly, multi unbundling and
    /// shutdown indications before handing anything to the host.
    pub(crate) async fn deliver_incoming(
        &self,
        parent: Option<&Arc<Session>>,
        p: Packet,
    ) -> Result<()> {
        self.touch();
        self.merge_received_tags(&p.tags);
        if p.flags.contains(flags::CRYPT) && !p.flags.contains(flags::FRAG) {
            let key = SessionKey::from_slice(&p.data)?;
            self.ratchet.lock().expect("ratchet lock").install(key);
            debug!(session = %self.id, "installed replacement ratchet key");
            return Ok(());
        }
        let assembled = self.assembler.lock().expect("assembler lock").offer(p)?;
        let Some(p) = assembled else {
            return Ok(());
        };
        if p.flags.contains(flags::MULTI) {
            for sub in p.unpack_multi()? {
                self.dispatch(parent, sub).await?;
            }
            return Ok(());
        }
        self.dispatch(parent, p).await
    }

    async fn dispatch(&self, parent: Option<&Arc<Session>>, p: Packet) -> Result<()> {
        if p.id == ids::SHUTDOWN {
            if self.client {
                info!(session = %self.id, "server indicated shutdown");
                self.state.set(State::CLOSING);
                self.wake.notify_one();
            }
            return Ok(());
        }
        let me = self.strong().ok_or(CoreError::Closed)?;
        self.handler.receive(&me, parent, p).await
    }
}

/// The long-lived transaction loop for a client session.
pub(crate) async fn run(session: Arc<Session>, mut wrap: WrapStack) {
    let mut errored = false;
    loop {
        session.wait_interval().await;
        debug!(session = %session.id, "waking up");
        if session.state.closing() {
            if session.state.moving() {
                info!(session = %session.id, "identity is migrating, stopping the loop");
                break;
            }
            info!(session = %session.id, "shutdown indicated, staging final shutdown packet");
            // This overrides whatever was stashed in the peek slot.
            *session.peek.lock().expect("peek lock") =
                Some(Packet::with_device(ids::SHUTDOWN, session.id));
            session.state.set(State::SHUTDOWN);
            session
                .state
                .unset(State::CHANNEL | State::CHANNEL_VALUE | State::CHANNEL_UPDATED);
        }
        let staged = session.swap.lock().expect("swap lock").take();
        if let Some(replacement) = staged {
            info!(session = %session.id, "performing a profile swap");
            let replacement = Arc::new(replacement);
            *session.profile.lock().expect("profile lock") = Arc::clone(&replacement);
            let (host, w, _) = replacement.next();
            if !host.is_empty() {
                *session.host.lock().expect("host lock") = host;
            }
            if let Some(w) = w {
                wrap = w;
            }
            if replacement.sleep() > Duration::ZERO {
                session.update_interval(replacement.sleep());
            }
            if (0..=100).contains(&replacement.jitter()) {
                session.update_jitter(replacement.jitter() as u8);
            }
        }
        let profile = Arc::clone(&*session.profile.lock().expect("profile lock"));
        if profile.switch(errored) {
            let (host, w, _) = profile.next();
            if !host.is_empty() {
                *session.host.lock().expect("host lock") = host;
            }
            if let Some(w) = w {
                wrap = w;
            }
            if profile.sleep() > Duration::ZERO {
                session.update_interval(profile.sleep());
            }
            if (0..=100).contains(&profile.jitter()) {
                session.update_jitter(profile.jitter() as u8);
            }
            // A switch consumes an error so rotating policies cannot
            // starve the session.
            let e = session.errors.load(Ordering::SeqCst);
            if e > 0 {
                session.errors.store(e - 1, Ordering::SeqCst);
            }
        }
        let host = session.remote_addr();
        match profile.connect(&host).await {
            Err(e) => {
                if session.state.closing() {
                    break;
                }
                warn!(session = %session.id, %host, error = %e, "connect failed");
                errored = true;
                let errs = session.errors.fetch_add(1, Ordering::SeqCst) + 1;
                if errs > MAX_ERRORS {
                    error!(session = %session.id, "too many errors, closing session");
                    break;
                }
                continue;
            }
            Ok(conn) => {
                debug!(session = %session.id, %host, "connected");
                if exchange(&session, conn, &wrap).await {
                    errored = false;
                    session.errors.store(0, Ordering::SeqCst);
                } else {
                    errored = true;
                    let errs = session.errors.fetch_add(1, Ordering::SeqCst) + 1;
                    if errs > MAX_ERRORS {
                        error!(session = %session.id, "too many errors, closing session");
                        break;
                    }
                }
                if session.state.shutdown() {
                    break;
                }
            }
        }
    }
    trace!(session = %session.id, "stopping transaction task");
    session.finalize();
}

/// One request/response exchange, optionally extending into channel
/// mode. Returns false on any failure; the connection is always torn
/// down before returning.
pub(crate) async fn exchange(session: &Arc<Session>, conn: Connection, wrap: &WrapStack) -> bool {
    let Some(mut n) = session.next(false).await else {
        return false;
    };
    session.state.unset(State::CHANNEL);
    if session.state.channel_can_start() {
        n.flags.set(flags::CHANNEL);
        session.state.set(State::CHANNEL);
        trace!(session = %session.id, "requesting channel mode on this exchange");
    } else if n.flags.contains(flags::CHANNEL) {
        session.state.set(State::CHANNEL);
    }
    let (mut tx, mut rx) = conn.split();
    // Only an outgoing key announcement moves the ratchet.
    let announced = n.flags.contains(flags::CRYPT);
    if n.id != ids::HELLO {
        session.mask_out(&mut n);
    }
    debug!(session = %session.id, packet = %n, "sending packet");
    if let Err(e) = write_packet(&mut tx, wrap, &n).await {
        error!(session = %session.id, error = %e, "error writing packet");
        if n.flags.contains(flags::FRAG) {
            // The rest of this fragment group is now undeliverable.
            session.state.set_last(n.flags.group());
        }
        if announced {
            session.ratchet_revert();
        }
        return false;
    }
    if announced {
        session.ratchet_commit();
    }

    let mut r = match read_packet(&mut rx, wrap).await {
        Ok(r) => r,
        Err(e) => {
            error!(session = %session.id, error = %e, "error reading packet");
            return false;
        }
    };
    session.mask_in(&mut r);
    if r.flags.contains(flags::CHANNEL) && !session.state.channel() {
        trace!(session = %session.id, "peer requested channel mode");
        session.state.set(State::CHANNEL);
    }
    debug!(session = %session.id, packet = %r, "received packet");
    let parent = session.parent.as_ref().and_then(|w| w.upgrade());
    if let Err(e) = session.deliver_incoming(parent.as_ref(), r).await {
        warn!(session = %session.id, error = %e, "error processing packet");
        return false;
    }
    if !session.state.channel() {
        tx.close().await;
        return true;
    }

    let reader = {
        let s = Arc::clone(session);
        let w = wrap.clone();
        tokio::spawn(channel_read(s, rx, w))
    };
    channel_write(session, &mut tx, wrap).await;
    tx.abort();
    tx.close().await;
    let _ = reader.await;
    session.state.unset(State::CHANNEL);
    true
}

/// Channel-mode reader: unbounded reads until the peer or the session
/// ends the stream.
pub(crate) async fn channel_read(session: Arc<Session>, mut rx: RecvHalf, wrap: WrapStack) {
    info!(session = %session.id, "started channel reader");
    rx.set_deadline(None);
    while session.state.channel() {
        let mut n = match read_packet(&mut rx, &wrap).await {
            Ok(n) => n,
            Err(e) => {
                debug!(session = %session.id, error = %e, "channel reader stopping");
                break;
            }
        };
        session.mask_in(&mut n);
        debug!(session = %session.id, packet = %n, "channel received packet");
        let end = n.flags.contains(flags::CHANNEL_END);
        let parent = session.parent.as_ref().and_then(|w| w.upgrade());
        if let Err(e) = session.deliver_incoming(parent.as_ref(), n).await {
            warn!(session = %session.id, error = %e, "channel processing error");
            break;
        }
        if end || session.state.channel_can_stop() {
            info!(session = %session.id, "channel close indicated");
            break;
        }
    }
    // Kick the writer loose from its queue wait and any in-flight I/O.
    rx.abort();
    session.wake.notify_one();
    debug!(session = %session.id, "closed channel reader");
}

/// Channel-mode writer: runs on the loop task, one packet per wait,
/// with a write deadline of `sleep * 5`.
pub(crate) async fn channel_write(session: &Arc<Session>, tx: &mut SendHalf, wrap: &WrapStack) {
    info!(session = %session.id, "started channel writer");
    loop {
        tx.set_deadline(Some(Instant::now() + session.interval() * SLEEP_MULTIPLIER));
        if !session.state.channel() {
            break;
        }
        let Some(mut n) = session.next(false).await else {
            info!(session = %session.id, "channel stop requested");
            break;
        };
        if session.state.channel_can_stop() {
            n.flags.set(flags::CHANNEL_END);
        }
        let announced = n.flags.contains(flags::CRYPT);
        session.mask_out(&mut n);
        debug!(session = %session.id, packet = %n, "channel sending packet");
        if let Err(e) = write_packet(tx, wrap, &n).await {
            debug!(session = %session.id, error = %e, "channel writer stopping");
            if n.flags.contains(flags::FRAG) {
                session.state.set_last(n.flags.group());
            }
            if announced {
                session.ratchet_revert();
            }
            break;
        }
        if announced {
            session.ratchet_commit();
        }
        if n.flags.contains(flags::CHANNEL_END) {
            info!(session = %session.id, "channel end sent");
            break;
        }
    }
    debug!(session = %session.id, "closed channel writer");
}
