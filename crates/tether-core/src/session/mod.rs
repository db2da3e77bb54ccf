//! The session: one logical peer with its queues, state and loop.
//!
//! A client session owns a long-lived transaction task that wakes on a
//! profile-directed schedule, performs one exchange, and goes back to
//! sleep. Server sessions are passive: the listener services them one
//! inbound connection at a time. Hosts interact through the queue API
//! (`send`/`write`/`read`/`packets`), channel control, and `close`.

mod handoff;
mod run;

pub use handoff::{HandoffOp, Inherited, Process, ProxyEntry, Runnable, accept};
pub(crate) use run::{channel_read, channel_write, read_packet_conn, write_packet_conn};

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use tether_crypto::{KeyRatchet, SessionKey};

use crate::device::{self, DeviceId};
use crate::error::{CoreError, Result};
use crate::frag::{self, Assembler};
use crate::packet::{Packet, flags, ids, merge_tags};
use crate::profile::{DEFAULT_JITTER, DEFAULT_SLEEP, Profile};
use crate::state::State;

/// Errors tolerated before a session closes itself.
pub const MAX_ERRORS: u8 = 5;

/// Queue capacity for the transmit and receive queues.
pub const QUEUE_CAPACITY: usize = 256;

/// Channel-mode write deadline, in sleep intervals.
pub(crate) const SLEEP_MULTIPLIER: u32 = 5;

/// Per-session tuning knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Transmit/receive queue capacity.
    pub capacity: usize,
    /// Fragment payloads larger than this (0 disables fragmentation).
    pub frag_limit: usize,
    /// Sleep between exchanges when the profile does not override it.
    pub sleep: Duration,
    /// Jitter percentage when the profile does not override it.
    pub jitter: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: QUEUE_CAPACITY,
            frag_limit: 0,
            sleep: DEFAULT_SLEEP,
            jitter: DEFAULT_JITTER,
        }
    }
}

/// Host callbacks the runtime drives.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Deliver one inbound packet.
    ///
    /// Errors terminate the current exchange (but not the session).
    async fn receive(
        &self,
        session: &Arc<Session>,
        parent: Option<&Arc<Session>>,
        packet: Packet,
    ) -> Result<()>;

    /// Deliver a sessionless oneshot packet. Dropped by default.
    async fn oneshot(&self, packet: Packet) {
        let _ = packet;
    }

    /// Invoked exactly once when a session reaches `CLOSED`, unless the
    /// session migrated away.
    fn shutdown(&self, session: &Arc<Session>) {
        let _ = session;
    }
}

/// The default handler: packets land in the receive queue.
///
/// Empty keep-alives are dropped here so hosts only see real traffic.
pub struct QueueHandler;

#[async_trait]
impl Handler for QueueHandler {
    async fn receive(
        &self,
        session: &Arc<Session>,
        _parent: Option<&Arc<Session>>,
        packet: Packet,
    ) -> Result<()> {
        if !packet.is_empty() {
            session.deliver(packet);
        }
        Ok(())
    }
}

/// A logical peer relationship.
pub struct Session {
    me: Weak<Session>,
    pub(crate) id: DeviceId,
    pub(crate) client: bool,
    pub(crate) state: State,
    pub(crate) cfg: Config,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) parent: Option<Weak<Session>>,

    pub(crate) profile: Mutex<Arc<Profile>>,
    pub(crate) swap: Mutex<Option<Profile>>,
    pub(crate) host: Mutex<String>,
    sleep: AtomicU64,
    jitter: AtomicU8,
    pub(crate) errors: AtomicU8,
    last_contact: Mutex<Instant>,

    send_tx: mpsc::Sender<Packet>,
    pub(crate) send_rx: AsyncMutex<mpsc::Receiver<Packet>>,
    recv_tx: Mutex<Option<mpsc::Sender<Packet>>>,
    recv_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    pub(crate) peek: Mutex<Option<Packet>>,
    pub(crate) ratchet: Mutex<KeyRatchet>,
    pub(crate) tags: Mutex<Vec<u32>>,
    pub(crate) assembler: Mutex<Assembler>,

    pub(crate) wake: Notify,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Session {
    fn build(
        id: DeviceId,
        client: bool,
        profile: Profile,
        handler: Arc<dyn Handler>,
        cfg: Config,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(cfg.capacity.max(1));
        let (done_tx, done_rx) = watch::channel(false);
        let sleep = if profile.sleep() > Duration::ZERO {
            profile.sleep()
        } else {
            cfg.sleep
        };
        let jitter = match profile.jitter() {
            j if (0..=100).contains(&j) => j as u8,
            _ => cfg.jitter,
        };
        let host = profile.next().0;
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id,
            client,
            state: State::new(),
            cfg,
            handler,
            parent: None,
            profile: Mutex::new(Arc::new(profile)),
            swap: Mutex::new(None),
            host: Mutex::new(host),
            sleep: AtomicU64::new(sleep.as_millis() as u64),
            jitter: AtomicU8::new(jitter),
            errors: AtomicU8::new(0),
            last_contact: Mutex::new(Instant::now()),
            send_tx,
            send_rx: AsyncMutex::new(send_rx),
            recv_tx: Mutex::new(None),
            recv_rx: Mutex::new(None),
            peek: Mutex::new(None),
            ratchet: Mutex::new(KeyRatchet::new(initial_key(&id))),
            tags: Mutex::new(Vec::new()),
            assembler: Mutex::new(Assembler::new()),
            wake: Notify::new(),
            done_tx,
            done_rx,
        })
    }

    pub(crate) fn new_client(profile: Profile, handler: Arc<dyn Handler>, cfg: Config) -> Arc<Self> {
        Self::build(device::local_id(), true, profile, handler, cfg)
    }

    pub(crate) fn new_server(
        id: DeviceId,
        profile: Profile,
        handler: Arc<dyn Handler>,
        cfg: Config,
    ) -> Arc<Self> {
        Self::build(id, false, profile, handler, cfg)
    }

    /// The session's device identifier.
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// True for client-created sessions.
    #[must_use]
    pub fn is_client(&self) -> bool {
        self.client
    }

    /// True while the session can still send and receive packets.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.state.closing()
    }

    /// True once the session reached its terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed()
    }

    /// True when channel mode is running or requested.
    #[must_use]
    pub fn in_channel(&self) -> bool {
        self.state.channel() || self.state.channel_value()
    }

    pub(crate) fn is_moving(&self) -> bool {
        self.client && self.state.moving()
    }

    /// The interval between exchanges.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.sleep.load(Ordering::SeqCst))
    }

    /// Replace the interval between exchanges.
    pub fn update_interval(&self, sleep: Duration) {
        if sleep >= Duration::from_millis(1) {
            self.sleep
                .store(sleep.as_millis() as u64, Ordering::SeqCst);
        }
    }

    /// The jitter percentage (0 = disabled).
    #[must_use]
    pub fn jitter(&self) -> u8 {
        self.jitter.load(Ordering::SeqCst)
    }

    /// Replace the jitter percentage.
    pub fn update_jitter(&self, jitter: u8) {
        if jitter <= 100 {
            self.jitter.store(jitter, Ordering::SeqCst);
        }
    }

    /// The endpoint the session last connected (or will connect) to.
    #[must_use]
    pub fn remote_addr(&self) -> String {
        self.host.lock().expect("host lock").clone()
    }

    /// When the peer last answered.
    #[must_use]
    pub fn last_contact(&self) -> Instant {
        *self.last_contact.lock().expect("last-contact lock")
    }

    pub(crate) fn touch(&self) {
        *self.last_contact.lock().expect("last-contact lock") = Instant::now();
    }

    /// Interrupt the loop's sleep, forcing an immediate exchange.
    ///
    /// Only meaningful on client sessions.
    pub fn wake(&self) {
        if self.client && !self.state.contains(State::WAKE_CLOSED) {
            self.wake.notify_one();
        }
    }

    /// Stage a replacement profile; applied at the top of the next
    /// iteration.
    pub fn swap_profile(&self, profile: Profile) {
        *self.swap.lock().expect("swap lock") = Some(profile);
        self.wake();
    }

    /// Stage a ratchet key for announcement on the next exchange.
    ///
    /// `None` generates a fresh random key.
    pub fn propose_rekey(&self, key: Option<SessionKey>) -> Result<()> {
        if self.state.closing() {
            return Err(CoreError::Closed);
        }
        let key = match key {
            Some(k) => k,
            None => SessionKey::generate()?,
        };
        self.ratchet.lock().expect("ratchet lock").propose(key);
        Ok(())
    }

    /// Request or end channel mode; takes effect on the next exchange.
    pub fn set_channel(&self, on: bool) {
        if self.state.closing() || self.is_moving() || !self.state.set_channel(on) {
            return;
        }
        let mut marker = Packet::with_device(0, self.id);
        marker.flags.set(if on {
            flags::CHANNEL
        } else {
            flags::CHANNEL_END
        });
        self.queue(marker);
        if !self.state.channel() && self.client {
            self.wake();
        }
    }

    /// Queue a packet, waiting for space when the queue is full.
    pub async fn send(&self, p: Packet) -> Result<()> {
        if self.state.closing() || self.state.send_closed() {
            return Err(CoreError::Closed);
        }
        let parts = frag::split(p, self.cfg.frag_limit)?;
        for part in parts {
            self.send_tx
                .send(part)
                .await
                .map_err(|_| CoreError::Closed)?;
            if self.state.channel() {
                self.wake();
            }
        }
        Ok(())
    }

    /// Queue a packet without waiting.
    ///
    /// Fails fast with [`CoreError::FullBuffer`] when the queue cannot
    /// take the packet or all of its fragments.
    pub fn write(&self, p: Packet) -> Result<()> {
        if self.state.closing() || self.state.send_closed() {
            return Err(CoreError::Closed);
        }
        let parts = frag::split(p, self.cfg.frag_limit)?;
        if self.send_tx.capacity() < parts.len() {
            return Err(CoreError::FullBuffer);
        }
        for part in parts {
            self.send_tx.try_send(part).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => CoreError::FullBuffer,
                mpsc::error::TrySendError::Closed(_) => CoreError::Closed,
            })?;
            if self.state.channel() {
                self.wake();
            }
        }
        Ok(())
    }

    /// Best-effort internal enqueue; drops the packet when full.
    pub(crate) fn queue(&self, mut p: Packet) {
        if self.state.send_closed() {
            return;
        }
        if p.device.is_empty() {
            p.device = self.id;
        }
        trace!(session = %self.id, packet = %p, "queueing packet");
        if self.send_tx.try_send(p).is_err() {
            warn!(session = %self.id, "packet dropped: send queue is full");
        }
    }

    /// Open (or return) the receive queue.
    ///
    /// The receiver can be taken once; later calls return `None`.
    pub fn packets(&self) -> Option<mpsc::Receiver<Packet>> {
        if self.is_moving() {
            return None;
        }
        if !self.state.can_recv() {
            let (tx, rx) = mpsc::channel(self.cfg.capacity.max(1));
            *self.recv_tx.lock().expect("recv lock") = Some(tx);
            *self.recv_rx.lock().expect("recv lock") = Some(rx);
            self.state.set(State::CAN_RECV);
            info!(session = %self.id, "enabled packet receive queue");
        }
        self.recv_rx.lock().expect("recv lock").take()
    }

    /// Pop one packet from the receive queue without blocking.
    ///
    /// Only usable before the receiver was taken via [`Session::packets`].
    #[must_use]
    pub fn read(&self) -> Option<Packet> {
        let mut guard = self.recv_rx.lock().expect("recv lock");
        guard.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    /// Push a packet into the receive queue, preserving wire order.
    ///
    /// A no-op until the host opens the queue with [`Session::packets`]
    /// (or [`Session::read`]); drops with a warning when the queue is
    /// full.
    pub fn deliver(&self, p: Packet) {
        if !self.state.can_recv() {
            return;
        }
        let guard = self.recv_tx.lock().expect("recv lock");
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(p).is_err() {
                warn!(session = %self.id, "packet dropped: receive queue is full");
            }
        }
    }

    /// A watch handle that flips to true when the session closes.
    #[must_use]
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Block until the session is closed and shut down.
    pub async fn wait(&self) {
        let mut rx = self.done_rx.clone();
        let _ = rx.wait_for(|v| *v).await;
    }

    /// A strong handle to this session.
    ///
    /// Only fails in the narrow window where the last external handle
    /// was dropped mid-teardown.
    pub(crate) fn strong(&self) -> Option<Arc<Session>> {
        self.me.upgrade()
    }

    /// Close the session and wait for the loop to finish.
    ///
    /// Idempotent: a second call returns once the first completes.
    pub async fn close(&self) {
        if self.state.closing() {
            self.wait().await;
            return;
        }
        if !self.client && !self.state.shutdown_wait() {
            // Server side: stage the shutdown packet with peek priority,
            // drop everything still queued, and wait for the client ack.
            *self.peek.lock().expect("peek lock") =
                Some(Packet::with_device(ids::SHUTDOWN, self.id));
            {
                let mut rx = self.send_rx.lock().await;
                while rx.try_recv().is_ok() {}
            }
            self.state
                .unset(State::CHANNEL | State::CHANNEL_VALUE | State::CHANNEL_UPDATED);
            self.state.set(State::SHUTDOWN_WAIT);
            debug!(session = %self.id, "server close staged, waiting for client ack");
            return;
        }
        self.state
            .unset(State::CHANNEL | State::CHANNEL_VALUE | State::CHANNEL_UPDATED);
        self.state.set(State::CLOSING);
        if !self.client {
            self.finalize();
            return;
        }
        self.wake();
        self.wait().await;
    }

    /// Release resources and mark the session `CLOSED`.
    ///
    /// The shutdown hook fires exactly once, and not at all when the
    /// identity migrated to another process.
    pub(crate) fn finalize(&self) {
        if !self.state.set(State::CLOSED) {
            return;
        }
        self.state
            .set(State::SEND_CLOSED | State::WAKE_CLOSED | State::RECV_CLOSED);
        self.assembler.lock().expect("assembler lock").clear();
        if self.is_moving() {
            return;
        }
        if let Some(me) = self.strong() {
            self.handler.shutdown(&me);
        }
        let _ = self.done_tx.send(true);
    }

    /// Signal the done watchers; used by migrate after the final ack.
    pub(crate) fn signal_done(&self) {
        let _ = self.done_tx.send(true);
    }

    pub(crate) fn mask_out(&self, p: &mut Packet) {
        self.ratchet.lock().expect("ratchet lock").mask(&mut p.data);
    }

    pub(crate) fn mask_in(&self, p: &mut Packet) {
        self.ratchet.lock().expect("ratchet lock").mask(&mut p.data);
    }

    pub(crate) fn ratchet_revert(&self) {
        self.ratchet.lock().expect("ratchet lock").revert();
    }

    pub(crate) fn ratchet_commit(&self) {
        if self.ratchet.lock().expect("ratchet lock").commit() {
            debug!(session = %self.id, "ratchet key swapped after confirmed send");
        }
    }

    /// Merge received route tags into the pending set.
    pub(crate) fn merge_received_tags(&self, received: &[u32]) {
        if received.is_empty() {
            return;
        }
        let mut tags = self.tags.lock().expect("tags lock");
        merge_tags(&mut tags, received);
    }

    pub(crate) fn take_tags(&self) -> Vec<u32> {
        std::mem::take(&mut *self.tags.lock().expect("tags lock"))
    }

    /// The key-announcement packet when a rekey is staged, otherwise an
    /// empty keep-alive.
    pub(crate) fn announce_or_ping(&self) -> Packet {
        let ratchet = self.ratchet.lock().expect("ratchet lock");
        match ratchet.pending_bytes() {
            Some(bytes) => {
                let mut p = Packet::with_device(0, self.id);
                p.flags.set(flags::CRYPT);
                p.data = bytes.to_vec();
                p
            }
            None => Packet::with_device(0, self.id),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Derive the initial shared masking key from the device identity.
///
/// Both ends know the device id after the hello exchange, so the first
/// rotation can happen entirely in-band.
pub(crate) fn initial_key(id: &DeviceId) -> SessionKey {
    SessionKey::from_bytes(blake3::derive_key(
        "tether session initial key v1",
        id.as_bytes(),
    ))
}

/// Establish a client session: hello exchange, then the loop.
pub async fn connect(
    profile: Profile,
    handler: Arc<dyn Handler>,
    cfg: Config,
) -> Result<Arc<Session>> {
    connect_with(profile, handler, cfg, None).await
}

/// Like [`connect`], passing an initial data packet with the hello.
pub async fn connect_with(
    profile: Profile,
    handler: Arc<dyn Handler>,
    cfg: Config,
    data: Option<Packet>,
) -> Result<Arc<Session>> {
    let (host, wrap, transport) = profile.next();
    let transport = transport.ok_or(CoreError::NotAConnector)?;
    let wrap = wrap.unwrap_or_default();
    let mut conn = transport.connect(&host).await?;

    let mut hello = Packet::with_device(ids::HELLO, device::local_id());
    hello.job = tether_crypto::random::random_u16()?;
    if let Some(d) = data {
        hello.data = d.encode()?;
        hello.flags.set(flags::DATA);
    }
    run::write_packet_conn(&mut conn, &wrap, &hello).await?;
    let reply = run::read_packet_conn(&mut conn, &wrap).await?;
    conn.close().await;
    if reply.id != ids::REGISTERED {
        return Err(CoreError::InvalidResponse);
    }
    info!(host = %host, "registered with server");

    let session = Session::new_client(profile, handler, cfg);
    let worker = Arc::clone(&session);
    tokio::spawn(async move { run::run(worker, wrap).await });
    Ok(session)
}

/// Send one unregistered packet and drop the connection.
///
/// No session state is created on either end.
pub async fn oneshot(profile: &Profile, packet: Option<Packet>) -> Result<()> {
    let (host, wrap, transport) = profile.next();
    let transport = transport.ok_or(CoreError::NotAConnector)?;
    let wrap = wrap.unwrap_or_default();
    let mut conn = transport.connect(&host).await?;
    let mut p = packet.unwrap_or_else(|| Packet::with_device(0, device::local_id()));
    if p.device.is_empty() {
        p.device = device::local_id();
    }
    p.flags.set(flags::ONESHOT);
    run::write_packet_conn(&mut conn, &wrap, &p).await?;
    conn.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Group, TransportKind};

    fn test_session(capacity: usize) -> Arc<Session> {
        let profile = Profile::single(
            Group::new("127.0.0.1:1")
                .with_transport(TransportKind::Tcp)
                .with_sleep(Duration::from_millis(50))
                .with_jitter(0),
        );
        Session::new_client(
            profile,
            Arc::new(QueueHandler),
            Config {
                capacity,
                ..Config::default()
            },
        )
    }

    #[tokio::test]
    async fn test_write_full_buffer() {
        let s = test_session(2);
        s.write(Packet::new(1)).unwrap();
        s.write(Packet::new(2)).unwrap();
        let err = s.write(Packet::new(3)).unwrap_err();
        assert!(matches!(err, CoreError::FullBuffer));
        assert_eq!(err.code(), Some(0x4C));
    }

    #[tokio::test]
    async fn test_write_checks_all_fragments() {
        let profile = Profile::single(Group::new("h:1").with_transport(TransportKind::Tcp));
        let s = Session::new_client(
            profile,
            Arc::new(QueueHandler),
            Config {
                capacity: 2,
                frag_limit: 8,
                ..Config::default()
            },
        );
        let mut p = Packet::new(1);
        p.data = vec![0u8; 32]; // four fragments, queue holds two
        assert!(matches!(s.write(p).unwrap_err(), CoreError::FullBuffer));
    }

    #[tokio::test]
    async fn test_send_waits_for_capacity() {
        let s = test_session(1);
        s.send(Packet::new(1)).await.unwrap();

        let sender = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.send(Packet::new(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!sender.is_finished(), "send returned on a full queue");

        let popped = s.send_rx.lock().await.try_recv().unwrap();
        assert_eq!(popped.id, 1);
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_set_channel_queues_marker() {
        let s = test_session(8);
        s.set_channel(true);
        let marker = s.send_rx.lock().await.try_recv().unwrap();
        assert!(marker.flags.contains(flags::CHANNEL));
        // Unchanged request queues nothing.
        s.set_channel(true);
        assert!(s.send_rx.lock().await.try_recv().is_err());

        s.set_channel(false);
        let marker = s.send_rx.lock().await.try_recv().unwrap();
        assert!(marker.flags.contains(flags::CHANNEL_END));
    }

    #[tokio::test]
    async fn test_peek_has_priority() {
        let s = test_session(8);
        s.write(Packet::new(9)).unwrap();
        *s.peek.lock().unwrap() = Some(Packet::new(1));
        let first = s.next(false).await.unwrap();
        assert_eq!(first.id, 1);
    }

    #[tokio::test]
    async fn test_next_skips_stale_fragment_group() {
        let s = test_session(8);
        let mut stale = Packet::new(4);
        stale.flags.set(flags::FRAG);
        stale.flags.set_group(0x77);
        stale.flags.set_total(3);
        stale.flags.set_position(1);
        s.write(stale.clone()).unwrap();
        stale.flags.set_position(2);
        s.write(stale).unwrap();
        s.write(Packet::new(5)).unwrap();

        s.state.set_last(0x77);
        let n = s.next(false).await.unwrap();
        assert_eq!(n.id, 5);
        assert_eq!(s.state.last(), 0);
    }

    #[tokio::test]
    async fn test_next_merges_pending_tags() {
        let s = test_session(8);
        s.merge_received_tags(&[7, 8]);
        let mut p = Packet::new(2);
        p.tags = vec![8, 9];
        s.write(p).unwrap();
        let n = s.next(false).await.unwrap();
        assert_eq!(n.tags, vec![8, 9, 7]);
    }

    #[tokio::test]
    async fn test_empty_queue_yields_keepalive_or_announce() {
        let s = test_session(8);
        let n = s.next(false).await.unwrap();
        assert!(n.is_empty() || n.id == 0);

        s.propose_rekey(None).unwrap();
        let n = s.next(false).await.unwrap();
        assert!(n.flags.contains(flags::CRYPT));
        assert_eq!(n.data.len(), tether_crypto::KEY_SIZE);
    }

    #[tokio::test]
    async fn test_deliver_preserves_order() {
        let s = test_session(8);
        let mut rx = s.packets().expect("first take");
        for i in 1..=5u8 {
            s.deliver(Packet::new(i));
        }
        for i in 1..=5u8 {
            assert_eq!(rx.recv().await.unwrap().id, i);
        }
        assert!(s.packets().is_none(), "receiver handed out twice");
    }

    #[tokio::test]
    async fn test_crypt_packet_installs_key() {
        let s = test_session(8);
        let replacement = SessionKey::from_bytes([0x5Au8; 32]);
        let mut p = Packet::with_device(0, s.id());
        p.flags.set(flags::CRYPT);
        p.data = replacement.as_bytes().to_vec();
        s.deliver_incoming(None, p).await.unwrap();
        assert_eq!(s.ratchet.lock().unwrap().current(), &replacement);
    }
}
