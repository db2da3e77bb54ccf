//! The accepting side: listener loop and session registry.
//!
//! The registry is owned state handed to the listener at bind time; no
//! process-global session table exists. Each inbound connection is one
//! exchange: hello packets register a server-side session, oneshot
//! packets are dispatched without creating state, and everything else
//! is answered with the next queued packet for that session (the peek
//! slot has priority). A client packet carrying the channel flag
//! upgrades the connection into streaming mode.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tether_transport::{Connection, Transport, WrapStack};

use crate::device::DeviceId;
use crate::error::Result;
use crate::packet::{Packet, flags, ids};
use crate::profile::{Group, Profile};
use crate::session::{Config, Handler, Session};
use crate::state::State;

/// How long a served connection may sit idle before it is dropped.
const SERVE_DEADLINE: Duration = Duration::from_secs(60);

/// All sessions known to one host, keyed by device id.
#[derive(Default)]
pub struct Registry {
    sessions: DashMap<DeviceId, Arc<Session>>,
}

impl Registry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a session.
    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(&s))
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of all registered sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| Arc::clone(&s)).collect()
    }

    fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    fn remove(&self, id: &DeviceId) {
        self.sessions.remove(id);
    }
}

/// Control handle for a running listener.
pub struct ListenerHandle {
    addr: String,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// The bound address.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Stop accepting and wait for the loop to finish.
    pub async fn close(self) {
        self.stop.notify_waiters();
        let _ = self.task.await;
    }
}

/// Bind a listener and start serving sessions into `registry`.
pub async fn listen(
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    addr: &str,
    wrap: WrapStack,
    handler: Arc<dyn Handler>,
    cfg: Config,
) -> Result<ListenerHandle> {
    let listener = transport.listen(addr).await?;
    let local = listener.local_addr();
    info!(addr = %local, "listening for sessions");
    let stop = Arc::new(Notify::new());
    let task = tokio::spawn(accept_loop(
        listener,
        registry,
        wrap,
        handler,
        cfg,
        Arc::clone(&stop),
    ));
    Ok(ListenerHandle {
        addr: local,
        stop,
        task,
    })
}

async fn accept_loop(
    mut listener: Box<dyn tether_transport::Listener>,
    registry: Arc<Registry>,
    wrap: WrapStack,
    handler: Arc<dyn Handler>,
    cfg: Config,
    stop: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    let registry = Arc::clone(&registry);
                    let wrap = wrap.clone();
                    let handler = Arc::clone(&handler);
                    let cfg = cfg.clone();
                    tokio::spawn(serve(conn, registry, wrap, handler, cfg));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            },
        }
    }
    debug!("listener stopped");
}

/// Service one inbound connection.
async fn serve(
    mut conn: Connection,
    registry: Arc<Registry>,
    wrap: WrapStack,
    handler: Arc<dyn Handler>,
    cfg: Config,
) {
    conn.set_read_deadline(Some(Instant::now() + SERVE_DEADLINE));
    conn.set_write_deadline(Some(Instant::now() + SERVE_DEADLINE));
    let p = match crate::session::read_packet_conn(&mut conn, &wrap).await {
        Ok(p) => p,
        Err(e) => {
            debug!(error = %e, "dropping connection: bad first packet");
            return;
        }
    };

    if p.flags.contains(flags::ONESHOT) {
        debug!(packet = %p, "oneshot packet received");
        handler.oneshot(p).await;
        return;
    }

    if p.id == ids::HELLO {
        hello(conn, p, &registry, &wrap, &handler, cfg).await;
        return;
    }

    if p.device.is_empty() {
        warn!("dropping packet without a device id");
        return;
    }
    // A session that failed over from another listener shows up here
    // without a hello; adopt it the same way.
    let session = match registry.get(&p.device) {
        Some(s) => s,
        None => {
            let s = Session::new_server(
                p.device,
                Profile::single(Group::new("")),
                Arc::clone(&handler),
                cfg,
            );
            registry.insert(Arc::clone(&s));
            info!(session = %p.device, "adopted session without hello");
            s
        }
    };
    let mut p = p;
    session.mask_in(&mut p);

    if p.id == ids::SHUTDOWN {
        // Either the ack of our staged close or a client-initiated one.
        let mut reply = Packet::with_device(ids::SHUTDOWN, session.id());
        session.mask_out(&mut reply);
        let _ = crate::session::write_packet_conn(&mut conn, &wrap, &reply).await;
        registry.remove(&session.id());
        session.state.set(State::CLOSING);
        session.finalize();
        info!(session = %session.id(), "session closed");
        return;
    }

    let channel = p.flags.contains(flags::CHANNEL);
    debug!(session = %session.id(), packet = %p, "received packet");
    if let Err(e) = session.deliver_incoming(None, p).await {
        warn!(session = %session.id(), error = %e, "receive handler failed");
        return;
    }

    let mut reply = match session.next(true).await {
        Some(r) => r,
        None => session.announce_or_ping(),
    };
    if channel {
        reply.flags.set(flags::CHANNEL);
    }
    let announced = reply.flags.contains(flags::CRYPT);
    session.mask_out(&mut reply);
    debug!(session = %session.id(), packet = %reply, "sending reply");
    if crate::session::write_packet_conn(&mut conn, &wrap, &reply)
        .await
        .is_err()
    {
        if announced {
            session.ratchet_revert();
        }
        return;
    }
    if announced {
        session.ratchet_commit();
    }

    if channel {
        session.state.set(State::CHANNEL);
        let (mut tx, rx) = conn.split();
        let reader = {
            let s = Arc::clone(&session);
            let w = wrap.clone();
            tokio::spawn(crate::session::channel_read(s, rx, w))
        };
        crate::session::channel_write(&session, &mut tx, &wrap).await;
        tx.abort();
        tx.close().await;
        let _ = reader.await;
        session.state.unset(State::CHANNEL);
    } else {
        conn.close().await;
    }
}

/// Register (or refresh) a session from a hello exchange.
async fn hello(
    mut conn: Connection,
    p: Packet,
    registry: &Arc<Registry>,
    wrap: &WrapStack,
    handler: &Arc<dyn Handler>,
    cfg: Config,
) {
    if p.device.is_empty() {
        warn!("hello without a device id");
        return;
    }
    let session = match registry.get(&p.device) {
        Some(existing) => existing,
        None => {
            let s = Session::new_server(
                p.device,
                Profile::single(Group::new("")),
                Arc::clone(handler),
                cfg,
            );
            registry.insert(Arc::clone(&s));
            info!(session = %p.device, "new session registered");
            s
        }
    };
    session.touch();
    let reply = Packet::with_device(ids::REGISTERED, session.id());
    if let Err(e) = crate::session::write_packet_conn(&mut conn, wrap, &reply).await {
        warn!(session = %session.id(), error = %e, "registration reply failed");
        return;
    }
    conn.close().await;
    if p.flags.contains(flags::DATA) && !p.data.is_empty() {
        match Packet::decode(&p.data) {
            Ok(inner) => {
                if let Err(e) = session.deliver_incoming(None, inner).await {
                    warn!(session = %session.id(), error = %e, "hello data rejected");
                }
            }
            Err(e) => warn!(session = %session.id(), error = %e, "bad hello data packet"),
        }
    }
}
