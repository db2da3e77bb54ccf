//! Identity handoff: spawn (copy) and migrate (transfer).
//!
//! Both operations push a session's profile (and, for migrate, its
//! identity and key material) to a freshly started local process over
//! an ephemeral pipe. The pipe name is derived from a caller-supplied
//! base plus the child pid in lowercase hex, and the whole handshake is
//! masked with an XOR key built from the UTF-8 bytes of the base name.
//!
//! Wire sequence (client = the running session, server = the child):
//!
//! ```text
//! C -> S: job_hi job_lo op          3 bytes (op 0x0F spawn, 0x0D migrate)
//! C -> S: profile block             length-prefixed
//! C -> S: device id                 16 bytes          (migrate only)
//! C -> S: proxy count + entries                       (migrate only)
//! C -> S: ratchet key               32 bytes          (migrate only)
//! S -> C: "OK"
//! C -> S: "OK"                      after Closed      (migrate only)
//! ```
//!
//! Migration is all-or-nothing: any failure before the child's `OK`
//! unsets `MOVING` and the parent keeps running.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use tether_crypto::{KEY_SIZE, SessionKey, Xor, XorStream};
use tether_transport::pipe;

use crate::device::DeviceId;
use crate::error::{CoreError, Result};
use crate::state::State;

use super::Session;

const OP_SPAWN: u8 = 0x0F;
const OP_MIGRATE: u8 = 0x0D;

/// How long the parent spins waiting for the child's pipe.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for the parent session to reach
/// `CLOSED` during migration.
const CLOSE_POLL: Duration = Duration::from_micros(500);

/// A startable child process the handoff API drives.
#[async_trait]
pub trait Runnable: Send {
    /// Start the process.
    fn start(&mut self) -> std::io::Result<()>;

    /// Process id of the started child (0 before start).
    fn pid(&self) -> u32;

    /// Block until the child exits.
    async fn wait(&mut self) -> std::io::Result<()>;

    /// Detach from the child, leaving it running.
    fn release(&mut self);

    /// Request a different parent process for the child.
    fn set_parent(&mut self, pid: Option<u32>);
}

/// A [`Runnable`] backed by a local command.
pub struct Process {
    program: String,
    args: Vec<String>,
    parent: Option<u32>,
    child: Option<tokio::process::Child>,
}

impl Process {
    /// Describe a command to run.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            parent: None,
            child: None,
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[async_trait]
impl Runnable for Process {
    fn start(&mut self) -> std::io::Result<()> {
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .spawn()?;
        self.child = Some(child);
        Ok(())
    }

    fn pid(&self) -> u32 {
        self.child.as_ref().and_then(|c| c.id()).unwrap_or(0)
    }

    async fn wait(&mut self) -> std::io::Result<()> {
        if let Some(child) = self.child.as_mut() {
            child.wait().await?;
        }
        Ok(())
    }

    fn release(&mut self) {
        // Dropping the handle leaves the child running.
        let _ = self.child.take();
    }

    fn set_parent(&mut self, pid: Option<u32>) {
        // Recorded for platforms that support re-parenting at spawn;
        // a plain command spawn cannot honor it.
        self.parent = pid;
    }
}

/// Which handoff operation the pipe carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffOp {
    /// Copy: the child becomes an independent session.
    Spawn,
    /// Transfer: the child takes over this identity.
    Migrate,
}

/// One proxied listener carried across a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    /// Proxy name.
    pub name: String,
    /// Bind address.
    pub addr: String,
    /// Marshalled profile of the proxy listener.
    pub profile: Vec<u8>,
}

/// Identity state received by the child end of a handoff.
#[derive(Debug)]
pub struct Inherited {
    /// The operation the parent performed.
    pub op: HandoffOp,
    /// Job id correlating the migration task.
    pub job: u16,
    /// Marshalled profile bytes.
    pub profile: Vec<u8>,
    /// Device identity (migrate only).
    pub device: Option<DeviceId>,
    /// Proxied listeners to re-create (migrate only).
    pub proxies: Vec<ProxyEntry>,
    /// Current ratchet key (migrate only).
    pub key: Option<SessionKey>,
}

type Pipe = XorStream<UnixStream>;

async fn write_block(pipe: &mut Pipe, data: &[u8]) -> Result<()> {
    let mut head = Vec::with_capacity(5);
    match data.len() {
        0 => head.push(0),
        n if n <= 0xFF => {
            head.push(1);
            head.push(n as u8);
        }
        n if n <= 0xFFFF => {
            head.push(2);
            head.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            head.push(3);
            head.extend_from_slice(&(n as u32).to_be_bytes());
        }
    }
    pipe.write_all(&head).await?;
    if !data.is_empty() {
        pipe.write_all(data).await?;
    }
    Ok(())
}

async fn read_block(pipe: &mut Pipe) -> Result<Vec<u8>> {
    let mut tag = [0u8; 1];
    pipe.read_exact(&mut tag).await?;
    let len = match tag[0] {
        0 => return Ok(Vec::new()),
        1 => {
            let mut b = [0u8; 1];
            pipe.read_exact(&mut b).await?;
            b[0] as usize
        }
        2 => {
            let mut b = [0u8; 2];
            pipe.read_exact(&mut b).await?;
            u16::from_be_bytes(b) as usize
        }
        3 => {
            let mut b = [0u8; 4];
            pipe.read_exact(&mut b).await?;
            u32::from_be_bytes(b) as usize
        }
        _ => return Err(CoreError::Malformed("invalid block width tag")),
    };
    let mut data = vec![0u8; len];
    pipe.read_exact(&mut data).await?;
    Ok(data)
}

impl Session {
    fn marshalled_profile(&self, supplied: Option<Vec<u8>>) -> Result<Vec<u8>> {
        match supplied {
            Some(b) if !b.is_empty() => Ok(b),
            _ => self.profile.lock().expect("profile lock").marshal(),
        }
    }

    /// Copy this session's profile to a new process.
    ///
    /// Returns the child pid. The child becomes an independent session
    /// with its own identity; this session keeps running.
    pub async fn spawn(&self, name: &str, runnable: &mut dyn Runnable) -> Result<u32> {
        self.spawn_profile(name, None, DEFAULT_TIMEOUT, runnable)
            .await
    }

    /// [`Session::spawn`] with explicit profile bytes and timeout.
    pub async fn spawn_profile(
        &self,
        name: &str,
        profile: Option<Vec<u8>>,
        timeout: Duration,
        runnable: &mut dyn Runnable,
    ) -> Result<u32> {
        if !self.is_client() {
            return Err(CoreError::NotClient);
        }
        if self.is_moving() {
            return Err(CoreError::Migrating);
        }
        if name.is_empty() {
            return Err(CoreError::EmptyName);
        }
        let blob = self.marshalled_profile(profile)?;
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        info!(session = %self.id, "starting spawn");
        runnable.start()?;
        let pid = runnable.pid();
        debug!(session = %self.id, pid, "child started, waiting for pipe");
        let stream = pipe::spin_connect(name, pid, timeout)
            .await
            .map_err(|_| CoreError::NoConn)?;
        let mut pipe = XorStream::new(stream, Xor::new(name.as_bytes().to_vec()));

        pipe.write_all(&[0, 0, OP_SPAWN]).await?;
        write_block(&mut pipe, &blob).await?;
        let mut ack = [0u8; 2];
        pipe.read_exact(&mut ack).await?;
        if &ack != b"OK" {
            return Err(CoreError::BadResponse);
        }
        info!(session = %self.id, pid, "spawn complete");
        Ok(pid)
    }

    /// Transfer this session's identity to a new process.
    ///
    /// On success the parent session is `CLOSED` without invoking the
    /// shutdown hook; the child resumes with the same device id and
    /// ratchet key. Returns the child pid.
    pub async fn migrate(&self, name: &str, job: u16, runnable: &mut dyn Runnable) -> Result<u32> {
        self.migrate_profile(name, None, job, DEFAULT_TIMEOUT, runnable)
            .await
    }

    /// [`Session::migrate`] with explicit profile bytes and timeout.
    pub async fn migrate_profile(
        &self,
        name: &str,
        profile: Option<Vec<u8>>,
        job: u16,
        timeout: Duration,
        runnable: &mut dyn Runnable,
    ) -> Result<u32> {
        if !self.is_client() {
            return Err(CoreError::NotClient);
        }
        if name.is_empty() {
            return Err(CoreError::EmptyName);
        }
        let blob = self.marshalled_profile(profile)?;
        if !self.state.set(State::MOVING) {
            return Err(CoreError::Migrating);
        }
        info!(session = %self.id, "starting migration");
        let res = self
            .migrate_inner(name, blob, job, timeout, runnable)
            .await;
        if res.is_err() {
            self.state.unset(State::MOVING);
        }
        res
    }

    async fn migrate_inner(
        &self,
        name: &str,
        blob: Vec<u8>,
        job: u16,
        timeout: Duration,
        runnable: &mut dyn Runnable,
    ) -> Result<u32> {
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        runnable.start()?;
        let pid = runnable.pid();
        debug!(session = %self.id, pid, "child started, waiting for pipe");
        let stream = pipe::spin_connect(name, pid, timeout)
            .await
            .map_err(|_| CoreError::NoConn)?;
        let mut pipe = XorStream::new(stream, Xor::new(name.as_bytes().to_vec()));

        pipe.write_all(&[(job >> 8) as u8, job as u8, OP_MIGRATE])
            .await?;
        write_block(&mut pipe, &blob).await?;
        pipe.write_all(self.id.as_bytes()).await?;
        // No active proxies travel with this build.
        pipe.write_all(&[0u8]).await?;
        let key = *self.ratchet.lock().expect("ratchet lock").current().as_bytes();
        pipe.write_all(&key).await?;

        let mut ack = [0u8; 2];
        pipe.read_exact(&mut ack).await?;
        if &ack != b"OK" {
            return Err(CoreError::BadResponse);
        }

        // Point of no return: the child owns the identity now.
        debug!(session = %self.id, "child acknowledged, shutting the loop down");
        self.state.set(State::CLOSING);
        self.wake();
        while !self.state.closed() {
            tokio::time::sleep(CLOSE_POLL).await;
        }
        if let Err(e) = pipe.write_all(b"OK").await {
            warn!(session = %self.id, error = %e, "final ack failed, child may linger");
        }
        runnable.release();
        self.signal_done();
        info!(session = %self.id, pid, "migration complete");
        Ok(pid)
    }
}

/// Child side: accept one handoff on the pipe named `base`.`own-pid`.
///
/// Binds the derived endpoint, reads the transfer, acknowledges with
/// `OK`, and (for migrations) waits for the parent's final `OK` before
/// returning the inherited identity.
pub async fn accept(base: &str, timeout: Duration) -> Result<Inherited> {
    if base.is_empty() {
        return Err(CoreError::EmptyName);
    }
    let listener = pipe::listen_self(base)?;
    let path = pipe::format(base, std::process::id());
    let accepted = tokio::time::timeout(timeout, listener.accept())
        .await
        .map_err(|_| CoreError::NoConn)?;
    let (stream, _) = accepted?;
    let mut pipe = XorStream::new(stream, Xor::new(base.as_bytes().to_vec()));

    let result = accept_inner(&mut pipe, timeout).await;
    let _ = std::fs::remove_file(&path);
    result
}

async fn accept_inner(pipe: &mut Pipe, timeout: Duration) -> Result<Inherited> {
    let mut head = [0u8; 3];
    pipe.read_exact(&mut head).await?;
    let job = u16::from_be_bytes([head[0], head[1]]);
    let op = match head[2] {
        OP_SPAWN => HandoffOp::Spawn,
        OP_MIGRATE => HandoffOp::Migrate,
        _ => return Err(CoreError::Malformed("unknown handoff operation")),
    };
    let profile = read_block(pipe).await?;

    let mut inherited = Inherited {
        op,
        job,
        profile,
        device: None,
        proxies: Vec::new(),
        key: None,
    };
    if op == HandoffOp::Migrate {
        let mut device = [0u8; DeviceId::SIZE];
        pipe.read_exact(&mut device).await?;
        inherited.device = Some(DeviceId::from_bytes(device));

        let mut count = [0u8; 1];
        pipe.read_exact(&mut count).await?;
        for _ in 0..count[0] {
            let mut lens = [0u8; 4];
            pipe.read_exact(&mut lens).await?;
            let name_len = u16::from_be_bytes([lens[0], lens[1]]) as usize;
            let addr_len = u16::from_be_bytes([lens[2], lens[3]]) as usize;
            let mut name = vec![0u8; name_len];
            pipe.read_exact(&mut name).await?;
            let mut addr = vec![0u8; addr_len];
            pipe.read_exact(&mut addr).await?;
            let profile = read_block(pipe).await?;
            inherited.proxies.push(ProxyEntry {
                name: String::from_utf8(name)
                    .map_err(|_| CoreError::Malformed("proxy name is not utf-8"))?,
                addr: String::from_utf8(addr)
                    .map_err(|_| CoreError::Malformed("proxy address is not utf-8"))?,
                profile,
            });
        }

        let mut key = [0u8; KEY_SIZE];
        pipe.read_exact(&mut key).await?;
        inherited.key = Some(SessionKey::from_bytes(key));
    }

    pipe.write_all(b"OK").await?;
    if op == HandoffOp::Migrate {
        // The parent answers only once its loop has fully stopped.
        let mut fin = [0u8; 2];
        tokio::time::timeout(timeout, pipe.read_exact(&mut fin))
            .await
            .map_err(|_| CoreError::NoConn)??;
        if &fin != b"OK" {
            return Err(CoreError::BadResponse);
        }
    }
    Ok(inherited)
}
