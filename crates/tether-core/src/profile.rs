//! Profile-directed connection policy.
//!
//! A profile is an ordered, non-empty list of groups. Each group names
//! an endpoint, a transport driver, an optional wrapper stack, and
//! sleep/jitter overrides. A selector policy chooses the active group
//! and decides how errors move it. Profiles are immutable after load;
//! the active-group index is the only mutable state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;

use tether_transport::{Connection, Pipe, Tcp, Transport, Udp, WrapStack, XorWrap};

use crate::error::{CoreError, Result};

/// Marshal format version written at the head of the blob.
const PROFILE_VERSION: u8 = 0x01;

/// Default interval between server connections.
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(30);

/// Default jitter percentage.
pub const DEFAULT_JITTER: u8 = 5;

/// The closed set of transport drivers a group can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Reliable stream over TCP.
    Tcp,
    /// Bounded datagrams over UDP.
    Udp,
    /// Local IPC stream.
    Pipe,
}

impl TransportKind {
    /// Instantiate the driver.
    #[must_use]
    pub fn driver(self) -> Arc<dyn Transport> {
        match self {
            TransportKind::Tcp => Arc::new(Tcp),
            TransportKind::Udp => Arc::new(Udp),
            TransportKind::Pipe => Arc::new(Pipe),
        }
    }

    const fn tag(self) -> u8 {
        match self {
            TransportKind::Tcp => 1,
            TransportKind::Udp => 2,
            TransportKind::Pipe => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Option<Self>> {
        match tag {
            0 => Ok(None),
            1 => Ok(Some(TransportKind::Tcp)),
            2 => Ok(Some(TransportKind::Udp)),
            3 => Ok(Some(TransportKind::Pipe)),
            _ => Err(CoreError::MalformedProfile("unknown transport tag")),
        }
    }
}

/// A serializable wrapper layer description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrapSpec {
    /// The built-in XOR masking layer.
    Xor(Vec<u8>),
}

impl WrapSpec {
    fn build(&self) -> Arc<dyn tether_transport::Wrap> {
        match self {
            WrapSpec::Xor(key) => Arc::new(XorWrap::new(key.clone())),
        }
    }
}

/// One endpoint entry within a profile.
#[derive(Clone)]
pub struct Group {
    /// Endpoint address, driver-specific.
    pub host: String,
    /// Transport driver; `None` means the group cannot connect.
    pub transport: Option<TransportKind>,
    /// Wrapper layers; `None` means inherit from the prior group.
    pub wrap: Option<Vec<WrapSpec>>,
    /// Runtime-only wrapper stack; makes the profile non-marshalable.
    pub custom_wrap: Option<WrapStack>,
    /// Sleep override; `ZERO` means inherit.
    pub sleep: Duration,
    /// Jitter override in percent; `-1` means inherit.
    pub jitter: i8,
}

impl Group {
    /// A group with only a host, inheriting everything else.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            transport: None,
            wrap: None,
            custom_wrap: None,
            sleep: Duration::ZERO,
            jitter: -1,
        }
    }

    /// Set the transport driver.
    #[must_use]
    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport = Some(kind);
        self
    }

    /// Set the wrapper layers.
    #[must_use]
    pub fn with_wrap(mut self, specs: Vec<WrapSpec>) -> Self {
        self.wrap = Some(specs);
        self
    }

    /// Attach a runtime-only wrapper stack.
    #[must_use]
    pub fn with_custom_wrap(mut self, stack: WrapStack) -> Self {
        self.custom_wrap = Some(stack);
        self
    }

    /// Set the sleep override.
    #[must_use]
    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    /// Set the jitter override.
    #[must_use]
    pub fn with_jitter(mut self, jitter: i8) -> Self {
        self.jitter = jitter;
        self
    }

    fn wrap_stack(&self) -> Option<WrapStack> {
        if let Some(stack) = &self.custom_wrap {
            return Some(stack.clone());
        }
        self.wrap.as_ref().map(|specs| {
            let mut stack = WrapStack::new();
            for s in specs {
                stack.push(s.build());
            }
            stack
        })
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("host", &self.host)
            .field("transport", &self.transport)
            .field("sleep", &self.sleep)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

/// The policy choosing which group is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selector {
    /// Stay on the first group; failures exhaust the error budget.
    #[default]
    First,
    /// Advance to the next group on error, staying at the end.
    Last,
    /// Advance every switch call.
    RoundRobin,
    /// Jump to a uniformly chosen other group every switch call.
    Random,
    /// Bias toward staying; ~25% chance to move.
    SemiRandom,
}

impl Selector {
    const fn tag(self) -> u8 {
        match self {
            Selector::First => 0,
            Selector::Last => 1,
            Selector::RoundRobin => 2,
            Selector::Random => 3,
            Selector::SemiRandom => 4,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Selector::First),
            1 => Ok(Selector::Last),
            2 => Ok(Selector::RoundRobin),
            3 => Ok(Selector::Random),
            4 => Ok(Selector::SemiRandom),
            _ => Err(CoreError::MalformedProfile("unknown selector tag")),
        }
    }
}

/// An ordered list of connection groups plus the selector policy.
pub struct Profile {
    groups: Vec<Group>,
    selector: Selector,
    active: AtomicUsize,
}

impl Profile {
    /// Build a profile; the group list must be non-empty.
    pub fn new(selector: Selector, groups: Vec<Group>) -> Result<Self> {
        if groups.is_empty() {
            return Err(CoreError::MalformedProfile("profile has no groups"));
        }
        Ok(Self {
            groups,
            selector,
            active: AtomicUsize::new(0),
        })
    }

    /// A single-group profile.
    pub fn single(group: Group) -> Self {
        Self {
            groups: vec![group],
            selector: Selector::First,
            active: AtomicUsize::new(0),
        }
    }

    fn active_group(&self) -> &Group {
        &self.groups[self.active.load(Ordering::SeqCst).min(self.groups.len() - 1)]
    }

    /// Index of the active group.
    #[must_use]
    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// The groups, in order.
    #[must_use]
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// The active group's endpoint, wrapper stack and driver.
    ///
    /// `None` values mean "inherit whatever the caller used last".
    #[must_use]
    pub fn next(&self) -> (String, Option<WrapStack>, Option<Arc<dyn Transport>>) {
        let g = self.active_group();
        (
            g.host.clone(),
            g.wrap_stack(),
            g.transport.map(TransportKind::driver),
        )
    }

    /// The active group's sleep override (`ZERO` = inherit).
    #[must_use]
    pub fn sleep(&self) -> Duration {
        self.active_group().sleep
    }

    /// The active group's jitter override (`-1` = inherit).
    #[must_use]
    pub fn jitter(&self) -> i8 {
        self.active_group().jitter
    }

    /// Move the active group per the selector policy.
    ///
    /// Returns true when the active group changed.
    pub fn switch(&self, errored: bool) -> bool {
        let n = self.groups.len();
        if n <= 1 {
            return false;
        }
        let cur = self.active.load(Ordering::SeqCst);
        let next = match self.selector {
            Selector::First => return false,
            Selector::Last => {
                if !errored || cur + 1 >= n {
                    return false;
                }
                cur + 1
            }
            Selector::RoundRobin => (cur + 1) % n,
            Selector::Random => pick_other(n, cur),
            Selector::SemiRandom => {
                if rand::thread_rng().gen_range(0u8..100) >= 25 {
                    return false;
                }
                pick_other(n, cur)
            }
        };
        self.active.store(next, Ordering::SeqCst);
        next != cur
    }

    /// Connect to `host` using the active group's driver.
    ///
    /// A group without a transport driver is not a connector.
    pub async fn connect(&self, host: &str) -> Result<Connection> {
        let Some(kind) = self.active_group().transport else {
            return Err(CoreError::NotAConnector);
        };
        Ok(kind.driver().connect(host).await?)
    }

    /// Serialize into a versioned binary blob.
    ///
    /// Fails when any group carries a runtime-only wrapper stack.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut out = vec![PROFILE_VERSION, self.selector.tag()];
        if self.groups.len() > 0xFF {
            return Err(CoreError::CannotMarshalProfile);
        }
        out.push(self.groups.len() as u8);
        for g in &self.groups {
            if g.custom_wrap.is_some() {
                return Err(CoreError::CannotMarshalProfile);
            }
            if g.host.len() > 0xFF {
                return Err(CoreError::CannotMarshalProfile);
            }
            out.push(g.host.len() as u8);
            out.extend_from_slice(g.host.as_bytes());
            out.push(g.transport.map_or(0, TransportKind::tag));
            out.extend_from_slice(&(g.sleep.as_millis() as u64).to_be_bytes());
            out.push(g.jitter as u8);
            match &g.wrap {
                None => out.push(0xFF),
                Some(specs) => {
                    if specs.len() >= 0xFF {
                        return Err(CoreError::CannotMarshalProfile);
                    }
                    out.push(specs.len() as u8);
                    for WrapSpec::Xor(key) in specs {
                        if key.len() > 0xFFFF {
                            return Err(CoreError::CannotMarshalProfile);
                        }
                        out.push(1);
                        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
                        out.extend_from_slice(key);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Rebuild a profile from a marshalled blob.
    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let mut r = Cursor { buf, pos: 0 };
        let version = r.u8()?;
        if version != PROFILE_VERSION {
            return Err(CoreError::ProfileVersion(version));
        }
        let selector = Selector::from_tag(r.u8()?)?;
        let count = r.u8()? as usize;
        if count == 0 {
            return Err(CoreError::MalformedProfile("profile has no groups"));
        }
        let mut groups = Vec::with_capacity(count);
        for _ in 0..count {
            let host_len = r.u8()? as usize;
            let host = std::str::from_utf8(r.bytes(host_len)?)
                .map_err(|_| CoreError::MalformedProfile("host is not utf-8"))?
                .to_string();
            let transport = TransportKind::from_tag(r.u8()?)?;
            let sleep = Duration::from_millis(u64::from_be_bytes(
                r.bytes(8)?.try_into().expect("8 bytes"),
            ));
            let jitter = r.u8()? as i8;
            let wrap = match r.u8()? {
                0xFF => None,
                n => {
                    let mut specs = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        if r.u8()? != 1 {
                            return Err(CoreError::MalformedProfile("unknown wrap tag"));
                        }
                        let len =
                            u16::from_be_bytes(r.bytes(2)?.try_into().expect("2 bytes")) as usize;
                        specs.push(WrapSpec::Xor(r.bytes(len)?.to_vec()));
                    }
                    Some(specs)
                }
            };
            groups.push(Group {
                host,
                transport,
                wrap,
                custom_wrap: None,
                sleep,
                jitter,
            });
        }
        if r.pos != buf.len() {
            return Err(CoreError::MalformedProfile("trailing bytes"));
        }
        Profile::new(selector, groups)
    }
}

impl Clone for Profile {
    fn clone(&self) -> Self {
        Self {
            groups: self.groups.clone(),
            selector: self.selector,
            active: AtomicUsize::new(self.active.load(Ordering::SeqCst)),
        }
    }
}

impl std::fmt::Debug for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profile")
            .field("selector", &self.selector)
            .field("groups", &self.groups.len())
            .field("active", &self.active_index())
            .finish()
    }
}

fn pick_other(n: usize, cur: usize) -> usize {
    let mut j = rand::thread_rng().gen_range(0..n - 1);
    if j >= cur {
        j += 1;
    }
    j
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(CoreError::MalformedProfile("truncated"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_groups() -> Profile {
        Profile::new(
            Selector::Last,
            vec![
                Group::new("127.0.0.1:8085")
                    .with_transport(TransportKind::Tcp)
                    .with_sleep(Duration::from_secs(5))
                    .with_jitter(0),
                Group::new("127.0.0.1:8086")
                    .with_transport(TransportKind::Tcp)
                    .with_sleep(Duration::from_secs(10))
                    .with_jitter(50),
                Group::new("127.0.0.1:8087")
                    .with_transport(TransportKind::Tcp)
                    .with_sleep(Duration::from_secs(5))
                    .with_jitter(0),
                Group::new("127.0.0.1:8088"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_first_never_advances() {
        let p = Profile::new(
            Selector::First,
            vec![
                Group::new("a").with_transport(TransportKind::Tcp),
                Group::new("b").with_transport(TransportKind::Tcp),
            ],
        )
        .unwrap();
        assert!(!p.switch(true));
        assert!(!p.switch(false));
        assert_eq!(p.active_index(), 0);
    }

    #[test]
    fn test_last_advances_on_error_and_sticks_at_end() {
        let p = four_groups();
        assert!(!p.switch(false));
        assert!(p.switch(true));
        assert_eq!(p.active_index(), 1);
        assert!(p.switch(true));
        assert!(p.switch(true));
        assert_eq!(p.active_index(), 3);
        // End reached: stay.
        assert!(!p.switch(true));
        assert_eq!(p.active_index(), 3);
    }

    #[test]
    fn test_round_robin_always_advances() {
        let p = Profile::new(
            Selector::RoundRobin,
            vec![
                Group::new("a").with_transport(TransportKind::Tcp),
                Group::new("b").with_transport(TransportKind::Tcp),
                Group::new("c").with_transport(TransportKind::Tcp),
            ],
        )
        .unwrap();
        assert!(p.switch(false));
        assert_eq!(p.active_index(), 1);
        assert!(p.switch(false));
        assert!(p.switch(true));
        assert_eq!(p.active_index(), 0);
    }

    #[test]
    fn test_random_never_stays() {
        let p = Profile::new(
            Selector::Random,
            vec![
                Group::new("a").with_transport(TransportKind::Tcp),
                Group::new("b").with_transport(TransportKind::Tcp),
                Group::new("c").with_transport(TransportKind::Tcp),
            ],
        )
        .unwrap();
        for _ in 0..50 {
            let before = p.active_index();
            assert!(p.switch(false));
            assert_ne!(p.active_index(), before);
        }
    }

    #[test]
    fn test_single_group_never_switches() {
        let p = Profile::single(Group::new("a").with_transport(TransportKind::Tcp));
        assert!(!p.switch(true));
    }

    #[test]
    fn test_marshal_roundtrip() {
        let p = four_groups();
        let blob = p.marshal().unwrap();
        assert_eq!(blob[0], PROFILE_VERSION);
        let q = Profile::unmarshal(&blob).unwrap();
        assert_eq!(q.groups().len(), 4);
        assert_eq!(q.jitter(), 0);
        let (host, _, transport) = q.next();
        assert_eq!(host, "127.0.0.1:8085");
        assert!(transport.is_some());
        assert_eq!(q.sleep(), Duration::from_secs(5));
    }

    #[test]
    fn test_marshal_wrap_layers() {
        let p = Profile::single(
            Group::new("h:1")
                .with_transport(TransportKind::Udp)
                .with_wrap(vec![WrapSpec::Xor(vec![1, 2, 3])]),
        );
        let q = Profile::unmarshal(&p.marshal().unwrap()).unwrap();
        let (_, wrap, _) = q.next();
        assert_eq!(wrap.unwrap().len(), 1);
    }

    #[test]
    fn test_custom_wrap_blocks_marshal() {
        let p = Profile::single(
            Group::new("h:1")
                .with_transport(TransportKind::Tcp)
                .with_custom_wrap(WrapStack::new()),
        );
        assert!(matches!(
            p.marshal().unwrap_err(),
            CoreError::CannotMarshalProfile
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let p = Profile::single(Group::new("h:1"));
        let mut blob = p.marshal().unwrap();
        blob[0] = 0x7F;
        assert!(matches!(
            Profile::unmarshal(&blob).unwrap_err(),
            CoreError::ProfileVersion(0x7F)
        ));
    }

    #[tokio::test]
    async fn test_transportless_group_is_not_a_connector() {
        let p = four_groups();
        p.switch(true);
        p.switch(true);
        p.switch(true);
        assert_eq!(p.active_index(), 3);
        assert!(matches!(
            p.connect("127.0.0.1:8088").await.unwrap_err(),
            CoreError::NotAConnector
        ));
    }

    #[tokio::test]
    async fn test_failover_walk_after_unmarshal() {
        let v = Profile::unmarshal(&four_groups().marshal().unwrap()).unwrap();
        assert_eq!(v.jitter(), 0);
        assert_eq!(v.next().0, "127.0.0.1:8085");

        assert!(!v.switch(false));
        assert_eq!(v.jitter(), 0);
        assert_eq!(v.next().0, "127.0.0.1:8085");

        assert!(v.switch(true));
        assert_eq!(v.jitter(), 50);
        assert_eq!(v.next().0, "127.0.0.1:8086");

        v.switch(true);
        v.switch(true);
        assert!(matches!(
            v.connect("127.0.0.1:8088").await.unwrap_err(),
            CoreError::NotAConnector
        ));
    }
}
