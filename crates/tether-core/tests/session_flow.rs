// End-to-end exchanges between a client session and an in-process
// listener over loopback TCP: registration, delivery order, channel
// mode liveness, close semantics and profile failover.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::{sleep, timeout};

use tether_core::{
    Config, Group, Handler, Packet, Profile, QueueHandler, Registry, Selector, Session,
    TransportKind, connect, flags, listen,
};
use tether_transport::{Tcp, WrapStack};

/// Handler that counts shutdown-hook invocations on top of queueing.
struct CountingHandler {
    shutdowns: AtomicUsize,
}

#[async_trait::async_trait]
impl Handler for CountingHandler {
    async fn receive(
        &self,
        session: &Arc<Session>,
        _parent: Option<&Arc<Session>>,
        packet: Packet,
    ) -> tether_core::Result<()> {
        session.deliver(packet);
        Ok(())
    }

    fn shutdown(&self, _session: &Arc<Session>) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

fn fast_profile(addr: &str) -> Profile {
    Profile::single(
        Group::new(addr)
            .with_transport(TransportKind::Tcp)
            .with_sleep(Duration::from_millis(100))
            .with_jitter(0),
    )
}

fn fast_config() -> Config {
    Config {
        sleep: Duration::from_millis(100),
        jitter: 0,
        ..Config::default()
    }
}

#[tokio::test]
async fn test_register_and_deliver_in_order() {
    let registry = Arc::new(Registry::new());
    let handle = listen(
        Arc::clone(&registry),
        Arc::new(Tcp),
        "127.0.0.1:0",
        WrapStack::new(),
        Arc::new(QueueHandler),
        fast_config(),
    )
    .await
    .unwrap();

    let client = connect(
        fast_profile(handle.addr()),
        Arc::new(QueueHandler),
        fast_config(),
    )
    .await
    .unwrap();
    assert_eq!(registry.len(), 1);
    let server = registry.get(&client.id()).unwrap();
    let mut server_rx = server.packets().unwrap();

    // Three task packets queued on the client arrive in order.
    for i in 1..=3u8 {
        let mut p = Packet::new(0x40 + i);
        p.data = vec![i; 8];
        client.send(p).await.unwrap();
    }
    for i in 1..=3u8 {
        let got = timeout(Duration::from_secs(5), server_rx.recv())
            .await
            .expect("packet arrived")
            .unwrap();
        assert_eq!(got.id, 0x40 + i);
        assert_eq!(got.data, vec![i; 8]);
    }

    // And a server-queued task reaches the client on its next wake.
    let mut client_rx = client.packets().unwrap();
    let mut task = Packet::new(0x60);
    task.data = b"work item".to_vec();
    server.send(task).await.unwrap();
    let got = timeout(Duration::from_secs(5), client_rx.recv())
        .await
        .expect("task arrived")
        .unwrap();
    assert_eq!(got.id, 0x60);
    assert_eq!(got.data, b"work item");

    client.close().await;
    assert!(client.is_closed());
    handle.close().await;
}

#[tokio::test]
async fn test_fragmented_payload_reassembles() {
    let registry = Arc::new(Registry::new());
    let handle = listen(
        Arc::clone(&registry),
        Arc::new(Tcp),
        "127.0.0.1:0",
        WrapStack::new(),
        Arc::new(QueueHandler),
        fast_config(),
    )
    .await
    .unwrap();

    let cfg = Config {
        frag_limit: 4096,
        ..fast_config()
    };
    let client = connect(fast_profile(handle.addr()), Arc::new(QueueHandler), cfg)
        .await
        .unwrap();
    let server = registry.get(&client.id()).unwrap();
    let mut server_rx = server.packets().unwrap();

    let payload: Vec<u8> = (0..10 * 1024).map(|i| (i % 241) as u8).collect();
    let mut big = Packet::new(0x51);
    big.data = payload.clone();
    client.send(big).await.unwrap();

    let got = timeout(Duration::from_secs(5), server_rx.recv())
        .await
        .expect("reassembled packet arrived")
        .unwrap();
    assert_eq!(got.id, 0x51);
    assert_eq!(got.data, payload);
    assert!(!got.flags.contains(flags::FRAG));

    client.close().await;
    handle.close().await;
}

/// Handler forwarding every packet, keep-alives included.
struct LogHandler {
    tx: tokio::sync::mpsc::UnboundedSender<Packet>,
}

#[async_trait::async_trait]
impl Handler for LogHandler {
    async fn receive(
        &self,
        _session: &Arc<Session>,
        _parent: Option<&Arc<Session>>,
        packet: Packet,
    ) -> tether_core::Result<()> {
        let _ = self.tx.send(packet);
        Ok(())
    }
}

#[tokio::test]
async fn test_channel_liveness_and_end() {
    let registry = Arc::new(Registry::new());
    let (log_tx, mut log_rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = listen(
        Arc::clone(&registry),
        Arc::new(Tcp),
        "127.0.0.1:0",
        WrapStack::new(),
        Arc::new(LogHandler { tx: log_tx }),
        fast_config(),
    )
    .await
    .unwrap();

    let client = connect(
        fast_profile(handle.addr()),
        Arc::new(QueueHandler),
        fast_config(),
    )
    .await
    .unwrap();

    client.set_channel(true);
    assert!(client.in_channel());

    // The channel marker arrives first; with nothing queued afterwards
    // the writer must still emit an empty keep-alive within one sleep
    // interval.
    let mut saw_marker = false;
    let mut saw_ping = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline && !(saw_marker && saw_ping) {
        let Ok(Some(p)) = timeout(Duration::from_secs(5), log_rx.recv()).await else {
            break;
        };
        if p.flags.contains(flags::CHANNEL) {
            saw_marker = true;
        } else if saw_marker && p.is_empty() {
            saw_ping = true;
        }
    }
    assert!(saw_marker, "channel marker never arrived");
    assert!(saw_ping, "no keep-alive ping inside the channel");

    // Packets now flow without waiting for the next wake.
    let mut burst = Packet::new(0x21);
    burst.data = b"streamed".to_vec();
    client.send(burst).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut saw_burst = false;
    while tokio::time::Instant::now() < deadline {
        let Ok(Some(p)) = timeout(Duration::from_secs(5), log_rx.recv()).await else {
            break;
        };
        if p.id == 0x21 {
            saw_burst = true;
            break;
        }
    }
    assert!(saw_burst, "streamed packet never arrived");

    client.set_channel(false);
    // The end marker flows through and the session leaves channel mode.
    let mut saw_end = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        let Ok(Some(p)) = timeout(Duration::from_secs(5), log_rx.recv()).await else {
            break;
        };
        if p.flags.contains(flags::CHANNEL_END) {
            saw_end = true;
            break;
        }
    }
    assert!(saw_end, "channel end marker never arrived");
    sleep(Duration::from_millis(300)).await;
    assert!(!client.in_channel());
    assert!(client.is_active(), "session must survive channel teardown");

    client.close().await;
    handle.close().await;
}

#[tokio::test]
async fn test_server_initiated_close() {
    let registry = Arc::new(Registry::new());
    let counting = Arc::new(CountingHandler {
        shutdowns: AtomicUsize::new(0),
    });
    let handle = listen(
        Arc::clone(&registry),
        Arc::new(Tcp),
        "127.0.0.1:0",
        WrapStack::new(),
        Arc::new(QueueHandler),
        fast_config(),
    )
    .await
    .unwrap();

    let client = connect(
        fast_profile(handle.addr()),
        Arc::clone(&counting) as Arc<dyn Handler>,
        fast_config(),
    )
    .await
    .unwrap();
    let server = registry.get(&client.id()).unwrap();

    // Stage the server-side close; the client acks it on a later wake.
    server.close().await;
    timeout(Duration::from_secs(10), client.wait())
        .await
        .expect("client closed after server shutdown");
    assert!(client.is_closed());
    assert!(server.is_closed());
    assert_eq!(registry.len(), 0);
    assert_eq!(counting.shutdowns.load(Ordering::SeqCst), 1);

    handle.close().await;
}

#[tokio::test]
async fn test_failover_to_second_group() {
    let registry = Arc::new(Registry::new());
    let handle = listen(
        Arc::clone(&registry),
        Arc::new(Tcp),
        "127.0.0.1:0",
        WrapStack::new(),
        Arc::new(QueueHandler),
        fast_config(),
    )
    .await
    .unwrap();
    let live = handle.addr().to_string();

    // First group answers the hello then goes dark; the second group is
    // the live listener.
    let first = listen(
        Arc::new(Registry::new()),
        Arc::new(Tcp),
        "127.0.0.1:0",
        WrapStack::new(),
        Arc::new(QueueHandler),
        fast_config(),
    )
    .await
    .unwrap();
    let first_addr = first.addr().to_string();

    let profile = Profile::new(
        Selector::Last,
        vec![
            Group::new(&first_addr)
                .with_transport(TransportKind::Tcp)
                .with_sleep(Duration::from_millis(100))
                .with_jitter(0),
            Group::new(&live)
                .with_transport(TransportKind::Tcp)
                .with_sleep(Duration::from_millis(100))
                .with_jitter(0),
        ],
    )
    .unwrap();

    let client = connect(profile, Arc::new(QueueHandler), fast_config())
        .await
        .unwrap();
    // Kill the first listener; its port now refuses connections.
    first.close().await;

    // The loop must error on group one, switch, and register with the
    // live listener.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if registry.get(&client.id()).is_some() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "failover never reached the second group"
        );
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(client.remote_addr(), live);

    client.close().await;
    handle.close().await;
}

#[tokio::test]
async fn test_rekey_rolls_the_wire_key() {
    let registry = Arc::new(Registry::new());
    let handle = listen(
        Arc::clone(&registry),
        Arc::new(Tcp),
        "127.0.0.1:0",
        WrapStack::new(),
        Arc::new(QueueHandler),
        fast_config(),
    )
    .await
    .unwrap();

    let client = connect(
        fast_profile(handle.addr()),
        Arc::new(QueueHandler),
        fast_config(),
    )
    .await
    .unwrap();
    let server = registry.get(&client.id()).unwrap();
    let mut server_rx = server.packets().unwrap();

    client.propose_rekey(None).unwrap();
    // Exchanges keep flowing under the new key.
    for i in 1..=3u8 {
        let mut p = Packet::new(0x30 + i);
        p.data = b"after rekey".to_vec();
        client.send(p).await.unwrap();
        let got = timeout(Duration::from_secs(5), server_rx.recv())
            .await
            .expect("packet after rekey")
            .unwrap();
        assert_eq!(got.id, 0x30 + i);
        assert_eq!(got.data, b"after rekey");
    }

    client.close().await;
    handle.close().await;
}
