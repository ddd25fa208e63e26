//! Integration Tests for the protocol core
//!
//! Each test runs complete nodes (manager + LAN service) on loopback with
//! ephemeral ports: discovery, channel setup, pairing, dispatch and payload
//! transfers.

use async_trait::async_trait;
use lanconnect_protocol::plugins::ping::{PingPlugin, PingPluginFactory};
use lanconnect_protocol::transfer::payload_checksum;
use lanconnect_protocol::{
    CertificateInfo, ChannelService, Device, DeviceInfo, DeviceStore, DeviceType, LanConfig,
    LanService, Manager, ManagerConfig, ManagerEvent, Packet, Plugin, PluginFactory,
    PluginRegistry, Result,
};
use serde_json::json;
use std::any::Any;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

const SHARE_PACKET_TYPE: &str = "kdeconnect.share.request";

/// Downloads every announced payload and reports its bytes
struct SharePlugin {
    received: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl Plugin for SharePlugin {
    fn name(&self) -> &str {
        "share"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![SHARE_PACKET_TYPE.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![SHARE_PACKET_TYPE.to_string()]
    }

    async fn handle_packet(&self, packet: &Packet, device: &Device) -> Result<()> {
        let mut data = Vec::new();
        device.download(packet, &mut data).await?;
        let _ = self.received.send(data);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct SharePluginFactory {
    received: mpsc::UnboundedSender<Vec<u8>>,
}

impl PluginFactory for SharePluginFactory {
    fn name(&self) -> &str {
        "share"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![SHARE_PACKET_TYPE.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![SHARE_PACKET_TYPE.to_string()]
    }

    fn create(&self, _device: &Device) -> Arc<dyn Plugin> {
        Arc::new(SharePlugin {
            received: self.received.clone(),
        })
    }
}

/// One running peer
struct Node {
    manager: Manager,
    service: Arc<LanService>,
    events: broadcast::Receiver<ManagerEvent>,
    shared: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Node {
    async fn start(id: &str, cert: &CertificateInfo, store: DeviceStore, config: ManagerConfig) -> Node {
        let (received, shared) = mpsc::unbounded_channel();
        let mut registry = PluginRegistry::new();
        registry.register_factory(Arc::new(PingPluginFactory)).unwrap();
        registry
            .register_factory(Arc::new(SharePluginFactory { received }))
            .unwrap();

        let info = DeviceInfo::with_id(id, id, DeviceType::Desktop, 0)
            .with_incoming_capabilities(registry.get_all_incoming_capabilities())
            .with_outgoing_capabilities(registry.get_all_outgoing_capabilities());
        let manager = Manager::new(config, registry, store);
        let lan_config = LanConfig {
            port: 0,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            broadcast_interval: Duration::from_secs(3600),
            ..LanConfig::default()
        };
        let service = Arc::new(LanService::new(info, cert, manager.policy(), lan_config).unwrap());
        manager.add_service(service.clone()).await;

        let events = manager.subscribe();
        manager.start().await.unwrap();
        Node {
            manager,
            service,
            events,
            shared,
        }
    }

    async fn simple(id: &str) -> Node {
        let cert = CertificateInfo::generate(id).unwrap();
        Node::start(id, &cert, DeviceStore::in_memory(), ManagerConfig::default()).await
    }

    fn address(&self) -> String {
        format!("lan://127.0.0.1:{}", self.service.local_port().unwrap())
    }

    async fn connected_device(&self, id: &str) -> Device {
        let manager = &self.manager;
        eventually(|| async move {
            manager
                .device(id)
                .await
                .is_some_and(|d| d.is_connected())
        })
        .await;
        self.manager.device(id).await.unwrap()
    }

    async fn next_event(&mut self, matches: impl Fn(&ManagerEvent) -> bool) -> ManagerEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match self.events.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn stop(self) {
        self.manager.stop().await;
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

/// Pair `a` (requesting) with `b` (accepting); returns (b as seen by a, a as seen by b)
async fn pair(a: &mut Node, a_id: &str, b: &mut Node, b_id: &str) -> (Device, Device) {
    let b_seen_by_a = a.connected_device(b_id).await;
    let a_seen_by_b = b.connected_device(a_id).await;

    b_seen_by_a.request_pair().await.unwrap();
    b.next_event(|e| matches!(e, ManagerEvent::PairingRequested { .. }))
        .await;
    a_seen_by_b.accept_pair().await.unwrap();
    a.next_event(|e| matches!(e, ManagerEvent::Paired { .. })).await;

    assert!(b_seen_by_a.is_paired());
    assert!(a_seen_by_b.is_paired());
    (b_seen_by_a, a_seen_by_b)
}

#[tokio::test]
async fn test_identify_pair_and_ping() {
    let mut alice = Node::simple("alice").await;
    let mut bob = Node::simple("bob").await;

    alice.manager.identify(Some(&bob.address())).await.unwrap();
    let (bob_seen_by_alice, alice_seen_by_bob) = pair(&mut alice, "alice", &mut bob, "bob").await;

    assert_eq!(bob_seen_by_alice.identity().device_id, "bob");
    assert_eq!(alice_seen_by_bob.identity().device_id, "alice");
    assert!(bob_seen_by_alice.handled_types().contains(&"kdeconnect.ping".to_string()));

    let ping = bob_seen_by_alice.plugin("ping").unwrap();
    ping.as_any()
        .downcast_ref::<PingPlugin>()
        .unwrap()
        .send_ping(&bob_seen_by_alice, Some("hello".to_string()))
        .await
        .unwrap();

    let receiver = alice_seen_by_bob.plugin("ping").unwrap();
    let plugin = &receiver;
    eventually(|| async move {
        plugin
            .as_any()
            .downcast_ref::<PingPlugin>()
            .is_some_and(|p| p.pings_received() == 1)
    })
    .await;
    assert_eq!(
        receiver
            .as_any()
            .downcast_ref::<PingPlugin>()
            .unwrap()
            .last_message()
            .as_deref(),
        Some("hello")
    );

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_repeated_identity_creates_no_duplicates() {
    let alice = Node::simple("alice").await;
    let bob = Node::simple("bob").await;

    alice.manager.identify(Some(&bob.address())).await.unwrap();
    bob.connected_device("alice").await;
    alice.connected_device("bob").await;

    for _ in 0..3 {
        alice.manager.identify(Some(&bob.address())).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(bob.manager.devices().await.len(), 1);
    assert_eq!(alice.manager.devices().await.len(), 1);
    assert_eq!(bob.service.channels().await.len(), 1);
    assert_eq!(alice.service.channels().await.len(), 1);

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_payload_transfer_between_paired_devices() {
    let mut alice = Node::simple("alice").await;
    let mut bob = Node::simple("bob").await;

    bob.manager.identify(Some(&alice.address())).await.unwrap();
    let (bob_seen_by_alice, _) = pair(&mut alice, "alice", &mut bob, "bob").await;

    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let packet = Packet::new(SHARE_PACKET_TYPE, json!({ "filename": "data.bin" }));
    let sent = bob_seen_by_alice
        .upload(
            packet,
            &data[..],
            data.len() as u64,
            Some(payload_checksum(&data)),
        )
        .await
        .unwrap();
    assert_eq!(sent, data.len() as u64);

    let received = tokio::time::timeout(Duration::from_secs(10), bob.shared.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, data);

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_pairing_survives_restart_and_detects_new_certificate() {
    let alice_dir = TempDir::new().unwrap();
    let alice_cert = CertificateInfo::generate("alice").unwrap();

    let mut alice = Node::start(
        "alice",
        &alice_cert,
        DeviceStore::open(alice_dir.path()).unwrap(),
        ManagerConfig::default(),
    )
    .await;
    let mut bob = Node::simple("bob").await;
    alice.manager.identify(Some(&bob.address())).await.unwrap();
    pair(&mut alice, "alice", &mut bob, "bob").await;
    alice.stop().await;

    // Restart with the same certificate and registry: the sweep re-dials bob
    let mut alice = Node::start(
        "alice",
        &alice_cert,
        DeviceStore::open(alice_dir.path()).unwrap(),
        ManagerConfig::default(),
    )
    .await;
    let bob_seen_by_alice = alice.connected_device("bob").await;
    assert!(bob_seen_by_alice.is_paired());
    bob.stop().await;

    // Same device id, different key
    let impostor = Node::simple("bob").await;
    alice.manager.identify(Some(&impostor.address())).await.unwrap();
    let event = alice
        .next_event(|e| matches!(e, ManagerEvent::Error { .. }))
        .await;
    assert_eq!(event.device_id(), Some("bob"));

    let stored = DeviceStore::open(alice_dir.path()).unwrap();
    assert!(stored.get("bob").map_or(true, |r| !r.is_paired()));
    assert!(alice
        .manager
        .device("bob")
        .await
        .map_or(true, |d| !d.is_paired()));

    alice.stop().await;
    impostor.stop().await;
}

#[tokio::test]
async fn test_discoverability_turns_off_after_three_unpaired_devices() {
    let hub = Node::simple("hub").await;
    assert!(hub.manager.is_discoverable());

    let mut peers = Vec::new();
    for id in ["peer1", "peer2", "peer3"] {
        let peer = Node::simple(id).await;
        peer.manager.identify(Some(&hub.address())).await.unwrap();
        hub.connected_device(id).await;
        peers.push(peer);
    }
    assert!(!hub.manager.is_discoverable());

    let late = Node::simple("peer4").await;
    late.manager.identify(Some(&hub.address())).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(hub.manager.device("peer4").await.is_none());
    assert_eq!(hub.manager.devices().await.len(), 3);

    late.stop().await;
    for peer in peers {
        peer.stop().await;
    }
    hub.stop().await;
}

#[tokio::test]
async fn test_undiscoverable_node_only_accepts_targeted_peers() {
    let alice = Node::simple("alice").await;
    let bob = Node::simple("bob").await;
    bob.manager.set_discoverable(false);

    // bob neither knows nor targeted alice
    alice.manager.identify(Some(&bob.address())).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(bob.manager.devices().await.is_empty());

    // Once bob targets alice, alice dials back and bob accepts
    bob.manager.identify(Some(&alice.address())).await.unwrap();
    bob.connected_device("alice").await;
    alice.connected_device("bob").await;

    alice.stop().await;
    bob.stop().await;
}
