//! Multi-process delivery over loopback QUIC
//!
//! Each test runs two or more servers in one process sharing a
//! `MemoryStore`, so bindings and transponds behave as in a cluster.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use hermod::config::{AckMode, ServerConfig};
use hermod::discovery::{BindingStore, MemoryStore, StoreDiscovery};
use hermod::protocol::{Chat, ChatBody, ChatType, FrameType, Presence};
use hermod::server::StaticMembership;
use hermod::{
    ClientConfig, ClientEvent, Message, Method, Payload, RelayClient, RelayError, Server,
    SignedTokenAuthenticator,
};

const SECRET: &str = "cluster-secret";
const SERVICE_TOKEN: &str = "cluster-service-token";
const NAMESPACE: &str = "test.cluster";
const BINDINGS: &str = "test.cluster.boundUserKey";

fn config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.auth_secret = Some(SECRET.to_string());
    config.peer.service_token = SERVICE_TOKEN.to_string();
    config.peer.connect_timeout_ms = 1_000;
    config.retry.peer_retry_backoff_ms = 20;
    config
}

struct Node {
    server: Arc<Server>,
    discovery: Arc<StoreDiscovery>,
}

impl Node {
    async fn start(store: &Arc<MemoryStore>, config: ServerConfig) -> Self {
        Self::start_with(store, config, Arc::new(StaticMembership::new())).await
    }

    async fn start_with(
        store: &Arc<MemoryStore>,
        config: ServerConfig,
        membership: Arc<StaticMembership>,
    ) -> Self {
        let discovery = Arc::new(StoreDiscovery::new(
            store.clone(),
            NAMESPACE,
            config.peer.clone(),
        ));
        let server = Arc::new(
            Server::builder(config)
                .discovery(discovery.clone())
                .membership(membership)
                .bind()
                .await
                .unwrap(),
        );

        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });
        Self { server, discovery }
    }

    async fn connect(&self, user: &str) -> (RelayClient, UnboundedReceiver<ClientEvent>) {
        let token = SignedTokenAuthenticator::new(SECRET).issue(user);
        RelayClient::connect(ClientConfig::with_token(self.server.local_addr(), token))
            .await
            .unwrap()
    }
}

/// Next non-Ack message frame
async fn next_message(events: &mut UnboundedReceiver<ClientEvent>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(ClientEvent::Message(msg)) if msg.frame_type() == FrameType::Ack => continue,
                Some(ClientEvent::Message(msg)) => return msg,
                other => panic!("expected a message, got {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for a message")
}

async fn next_disconnect(events: &mut UnboundedReceiver<ClientEvent>) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(ClientEvent::Disconnected(reason)) => return reason,
                Some(ClientEvent::Message(_)) => continue,
                None => return String::new(),
            }
        }
    })
    .await
    .expect("timed out waiting for disconnect")
}

/// Asserts no further message frame arrives within `window`
async fn assert_quiet(events: &mut UnboundedReceiver<ClientEvent>, window: Duration) {
    let extra = tokio::time::timeout(window, next_message(events)).await;
    assert!(extra.is_err(), "unexpected frame {:?}", extra.map(|m| m.id));
}

async fn wait_for_binding(store: &MemoryStore, user: &str, expected: Option<&str>) {
    for _ in 0..200 {
        let current = store.get_binding(BINDINGS, user).await.unwrap();
        if current.as_deref() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("binding of {} never became {:?}", user, expected);
}

fn chat(from: &str, to: &str, content: &str) -> Message {
    Message::data(
        Method::ConversationChat,
        from,
        Payload::Chat(Chat {
            conversation_id: format!("{}_{}", from, to),
            chat_type: ChatType::Single,
            send_id: from.to_string(),
            recv_id: to.to_string(),
            msg: ChatBody {
                m_type: 0,
                content: content.to_string(),
            },
            send_time: hermod::current_timestamp(),
        }),
    )
}

fn error_reason(msg: &Message) -> &str {
    assert_eq!(msg.frame_type(), FrameType::Err);
    match &msg.data {
        Payload::Error(reason) => reason,
        other => panic!("expected an error reason, got {:?}", other),
    }
}

#[tokio::test]
async fn test_chat_crosses_processes_then_unbound_after_disconnect() {
    let store = Arc::new(MemoryStore::new());
    let a = Node::start(&store, config()).await;
    let b = Node::start(&store, config()).await;

    let (alice, mut alice_events) = a.connect("alice").await;
    let (bob, mut bob_events) = b.connect("bob").await;
    assert_eq!(alice.user_id(), "alice");

    let a_addr = a.server.advertise_addr().to_string();
    wait_for_binding(&store, "alice", Some(&a_addr)).await;
    wait_for_binding(&store, "bob", Some(b.server.advertise_addr())).await;

    let sent = chat("bob", "alice", "hi alice");
    bob.send(&sent).await.unwrap();

    let received = next_message(&mut alice_events).await;
    assert_eq!(received.frame_type(), FrameType::Data);
    assert_eq!(received.method, Method::ConversationChat);
    assert_eq!(received.from_id, "bob");
    assert_eq!(received.id, sent.id);
    assert_eq!(received.data, sent.data);

    alice.close("logout").await;
    wait_for_binding(&store, "alice", None).await;

    let retry = chat("bob", "alice", "still there?");
    bob.send(&retry).await.unwrap();

    let reply = next_message(&mut bob_events).await;
    assert_eq!(reply.id, retry.id);
    let reason = error_reason(&reply);
    assert!(reason.contains("alice"), "{}", reason);
    assert!(reason.contains(&RelayError::unbound_user("alice").to_string()));

    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test]
async fn test_sender_identity_cannot_be_spoofed() {
    let store = Arc::new(MemoryStore::new());
    let a = Node::start(&store, config()).await;
    let b = Node::start(&store, config()).await;

    let (_alice, mut alice_events) = a.connect("alice").await;
    let (mallory, _mallory_events) = b.connect("mallory").await;

    let mut forged = chat("bob", "alice", "it's bob, honest");
    forged.from_id = "bob".to_string();
    mallory.send(&forged).await.unwrap();

    let received = next_message(&mut alice_events).await;
    assert_eq!(received.from_id, "mallory");

    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test]
async fn test_group_chat_fans_out_across_processes() {
    let store = Arc::new(MemoryStore::new());
    let membership = Arc::new(StaticMembership::new());
    membership.set_members(
        "g1",
        vec!["alice".to_string(), "bob".to_string(), "carol".to_string()],
    );

    let a = Node::start_with(&store, config(), membership.clone()).await;
    let b = Node::start_with(&store, config(), membership).await;

    let (_alice, mut alice_events) = a.connect("alice").await;
    let (_carol, mut carol_events) = a.connect("carol").await;
    let (bob, mut bob_events) = b.connect("bob").await;

    let mut group = chat("bob", "g1", "hello group");
    if let Payload::Chat(body) = &mut group.data {
        body.chat_type = ChatType::Group;
        body.conversation_id = "g1".to_string();
    }
    bob.send(&group).await.unwrap();

    for events in [&mut alice_events, &mut carol_events] {
        let received = next_message(events).await;
        assert_eq!(received.id, group.id);
        assert_eq!(received.from_id, "bob");
    }

    // Sender only sees its Ack
    let nothing =
        tokio::time::timeout(Duration::from_millis(300), next_message(&mut bob_events)).await;
    assert!(nothing.is_err());

    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test]
async fn test_presence_and_unknown_method() {
    let store = Arc::new(MemoryStore::new());
    let a = Node::start(&store, config()).await;

    let (alice, mut alice_events) = a.connect("alice").await;
    let (_carol, _carol_events) = a.connect("carol").await;

    let online = Message::data(Method::UserOnline, "alice", Payload::Empty);
    alice.send(&online).await.unwrap();
    let reply = next_message(&mut alice_events).await;
    assert_eq!(reply.id, online.id);
    assert_eq!(
        reply.data,
        Payload::Presence(Presence {
            users: vec!["alice".to_string(), "carol".to_string()],
        })
    );

    let custom = Message::data(
        Method::Other("room.custom".to_string()),
        "alice",
        Payload::Opaque(serde_json::json!({"x": 1})),
    );
    alice.send(&custom).await.unwrap();
    let reply = next_message(&mut alice_events).await;
    assert_eq!(reply.id, custom.id);
    assert!(error_reason(&reply).contains("room.custom"));

    // The connection survives the protocol error
    alice.send(&online).await.unwrap();
    assert_eq!(next_message(&mut alice_events).await.id, online.id);

    a.server.stop().await;
}

#[tokio::test]
async fn test_inbound_data_is_acked() {
    let store = Arc::new(MemoryStore::new());
    let a = Node::start(&store, config()).await;
    let (alice, mut alice_events) = a.connect("alice").await;

    let mut msg = Message::data(Method::UserOnline, "alice", Payload::Empty);
    msg.ack_seq = 7;
    alice.send(&msg).await.unwrap();

    let ack = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match alice_events.recv().await {
                Some(ClientEvent::Message(m)) if m.frame_type() == FrameType::Ack => return m,
                Some(ClientEvent::Message(_)) => continue,
                other => panic!("expected an ack, got {:?}", other),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(ack.id, msg.id);
    assert_eq!(ack.ack_seq, 7);

    a.server.stop().await;
}

#[tokio::test]
async fn test_rigor_delivery_is_acknowledged_by_client() {
    let store = Arc::new(MemoryStore::new());
    let mut rigor = config();
    rigor.ack_mode = AckMode::Rigor;
    let a = Node::start(&store, rigor).await;

    let (_alice, mut alice_events) = a.connect("alice").await;
    let (bob, _bob_events) = a.connect("bob").await;

    bob.send(&chat("bob", "alice", "tracked")).await.unwrap();
    let received = next_message(&mut alice_events).await;
    assert!(received.ack_seq > 0);

    let handle = a.server.registry().get("alice").unwrap();
    for _ in 0..200 {
        if handle.acks().outstanding() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.acks().outstanding(), 0);

    // No resend after the ack
    let resend =
        tokio::time::timeout(Duration::from_millis(500), next_message(&mut alice_events)).await;
    assert!(resend.is_err());

    a.server.stop().await;
}

#[tokio::test]
async fn test_bad_token_rejected() {
    let store = Arc::new(MemoryStore::new());
    let a = Node::start(&store, config()).await;

    let forged = SignedTokenAuthenticator::new("wrong-secret").issue("alice");
    let result =
        RelayClient::connect(ClientConfig::with_token(a.server.local_addr(), forged)).await;
    assert!(matches!(result, Err(RelayError::AuthFailed(_))));
    assert!(a.server.registry().is_empty());
    assert!(store.get_binding(BINDINGS, "alice").await.unwrap().is_none());

    a.server.stop().await;
}

#[tokio::test]
async fn test_store_outage_fails_connect() {
    let store = Arc::new(MemoryStore::new());
    let a = Node::start(&store, config()).await;
    store.set_available(false);

    let token = SignedTokenAuthenticator::new(SECRET).issue("alice");
    let result =
        RelayClient::connect(ClientConfig::with_token(a.server.local_addr(), token)).await;
    assert!(matches!(result, Err(RelayError::AuthFailed(_))));
    assert!(a.server.registry().is_empty());

    store.set_available(true);
    a.server.stop().await;
}

#[tokio::test]
async fn test_reconnect_supersedes_without_unbinding() {
    let store = Arc::new(MemoryStore::new());
    let a = Node::start(&store, config()).await;
    let addr = a.server.advertise_addr().to_string();

    let (_first, mut first_events) = a.connect("alice").await;
    let (_second, mut second_events) = a.connect("alice").await;

    let reason = next_disconnect(&mut first_events).await;
    assert!(reason.contains("superseded"), "{}", reason);

    // Old connection's teardown must leave the new binding alone
    tokio::time::sleep(Duration::from_millis(100)).await;
    wait_for_binding(&store, "alice", Some(&addr)).await;
    assert_eq!(a.server.registry().len(), 1);

    let (bob, _bob_events) = a.connect("bob").await;
    bob.send(&chat("bob", "alice", "to the new one")).await.unwrap();
    assert_eq!(next_message(&mut second_events).await.from_id, "bob");

    a.server.stop().await;
}

#[tokio::test]
async fn test_shutdown_relieves_and_deregisters() {
    let store = Arc::new(MemoryStore::new());
    let a = Node::start(&store, config()).await;
    let addr = a.server.advertise_addr().to_string();

    let (_alice, mut alice_events) = a.connect("alice").await;
    wait_for_binding(&store, "alice", Some(&addr)).await;

    a.server.stop().await;

    let reason = next_disconnect(&mut alice_events).await;
    assert!(reason.contains("shutting down"), "{}", reason);
    assert!(store.get_binding(BINDINGS, "alice").await.unwrap().is_none());
    assert!(!store.services(NAMESPACE).await.unwrap().contains(&addr));
}

#[tokio::test]
async fn test_relay_over_frame_limit_reported_to_sender() {
    const LIMIT: usize = 4096;
    let mut limited = config();
    limited.max_message_size = LIMIT;
    limited.peer.max_message_size = LIMIT;

    let store = Arc::new(MemoryStore::new());
    let a = Node::start(&store, limited.clone()).await;
    let b = Node::start(&store, limited).await;

    let (_alice, mut alice_events) = a.connect("alice").await;
    let (bob, mut bob_events) = b.connect("bob").await;
    wait_for_binding(&store, "alice", Some(a.server.advertise_addr())).await;

    // Fits the sender's frame, not the Transpond envelope around it
    let base = chat("bob", "alice", "").to_json().unwrap().len();
    let big = chat("bob", "alice", &"x".repeat(LIMIT - base - 40));
    assert!(big.to_json().unwrap().len() <= LIMIT);
    bob.send(&big).await.unwrap();

    let reply = next_message(&mut bob_events).await;
    assert_eq!(reply.id, big.id);
    let reason = error_reason(&reply);
    assert!(reason.contains("too large"), "{}", reason);
    assert_quiet(&mut alice_events, Duration::from_millis(300)).await;

    // The peer link is still usable
    let small = chat("bob", "alice", "fits");
    bob.send(&small).await.unwrap();
    assert_eq!(next_message(&mut alice_events).await.id, small.id);
    assert_eq!(b.server.stats().peer_connections, 1);

    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test]
async fn test_dead_peer_evicted_then_redialed_once() {
    let mut fast = config();
    fast.peer.connect_timeout_ms = 300;

    let store = Arc::new(MemoryStore::new());
    let a = Node::start(&store, fast.clone()).await;
    let b = Node::start(&store, fast.clone()).await;
    let a_addr = a.server.advertise_addr().to_string();

    let (_alice, mut alice_events) = a.connect("alice").await;
    let (bob, mut bob_events) = b.connect("bob").await;
    wait_for_binding(&store, "alice", Some(&a_addr)).await;

    let first = chat("bob", "alice", "first");
    bob.send(&first).await.unwrap();
    assert_eq!(next_message(&mut alice_events).await.id, first.id);
    let peers = b.discovery.peers();
    assert!(peers.is_connected(&a_addr));

    // A goes away while its binding lingers in the store
    a.server.stop().await;
    store.set_binding(BINDINGS, "alice", &a_addr).await.unwrap();

    let lost = chat("bob", "alice", "into the void");
    bob.send(&lost).await.unwrap();
    let reply = next_message(&mut bob_events).await;
    assert_eq!(reply.id, lost.id);
    let reason = error_reason(&reply);
    assert!(reason.contains("Delivery abandoned"), "{}", reason);
    assert!(!peers.is_connected(&a_addr));

    let direct = peers.send(&a_addr, &chat("bob", "alice", "direct")).await;
    assert!(matches!(direct, Err(RelayError::PeerUnreachable(_))), "{:?}", direct);
    assert!(!peers.is_connected(&a_addr));

    // alice comes back on a fresh process
    let a2 = Node::start(&store, fast).await;
    let a2_addr = a2.server.advertise_addr().to_string();
    let (_alice2, mut alice2_events) = a2.connect("alice").await;
    wait_for_binding(&store, "alice", Some(&a2_addr)).await;

    let again = chat("bob", "alice", "welcome back");
    bob.send(&again).await.unwrap();
    assert_eq!(next_message(&mut alice2_events).await.id, again.id);
    assert_quiet(&mut alice2_events, Duration::from_millis(500)).await;
    assert_quiet(&mut bob_events, Duration::from_millis(100)).await;

    assert!(peers.is_connected(&a2_addr));
    assert!(!peers.is_connected(&a_addr));
    let stats = b.server.stats();
    assert_eq!(stats.peer_connections, 1);
    assert_eq!(stats.connected_users, 1);
    assert_eq!(stats.bind_address, b.server.local_addr());

    a2.server.stop().await;
    b.server.stop().await;
}
