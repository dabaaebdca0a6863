//! Method-based dispatch and local-first delivery

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::registry::ConnectionRegistry;
use crate::config::RetryPolicy;
use crate::discovery::Discover;
use crate::error::{RelayError, Result};
use crate::protocol::message::{Message, Method, UserId};

/// A frame a handler wants delivered to a set of users
#[derive(Debug, Clone)]
pub struct Outbound {
    pub targets: Vec<UserId>,
    pub message: Message,
}

impl Outbound {
    pub fn to(target: impl Into<UserId>, message: Message) -> Self {
        Self {
            targets: vec![target.into()],
            message,
        }
    }
}

/// What a handler sees about the frame it is handling
pub struct RouteContext {
    /// Authenticated sender
    pub sender: UserId,
    pub registry: Arc<ConnectionRegistry>,
}

/// Application handler registered under a method
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: &RouteContext, msg: Message) -> Result<Vec<Outbound>>;

    /// Frame to return to the sender when delivering `msg` to `target` failed.
    /// Defaults to an Err frame naming the target and the failure.
    fn on_delivery_failure(
        &self,
        _ctx: &RouteContext,
        msg: &Message,
        target: &str,
        error: &RelayError,
    ) -> Option<Message> {
        Some(
            Message::error(format!("delivery to {} failed: {}", target, error))
                .with_id(msg.id.clone()),
        )
    }
}

/// Routes inbound frames to handlers and their output to recipients
pub struct Router {
    routes: HashMap<Method, Arc<dyn Handler>>,
    registry: Arc<ConnectionRegistry>,
    discovery: Arc<dyn Discover>,
    retry: RetryPolicy,
}

impl Router {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        discovery: Arc<dyn Discover>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            routes: HashMap::new(),
            registry,
            discovery,
            retry,
        }
    }

    /// Register `handler` for `method`, replacing any previous one
    pub fn route(&mut self, method: Method, handler: Arc<dyn Handler>) -> &mut Self {
        self.routes.insert(method, handler);
        self
    }

    pub fn has_route(&self, method: &Method) -> bool {
        self.routes.contains_key(method)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn discovery(&self) -> &Arc<dyn Discover> {
        &self.discovery
    }

    /// Run the handler for `msg` and deliver what it produces.
    /// Unknown methods and handler errors are answered with an Err frame.
    pub async fn dispatch(self: &Arc<Self>, sender: &str, msg: Message) {
        let Some(handler) = self.routes.get(&msg.method).cloned() else {
            warn!("Unknown method {:?} from {}", msg.method.as_str(), sender);
            let err = RelayError::protocol(format!("unknown method: {}", msg.method));
            self.reply(sender, Message::error(err).with_id(msg.id));
            return;
        };

        let ctx = RouteContext {
            sender: sender.to_string(),
            registry: self.registry.clone(),
        };

        let id = msg.id.clone();
        let outbound = match handler.handle(&ctx, msg).await {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!("Handler for {} failed: {}", id, e);
                self.reply(sender, Message::error(e).with_id(id));
                return;
            }
        };

        for Outbound { targets, message } in outbound {
            let mut deliveries = JoinSet::new();
            for target in targets {
                let router = self.clone();
                let message = message.clone();
                deliveries.spawn(async move {
                    let result = router.deliver(&target, message).await;
                    (target, result)
                });
            }

            while let Some(joined) = deliveries.join_next().await {
                let (target, result) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        warn!("Delivery task failed: {}", e);
                        continue;
                    }
                };
                if let Err(e) = result {
                    debug!("Delivery of {} to {} failed: {}", message.id, target, e);
                    if let Some(reply) = handler.on_delivery_failure(&ctx, &message, &target, &e) {
                        self.reply(sender, reply);
                    }
                }
            }
        }
    }

    /// Deliver to a local connection if `target` is attached here, otherwise
    /// transpond. Unreachable peers are retried up to the retry budget.
    pub async fn deliver(&self, target: &str, msg: Message) -> Result<()> {
        if let Some(conn) = self.registry.get(target) {
            debug!("Delivering {} to local user {}", msg.id, target);
            return conn.deliver(msg).await;
        }

        let targets = [target.to_string()];
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.discovery.transpond(&msg, &targets).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempts < self.retry.max_err_count => {
                    debug!("Transpond of {} attempt {} failed: {}", msg.id, attempts, e);
                    tokio::time::sleep(self.retry.peer_retry_backoff()).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!("Giving up on {} to {}: {}", msg.id, target, e);
                    return Err(RelayError::delivery_abandoned(format!(
                        "{} to {} after {} attempts: {}",
                        msg.id, target, attempts, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Hand a frame relayed by a peer to its local recipient
    pub fn deliver_transponded(&self, frame: Message) -> Result<()> {
        let (target, inner) = frame
            .into_relayed()
            .ok_or_else(|| RelayError::protocol("expected a transpond frame"))?;

        match self.registry.get(&target) {
            Some(conn) => {
                debug!("Delivering relayed {} to {}", inner.id, target);
                conn.deliver_detached(inner)
            }
            None => {
                warn!("Relayed {} for {} who is not attached here", inner.id, target);
                Err(RelayError::unbound_user(target))
            }
        }
    }

    /// Best-effort frame to a locally attached user
    pub fn reply(&self, user_id: &str, msg: Message) {
        match self.registry.get(user_id) {
            Some(conn) => {
                if let Err(e) = conn.send(msg) {
                    debug!("Reply to {} dropped: {}", user_id, e);
                }
            }
            None => debug!("Reply to {} dropped: not attached", user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::AckTracker;
    use crate::config::AckMode;
    use crate::discovery::NoopDiscovery;
    use crate::protocol::message::{FrameType, Payload};
    use crate::server::registry::{ConnectionHandle, Outgoing};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    fn attach(
        registry: &ConnectionRegistry,
        user: &str,
    ) -> mpsc::UnboundedReceiver<Outgoing> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.insert(Arc::new(ConnectionHandle::new(
            format!("conn-{}", user),
            user.to_string(),
            SocketAddr::from(([127, 0, 0, 1], 5000)),
            tx,
            Arc::new(AckTracker::new(RetryPolicy::default())),
            AckMode::Only,
        )));
        rx
    }

    fn next_message(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Message {
        match rx.try_recv() {
            Ok(Outgoing::Message(msg)) => msg,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, ctx: &RouteContext, msg: Message) -> Result<Vec<Outbound>> {
            Ok(vec![Outbound::to(ctx.sender.clone(), msg)])
        }
    }

    struct Failing;

    #[async_trait]
    impl Handler for Failing {
        async fn handle(&self, _ctx: &RouteContext, _msg: Message) -> Result<Vec<Outbound>> {
            Err(RelayError::protocol("bad payload"))
        }
    }

    struct ToGhost;

    #[async_trait]
    impl Handler for ToGhost {
        async fn handle(&self, _ctx: &RouteContext, msg: Message) -> Result<Vec<Outbound>> {
            Ok(vec![Outbound::to("ghost", msg)])
        }
    }

    /// Transpond that always reports an unreachable peer
    struct Unreachable(AtomicU32);

    #[async_trait]
    impl Discover for Unreachable {
        async fn register(&self, _addr: &str) -> Result<()> {
            Ok(())
        }
        async fn bound_user(&self, _user_id: &str) -> Result<()> {
            Ok(())
        }
        async fn relieve_user(&self, _user_id: &str) -> Result<()> {
            Ok(())
        }
        async fn transpond(&self, _msg: &Message, _targets: &[UserId]) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::peer_unreachable("10.0.0.9:9001"))
        }
    }

    /// Transpond that reports every target as unbound
    struct Unbound;

    #[async_trait]
    impl Discover for Unbound {
        async fn register(&self, _addr: &str) -> Result<()> {
            Ok(())
        }
        async fn bound_user(&self, _user_id: &str) -> Result<()> {
            Ok(())
        }
        async fn relieve_user(&self, _user_id: &str) -> Result<()> {
            Ok(())
        }
        async fn transpond(&self, _msg: &Message, targets: &[UserId]) -> Result<()> {
            Err(RelayError::unbound_user(targets[0].clone()))
        }
    }

    fn router(discovery: Arc<dyn Discover>) -> Arc<Router> {
        let mut router = Router::new(
            Arc::new(ConnectionRegistry::new()),
            discovery,
            RetryPolicy {
                ack_timeout_ms: 50,
                max_err_count: 3,
                peer_retry_backoff_ms: 1,
            },
        );
        router
            .route(Method::Other("echo".to_string()), Arc::new(Echo))
            .route(Method::Other("fail".to_string()), Arc::new(Failing))
            .route(Method::Other("ghost".to_string()), Arc::new(ToGhost));
        Arc::new(router)
    }

    fn request(method: &str) -> Message {
        Message::data(Method::parse(method), "alice", Payload::Empty).with_id("m1")
    }

    #[tokio::test]
    async fn test_unknown_method_echoes_error() {
        let router = router(Arc::new(NoopDiscovery));
        let mut rx = attach(router.registry(), "alice");

        router.dispatch("alice", request("room.unknown")).await;

        let reply = next_message(&mut rx);
        assert_eq!(reply.frame_type, FrameType::Err);
        assert_eq!(reply.id, "m1");
        match reply.data {
            Payload::Error(reason) => assert!(reason.contains("room.unknown")),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_delivery_first() {
        let discovery = Arc::new(Unreachable(AtomicU32::new(0)));
        let router = router(discovery.clone());
        let mut rx = attach(router.registry(), "alice");

        router.dispatch("alice", request("echo")).await;

        let delivered = next_message(&mut rx);
        assert_eq!(delivered.id, "m1");
        assert_eq!(discovery.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_echoed() {
        let router = router(Arc::new(NoopDiscovery));
        let mut rx = attach(router.registry(), "alice");

        router.dispatch("alice", request("fail")).await;

        let reply = next_message(&mut rx);
        assert_eq!(reply.frame_type, FrameType::Err);
        assert_eq!(reply.data, Payload::Error("Protocol error: bad payload".to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_peer_retried_then_abandoned() {
        let discovery = Arc::new(Unreachable(AtomicU32::new(0)));
        let router = router(discovery.clone());

        let err = router.deliver("bob", request("echo")).await.unwrap_err();
        assert!(matches!(err, RelayError::DeliveryAbandoned(_)));
        assert_eq!(discovery.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unbound_target_reported_to_sender() {
        let router = router(Arc::new(Unbound));
        let mut rx = attach(router.registry(), "alice");

        router.dispatch("alice", request("ghost")).await;

        let reply = next_message(&mut rx);
        assert_eq!(reply.frame_type, FrameType::Err);
        match reply.data {
            Payload::Error(reason) => {
                assert!(reason.contains("ghost"));
                assert!(reason.contains("not bound"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transponded_frame_reaches_local_user() {
        let router = router(Arc::new(NoopDiscovery));
        let mut rx = attach(router.registry(), "alice");

        let inner = Message::data(Method::ConversationChat, "bob", Payload::Empty);
        router
            .deliver_transponded(Message::transpond("alice", inner.clone()))
            .unwrap();
        assert_eq!(next_message(&mut rx), inner);

        let err = router
            .deliver_transponded(Message::transpond("carol", inner))
            .unwrap_err();
        assert_eq!(err, RelayError::unbound_user("carol"));

        assert!(router.deliver_transponded(Message::ping()).is_err());
    }
}
