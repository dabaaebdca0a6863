//! Built-in routes: presence, chat, read markers and generic push

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::router::{Handler, Outbound, RouteContext, Router};
use crate::error::{RelayError, Result};
use crate::protocol::message::{ChatType, FrameType, Message, Method, Payload, Presence, UserId};

/// Source of group conversation members
#[async_trait]
pub trait MembershipSource: Send + Sync + 'static {
    async fn members(&self, group_id: &str) -> Result<Vec<UserId>>;
}

/// In-memory membership table
#[derive(Debug, Default)]
pub struct StaticMembership {
    groups: DashMap<String, Vec<UserId>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_groups(groups: HashMap<String, Vec<UserId>>) -> Self {
        Self {
            groups: groups.into_iter().collect(),
        }
    }

    pub fn set_members(&self, group_id: impl Into<String>, members: Vec<UserId>) {
        self.groups.insert(group_id.into(), members);
    }
}

#[async_trait]
impl MembershipSource for StaticMembership {
    async fn members(&self, group_id: &str) -> Result<Vec<UserId>> {
        self.groups
            .get(group_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RelayError::protocol(format!("unknown group: {}", group_id)))
    }
}

/// `user.online`: replies with the users attached to this process
pub struct PresenceHandler;

#[async_trait]
impl Handler for PresenceHandler {
    async fn handle(&self, ctx: &RouteContext, msg: Message) -> Result<Vec<Outbound>> {
        let reply = Message::data(
            Method::UserOnline,
            UserId::new(),
            Payload::Presence(Presence {
                users: ctx.registry.users(),
            }),
        )
        .with_id(msg.id);
        Ok(vec![Outbound::to(ctx.sender.clone(), reply)])
    }
}

/// `conversation.chat` and `conversation.markChat`: single chats go to the
/// receiver, group chats to every other member
pub struct ConversationHandler {
    membership: Arc<dyn MembershipSource>,
}

impl ConversationHandler {
    pub fn new(membership: Arc<dyn MembershipSource>) -> Self {
        Self { membership }
    }

    async fn recipients(
        &self,
        sender: &str,
        chat_type: ChatType,
        recv_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<UserId>> {
        match chat_type {
            ChatType::Single => {
                if recv_id.is_empty() {
                    return Err(RelayError::protocol("single chat without recvId"));
                }
                Ok(vec![recv_id.to_string()])
            }
            ChatType::Group => {
                let group = if recv_id.is_empty() {
                    conversation_id
                } else {
                    recv_id
                };
                Ok(self
                    .membership
                    .members(group)
                    .await?
                    .into_iter()
                    .filter(|member| member != sender)
                    .collect())
            }
        }
    }
}

#[async_trait]
impl Handler for ConversationHandler {
    async fn handle(&self, ctx: &RouteContext, msg: Message) -> Result<Vec<Outbound>> {
        let targets = match &msg.data {
            Payload::Chat(chat) => {
                self.recipients(&ctx.sender, chat.chat_type, &chat.recv_id, &chat.conversation_id)
                    .await?
            }
            Payload::MarkRead(mark) => {
                self.recipients(&ctx.sender, mark.chat_type, &mark.recv_id, &mark.conversation_id)
                    .await?
            }
            _ => {
                return Err(RelayError::protocol(format!(
                    "{} requires a conversation payload",
                    msg.method
                )));
            }
        };

        Ok(vec![Outbound {
            targets,
            message: forward(ctx, msg),
        }])
    }
}

/// `push`: delivers to `recvIds`, or `recvId` when the list is empty
pub struct PushHandler;

#[async_trait]
impl Handler for PushHandler {
    async fn handle(&self, ctx: &RouteContext, msg: Message) -> Result<Vec<Outbound>> {
        let Payload::Push(push) = &msg.data else {
            return Err(RelayError::protocol("push requires a push payload"));
        };

        let targets = if push.recv_ids.is_empty() {
            if push.recv_id.is_empty() {
                return Err(RelayError::protocol("push without recipients"));
            }
            vec![push.recv_id.clone()]
        } else {
            push.recv_ids.clone()
        };

        Ok(vec![Outbound {
            targets,
            message: forward(ctx, msg),
        }])
    }
}

/// Inbound payload unchanged, attributed to the sender. A NoAck frame stays
/// NoAck so it is never tracked for acknowledgment.
fn forward(ctx: &RouteContext, msg: Message) -> Message {
    let sender = ctx.sender.clone();
    let forwarded = match msg.frame_type {
        FrameType::NoAck => Message::no_ack(msg.method, sender, msg.data),
        _ => Message::data(msg.method, sender, msg.data),
    };
    forwarded.with_id(msg.id)
}

/// Register the built-in routes on `router`
pub fn default_routes(router: &mut Router, membership: Arc<dyn MembershipSource>) {
    let conversation: Arc<dyn Handler> = Arc::new(ConversationHandler::new(membership));
    router
        .route(Method::UserOnline, Arc::new(PresenceHandler))
        .route(Method::ConversationChat, conversation.clone())
        .route(Method::ConversationMarkChat, conversation)
        .route(Method::Push, Arc::new(PushHandler));
}
