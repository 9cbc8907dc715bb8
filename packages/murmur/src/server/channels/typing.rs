use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use murmur_proto::channels::TYPING;
use murmur_proto::message::Typing;
use murmur_proto::{Message, MessageKind};

use super::Channel;
use crate::server::broadcast::{Broadcaster, ClientFilter};
use crate::server::session::Session;

/// Typing indicators, relayed to everyone but the typist.
pub struct TypingChannel {
    broadcaster: Arc<Broadcaster>,
}

impl TypingChannel {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self { broadcaster }
    }
}

#[async_trait]
impl Channel for TypingChannel {
    fn name(&self) -> &'static str {
        TYPING
    }

    fn inbound(&self) -> Option<MessageKind> {
        Some(MessageKind::Typing)
    }

    fn max_size(&self) -> usize {
        512
    }

    async fn handle(&self, from: &Arc<Session>, msg: Message) -> Result<()> {
        let Message::Typing(typing) = msg else {
            bail!("typing expects typing indicators, got {}", msg.kind());
        };
        let relayed = Typing {
            name: from.name().to_string(),
            active: typing.active,
        };
        self.broadcaster
            .broadcast(ClientFilter::channel(TYPING).exclude([from.name()]), relayed)
            .await;
        Ok(())
    }
}
