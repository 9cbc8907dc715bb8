use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use murmur_proto::channels::PING;
use murmur_proto::{Message, MessageKind};

use super::Channel;
use crate::server::broadcast::{Broadcaster, ClientFilter};
use crate::server::session::Session;

/// Echoes pings back to the exact session that sent them.
pub struct PingChannel {
    broadcaster: Arc<Broadcaster>,
}

impl PingChannel {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self { broadcaster }
    }
}

#[async_trait]
impl Channel for PingChannel {
    fn name(&self) -> &'static str {
        PING
    }

    fn inbound(&self) -> Option<MessageKind> {
        Some(MessageKind::Ping)
    }

    fn max_size(&self) -> usize {
        64
    }

    async fn handle(&self, from: &Arc<Session>, msg: Message) -> Result<()> {
        if !matches!(msg, Message::Ping(_)) {
            bail!("ping expects pings, got {}", msg.kind());
        }
        self.broadcaster
            .broadcast(ClientFilter::to_session(from, PING), msg)
            .await;
        Ok(())
    }
}
