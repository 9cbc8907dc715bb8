use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use murmur_proto::channels::CHAT;
use murmur_proto::message::Chat;
use murmur_proto::{Message, MessageKind};
use tokio::sync::Mutex;
use tracing::warn;

use super::{Channel, Durable};
use crate::server::broadcast::{Broadcaster, ClientFilter};
use crate::server::history::{AuditLog, History, HistoryEntry};
use crate::server::session::Session;

const MAX_CHAT_SIZE: usize = 16 * 1024;

/// Relays chat to every subscriber and records it for replay.
pub struct ChatChannel {
    broadcaster: Arc<Broadcaster>,
    history: Arc<Mutex<History>>,
    audit: Option<AuditLog>,
}

impl ChatChannel {
    pub fn new(
        broadcaster: Arc<Broadcaster>,
        history: Arc<Mutex<History>>,
        audit: Option<AuditLog>,
    ) -> Self {
        Self {
            broadcaster,
            history,
            audit,
        }
    }
}

#[async_trait]
impl Channel for ChatChannel {
    fn name(&self) -> &'static str {
        CHAT
    }

    fn inbound(&self) -> Option<MessageKind> {
        Some(MessageKind::Chat)
    }

    fn max_size(&self) -> usize {
        MAX_CHAT_SIZE
    }

    async fn handle(&self, from: &Arc<Session>, msg: Message) -> Result<()> {
        let Message::Chat(chat) = msg else {
            bail!("chat expects chat messages, got {}", msg.kind());
        };
        // Senders cannot speak for someone else.
        let chat = Chat {
            from: from.name().to_string(),
            text: chat.text,
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        let entry = HistoryEntry {
            from: from.name().to_string(),
            message: chat.clone(),
        };
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(&entry).await {
                warn!(channel = CHAT, "audit log append failed: {:#}", e);
            }
        }
        self.history.lock().await.push(entry);
        self.broadcaster
            .broadcast(ClientFilter::channel(CHAT), chat)
            .await;
        Ok(())
    }

    fn durable(&self) -> Option<&dyn Durable> {
        Some(self)
    }
}

#[async_trait]
impl Durable for ChatChannel {
    async fn needs_saving(&self) -> bool {
        self.history.lock().await.is_dirty()
    }

    async fn save(&self) -> Vec<u8> {
        self.history.lock().await.encode()
    }

    async fn load(&self, bytes: &[u8]) -> Result<()> {
        let mut history = self.history.lock().await;
        let loaded = History::decode(bytes, history.capacity())?;
        *history = loaded;
        Ok(())
    }

    async fn mark_dirty(&self) {
        self.history.lock().await.mark_dirty();
    }
}
