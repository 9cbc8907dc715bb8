//! Server-side protocol handlers, one per logical channel.

mod chat;
mod history;
mod music;
mod ping;
mod typing;
mod update;
mod upload;
mod users;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use murmur_proto::{Message, MessageKind};
use tokio::sync::Mutex;

use super::broadcast::Broadcaster;
use super::history::{AuditLog, History};
use super::session::Session;
use crate::config::ServerConfig;

pub use chat::ChatChannel;
pub use history::HistoryChannel;
pub use music::MusicChannel;
pub use ping::PingChannel;
pub use typing::TypingChannel;
pub use update::{UpdateChannel, encode_update_store};
pub use upload::UploadChannel;
pub use users::UsersChannel;

/// Inbound payload ceiling unless a channel says otherwise.
pub const DEFAULT_MAX_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEvent {
    Connected,
    Disconnected,
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Payload kind accepted from clients; `None` makes the channel
    /// receive-only from the client's point of view.
    fn inbound(&self) -> Option<MessageKind>;

    fn max_size(&self) -> usize {
        DEFAULT_MAX_SIZE
    }

    /// Channels whose payloads have no JSON form.
    fn binary_only(&self) -> bool {
        false
    }

    async fn handle(&self, from: &Arc<Session>, msg: Message) -> Result<()> {
        let _ = from;
        bail!("{} does not accept {}", self.name(), msg.kind())
    }

    /// Called after a session joins the registry and after it leaves.
    async fn user_update(&self, session: &Arc<Session>, event: UserEvent) {
        let _ = (session, event);
    }

    fn durable(&self) -> Option<&dyn Durable> {
        None
    }
}

/// Channel state that survives restarts.
#[async_trait]
pub trait Durable: Send + Sync {
    async fn needs_saving(&self) -> bool;

    /// Serialize the current state and clear the dirty flag.
    async fn save(&self) -> Vec<u8>;

    async fn load(&self, bytes: &[u8]) -> Result<()>;

    async fn mark_dirty(&self);
}

/// Every channel the server knows, by name.
#[derive(Default)]
pub struct Channels {
    by_name: BTreeMap<&'static str, Arc<dyn Channel>>,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full built-in set, sharing one history between `chat` and
    /// `history`.
    pub fn standard(broadcaster: &Arc<Broadcaster>, config: &ServerConfig) -> Self {
        let history = Arc::new(Mutex::new(History::new(config.history_capacity)));
        let audit = config
            .history_log
            .then(|| AuditLog::new(config.audit_log_path.clone()));

        let mut channels = Self::new();
        channels.register(Arc::new(ChatChannel::new(
            Arc::clone(broadcaster),
            Arc::clone(&history),
            audit,
        )));
        channels.register(Arc::new(HistoryChannel::new(
            Arc::clone(broadcaster),
            history,
        )));
        channels.register(Arc::new(UsersChannel::new(Arc::clone(broadcaster))));
        channels.register(Arc::new(PingChannel::new(Arc::clone(broadcaster))));
        channels.register(Arc::new(TypingChannel::new(Arc::clone(broadcaster))));
        channels.register(Arc::new(UploadChannel::new(Arc::clone(broadcaster))));
        channels.register(Arc::new(UpdateChannel::new(Arc::clone(broadcaster))));
        channels.register(Arc::new(MusicChannel::new(Arc::clone(broadcaster))));
        channels
    }

    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        self.by_name.insert(channel.name(), channel);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Channel>> {
        self.by_name.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Channel>> {
        self.by_name.values()
    }

    /// Fan a connect or disconnect out to every channel.
    pub async fn user_update(&self, session: &Arc<Session>, event: UserEvent) {
        for channel in self.by_name.values() {
            channel.user_update(session, event).await;
        }
    }
}

/// Small versioned container used by the single-value channels
/// (`update`, `music`): `u16 version | payload`.
pub(crate) mod slot {
    use anyhow::{Result, anyhow};
    use bytes::{BufMut, BytesMut};
    use murmur_proto::WireMessage;
    use murmur_proto::wire::{WireError, WireReader};

    pub const SLOT_VERSION: u16 = 1;

    pub fn encode<M: WireMessage>(value: &M) -> Vec<u8> {
        let mut out = BytesMut::new();
        out.put_u16(SLOT_VERSION);
        value.encode_binary(&mut out);
        out.to_vec()
    }

    pub fn decode<M: WireMessage>(bytes: &[u8]) -> Result<M> {
        let mut reader = WireReader::new(bytes);
        let parsed = reader.u16().and_then(|version| {
            if version != SLOT_VERSION {
                return Err(WireError::Invalid(format!("unsupported version {version}")));
            }
            M::decode_binary(&mut reader)
        });
        parsed.map_err(|e| match e {
            WireError::Incomplete => anyhow!("stored state is truncated"),
            WireError::Invalid(reason) => anyhow!("stored state is invalid: {reason}"),
        })
    }
}
