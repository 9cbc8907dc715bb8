use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use murmur_proto::MessageKind;
use murmur_proto::channels::UPDATE;
use murmur_proto::message::Update;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Channel, Durable, UserEvent, slot};
use crate::server::broadcast::{Broadcaster, ClientFilter};
use crate::server::session::Session;

#[derive(Default)]
struct Latest {
    update: Option<Update>,
    dirty: bool,
}

/// Self-update distribution. Clients only listen. The operator stages a
/// build in the store file, which is loaded at boot.
pub struct UpdateChannel {
    broadcaster: Arc<Broadcaster>,
    latest: Mutex<Latest>,
}

impl UpdateChannel {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            broadcaster,
            latest: Mutex::new(Latest::default()),
        }
    }
}

/// Store-file bytes for `update`, for writing the file while the server
/// is down.
pub fn encode_update_store(update: &Update) -> Vec<u8> {
    slot::encode(update)
}

#[async_trait]
impl Channel for UpdateChannel {
    fn name(&self) -> &'static str {
        UPDATE
    }

    fn inbound(&self) -> Option<MessageKind> {
        None
    }

    fn binary_only(&self) -> bool {
        true
    }

    async fn user_update(&self, session: &Arc<Session>, event: UserEvent) {
        if event != UserEvent::Connected || !session.is_subscribed(UPDATE) {
            return;
        }
        let Some(update) = self.latest.lock().await.update.clone() else {
            return;
        };
        debug!(session = %session.id(), version = %update.version, "offering update");
        self.broadcaster
            .broadcast(ClientFilter::to_session(session, UPDATE), update)
            .await;
    }

    fn durable(&self) -> Option<&dyn Durable> {
        Some(self)
    }
}

#[async_trait]
impl Durable for UpdateChannel {
    async fn needs_saving(&self) -> bool {
        self.latest.lock().await.dirty
    }

    async fn save(&self) -> Vec<u8> {
        let mut latest = self.latest.lock().await;
        latest.dirty = false;
        match &latest.update {
            Some(update) => slot::encode(update),
            None => Vec::new(),
        }
    }

    async fn load(&self, bytes: &[u8]) -> Result<()> {
        let update = if bytes.is_empty() {
            None
        } else {
            Some(slot::decode::<Update>(bytes)?)
        };
        *self.latest.lock().await = Latest {
            update,
            dirty: false,
        };
        Ok(())
    }

    async fn mark_dirty(&self) {
        self.latest.lock().await.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::session::test_support::{assert_quiet, recv, session};
    use bytes::Bytes;
    use murmur_proto::Message;

    fn build(version: &str) -> Update {
        Update {
            version: version.into(),
            body: Bytes::from(vec![0xAB; 1024]),
        }
    }

    #[tokio::test]
    async fn joiners_get_the_current_build() {
        let broadcaster = super::super::test_support::broadcaster();
        let channel = UpdateChannel::new(broadcaster.clone());
        let stored = encode_update_store(&build("1.4.0"));
        channel.load(&stored).await.unwrap();

        let (alice, mut ra) = session("alice", &[UPDATE]);
        let (bob, mut rb) = session("bob", &["chat"]);
        broadcaster.registry().insert(&alice).await;
        broadcaster.registry().insert(&bob).await;
        channel.user_update(&alice, UserEvent::Connected).await;
        channel.user_update(&bob, UserEvent::Connected).await;

        let (_, msg) = recv(&mut ra, MessageKind::Update).await;
        assert_eq!(msg, Message::Update(build("1.4.0")));
        assert_quiet(&mut rb).await;
    }

    #[tokio::test]
    async fn same_build_is_offered_once_and_saved_on_demand() {
        let broadcaster = super::super::test_support::broadcaster();
        let channel = UpdateChannel::new(broadcaster.clone());
        channel
            .load(&encode_update_store(&build("2.0.0")))
            .await
            .unwrap();
        let (alice, mut ra) = session("alice", &[UPDATE]);
        broadcaster.registry().insert(&alice).await;

        channel.user_update(&alice, UserEvent::Connected).await;
        let (_, msg) = recv(&mut ra, MessageKind::Update).await;
        assert_eq!(msg, Message::Update(build("2.0.0")));

        // The session already holds this build: deduplicated.
        channel.user_update(&alice, UserEvent::Connected).await;
        assert_quiet(&mut ra).await;

        assert!(!channel.needs_saving().await);
        channel.mark_dirty().await;
        let bytes = channel.save().await;
        assert!(!channel.needs_saving().await);
        assert_eq!(slot::decode::<Update>(&bytes).unwrap().version, "2.0.0");
    }

    #[tokio::test]
    async fn empty_store_means_no_build() {
        let broadcaster = super::super::test_support::broadcaster();
        let channel = UpdateChannel::new(broadcaster.clone());
        channel.load(&[]).await.unwrap();
        let (alice, mut ra) = session("alice", &[UPDATE]);
        broadcaster.registry().insert(&alice).await;
        channel.user_update(&alice, UserEvent::Connected).await;
        assert_quiet(&mut ra).await;
        assert!(channel.save().await.is_empty());
    }
}
