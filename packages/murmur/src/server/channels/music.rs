use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use murmur_proto::channels::MUSIC;
use murmur_proto::message::MusicState;
use murmur_proto::{Message, MessageKind};
use tokio::sync::Mutex;

use super::{Channel, Durable, UserEvent, slot};
use crate::server::broadcast::{Broadcaster, ClientFilter};
use crate::server::session::Session;

#[derive(Default)]
struct Playback {
    state: Option<MusicState>,
    dirty: bool,
}

/// Playback sync between music nodes and listeners.
///
/// Nodes report their state periodically; listeners that already have an
/// identical state are skipped by the per-session dedup.
pub struct MusicChannel {
    broadcaster: Arc<Broadcaster>,
    playback: Mutex<Playback>,
}

impl MusicChannel {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            broadcaster,
            playback: Mutex::new(Playback::default()),
        }
    }
}

#[async_trait]
impl Channel for MusicChannel {
    fn name(&self) -> &'static str {
        MUSIC
    }

    fn inbound(&self) -> Option<MessageKind> {
        Some(MessageKind::MusicState)
    }

    fn max_size(&self) -> usize {
        4 * 1024
    }

    async fn handle(&self, from: &Arc<Session>, msg: Message) -> Result<()> {
        let Message::MusicState(state) = msg else {
            bail!("music expects playback state, got {}", msg.kind());
        };
        {
            let mut playback = self.playback.lock().await;
            if playback.state.as_ref() != Some(&state) {
                playback.state = Some(state.clone());
                playback.dirty = true;
            }
        }
        self.broadcaster
            .broadcast(ClientFilter::channel(MUSIC).exclude([from.name()]), state)
            .await;
        Ok(())
    }

    async fn user_update(&self, session: &Arc<Session>, event: UserEvent) {
        if event != UserEvent::Connected || !session.is_subscribed(MUSIC) {
            return;
        }
        let Some(state) = self.playback.lock().await.state.clone() else {
            return;
        };
        self.broadcaster
            .broadcast(ClientFilter::to_session(session, MUSIC), state)
            .await;
    }

    fn durable(&self) -> Option<&dyn Durable> {
        Some(self)
    }
}

#[async_trait]
impl Durable for MusicChannel {
    async fn needs_saving(&self) -> bool {
        self.playback.lock().await.dirty
    }

    async fn save(&self) -> Vec<u8> {
        let mut playback = self.playback.lock().await;
        playback.dirty = false;
        match &playback.state {
            Some(state) => slot::encode(state),
            None => Vec::new(),
        }
    }

    async fn load(&self, bytes: &[u8]) -> Result<()> {
        let state = if bytes.is_empty() {
            None
        } else {
            Some(slot::decode::<MusicState>(bytes)?)
        };
        *self.playback.lock().await = Playback {
            state,
            dirty: false,
        };
        Ok(())
    }

    async fn mark_dirty(&self) {
        self.playback.lock().await.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::session::test_support::{assert_quiet, recv, session};

    fn state(position_ms: u64) -> MusicState {
        MusicState {
            node: "living-room".into(),
            song: "track 1".into(),
            playing: true,
            position_ms,
        }
    }

    #[tokio::test]
    async fn periodic_reports_are_deduplicated_for_listeners() {
        let broadcaster = super::super::test_support::broadcaster();
        let channel = MusicChannel::new(broadcaster.clone());
        let (node, mut r_node) = session("node", &[MUSIC]);
        let (listener, mut r_listener) = session("listener", &[MUSIC]);
        broadcaster.registry().insert(&node).await;
        broadcaster.registry().insert(&listener).await;

        channel.handle(&node, state(1000).into()).await.unwrap();
        channel.handle(&node, state(1000).into()).await.unwrap();
        channel.handle(&node, state(2000).into()).await.unwrap();

        let (_, first) = recv(&mut r_listener, MessageKind::MusicState).await;
        assert_eq!(first, Message::MusicState(state(1000)));
        let (_, second) = recv(&mut r_listener, MessageKind::MusicState).await;
        assert_eq!(second, Message::MusicState(state(2000)));
        assert_quiet(&mut r_listener).await;
        assert_quiet(&mut r_node).await;
    }

    #[tokio::test]
    async fn joiner_gets_last_state_and_it_persists() {
        let broadcaster = super::super::test_support::broadcaster();
        let channel = MusicChannel::new(broadcaster.clone());
        let (node, _r_node) = session("node", &[MUSIC]);
        channel.handle(&node, state(5000).into()).await.unwrap();
        assert!(channel.needs_saving().await);
        let saved = channel.save().await;

        let restored = MusicChannel::new(broadcaster.clone());
        restored.load(&saved).await.unwrap();
        let (joiner, mut r_joiner) = session("joiner", &[MUSIC]);
        broadcaster.registry().insert(&joiner).await;
        restored.user_update(&joiner, UserEvent::Connected).await;

        let (_, msg) = recv(&mut r_joiner, MessageKind::MusicState).await;
        assert_eq!(msg, Message::MusicState(state(5000)));
    }
}
