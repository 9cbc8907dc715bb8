use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use murmur_proto::channels::HISTORY;
use murmur_proto::{Message, MessageKind};
use tokio::sync::Mutex;
use tracing::debug;

use super::Channel;
use crate::server::broadcast::{Batch, Broadcaster, ClientFilter};
use crate::server::history::History;
use crate::server::session::Session;

/// Replays recent chat to the session that asks.
pub struct HistoryChannel {
    broadcaster: Arc<Broadcaster>,
    history: Arc<Mutex<History>>,
}

impl HistoryChannel {
    pub fn new(broadcaster: Arc<Broadcaster>, history: Arc<Mutex<History>>) -> Self {
        Self {
            broadcaster,
            history,
        }
    }
}

#[async_trait]
impl Channel for HistoryChannel {
    fn name(&self) -> &'static str {
        HISTORY
    }

    fn inbound(&self) -> Option<MessageKind> {
        Some(MessageKind::HistoryRequest)
    }

    async fn handle(&self, from: &Arc<Session>, msg: Message) -> Result<()> {
        let Message::HistoryRequest(request) = msg else {
            bail!("history expects history requests, got {}", msg.kind());
        };
        let batches: Vec<Batch> = {
            let history = self.history.lock().await;
            history
                .recent(request.depth as usize)
                .map(|entry| {
                    Batch::new(
                        ClientFilter::to_session(from, HISTORY),
                        entry.message.clone(),
                    )
                })
                .collect()
        };
        debug!(
            session = %from.id(),
            requested = request.depth,
            replaying = batches.len(),
            "history replay"
        );
        // One submission so the whole replay lands as a single ordered job.
        self.broadcaster.broadcast_batch(batches).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::history::HistoryEntry;
    use crate::server::session::test_support::{assert_quiet, recv, session};
    use murmur_proto::message::{Chat, HistoryRequest};

    async fn seeded(n: usize, capacity: usize) -> Arc<Mutex<History>> {
        let history = Arc::new(Mutex::new(History::new(capacity)));
        for i in 0..n {
            history.lock().await.push(HistoryEntry {
                from: "alice".into(),
                message: Chat {
                    from: "alice".into(),
                    text: format!("m{i}"),
                    sent_at_ms: i as i64,
                },
            });
        }
        history
    }

    async fn replayed(reader: &mut murmur_proto::MessageReader<tokio::io::DuplexStream>, n: usize) -> Vec<String> {
        let mut out = Vec::new();
        for _ in 0..n {
            let (ch, msg) = recv(reader, MessageKind::Chat).await;
            assert_eq!(ch, HISTORY);
            let Message::Chat(chat) = msg else {
                panic!("expected chat");
            };
            out.push(chat.text);
        }
        out
    }

    #[tokio::test]
    async fn replays_newest_entries_oldest_first_to_requester_only() {
        let broadcaster = super::super::test_support::broadcaster();
        let channel = HistoryChannel::new(broadcaster.clone(), seeded(6, 10).await);
        let (alice, mut ra) = session("alice", &[HISTORY]);
        let (bob, mut rb) = session("bob", &[HISTORY]);
        broadcaster.registry().insert(&alice).await;
        broadcaster.registry().insert(&bob).await;

        channel
            .handle(&alice, HistoryRequest { depth: 3 }.into())
            .await
            .unwrap();
        assert_eq!(replayed(&mut ra, 3).await, ["m3", "m4", "m5"]);
        assert_quiet(&mut ra).await;
        assert_quiet(&mut rb).await;
    }

    #[tokio::test]
    async fn depth_is_capped_at_capacity() {
        let broadcaster = super::super::test_support::broadcaster();
        let channel = HistoryChannel::new(broadcaster.clone(), seeded(8, 4).await);
        let (alice, mut ra) = session("alice", &[HISTORY]);
        broadcaster.registry().insert(&alice).await;

        channel
            .handle(&alice, HistoryRequest { depth: 1000 }.into())
            .await
            .unwrap();
        assert_eq!(replayed(&mut ra, 4).await, ["m4", "m5", "m6", "m7"]);
        assert_quiet(&mut ra).await;
    }
}
