//! One identified connection, as the rest of the server sees it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use murmur_proto::{Format, Message, MessageWriter, ProtoError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::transport::BoxedWrite;

pub struct Session {
    id: Uuid,
    name: String,
    format: Format,
    channels: HashSet<String>,
    outbound: Mutex<Outbound>,
    /// Longest a single write may wait on a peer that is not reading.
    write_timeout: Duration,
    cancel: CancellationToken,
}

/// Writer side, held by whichever broadcast worker is delivering a job to
/// this session.
struct Outbound {
    writer: MessageWriter<BoxedWrite>,
    /// Last message delivered per channel, for dedup.
    last_sent: HashMap<String, Arc<Message>>,
}

impl Session {
    pub fn new(
        name: String,
        format: Format,
        channels: impl IntoIterator<Item = String>,
        writer: BoxedWrite,
        write_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name,
            format,
            channels: channels.into_iter().collect(),
            outbound: Mutex::new(Outbound {
                writer: MessageWriter::new(writer, format),
                last_sent: HashMap::new(),
            }),
            write_timeout,
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    pub fn subscribed_to_all(&self, channels: &[String]) -> bool {
        channels.iter().all(|c| self.channels.contains(c))
    }

    /// Ask the connection task to hang up.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Write `messages` on `channel` back-to-back, skipping any message
    /// equal to the last one this session received on that channel.
    /// Returns how many were written. The first write error aborts the
    /// rest. A write that outlasts the write timeout, or is still pending
    /// when the session closes, counts as an error.
    pub(crate) async fn deliver(
        &self,
        channel: &str,
        messages: &[Arc<Message>],
    ) -> Result<usize, ProtoError> {
        let mut out = self.outbound.lock().await;
        let mut written = 0;
        for msg in messages {
            if out
                .last_sent
                .get(channel)
                .is_some_and(|last| last.same_as(msg))
            {
                debug!(session = %self.id, channel, "skipping duplicate");
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ProtoError::Closed),
                sent = tokio::time::timeout(self.write_timeout, out.writer.send(channel, msg)) => {
                    sent.map_err(|_| ProtoError::Timeout("write"))??;
                }
            }
            out.last_sent.insert(channel.to_string(), Arc::clone(msg));
            written += 1;
        }
        Ok(written)
    }

    /// Flush and close the write side. Gives up after the write timeout so
    /// a peer that stopped reading cannot hold the connection task open.
    pub(crate) async fn shutdown(&self) {
        let flushed = tokio::time::timeout(self.write_timeout, async {
            let mut out = self.outbound.lock().await;
            let _ = out.writer.shutdown().await;
        })
        .await;
        if flushed.is_err() {
            debug!(session = %self.id, "shutdown timed out");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("format", &self.format)
            .finish()
    }
}
