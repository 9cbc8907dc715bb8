//! Recipient filtering, batch merging, and the egress worker pool.
//!
//! A broadcast resolves each `(filter, message)` pair to sessions, then
//! groups messages into jobs keyed by `(channel, session)`. Messages in one
//! job reach their session back-to-back in submission order; nothing is
//! promised across jobs. Workers pull jobs off one shared queue.

use std::collections::HashMap;
use std::sync::Arc;

use murmur_proto::Message;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::registry::Registry;
use super::session::Session;

/// Recipient predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientFilter {
    /// Only this session.
    pub session: Option<Uuid>,
    /// Anyone but this session.
    pub except: Option<Uuid>,
    /// Registry bucket to resolve from.
    pub channel: String,
    /// Recipients must be subscribed to all of these.
    pub has_channels: Vec<String>,
    /// Empty means everyone not excluded.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl ClientFilter {
    /// Everyone subscribed to `channel`.
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }

    /// Exactly one session, on `channel`.
    pub fn to_session(session: &Session, channel: impl Into<String>) -> Self {
        Self {
            session: Some(session.id()),
            channel: channel.into(),
            ..Default::default()
        }
    }

    /// Skip one session; other sessions under the same name still match.
    pub fn except_session(mut self, session: &Session) -> Self {
        self.except = Some(session.id());
        self
    }

    pub fn include<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn has_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.has_channels.extend(channels.into_iter().map(Into::into));
        self
    }

    /// Per-session part of the predicate; names are checked by the
    /// registry walk.
    pub(crate) fn matches_session(&self, session: &Session) -> bool {
        if self.session.is_some_and(|id| id != session.id()) {
            return false;
        }
        if self.except == Some(session.id()) {
            return false;
        }
        session.subscribed_to_all(&self.has_channels)
    }
}

/// The unit submitted to the broadcast engine.
#[derive(Debug, Clone)]
pub struct Batch {
    pub filter: ClientFilter,
    pub message: Message,
}

impl Batch {
    pub fn new(filter: ClientFilter, message: impl Into<Message>) -> Self {
        Self {
            filter,
            message: message.into(),
        }
    }
}

/// Messages for one session on one channel.
struct Job {
    session: Arc<Session>,
    channel: String,
    messages: Vec<Arc<Message>>,
}

pub struct Broadcaster {
    registry: Arc<Registry>,
    jobs: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl Broadcaster {
    /// Start `workers` egress tasks sharing a queue of `queue` jobs.
    pub fn start(registry: Arc<Registry>, workers: usize, queue: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..workers.max(1))
            .map(|n| tokio::spawn(worker(n, Arc::clone(&rx))))
            .collect();
        Self {
            registry,
            jobs: tx,
            workers,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn broadcast(&self, filter: ClientFilter, message: impl Into<Message>) {
        self.broadcast_batch(vec![Batch::new(filter, message)]).await;
    }

    /// Resolve every batch, merge by `(channel, session)`, and queue the
    /// resulting jobs. Returns the number of jobs queued.
    pub async fn broadcast_batch(&self, batches: Vec<Batch>) -> usize {
        let mut jobs: Vec<Job> = Vec::new();
        let mut index: HashMap<(String, Uuid), usize> = HashMap::new();

        for batch in batches {
            let recipients = self.registry.resolve(&batch.filter).await;
            if recipients.is_empty() {
                continue;
            }
            let message = Arc::new(batch.message);
            for session in recipients {
                let key = (batch.filter.channel.clone(), session.id());
                match index.get(&key) {
                    Some(&i) => jobs[i].messages.push(Arc::clone(&message)),
                    None => {
                        index.insert(key, jobs.len());
                        jobs.push(Job {
                            session,
                            channel: batch.filter.channel.clone(),
                            messages: vec![Arc::clone(&message)],
                        });
                    }
                }
            }
        }

        let queued = jobs.len();
        for job in jobs {
            if self.jobs.send(job).await.is_err() {
                warn!("broadcast queue closed, dropping job");
                return 0;
            }
        }
        queued
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn worker(n: usize, jobs: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            match rx.recv().await {
                Some(job) => job,
                None => break,
            }
        };
        if job.session.is_closed() {
            continue;
        }
        match job.session.deliver(&job.channel, &job.messages).await {
            Ok(written) => debug!(
                worker = n,
                session = %job.session.id(),
                channel = %job.channel,
                written,
                "delivered"
            ),
            Err(e) => {
                warn!(
                    session = %job.session.id(),
                    name = %job.session.name(),
                    channel = %job.channel,
                    "write failed, closing session: {}",
                    e
                );
                job.session.close();
            }
        }
    }
}
