//! Connected sessions indexed `channel -> name -> [sessions]`.
//!
//! Write-locked only on connect and disconnect; recipient resolution takes
//! the read lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use murmur_proto::message::{UserEntry, UserList};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::broadcast::ClientFilter;
use super::session::Session;

type Bucket = HashMap<String, Vec<Arc<Session>>>;

#[derive(Default)]
pub struct Registry {
    channels: RwLock<HashMap<String, Bucket>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `session` under every channel it subscribed to.
    pub async fn insert(&self, session: &Arc<Session>) {
        let mut channels = self.channels.write().await;
        for channel in session.channels() {
            channels
                .entry(channel.to_string())
                .or_default()
                .entry(session.name().to_string())
                .or_default()
                .push(Arc::clone(session));
        }
    }

    /// Remove `session` everywhere. Empty names and channels are dropped.
    pub async fn remove(&self, session: &Session) {
        let mut channels = self.channels.write().await;
        for channel in session.channels() {
            let Some(bucket) = channels.get_mut(channel) else {
                continue;
            };
            if let Some(list) = bucket.get_mut(session.name()) {
                list.retain(|s| s.id() != session.id());
                if list.is_empty() {
                    bucket.remove(session.name());
                }
            }
            if bucket.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Sessions matching `filter`. A channel nobody subscribes to resolves
    /// to nothing.
    pub async fn resolve(&self, filter: &ClientFilter) -> Vec<Arc<Session>> {
        let channels = self.channels.read().await;
        let Some(bucket) = channels.get(&filter.channel) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let mut push_name = |sessions: &Vec<Arc<Session>>| {
            out.extend(
                sessions
                    .iter()
                    .filter(|s| filter.matches_session(s))
                    .cloned(),
            );
        };

        if filter.include.is_empty() {
            for (name, sessions) in bucket {
                if !filter.exclude.contains(name) {
                    push_name(sessions);
                }
            }
        } else {
            // A name listed twice still matches its sessions once.
            let mut seen = HashSet::new();
            for name in &filter.include {
                if !seen.insert(name.as_str()) || filter.exclude.contains(name) {
                    continue;
                }
                if let Some(sessions) = bucket.get(name) {
                    push_name(sessions);
                }
            }
        }
        out
    }

    /// One entry per display name with its session count and the union
    /// of its channels, sorted by name.
    pub async fn user_list(&self) -> UserList {
        let channels = self.channels.read().await;
        let mut by_name: BTreeMap<&str, (Vec<Uuid>, Vec<String>)> = BTreeMap::new();
        for (channel, bucket) in channels.iter() {
            for (name, sessions) in bucket {
                let entry = by_name.entry(name.as_str()).or_default();
                for s in sessions {
                    if !entry.0.contains(&s.id()) {
                        entry.0.push(s.id());
                    }
                }
                if !entry.1.contains(channel) {
                    entry.1.push(channel.clone());
                }
            }
        }
        UserList {
            users: by_name
                .into_iter()
                .map(|(name, (ids, mut chans))| {
                    chans.sort();
                    UserEntry {
                        name: name.to_string(),
                        sessions: ids.len().min(u16::MAX as usize) as u16,
                        channels: chans,
                    }
                })
                .collect(),
        }
    }

    /// Distinct sessions across all channels.
    pub async fn session_count(&self) -> usize {
        let channels = self.channels.read().await;
        let mut ids: Vec<Uuid> = channels
            .values()
            .flat_map(|b| b.values().flatten().map(|s| s.id()))
            .collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }
}
