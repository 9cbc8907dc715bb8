//! Channel state on disk: one file per channel at `<prefix><channel>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::channels::Channels;

pub struct Store {
    prefix: String,
}

impl Store {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn path(&self, channel: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.prefix, channel))
    }

    /// Restore every durable channel from its file. Missing files are a
    /// fresh start; unreadable ones are logged and skipped.
    pub async fn load_all(&self, channels: &Channels) {
        for channel in channels.iter() {
            let Some(durable) = channel.durable() else {
                continue;
            };
            let path = self.path(channel.name());
            match tokio::fs::read(&path).await {
                Ok(bytes) => match durable.load(&bytes).await {
                    Ok(()) => info!(channel = channel.name(), "loaded {}", path.display()),
                    Err(e) => warn!(
                        channel = channel.name(),
                        "ignoring unreadable {}: {:#}",
                        path.display(),
                        e
                    ),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(channel = channel.name(), "no stored state");
                }
                Err(e) => warn!(channel = channel.name(), "failed to read {}: {}", path.display(), e),
            }
        }
    }

    /// Write every dirty channel. Returns how many were saved; failures
    /// leave the channel dirty for the next pass.
    pub async fn save_all(&self, channels: &Channels) -> usize {
        let mut saved = 0;
        for channel in channels.iter() {
            let Some(durable) = channel.durable() else {
                continue;
            };
            if !durable.needs_saving().await {
                continue;
            }
            let bytes = durable.save().await;
            let path = self.path(channel.name());
            match write_atomic(&path, &bytes).await {
                Ok(()) => {
                    debug!(channel = channel.name(), bytes = bytes.len(), "saved");
                    saved += 1;
                }
                Err(e) => {
                    error!(channel = channel.name(), "failed to save: {:#}", e);
                    durable.mark_dirty().await;
                }
            }
        }
        saved
    }

    /// Spawn the periodic save loop.
    pub fn start(self: Arc<Self>, channels: Arc<Channels>, interval: Duration) -> JoinHandle<()> {
        info!("Starting persistence with save interval: {:?}", interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.save_all(&channels).await;
            }
        })
    }
}

/// Write to a sibling temp file, then rename over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {:?}", tmp))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to rename {:?} into place", tmp))?;
    Ok(())
}
