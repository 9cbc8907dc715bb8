//! The messaging server: connection admission, the per-connection read
//! loop, and the shared state every connection task works against.

pub mod broadcast;
pub mod channels;
pub mod history;
pub mod listener;
pub mod registry;
pub mod session;
pub mod store;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use murmur_proto::channels::STATUS;
use murmur_proto::handshake::{self, Secured};
use murmur_proto::message::{Identify, IdentifyReply, StatusNotice};
use murmur_proto::{CONTROL_MAX_SIZE, Format, Message, MessageKind, ProtoError, ServerKey, Status};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::transport::{BoxedRead, BoxedWrite};
use broadcast::Broadcaster;
use channels::{Channels, UserEvent};
use registry::Registry;
use session::Session;
use store::Store;

/// Longest display name kept after normalization, in characters.
pub const MAX_NAME_CHARS: usize = 32;

pub struct Server {
    config: ServerConfig,
    key: ServerKey,
    broadcaster: Arc<Broadcaster>,
    channels: Arc<Channels>,
    store: Arc<Store>,
}

impl Server {
    /// Build the server and start its broadcast workers. Channel state is
    /// not loaded until [`Server::load`].
    pub fn new(config: ServerConfig, key: ServerKey) -> Self {
        let registry = Arc::new(Registry::new());
        let broadcaster = Arc::new(Broadcaster::start(
            registry,
            config.workers,
            config.job_queue,
        ));
        let channels = Arc::new(Channels::standard(&broadcaster, &config));
        let store = Arc::new(Store::new(config.store_prefix.clone()));
        Self {
            config,
            key,
            broadcaster,
            channels,
            store,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn fingerprint(&self) -> String {
        self.key.public_key().fingerprint()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.broadcaster.registry()
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn channels(&self) -> &Arc<Channels> {
        &self.channels
    }

    /// Restore every channel from its store file.
    pub async fn load(&self) {
        self.store.load_all(&self.channels).await;
    }

    /// Spawn the periodic save loop.
    pub fn start_persistence(&self) -> JoinHandle<()> {
        Arc::clone(&self.store).start(Arc::clone(&self.channels), self.config.save_interval)
    }

    /// Save every dirty channel now.
    pub async fn save_all(&self) -> usize {
        self.store.save_all(&self.channels).await
    }

    /// Serve one accepted connection to completion. Errors end only this
    /// connection and are logged here.
    pub async fn handle_connection(self: Arc<Self>, read: BoxedRead, write: BoxedWrite, peer: String) {
        match self.serve_connection(read, write, &peer).await {
            Ok(()) => debug!(%peer, "connection closed"),
            Err(e) => warn!(%peer, "connection ended: {:#}", e),
        }
    }

    async fn serve_connection(&self, read: BoxedRead, write: BoxedWrite, peer: &str) -> Result<()> {
        let Secured {
            mut reader,
            mut writer,
            format,
            ..
        } = handshake::accept(read, write, &self.key, self.config.handshake_timeout)
            .await
            .context("handshake failed")?;

        let identify = tokio::time::timeout(
            self.config.handshake_timeout,
            reader.read(MessageKind::Identify, CONTROL_MAX_SIZE),
        )
        .await
        .map_err(|_| ProtoError::Timeout("identify"))??;
        let Message::Identify(identify) = identify else {
            bail!("expected identify, got {}", identify.kind());
        };

        let admitted = self.admit(&identify, format);
        let reply = match &admitted {
            Ok(name) => IdentifyReply {
                status: Status::Ok,
                detail: String::new(),
                name: name.clone(),
            },
            Err((status, detail)) => IdentifyReply {
                status: *status,
                detail: detail.clone(),
                name: String::new(),
            },
        };
        writer.write(&reply.into()).await?;

        let name = match admitted {
            Ok(name) => name,
            Err((status, detail)) => {
                info!(%peer, requested = %identify.name, ?status, "identify rejected: {}", detail);
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let session = Session::new(
            name,
            format,
            identify.channels,
            Box::new(writer.into_inner()),
            self.config.write_timeout,
        );
        info!(
            %peer,
            session = %session.id(),
            name = %session.name(),
            format = ?session.format(),
            channels = ?session.channels().collect::<BTreeSet<_>>(),
            "session joined"
        );

        self.registry().insert(&session).await;
        self.channels
            .user_update(&session, UserEvent::Connected)
            .await;

        let result = self.read_loop(&session, &mut reader).await;

        session.close();
        self.registry().remove(&session).await;
        self.channels
            .user_update(&session, UserEvent::Disconnected)
            .await;
        session.shutdown().await;
        info!(session = %session.id(), name = %session.name(), "session left");
        result
    }

    /// Check an Identify. Returns the assigned name, or the status and
    /// reason to refuse with.
    fn admit(&self, identify: &Identify, format: Format) -> Result<String, (Status, String)> {
        if identify.version != self.config.protocol_version {
            return Err((
                Status::MustUpgrade,
                format!(
                    "server speaks {}, client sent {}",
                    self.config.protocol_version, identify.version
                ),
            ));
        }
        for requested in &identify.channels {
            let Some(channel) = self.channels.get(requested) else {
                return Err((Status::NotOk, format!("unknown channel {requested:?}")));
            };
            if format == Format::Json && channel.binary_only() {
                return Err((
                    Status::NotOk,
                    format!("{requested} is binary only; reconnect with the binary format"),
                ));
            }
        }
        let name = normalize_name(&identify.name);
        if name.is_empty() {
            return Err((Status::NotOk, "name is empty".into()));
        }
        Ok(name)
    }

    async fn read_loop<R>(&self, session: &Arc<Session>, reader: &mut murmur_proto::MessageReader<R>) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let idle = self.config.idle_timeout;
        loop {
            let channel_name = tokio::select! {
                _ = session.closed() => return Ok(()),
                read = tokio::time::timeout(idle, reader.read_channel()) => match read {
                    Err(_) => {
                        info!(session = %session.id(), "idle timeout");
                        return Ok(());
                    }
                    Ok(Err(ProtoError::Closed)) => return Ok(()),
                    Ok(res) => res?,
                },
            };

            let Some(channel) = self.channels.get(&channel_name) else {
                bail!("unknown channel {channel_name:?}");
            };
            if !session.is_subscribed(&channel_name) {
                bail!("not subscribed to {channel_name}");
            }
            let Some(kind) = channel.inbound() else {
                let notice = StatusNotice {
                    status: Status::NotAllowed,
                    detail: format!("{channel_name} does not accept messages"),
                };
                let _ = session.deliver(STATUS, &[Arc::new(notice.into())]).await;
                bail!("sent on receive-only channel {channel_name}");
            };

            let msg = tokio::select! {
                _ = session.closed() => return Ok(()),
                read = tokio::time::timeout(idle, reader.read(kind, channel.max_size())) => match read {
                    Err(_) => {
                        info!(session = %session.id(), "idle timeout mid-message");
                        return Ok(());
                    }
                    Ok(res) => res.with_context(|| format!("bad {channel_name} payload"))?,
                },
            };
            channel
                .handle(session, msg)
                .await
                .with_context(|| format!("{channel_name} handler failed"))?;
        }
    }
}

/// Strip control characters and whitespace, then cap the length.
pub fn normalize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control() && !c.is_whitespace())
        .take(MAX_NAME_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_proto::PROTOCOL_VERSION;
    use murmur_proto::channels::{CHAT, UPLOAD, USERS};

    fn server(dir: &std::path::Path) -> Server {
        Server::new(ServerConfig::for_tests(dir), ServerKey::generate())
    }

    fn identify(name: &str, channels: &[&str], version: &str) -> Identify {
        Identify {
            name: name.into(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            version: version.into(),
        }
    }

    #[test]
    fn name_normalization() {
        assert_eq!(normalize_name("  al ice\t\n"), "alice");
        assert_eq!(normalize_name("b\u{0}o\u{1b}b"), "bob");
        assert_eq!(normalize_name(&"x".repeat(100)).len(), MAX_NAME_CHARS);
        assert_eq!(normalize_name(" \u{7} "), "");
    }

    #[tokio::test]
    async fn version_mismatch_is_must_upgrade() {
        let tmp = tempfile::tempdir().unwrap();
        let server = server(tmp.path());
        let err = server
            .admit(&identify("alice", &[CHAT], "murmur/0"), Format::Binary)
            .unwrap_err();
        assert_eq!(err.0, Status::MustUpgrade);
    }

    #[tokio::test]
    async fn unknown_channel_is_not_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let server = server(tmp.path());
        let err = server
            .admit(&identify("alice", &[CHAT, "gossip"], PROTOCOL_VERSION), Format::Binary)
            .unwrap_err();
        assert_eq!(err.0, Status::NotOk);
        assert!(err.1.contains("gossip"));

        let err = server
            .admit(&identify("alice", &[STATUS], PROTOCOL_VERSION), Format::Binary)
            .unwrap_err();
        assert_eq!(err.0, Status::NotOk);
    }

    #[tokio::test]
    async fn json_sessions_cannot_take_binary_only_channels() {
        let tmp = tempfile::tempdir().unwrap();
        let server = server(tmp.path());
        let request = identify("alice", &[CHAT, UPLOAD], PROTOCOL_VERSION);
        assert_eq!(server.admit(&request, Format::Json).unwrap_err().0, Status::NotOk);
        assert_eq!(server.admit(&request, Format::Binary).unwrap(), "alice");
    }

    #[tokio::test]
    async fn blank_name_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let server = server(tmp.path());
        let err = server
            .admit(&identify(" \t", &[USERS], PROTOCOL_VERSION), Format::Binary)
            .unwrap_err();
        assert_eq!(err.0, Status::NotOk);
    }

    #[tokio::test]
    async fn save_and_reload_through_store() {
        let tmp = tempfile::tempdir().unwrap();
        let first = server(tmp.path());
        let update = murmur_proto::message::Update {
            version: "3.1.0".into(),
            body: bytes::Bytes::from_static(b"build"),
        };
        tokio::fs::write(
            first.config().store_path(murmur_proto::channels::UPDATE),
            channels::encode_update_store(&update),
        )
        .await
        .unwrap();
        first.load().await;
        // Loaded state is clean; nothing to write back.
        assert_eq!(first.save_all().await, 0);

        let (alice, _r) = session::test_support::session("alice", &[CHAT]);
        first
            .channels()
            .get(CHAT)
            .unwrap()
            .handle(
                &alice,
                murmur_proto::message::Chat {
                    from: String::new(),
                    text: "persist me".into(),
                    sent_at_ms: 0,
                }
                .into(),
            )
            .await
            .unwrap();
        assert_eq!(first.save_all().await, 1);
        assert!(first.config().store_path(CHAT).exists());
        assert_eq!(first.save_all().await, 0);
    }
}
