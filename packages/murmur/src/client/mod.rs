//! Client session: dial, handshake, identify, then shuttle messages until
//! the connection drops, and start over unless the failure is fatal.

mod error;
mod heartbeat;
mod known_hosts;
mod reconnect;

pub use error::ClientError;
pub use heartbeat::Heartbeat;
pub use known_hosts::KnownHosts;

use std::sync::Arc;
use std::time::Duration;

use murmur_proto::channels::{self, HISTORY, PING};
use murmur_proto::handshake::{self, Secured};
use murmur_proto::message::{HistoryRequest, Identify};
use murmur_proto::{
    CONTROL_MAX_SIZE, Message, MessageKind, PROTOCOL_VERSION, ProtoError, SecureReader,
    SecureWriter, Status,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::transport::{self, Endpoint};

/// Largest payload accepted from the server (file and update bodies).
const INBOUND_MAX_SIZE: usize = 32 * 1024 * 1024;

const QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Identifying,
    Active,
}

/// A message the server sent on `channel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub channel: String,
    pub message: Message,
}

/// The application's side of a running [`Client`].
pub struct ClientHandle {
    outbound: mpsc::Sender<(String, Message)>,
    incoming: mpsc::Receiver<Incoming>,
    state: watch::Receiver<ConnectionState>,
    latency: watch::Receiver<Option<Duration>>,
    stop: CancellationToken,
}

impl ClientHandle {
    /// Queue `msg` on `channel`. Messages queued while disconnected go out
    /// after the next successful identify. Returns false once the client
    /// has stopped.
    pub async fn send(&self, channel: &str, msg: impl Into<Message>) -> bool {
        self.outbound
            .send((channel.to_string(), msg.into()))
            .await
            .is_ok()
    }

    pub async fn recv(&mut self) -> Option<Incoming> {
        self.incoming.recv().await
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Latest ping round trip.
    pub fn latency(&self) -> watch::Receiver<Option<Duration>> {
        self.latency.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

pub struct Client {
    config: ClientConfig,
    known_hosts: KnownHosts,
    outbound: mpsc::Receiver<(String, Message)>,
    incoming: mpsc::Sender<Incoming>,
    state: Arc<watch::Sender<ConnectionState>>,
    latency: watch::Sender<Option<Duration>>,
    heartbeat: Heartbeat,
    stop: CancellationToken,
}

impl Client {
    pub fn new(config: ClientConfig, known_hosts: KnownHosts) -> (Self, ClientHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (incoming_tx, incoming_rx) = mpsc::channel(QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (latency_tx, latency_rx) = watch::channel(None);
        let stop = CancellationToken::new();

        let client = Self {
            config,
            known_hosts,
            outbound: outbound_rx,
            incoming: incoming_tx,
            state: Arc::new(state_tx),
            latency: latency_tx,
            heartbeat: Heartbeat::default(),
            stop: stop.clone(),
        };
        let handle = ClientHandle {
            outbound: outbound_tx,
            incoming: incoming_rx,
            state: state_rx,
            latency: latency_rx,
            stop,
        };
        (client, handle)
    }

    /// Keep a connection up until stopped or a fatal error occurs.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let min_interval = self.config.min_reconnect_interval;
        let state = Arc::clone(&self.state);
        let stop = self.stop.clone();
        reconnect::run(&mut self, min_interval, &state, &stop).await
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(?state, "client state");
        self.state.send_replace(state);
    }

    async fn connect_once(&mut self) -> Result<(), ClientError> {
        let endpoint = Endpoint::parse(&self.config.server).map_err(ClientError::InvalidUrl)?;

        self.set_state(ConnectionState::Connecting);
        let (read, write) = transport::connect(&endpoint)
            .await
            .map_err(ClientError::Connect)?;

        self.set_state(ConnectionState::Handshaking);
        let server = self.config.server.clone();
        let pinned = self.known_hosts.get(&server).map(str::to_string);
        let secured = handshake::initiate(
            read,
            write,
            self.config.format,
            self.config.handshake_timeout,
            |presented| match &pinned {
                Some(pinned) if pinned != presented => Err(ProtoError::FingerprintMismatch {
                    pinned: pinned.clone(),
                    presented: presented.to_string(),
                }),
                _ => Ok(()),
            },
        )
        .await?;
        if pinned.is_none() {
            self.known_hosts
                .pin(&server, &secured.fingerprint)
                .map_err(ClientError::TrustStore)?;
            info!(%server, fingerprint = %secured.fingerprint, "pinned server fingerprint");
        }
        let Secured {
            mut reader,
            mut writer,
            ..
        } = secured;

        self.set_state(ConnectionState::Identifying);
        writer
            .write(
                &Identify {
                    name: self.config.name.clone(),
                    channels: self.config.channels.clone(),
                    version: PROTOCOL_VERSION.to_string(),
                }
                .into(),
            )
            .await?;
        let reply = tokio::time::timeout(
            self.config.handshake_timeout,
            reader.read(MessageKind::IdentifyReply, CONTROL_MAX_SIZE),
        )
        .await
        .map_err(|_| ProtoError::Timeout("identify reply"))??;
        let Message::IdentifyReply(reply) = reply else {
            return Err(ProtoError::Malformed {
                kind: MessageKind::IdentifyReply,
                reason: format!("got {}", reply.kind()),
            }
            .into());
        };
        match reply.status {
            Status::Ok => {}
            Status::MustUpgrade => return Err(ClientError::MustUpgrade(reply.detail)),
            Status::NotOk | Status::NotAllowed => return Err(ClientError::Rejected(reply.detail)),
        }

        info!(name = %reply.name, %server, "connected");
        self.set_state(ConnectionState::Active);
        if self.config.history_depth > 0 && self.subscribed(HISTORY) {
            writer
                .send(
                    HISTORY,
                    &HistoryRequest {
                        depth: self.config.history_depth,
                    }
                    .into(),
                )
                .await?;
        }
        self.heartbeat.reset();
        self.serve(reader, writer).await
    }

    fn subscribed(&self, channel: &str) -> bool {
        self.config.channels.iter().any(|c| c == channel)
    }

    /// The active phase: one task reads, this loop writes and pings.
    async fn serve<R, W>(
        &mut self,
        reader: SecureReader<R>,
        mut writer: SecureWriter<W>,
    ) -> Result<(), ClientError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let (events_tx, mut events) = mpsc::channel(QUEUE_DEPTH);
        let _reader = AbortOnDropHandle::new(tokio::spawn(read_loop(reader, events_tx)));

        let pinging = self.subscribed(PING);
        let mut ticker = tokio::time::interval(self.config.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
                out = self.outbound.recv() => match out {
                    Some((channel, msg)) => writer.send(&channel, &msg).await?,
                    None => {
                        // Every handle is gone; nobody is left to talk to.
                        let _ = writer.shutdown().await;
                        self.stop.cancel();
                        return Ok(());
                    }
                },
                _ = ticker.tick(), if pinging => {
                    let ping = self.heartbeat.issue(Instant::now());
                    writer.send(PING, &ping.into()).await?;
                }
                event = events.recv() => match event {
                    Some(Ok(incoming)) => self.dispatch(incoming),
                    Some(Err(ProtoError::Closed)) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    fn dispatch(&mut self, incoming: Incoming) {
        if let Message::Ping(echo) = &incoming.message {
            if let Some(rtt) = self.heartbeat.answer(echo, Instant::now()) {
                debug!(?rtt, "latency sample");
                self.latency.send_replace(Some(rtt));
            }
            return;
        }
        if let Message::StatusNotice(notice) = &incoming.message {
            warn!(status = ?notice.status, "server notice: {}", notice.detail);
        }
        // Never wait on the application: a full queue drops the message.
        match self.incoming.try_send(incoming) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(channel = %dropped.channel, "incoming queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

#[async_trait::async_trait]
impl reconnect::Connector for Client {
    async fn attempt(&mut self) -> Result<(), ClientError> {
        self.connect_once().await
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: SecureReader<R>,
    events: mpsc::Sender<Result<Incoming, ProtoError>>,
) {
    loop {
        let next = read_one(&mut reader).await;
        let failed = next.is_err();
        if events.send(next).await.is_err() || failed {
            return;
        }
    }
}

async fn read_one<R: AsyncRead + Unpin>(
    reader: &mut SecureReader<R>,
) -> Result<Incoming, ProtoError> {
    let channel = reader.read_channel().await?;
    let kind = channels::outbound_kind(&channel).ok_or_else(|| ProtoError::Malformed {
        kind: MessageKind::ChannelId,
        reason: format!("unknown channel {channel:?}"),
    })?;
    let message = reader.read(kind, INBOUND_MAX_SIZE).await?;
    Ok(Incoming { channel, message })
}
