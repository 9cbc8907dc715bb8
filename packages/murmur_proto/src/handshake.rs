//! Connection setup up to an encrypted, key-confirmed stream.
//!
//! ```text
//! client                                server
//!   format byte  ──────────────────────▶
//!               ◀──────────────────────  ServerHello{public_key, random, fingerprint}
//!   (pin check)
//!   KeyExchange{random, ephemeral, sealed} ──▶
//!   ═════════════ both directions encrypted from here ═════════════
//!   Probe ───────────────────────────────▶
//!               ◀───────────────────────  Probe (echo)
//! ```
//!
//! Identify runs afterwards over the secured stream and belongs to the
//! server and client crates.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::cipher::{CipherReader, CipherWriter};
use crate::codec::{CONTROL_MAX_SIZE, MessageReader, MessageWriter, unexpected};
use crate::error::ProtoError;
use crate::keys::{PreMasterSecret, PublicKey, ServerKey, seal_pre_master};
use crate::message::{Format, KeyExchange, Message, MessageKind, Probe, ServerHello};
use crate::session_keys::{KeyStream, Role, SessionKeys};

/// Known plaintext exchanged right after keys switch on.
pub const PROBE_TOKEN: &str = "murmur-probe";

pub type SecureReader<R> = MessageReader<CipherReader<R>>;
pub type SecureWriter<W> = MessageWriter<CipherWriter<W>>;

/// An established, encrypted connection.
pub struct Secured<R, W> {
    pub reader: SecureReader<R>,
    pub writer: SecureWriter<W>,
    pub format: Format,
    /// Fingerprint of the server key this connection was keyed against.
    pub fingerprint: String,
}

async fn step<T, F>(what: &'static str, limit: Duration, fut: F) -> Result<T, ProtoError>
where
    F: Future<Output = Result<T, ProtoError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ProtoError::Timeout(what))?
}

/// Read the one-byte format selector that opens every connection.
pub async fn read_format<R: AsyncRead + Unpin>(read: &mut R) -> Result<Format, ProtoError> {
    let byte = read.read_u8().await?;
    Format::from_byte(byte)
}

fn secure<R, W>(
    reader: MessageReader<R>,
    writer: MessageWriter<W>,
    read_keys: KeyStream,
    write_keys: KeyStream,
) -> (SecureReader<R>, SecureWriter<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let format = reader.format();
    let (inner, mut leftover) = reader.into_parts();
    let mut cipher_reader = CipherReader::new(inner, read_keys);
    cipher_reader.decrypt_leftover(&mut leftover);
    (
        MessageReader::with_buffer(cipher_reader, format, leftover),
        MessageWriter::new(CipherWriter::new(writer.into_inner(), write_keys), format),
    )
}

async fn read_probe<R: AsyncRead + Unpin>(
    reader: &mut SecureReader<R>,
) -> Result<(), ProtoError> {
    // Wrong keys turn the probe into noise, which surfaces as a decode
    // failure rather than a token mismatch.
    let msg = reader
        .read(MessageKind::Probe, CONTROL_MAX_SIZE)
        .await
        .map_err(|e| match e {
            ProtoError::Malformed { .. } | ProtoError::TooLarge { .. } => ProtoError::ProbeMismatch,
            other => other,
        })?;
    match msg {
        Message::Probe(Probe { token }) if token == PROBE_TOKEN => Ok(()),
        Message::Probe(_) => Err(ProtoError::ProbeMismatch),
        other => Err(unexpected(MessageKind::Probe, &other)),
    }
}

fn probe() -> Message {
    Probe {
        token: PROBE_TOKEN.to_string(),
    }
    .into()
}

/// Server side: everything after the TCP/WebSocket accept up to a
/// confirmed encrypted stream.
pub async fn accept<R, W>(
    mut read: R,
    write: W,
    key: &ServerKey,
    step_timeout: Duration,
) -> Result<Secured<R, W>, ProtoError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let format = step("format selector", step_timeout, read_format(&mut read)).await?;
    let mut reader = MessageReader::new(read, format);
    let mut writer = MessageWriter::new(write, format);

    let public_key = key.public_key();
    let server_random: [u8; 32] = rand::random();
    let fingerprint = public_key.fingerprint();
    writer
        .write(
            &ServerHello {
                public_key: *public_key.as_bytes(),
                random: server_random,
                fingerprint: fingerprint.clone(),
            }
            .into(),
        )
        .await?;

    let exchange = match step(
        "key exchange",
        step_timeout,
        reader.read(MessageKind::KeyExchange, CONTROL_MAX_SIZE),
    )
    .await?
    {
        Message::KeyExchange(kx) => kx,
        other => return Err(unexpected(MessageKind::KeyExchange, &other)),
    };

    let pre_master = key.open_pre_master(&exchange.ephemeral, &exchange.sealed)?;
    let keys = SessionKeys::derive(pre_master, &exchange.random, &server_random);
    let (read_keys, write_keys) = keys.split(Role::Server);
    let (mut reader, mut writer) = secure(reader, writer, read_keys, write_keys);

    step("probe", step_timeout, read_probe(&mut reader)).await?;
    writer.write(&probe()).await?;
    debug!(?format, "handshake complete");

    Ok(Secured {
        reader,
        writer,
        format,
        fingerprint,
    })
}

/// Client side. `verify` sees the server's fingerprint before any secret
/// leaves this process; returning an error aborts the handshake.
pub async fn initiate<R, W, F>(
    read: R,
    mut write: W,
    format: Format,
    step_timeout: Duration,
    verify: F,
) -> Result<Secured<R, W>, ProtoError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnOnce(&str) -> Result<(), ProtoError>,
{
    write.write_all(&[format.as_byte()]).await?;
    write.flush().await?;

    let mut reader = MessageReader::new(read, format);
    let mut writer = MessageWriter::new(write, format);

    let hello = match step(
        "server hello",
        step_timeout,
        reader.read(MessageKind::ServerHello, CONTROL_MAX_SIZE),
    )
    .await?
    {
        Message::ServerHello(hello) => hello,
        other => return Err(unexpected(MessageKind::ServerHello, &other)),
    };

    let server_key = PublicKey::from_bytes(hello.public_key);
    let fingerprint = server_key.fingerprint();
    if hello.fingerprint != fingerprint {
        return Err(ProtoError::BadFingerprint);
    }
    verify(&fingerprint)?;

    let client_random: [u8; 32] = rand::random();
    let pre_master = PreMasterSecret::generate();
    let sealed = seal_pre_master(&server_key, &pre_master)?;
    writer
        .write(
            &KeyExchange {
                random: client_random,
                ephemeral: sealed.ephemeral,
                sealed: sealed.sealed,
            }
            .into(),
        )
        .await?;

    let keys = SessionKeys::derive(pre_master, &client_random, &hello.random);
    let (read_keys, write_keys) = keys.split(Role::Client);
    let (mut reader, mut writer) = secure(reader, writer, read_keys, write_keys);

    writer.write(&probe()).await?;
    step("probe echo", step_timeout, read_probe(&mut reader)).await?;
    debug!(%fingerprint, ?format, "handshake complete");

    Ok(Secured {
        reader,
        writer,
        format,
        fingerprint,
    })
}
