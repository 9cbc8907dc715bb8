//! The message contract.
//!
//! Every message kind is a plain struct implementing [`WireMessage`]: a
//! compact binary form, a JSON form (unless the kind carries a streamed
//! body), structural equality used for broadcast dedup, and an explicit
//! `close` that releases attached bodies. [`Message`] is the closed set of
//! kinds; a message's kind is implied by the channel it travels on.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::encoding::b64;
use crate::error::ProtoError;
use crate::wire::{WireError, WireReader, WireResult, WireWrite};

/// Wire framing negotiated by the first byte of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Json,
    Binary,
}

impl Format {
    pub const NONE_BYTE: u8 = 0;
    pub const JSON_BYTE: u8 = 1;
    pub const BINARY_BYTE: u8 = 2;

    pub fn from_byte(b: u8) -> Result<Self, ProtoError> {
        match b {
            Self::JSON_BYTE => Ok(Self::Json),
            Self::BINARY_BYTE => Ok(Self::Binary),
            other => Err(ProtoError::UnknownFormat(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Json => Self::JSON_BYTE,
            Self::Binary => Self::BINARY_BYTE,
        }
    }
}

/// Result of an identify exchange or a channel-level refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    NotOk,
    MustUpgrade,
    NotAllowed,
}

impl Status {
    fn as_byte(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::NotOk => 1,
            Self::MustUpgrade => 2,
            Self::NotAllowed => 3,
        }
    }

    fn from_byte(b: u8) -> WireResult<Self> {
        match b {
            0 => Ok(Self::Ok),
            1 => Ok(Self::NotOk),
            2 => Ok(Self::MustUpgrade),
            3 => Ok(Self::NotAllowed),
            other => Err(WireError::Invalid(format!("unknown status {other}"))),
        }
    }
}

/// Per-kind contract.
pub trait WireMessage: Sized {
    const KIND: MessageKind;

    fn encode_binary(&self, out: &mut BytesMut);

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self>;

    fn encode_json(&self, out: &mut BytesMut) -> Result<(), ProtoError>;

    /// Decode one JSON object from the front of `input`. Returns the message
    /// and how many bytes it used; the rest belongs to the next message.
    fn decode_json(input: &[u8]) -> Result<Option<(Self, usize)>, ProtoError>;

    /// Structural equality for dedup. Kinds without a meaningful notion of
    /// "the same state" return false.
    fn same_as(&self, other: &Self) -> bool;

    /// Release any attached body.
    fn close(&mut self) {}
}

fn json_encode<T: Serialize>(kind: MessageKind, msg: &T, out: &mut BytesMut) -> Result<(), ProtoError> {
    serde_json::to_writer((&mut *out).writer(), msg).map_err(|e| ProtoError::Malformed {
        kind,
        reason: e.to_string(),
    })?;
    out.put_u8(b'\n');
    Ok(())
}

fn json_decode<T: DeserializeOwned>(
    kind: MessageKind,
    input: &[u8],
) -> Result<Option<(T, usize)>, ProtoError> {
    let mut stream = serde_json::Deserializer::from_slice(input).into_iter::<T>();
    match stream.next() {
        None => Ok(None),
        Some(Ok(value)) => Ok(Some((value, stream.byte_offset()))),
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(ProtoError::Malformed {
            kind,
            reason: e.to_string(),
        }),
    }
}

/// Deserializers for identity-bearing strings: control characters are
/// dropped the same way [`WireReader::name`] drops them.
mod clean {
    use serde::{Deserialize, Deserializer};

    use crate::wire::strip_control;

    pub fn name<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(strip_control(&String::deserialize(d)?))
    }

    pub fn names<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        let raw = Vec::<String>::deserialize(d)?;
        Ok(raw.iter().map(|s| strip_control(s)).collect())
    }
}

/// Implements the JSON half of [`WireMessage`] through serde.
macro_rules! serde_json_codec {
    () => {
        fn encode_json(&self, out: &mut BytesMut) -> Result<(), ProtoError> {
            json_encode(Self::KIND, self, out)
        }

        fn decode_json(input: &[u8]) -> Result<Option<(Self, usize)>, ProtoError> {
            json_decode(Self::KIND, input)
        }
    };
}

/// Implements the JSON half of [`WireMessage`] for binary-only kinds.
macro_rules! binary_only {
    () => {
        fn encode_json(&self, _out: &mut BytesMut) -> Result<(), ProtoError> {
            Err(ProtoError::JsonUnsupported(Self::KIND))
        }

        fn decode_json(_input: &[u8]) -> Result<Option<(Self, usize)>, ProtoError> {
            Err(ProtoError::JsonUnsupported(Self::KIND))
        }
    };
}

// --- Envelope ---

/// Names the channel the next message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelId {
    #[serde(deserialize_with = "clean::name")]
    pub name: String,
}

impl WireMessage for ChannelId {
    const KIND: MessageKind = MessageKind::ChannelId;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_name(&self.name);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self { name: input.name()? })
    }

    serde_json_codec!();

    fn same_as(&self, other: &Self) -> bool {
        self == other
    }
}

// --- Handshake ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    #[serde(with = "b64")]
    pub public_key: [u8; 32],
    #[serde(with = "b64")]
    pub random: [u8; 32],
    #[serde(deserialize_with = "clean::name")]
    pub fingerprint: String,
}

impl WireMessage for ServerHello {
    const KIND: MessageKind = MessageKind::ServerHello;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_slice(&self.public_key);
        out.put_slice(&self.random);
        out.put_name(&self.fingerprint);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self {
            public_key: input.array()?,
            random: input.array()?,
            fingerprint: input.name()?,
        })
    }

    serde_json_codec!();

    fn same_as(&self, other: &Self) -> bool {
        self == other
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    #[serde(with = "b64")]
    pub random: [u8; 32],
    #[serde(with = "b64")]
    pub ephemeral: [u8; 32],
    #[serde(with = "b64")]
    pub sealed: Vec<u8>,
}

impl WireMessage for KeyExchange {
    const KIND: MessageKind = MessageKind::KeyExchange;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_slice(&self.random);
        out.put_slice(&self.ephemeral);
        out.put_blob16(&self.sealed);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self {
            random: input.array()?,
            ephemeral: input.array()?,
            sealed: input.blob16()?,
        })
    }

    serde_json_codec!();

    fn same_as(&self, other: &Self) -> bool {
        self == other
    }
}

/// Known plaintext exchanged right after keys are installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub token: String,
}

impl WireMessage for Probe {
    const KIND: MessageKind = MessageKind::Probe;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_str8(&self.token);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self { token: input.str8()? })
    }

    serde_json_codec!();

    fn same_as(&self, other: &Self) -> bool {
        self == other
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    #[serde(deserialize_with = "clean::name")]
    pub name: String,
    #[serde(deserialize_with = "clean::names")]
    pub channels: Vec<String>,
    pub version: String,
}

impl WireMessage for Identify {
    const KIND: MessageKind = MessageKind::Identify;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_name(&self.name);
        out.put_u16(self.channels.len().min(u16::MAX as usize) as u16);
        for channel in self.channels.iter().take(u16::MAX as usize) {
            out.put_name(channel);
        }
        out.put_str8(&self.version);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self {
            name: input.name()?,
            channels: input.list16(|r| r.name())?,
            version: input.str8()?,
        })
    }

    serde_json_codec!();

    fn same_as(&self, other: &Self) -> bool {
        self == other
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyReply {
    pub status: Status,
    pub detail: String,
    #[serde(deserialize_with = "clean::name")]
    pub name: String,
}

impl WireMessage for IdentifyReply {
    const KIND: MessageKind = MessageKind::IdentifyReply;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_u8(self.status.as_byte());
        out.put_str16(&self.detail);
        out.put_name(&self.name);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self {
            status: Status::from_byte(input.u8()?)?,
            detail: input.str16()?,
            name: input.name()?,
        })
    }

    serde_json_codec!();

    fn same_as(&self, other: &Self) -> bool {
        self == other
    }
}

// --- Channel payloads ---

/// Refusal or notice sent on the `status` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotice {
    pub status: Status,
    pub detail: String,
}

impl WireMessage for StatusNotice {
    const KIND: MessageKind = MessageKind::StatusNotice;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_u8(self.status.as_byte());
        out.put_str16(&self.detail);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self {
            status: Status::from_byte(input.u8()?)?,
            detail: input.str16()?,
        })
    }

    serde_json_codec!();

    fn same_as(&self, _other: &Self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    #[serde(deserialize_with = "clean::name")]
    pub from: String,
    pub text: String,
    pub sent_at_ms: i64,
}

impl WireMessage for Chat {
    const KIND: MessageKind = MessageKind::Chat;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_name(&self.from);
        out.put_str32(&self.text);
        out.put_i64(self.sent_at_ms);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self {
            from: input.name()?,
            text: input.str32()?,
            sent_at_ms: input.i64()?,
        })
    }

    serde_json_codec!();

    /// Chat lines are events, never state: two identical lines are still two
    /// lines.
    fn same_as(&self, _other: &Self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub depth: u32,
}

impl WireMessage for HistoryRequest {
    const KIND: MessageKind = MessageKind::HistoryRequest;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_u32(self.depth);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self { depth: input.u32()? })
    }

    serde_json_codec!();

    fn same_as(&self, _other: &Self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    #[serde(deserialize_with = "clean::name")]
    pub name: String,
    pub sessions: u16,
    #[serde(deserialize_with = "clean::names")]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserList {
    pub users: Vec<UserEntry>,
}

impl WireMessage for UserList {
    const KIND: MessageKind = MessageKind::UserList;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_u16(self.users.len().min(u16::MAX as usize) as u16);
        for user in self.users.iter().take(u16::MAX as usize) {
            out.put_name(&user.name);
            out.put_u16(user.sessions);
            out.put_u16(user.channels.len().min(u16::MAX as usize) as u16);
            for channel in user.channels.iter().take(u16::MAX as usize) {
                out.put_name(channel);
            }
        }
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        let users = input.list16(|r| {
            Ok(UserEntry {
                name: r.name()?,
                sessions: r.u16()?,
                channels: r.list16(|r| r.name())?,
            })
        })?;
        Ok(Self { users })
    }

    serde_json_codec!();

    fn same_as(&self, other: &Self) -> bool {
        self == other
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub token: u64,
}

impl WireMessage for Ping {
    const KIND: MessageKind = MessageKind::Ping;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_u64(self.token);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self { token: input.u64()? })
    }

    serde_json_codec!();

    /// Every ping must be echoed.
    fn same_as(&self, _other: &Self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typing {
    #[serde(deserialize_with = "clean::name")]
    pub name: String,
    pub active: bool,
}

impl WireMessage for Typing {
    const KIND: MessageKind = MessageKind::Typing;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_name(&self.name);
        out.put_bool(self.active);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self {
            name: input.name()?,
            active: input.bool()?,
        })
    }

    serde_json_codec!();

    fn same_as(&self, other: &Self) -> bool {
        self == other
    }
}

/// A file body streamed through the `upload` channel. Binary only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub from: String,
    pub file_name: String,
    pub body: Bytes,
}

impl WireMessage for FileUpload {
    const KIND: MessageKind = MessageKind::FileUpload;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_name(&self.from);
        out.put_str16(&self.file_name);
        out.put_blob32(&self.body);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self {
            from: input.name()?,
            file_name: input.str16()?,
            body: input.blob32()?,
        })
    }

    binary_only!();

    fn same_as(&self, _other: &Self) -> bool {
        false
    }

    fn close(&mut self) {
        self.body = Bytes::new();
    }
}

/// A client build distributed through the `update` channel. Binary only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub version: String,
    pub body: Bytes,
}

impl WireMessage for Update {
    const KIND: MessageKind = MessageKind::Update;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_str8(&self.version);
        out.put_blob32(&self.body);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self {
            version: input.str8()?,
            body: input.blob32()?,
        })
    }

    binary_only!();

    fn same_as(&self, other: &Self) -> bool {
        self == other
    }

    fn close(&mut self) {
        self.body = Bytes::new();
    }
}

/// Playback state of a music node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicState {
    #[serde(deserialize_with = "clean::name")]
    pub node: String,
    pub song: String,
    pub playing: bool,
    pub position_ms: u64,
}

impl WireMessage for MusicState {
    const KIND: MessageKind = MessageKind::MusicState;

    fn encode_binary(&self, out: &mut BytesMut) {
        out.put_name(&self.node);
        out.put_str16(&self.song);
        out.put_bool(self.playing);
        out.put_u64(self.position_ms);
    }

    fn decode_binary(input: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self {
            node: input.name()?,
            song: input.str16()?,
            playing: input.bool()?,
            position_ms: input.u64()?,
        })
    }

    serde_json_codec!();

    fn same_as(&self, other: &Self) -> bool {
        self == other
    }
}

// --- Closed set of kinds ---

macro_rules! messages {
    ($($variant:ident => $label:literal),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageKind {
            $($variant),+
        }

        impl MessageKind {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Message {
            $($variant($variant)),+
        }

        $(
            impl From<$variant> for Message {
                fn from(msg: $variant) -> Self {
                    Message::$variant(msg)
                }
            }
        )+

        impl Message {
            pub fn kind(&self) -> MessageKind {
                match self {
                    $(Self::$variant(_) => MessageKind::$variant),+
                }
            }

            /// Append this message's encoding to `out`.
            pub fn encode(&self, format: Format, out: &mut BytesMut) -> Result<(), ProtoError> {
                match (self, format) {
                    $(
                        (Self::$variant(m), Format::Binary) => {
                            m.encode_binary(out);
                            Ok(())
                        }
                        (Self::$variant(m), Format::Json) => m.encode_json(out),
                    )+
                }
            }

            /// Decode one message of `kind` from the front of `input`.
            ///
            /// `Ok(None)` means more input is needed. On success the second
            /// element is the number of bytes used; anything past it is left
            /// for the next read.
            pub fn decode(
                kind: MessageKind,
                format: Format,
                input: &[u8],
            ) -> Result<Option<(Message, usize)>, ProtoError> {
                match kind {
                    $(
                        MessageKind::$variant => match format {
                            Format::Binary => {
                                let mut reader = WireReader::new(input);
                                match $variant::decode_binary(&mut reader) {
                                    Ok(m) => Ok(Some((Message::$variant(m), reader.consumed()))),
                                    Err(WireError::Incomplete) => Ok(None),
                                    Err(WireError::Invalid(reason)) => {
                                        Err(ProtoError::Malformed { kind, reason })
                                    }
                                }
                            }
                            Format::Json => Ok($variant::decode_json(input)?
                                .map(|(m, used)| (Message::$variant(m), used))),
                        },
                    )+
                }
            }

            /// Structural equality; messages of different kinds are never equal.
            pub fn same_as(&self, other: &Message) -> bool {
                match (self, other) {
                    $((Self::$variant(a), Self::$variant(b)) => a.same_as(b),)+
                    _ => false,
                }
            }

            pub fn close(&mut self) {
                match self {
                    $(Self::$variant(m) => m.close()),+
                }
            }
        }
    };
}

messages! {
    ChannelId => "channel id",
    ServerHello => "server hello",
    KeyExchange => "key exchange",
    Probe => "probe",
    Identify => "identify",
    IdentifyReply => "identify reply",
    StatusNotice => "status notice",
    Chat => "chat",
    HistoryRequest => "history request",
    UserList => "user list",
    Ping => "ping",
    Typing => "typing",
    FileUpload => "file upload",
    Update => "update",
    MusicState => "music state",
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
