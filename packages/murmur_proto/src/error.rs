//! Error types and stable error codes.

use crate::message::MessageKind;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: MessageKind, reason: String },

    #[error("payload exceeds {max} bytes")]
    TooLarge { max: usize },

    #[error("{0} messages are binary only")]
    JsonUnsupported(MessageKind),

    #[error("unknown protocol format selector {0}")]
    UnknownFormat(u8),

    #[error("server fingerprint mismatch: pinned {pinned}, presented {presented}")]
    FingerprintMismatch { pinned: String, presented: String },

    #[error("server fingerprint does not match its public key")]
    BadFingerprint,

    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    #[error("key confirmation failed")]
    ProbeMismatch,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Malformed { .. } => "malformed",
            Self::TooLarge { .. } => "too_large",
            Self::JsonUnsupported(_) => "json_unsupported",
            Self::UnknownFormat(_) => "unknown_format",
            Self::FingerprintMismatch { .. } => "fingerprint_mismatch",
            Self::BadFingerprint => "bad_fingerprint",
            Self::KeyExchange(_) => "key_exchange",
            Self::ProbeMismatch => "probe_mismatch",
            Self::Timeout(_) => "timeout",
            Self::Closed => "closed",
            Self::Io(_) => "io",
        }
    }

    /// Whether this error means the peer cannot be trusted, as opposed to
    /// a network hiccup that a reconnect could fix.
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Self::FingerprintMismatch { .. } | Self::BadFingerprint
        )
    }
}
