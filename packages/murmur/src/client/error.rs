use murmur_proto::ProtoError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("server fingerprint changed: pinned {pinned}, presented {presented}")]
    FingerprintMismatch { pinned: String, presented: String },

    #[error("server requires a different client version: {0}")]
    MustUpgrade(String),

    #[error("server refused identify: {0}")]
    Rejected(String),

    #[error("invalid server URL: {0:#}")]
    InvalidUrl(anyhow::Error),

    #[error("trust store error: {0:#}")]
    TrustStore(anyhow::Error),

    #[error("connect failed: {0:#}")]
    Connect(anyhow::Error),

    #[error(transparent)]
    Protocol(ProtoError),
}

impl From<ProtoError> for ClientError {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::FingerprintMismatch { pinned, presented } => {
                Self::FingerprintMismatch { pinned, presented }
            }
            other => Self::Protocol(other),
        }
    }
}

impl ClientError {
    /// Fatal errors stop the client for good; anything else is retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::FingerprintMismatch { .. }
            | Self::MustUpgrade(_)
            | Self::Rejected(_)
            | Self::InvalidUrl(_)
            | Self::TrustStore(_) => true,
            Self::Protocol(e) => e.is_trust_failure(),
            Self::Connect(_) => false,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::FingerprintMismatch { .. } => "fingerprint_mismatch",
            Self::MustUpgrade(_) => "must_upgrade",
            Self::Rejected(_) => "rejected",
            Self::InvalidUrl(_) => "invalid_url",
            Self::TrustStore(_) => "trust_store",
            Self::Connect(_) => "connect",
            Self::Protocol(e) => e.error_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let pinned: ClientError = ProtoError::FingerprintMismatch {
            pinned: "mm_A".into(),
            presented: "mm_B".into(),
        }
        .into();
        assert!(matches!(pinned, ClientError::FingerprintMismatch { .. }));
        assert!(pinned.is_fatal());
        assert_eq!(pinned.code(), "fingerprint_mismatch");

        assert!(ClientError::MustUpgrade("murmur/2".into()).is_fatal());
        assert!(ClientError::Rejected("unknown channel".into()).is_fatal());
        assert!(ClientError::from(ProtoError::BadFingerprint).is_fatal());

        let reset: ClientError =
            ProtoError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).into();
        assert!(!reset.is_fatal());
        assert_eq!(reset.code(), "io");
        assert!(!ClientError::from(ProtoError::Timeout("server hello")).is_fatal());
        assert!(!ClientError::Connect(anyhow::anyhow!("refused")).is_fatal());
    }
}
