//! Server identity keys, fingerprints, and pre-master sealing.
//!
//! The server's long-term key is an X25519 static secret. A client seals
//! its pre-master secret to that key: it makes an ephemeral X25519 key,
//! runs Diffie-Hellman against the server's public key, derives a one-shot
//! sealing key from the shared secret, and encrypts the pre-master with
//! ChaCha20-Poly1305. Only the holder of the server secret can open it.

use std::fmt;

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::encoding::{base64_decode, base64_encode, crockford_encode};
use crate::error::ProtoError;

const SEAL_CONTEXT: &str = "murmur 2024-06 pre-master seal";

/// Bytes of the SHA-256 digest shown in a fingerprint.
const FINGERPRINT_BYTES: usize = 10;

// --- PublicKey ---

#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `mm_` + Crockford base32 of the first 10 bytes of SHA-256(key).
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(self.0);
        format!("mm_{}", crockford_encode(&hash[..FINGERPRINT_BYTES]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base64_encode(&self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64_encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = base64_decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("public key must be 32 bytes"))?;
        Ok(PublicKey(arr))
    }
}

// --- ServerKey ---

/// Long-term server secret.
#[derive(Clone)]
pub struct ServerKey(x25519_dalek::StaticSecret);

impl ServerKey {
    pub fn generate() -> Self {
        Self::from_bytes(rand::random())
    }

    /// Reconstruct from the raw 32-byte secret.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    /// Raw secret, for persistent storage.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }

    /// Open a pre-master secret sealed by [`seal_pre_master`].
    pub fn open_pre_master(
        &self,
        ephemeral: &[u8; 32],
        sealed: &[u8],
    ) -> Result<PreMasterSecret, ProtoError> {
        let their = x25519_dalek::PublicKey::from(*ephemeral);
        let shared = self.0.diffie_hellman(&their);
        if !shared.was_contributory() {
            return Err(ProtoError::KeyExchange("non-contributory ephemeral key".into()));
        }
        let key = seal_key(shared.as_bytes(), ephemeral, self.public_key().as_bytes());
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plain = cipher
            .decrypt(Nonce::from_slice(&[0u8; 12]), sealed)
            .map_err(|_| ProtoError::KeyExchange("pre-master does not open".into()))?;
        let bytes: [u8; 32] = plain
            .try_into()
            .map_err(|_| ProtoError::KeyExchange("pre-master must be 32 bytes".into()))?;
        Ok(PreMasterSecret(bytes))
    }
}

impl fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerKey({})", self.public_key().fingerprint())
    }
}

// --- PreMasterSecret ---

/// Seed of every session key. Consumed by key derivation, so one value
/// can never key two connections.
pub struct PreMasterSecret([u8; 32]);

impl PreMasterSecret {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub(crate) fn expose(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for PreMasterSecret {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

impl fmt::Debug for PreMasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PreMasterSecret(..)")
    }
}

/// Client's sealed pre-master, ready for the key exchange message.
#[derive(Debug, Clone)]
pub struct SealedPreMaster {
    pub ephemeral: [u8; 32],
    pub sealed: Vec<u8>,
}

pub fn seal_pre_master(
    server: &PublicKey,
    pre_master: &PreMasterSecret,
) -> Result<SealedPreMaster, ProtoError> {
    let secret = x25519_dalek::StaticSecret::from(rand::random::<[u8; 32]>());
    let ephemeral = x25519_dalek::PublicKey::from(&secret).to_bytes();
    let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(server.0));
    if !shared.was_contributory() {
        return Err(ProtoError::KeyExchange("server key is a low-order point".into()));
    }
    let key = seal_key(shared.as_bytes(), &ephemeral, server.as_bytes());
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), pre_master.expose().as_slice())
        .map_err(|_| ProtoError::KeyExchange("sealing failed".into()))?;
    Ok(SealedPreMaster { ephemeral, sealed })
}

/// Sealing keys are single-use (fresh ephemeral per seal), so a zero
/// nonce is sound.
fn seal_key(shared: &[u8; 32], ephemeral: &[u8; 32], server: &[u8; 32]) -> [u8; 32] {
    let mut material = [0u8; 96];
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(ephemeral);
    material[64..].copy_from_slice(server);
    blake3::derive_key(SEAL_CONTEXT, &material)
}
