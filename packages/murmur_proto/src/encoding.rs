//! Text encodings for binary values: Crockford base32 for fingerprints and
//! URL-safe unpadded base64 for key material inside JSON messages.

use data_encoding::BASE32_NOPAD;

/// Crockford base32 alphabet: `0123456789ABCDEFGHJKMNPQRSTVWXYZ`.
const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Encode bytes as Crockford base32 (uppercase).
pub fn crockford_encode(bytes: &[u8]) -> String {
    let standard = BASE32_NOPAD.encode(bytes);
    standard
        .bytes()
        .map(|b| {
            let idx = match b {
                b'A'..=b'Z' => b - b'A',
                b'2'..=b'7' => 26 + (b - b'2'),
                _ => 0,
            };
            CROCKFORD_ALPHABET[idx as usize] as char
        })
        .collect()
}

pub fn base64_encode(bytes: &[u8]) -> String {
    data_encoding::BASE64URL_NOPAD.encode(bytes)
}

pub fn base64_decode(s: &str) -> Result<Vec<u8>, data_encoding::DecodeError> {
    data_encoding::BASE64URL_NOPAD.decode(s.as_bytes())
}

/// `#[serde(with = "b64")]` for byte arrays and vectors.
pub(crate) mod b64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, T: AsRef<[u8]>>(
        value: &T,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::base64_encode(value.as_ref()))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = super::base64_decode(&s).map_err(serde::de::Error::custom)?;
        let len = bytes.len();
        T::try_from(bytes)
            .map_err(|_| serde::de::Error::custom(format!("unexpected length {len}")))
    }
}
