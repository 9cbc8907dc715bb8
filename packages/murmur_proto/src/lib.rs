//! Wire protocol for murmur: the message contract, both encodings, the
//! channel envelope, and the encrypted session handshake.

pub mod channels;
pub mod cipher;
pub mod codec;
pub mod encoding;
pub mod error;
pub mod handshake;
pub mod keys;
pub mod message;
pub mod session_keys;
pub mod wire;

pub use codec::{CONTROL_MAX_SIZE, MessageReader, MessageWriter};
pub use error::ProtoError;
pub use handshake::{PROBE_TOKEN, SecureReader, SecureWriter, Secured};
pub use keys::{PublicKey, ServerKey};
pub use message::{Format, Message, MessageKind, Status, WireMessage};

/// Version string exchanged in Identify. Servers refuse any other value
/// with `Status::MustUpgrade`.
pub const PROTOCOL_VERSION: &str = "murmur/1";
