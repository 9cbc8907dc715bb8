//! Directional session key derivation.
//!
//! `master = BLAKE3-keyed(pre_master, "master secret" || cr || sr)`, then each
//! of the four labels gives independent material:
//! `BLAKE3-keyed(master, label || cr || sr)`. The client writes with the
//! client-write key and the server reads with it, and vice versa.

use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};

use crate::keys::PreMasterSecret;

const MASTER_LABEL: &[u8] = b"master secret";
const CLIENT_WRITE_KEY: &[u8] = b"client write key";
const SERVER_WRITE_KEY: &[u8] = b"server write key";
const CLIENT_WRITE_IV: &[u8] = b"client write iv";
const SERVER_WRITE_IV: &[u8] = b"server write iv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Clone, PartialEq, Eq)]
struct Direction {
    key: [u8; 32],
    iv: [u8; 12],
}

impl Direction {
    fn keystream(&self) -> KeyStream {
        KeyStream(ChaCha20::new(&self.key.into(), &self.iv.into()))
    }
}

pub struct SessionKeys {
    client_write: Direction,
    server_write: Direction,
}

impl SessionKeys {
    /// Takes the pre-master by value: it is spent once keys exist.
    pub fn derive(
        pre_master: PreMasterSecret,
        client_random: &[u8; 32],
        server_random: &[u8; 32],
    ) -> Self {
        let master = labelled(pre_master.expose(), MASTER_LABEL, client_random, server_random);
        drop(pre_master);

        let iv = |label| {
            let full = labelled(&master, label, client_random, server_random);
            let mut iv = [0u8; 12];
            iv.copy_from_slice(&full[..12]);
            iv
        };

        Self {
            client_write: Direction {
                key: labelled(&master, CLIENT_WRITE_KEY, client_random, server_random),
                iv: iv(CLIENT_WRITE_IV),
            },
            server_write: Direction {
                key: labelled(&master, SERVER_WRITE_KEY, client_random, server_random),
                iv: iv(SERVER_WRITE_IV),
            },
        }
    }

    /// `(read, write)` keystreams for one end of the connection.
    pub fn split(self, role: Role) -> (KeyStream, KeyStream) {
        match role {
            Role::Client => (self.server_write.keystream(), self.client_write.keystream()),
            Role::Server => (self.client_write.keystream(), self.server_write.keystream()),
        }
    }
}

fn labelled(key: &[u8; 32], label: &[u8], client_random: &[u8; 32], server_random: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(label);
    hasher.update(client_random);
    hasher.update(server_random);
    *hasher.finalize().as_bytes()
}

/// ChaCha20 keystream for one direction of a connection.
pub struct KeyStream(ChaCha20);

impl KeyStream {
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf);
    }
}
