//! Bounded chat history for replay to (re)connecting sessions.
//!
//! Stored file layout (big-endian):
//!
//! ```text
//! u16 version | u32 count | count × entry
//! v1 entry: str8 from | str32 text
//! v2 entry: str8 from | Chat (binary)
//! ```
//!
//! Older versions load fine and leave the history dirty so the next save
//! rewrites the file in the current layout.

use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use bytes::{BufMut, BytesMut};
use murmur_proto::WireMessage;
use murmur_proto::message::Chat;
use murmur_proto::wire::{WireError, WireReader, WireResult, WireWrite};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

pub const HISTORY_VERSION: u16 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Display name of the session that sent it.
    pub from: String,
    pub message: Chat,
}

/// Ring of the most recent `capacity` entries, oldest first.
#[derive(Debug)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    dirty: bool,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            dirty: false,
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.dirty = true;
    }

    /// The newest `depth` entries (at most `capacity`), oldest first.
    pub fn recent(&self, depth: usize) -> impl Iterator<Item = &HistoryEntry> {
        let depth = depth.min(self.capacity);
        self.entries.iter().skip(self.entries.len().saturating_sub(depth))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Serialize in the current layout and clear the dirty flag.
    pub fn encode(&mut self) -> Vec<u8> {
        let mut out = BytesMut::new();
        out.put_u16(HISTORY_VERSION);
        out.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            out.put_name(&entry.from);
            entry.message.encode_binary(&mut out);
        }
        self.dirty = false;
        out.to_vec()
    }

    /// Load a stored file. Entries beyond `capacity` drop oldest first.
    pub fn decode(bytes: &[u8], capacity: usize) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let (version, entries) = read_entries(&mut reader).map_err(|e| match e {
            WireError::Incomplete => anyhow!("history file is truncated"),
            WireError::Invalid(reason) => anyhow!("history file is invalid: {reason}"),
        })?;
        let mut history = Self::new(capacity);
        for entry in entries {
            history.push(entry);
        }
        history.dirty = version != HISTORY_VERSION;
        Ok(history)
    }
}

fn read_entries(reader: &mut WireReader<'_>) -> WireResult<(u16, Vec<HistoryEntry>)> {
    let version = reader.u16()?;
    let count = reader.u32()? as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    match version {
        1 => {
            for _ in 0..count {
                let from = reader.name()?;
                let text = reader.str32()?;
                entries.push(HistoryEntry {
                    message: Chat {
                        from: from.clone(),
                        text,
                        sent_at_ms: 0,
                    },
                    from,
                });
            }
        }
        HISTORY_VERSION => {
            for _ in 0..count {
                let from = reader.name()?;
                let message = Chat::decode_binary(reader)?;
                entries.push(HistoryEntry { from, message });
            }
        }
        other => return Err(WireError::Invalid(format!("unsupported version {other}"))),
    }
    Ok((version, entries))
}

/// Append-only side file of every chat line, one JSON object per line.
pub struct AuditLog {
    path: PathBuf,
}

#[derive(Serialize)]
struct AuditLine<'a> {
    from: &'a str,
    text: &'a str,
    sent_at_ms: i64,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let mut line = serde_json::to_vec(&AuditLine {
            from: &entry.from,
            text: &entry.message.text,
            sent_at_ms: entry.message.sent_at_ms,
        })?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }
}
