//! Well-known channel names and the payload kind each carries.
//!
//! `inbound` is what a client may send to the server on the channel,
//! `outbound` what the server sends back. `None` makes the channel
//! send-only or receive-only in that direction.

use crate::message::MessageKind;

pub const CHAT: &str = "chat";
pub const HISTORY: &str = "history";
pub const USERS: &str = "users";
pub const PING: &str = "ping";
pub const TYPING: &str = "typing";
pub const UPLOAD: &str = "upload";
pub const UPDATE: &str = "update";
pub const MUSIC: &str = "music";
/// Server notices (refusals). Every session receives them; nobody
/// subscribes.
pub const STATUS: &str = "status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: &'static str,
    pub inbound: Option<MessageKind>,
    pub outbound: Option<MessageKind>,
}

pub const WELL_KNOWN: &[ChannelInfo] = &[
    ChannelInfo {
        name: CHAT,
        inbound: Some(MessageKind::Chat),
        outbound: Some(MessageKind::Chat),
    },
    ChannelInfo {
        name: HISTORY,
        inbound: Some(MessageKind::HistoryRequest),
        outbound: Some(MessageKind::Chat),
    },
    ChannelInfo {
        name: USERS,
        inbound: None,
        outbound: Some(MessageKind::UserList),
    },
    ChannelInfo {
        name: PING,
        inbound: Some(MessageKind::Ping),
        outbound: Some(MessageKind::Ping),
    },
    ChannelInfo {
        name: TYPING,
        inbound: Some(MessageKind::Typing),
        outbound: Some(MessageKind::Typing),
    },
    ChannelInfo {
        name: UPLOAD,
        inbound: Some(MessageKind::FileUpload),
        outbound: Some(MessageKind::FileUpload),
    },
    ChannelInfo {
        name: UPDATE,
        inbound: None,
        outbound: Some(MessageKind::Update),
    },
    ChannelInfo {
        name: MUSIC,
        inbound: Some(MessageKind::MusicState),
        outbound: Some(MessageKind::MusicState),
    },
    ChannelInfo {
        name: STATUS,
        inbound: None,
        outbound: Some(MessageKind::StatusNotice),
    },
];

pub fn lookup(name: &str) -> Option<&'static ChannelInfo> {
    WELL_KNOWN.iter().find(|c| c.name == name)
}

/// Kind of payload the server sends on `name`.
pub fn outbound_kind(name: &str) -> Option<MessageKind> {
    lookup(name).and_then(|c| c.outbound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        for (i, a) in WELL_KNOWN.iter().enumerate() {
            for b in &WELL_KNOWN[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn directions() {
        assert_eq!(lookup(USERS).unwrap().inbound, None);
        assert_eq!(lookup(UPDATE).unwrap().inbound, None);
        assert_eq!(outbound_kind(HISTORY), Some(MessageKind::Chat));
        assert_eq!(outbound_kind(STATUS), Some(MessageKind::StatusNotice));
        assert!(lookup("nope").is_none());
    }
}
