//! Real server on an ephemeral port, driven by the real client.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use murmur_proto::channels::{CHAT, HISTORY, PING, STATUS, USERS};
use murmur_proto::handshake::{self, Secured};
use murmur_proto::message::{Chat, Identify, IdentifyReply, UserList};
use murmur_proto::{
    CONTROL_MAX_SIZE, Format, Message, MessageKind, PROTOCOL_VERSION, SecureReader, SecureWriter,
    ServerKey, Status,
};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::client::{Client, ClientError, ClientHandle, ConnectionState, KnownHosts};
use crate::config::ServerConfig;
use crate::server::{Server, listener};

const WAIT: Duration = Duration::from_secs(5);

struct Running {
    server: Arc<Server>,
    addr: std::net::SocketAddr,
    _dir: tempfile::TempDir,
}

impl Running {
    fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

async fn start_server(configure: impl FnOnce(&mut ServerConfig)) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig::for_tests(dir.path());
    configure(&mut config);
    let server = Arc::new(Server::new(config, ServerKey::generate()));
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    tokio::spawn(listener::serve_tcp(Arc::clone(&server), tcp));
    Running {
        server,
        addr,
        _dir: dir,
    }
}

fn client_config(url: &str, name: &str, channels: &[&str]) -> crate::config::ClientConfig {
    crate::config::ClientConfig {
        server: url.to_string(),
        name: name.to_string(),
        channels: channels.iter().map(|c| c.to_string()).collect(),
        format: Format::Binary,
        history_depth: 0,
        min_reconnect_interval: Duration::from_millis(100),
        ping_interval: Duration::from_secs(30),
        handshake_timeout: WAIT,
    }
}

fn spawn_client(
    config: crate::config::ClientConfig,
    hosts: &Path,
) -> (
    ClientHandle,
    tokio::task::JoinHandle<Result<(), ClientError>>,
) {
    let known_hosts = KnownHosts::load(hosts).unwrap();
    let (client, handle) = Client::new(config, known_hosts);
    (handle, tokio::spawn(client.run()))
}

async fn wait_active(handle: &ClientHandle) {
    let mut state = handle.state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Active))
        .await
        .expect("client never became active")
        .unwrap();
}

async fn next_on(handle: &mut ClientHandle, channel: &str) -> Message {
    tokio::time::timeout(WAIT, async {
        loop {
            let incoming = handle.recv().await.expect("client stopped");
            if incoming.channel == channel {
                return incoming.message;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("nothing arrived on {channel}"))
}

/// Wait for a user list naming exactly `names`.
async fn wait_for_users(handle: &mut ClientHandle, names: &[&str]) {
    loop {
        let Message::UserList(UserList { users }) = next_on(handle, USERS).await else {
            panic!("expected user list");
        };
        let got: Vec<&str> = users.iter().map(|u| u.name.as_str()).collect();
        if got == names {
            return;
        }
    }
}

fn text_of(msg: Message) -> (String, String) {
    match msg {
        Message::Chat(chat) => (chat.from, chat.text),
        other => panic!("expected chat, got {other:?}"),
    }
}

/// Handshake and identify by hand, returning the secured halves.
async fn raw_identify(
    addr: std::net::SocketAddr,
    name: &str,
    channels: &[&str],
    version: &str,
) -> (
    SecureReader<OwnedReadHalf>,
    SecureWriter<OwnedWriteHalf>,
    IdentifyReply,
) {
    let (read, write) = tokio::net::TcpStream::connect(addr)
        .await
        .unwrap()
        .into_split();
    let Secured {
        mut reader,
        mut writer,
        ..
    } = handshake::initiate(read, write, Format::Binary, WAIT, |_| Ok(()))
        .await
        .unwrap();
    writer
        .write(
            &Identify {
                name: name.into(),
                channels: channels.iter().map(|c| c.to_string()).collect(),
                version: version.into(),
            }
            .into(),
        )
        .await
        .unwrap();
    let Message::IdentifyReply(reply) = reader
        .read(MessageKind::IdentifyReply, CONTROL_MAX_SIZE)
        .await
        .unwrap()
    else {
        panic!("expected identify reply");
    };
    (reader, writer, reply)
}

// ── Relay ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_relays_between_binary_and_json_clients() {
    let running = start_server(|_| {}).await;
    let tmp = tempfile::tempdir().unwrap();

    let (mut alice, _a) = spawn_client(
        client_config(&running.url(), "alice", &[CHAT, USERS]),
        &tmp.path().join("alice.json"),
    );
    let mut bob_config = client_config(&running.url(), "bob", &[CHAT, USERS]);
    bob_config.format = Format::Json;
    let (mut bob, _b) = spawn_client(bob_config, &tmp.path().join("bob.json"));

    wait_for_users(&mut alice, &["alice", "bob"]).await;
    wait_for_users(&mut bob, &["alice", "bob"]).await;

    assert!(
        alice
            .send(
                CHAT,
                Chat {
                    from: "bob".into(),
                    text: "hi bob".into(),
                    sent_at_ms: 0,
                },
            )
            .await
    );
    assert_eq!(
        text_of(next_on(&mut bob, CHAT).await),
        ("alice".to_string(), "hi bob".to_string())
    );
    assert_eq!(running.server.registry().session_count().await, 2);

    alice.stop();
    wait_for_users(&mut bob, &["bob"]).await;
}

#[tokio::test]
async fn test_history_replayed_on_connect() {
    let running = start_server(|_| {}).await;
    let tmp = tempfile::tempdir().unwrap();

    let (mut alice, _a) = spawn_client(
        client_config(&running.url(), "alice", &[CHAT]),
        &tmp.path().join("alice.json"),
    );
    wait_active(&alice).await;
    for text in ["one", "two", "three"] {
        alice
            .send(
                CHAT,
                Chat {
                    from: String::new(),
                    text: text.into(),
                    sent_at_ms: 0,
                },
            )
            .await;
        // Each line comes back once it is in history.
        assert_eq!(text_of(next_on(&mut alice, CHAT).await).1, text);
    }

    let mut carol_config = client_config(&running.url(), "carol", &[CHAT, HISTORY]);
    carol_config.history_depth = 2;
    let (mut carol, _c) = spawn_client(carol_config, &tmp.path().join("carol.json"));
    assert_eq!(text_of(next_on(&mut carol, HISTORY).await).1, "two");
    assert_eq!(text_of(next_on(&mut carol, HISTORY).await).1, "three");
}

#[tokio::test]
async fn test_ping_produces_latency_sample() {
    let running = start_server(|_| {}).await;
    let tmp = tempfile::tempdir().unwrap();
    let mut config = client_config(&running.url(), "clock", &[PING]);
    config.ping_interval = Duration::from_millis(50);
    let (handle, _task) = spawn_client(config, &tmp.path().join("hosts.json"));

    let mut latency = handle.latency();
    let sample = *tokio::time::timeout(WAIT, latency.wait_for(Option::is_some))
        .await
        .expect("no latency sample")
        .unwrap();
    assert!(sample.is_some_and(|rtt| rtt < WAIT));
}

#[tokio::test]
async fn unread_incoming_does_not_stall_heartbeat() {
    let running = start_server(|_| {}).await;
    let tmp = tempfile::tempdir().unwrap();
    let mut config = client_config(&running.url(), "idle", &[CHAT, PING]);
    config.ping_interval = Duration::from_millis(50);
    let (idle, _task) = spawn_client(config, &tmp.path().join("hosts.json"));
    wait_active(&idle).await;

    let (_reader, mut writer, reply) =
        raw_identify(running.addr, "talker", &[CHAT], PROTOCOL_VERSION).await;
    assert_eq!(reply.status, Status::Ok);
    for n in 0..300 {
        let chat = Chat {
            from: String::new(),
            text: format!("line {n}"),
            sent_at_ms: 0,
        };
        writer.send(CHAT, &chat.into()).await.unwrap();
    }

    // `idle` never calls recv, so its incoming queue overflows.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut latency = idle.latency();
    let _ = latency.borrow_and_update();
    tokio::time::timeout(WAIT, latency.changed())
        .await
        .expect("heartbeat stalled behind a full incoming queue")
        .unwrap();
}

// ── Admission ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_version_mismatch_is_must_upgrade_and_unregistered() {
    let running = start_server(|_| {}).await;

    let (_r, _w, reply) = raw_identify(running.addr, "old", &[CHAT], "murmur/0").await;
    assert_eq!(reply.status, Status::MustUpgrade);
    assert_eq!(running.server.registry().session_count().await, 0);

    let (_r, _w, reply) = raw_identify(running.addr, "new", &["no-such-channel"], PROTOCOL_VERSION).await;
    assert_eq!(reply.status, Status::NotOk);
    assert_eq!(running.server.registry().session_count().await, 0);
}

#[tokio::test]
async fn test_client_gives_up_on_must_upgrade() {
    let running = start_server(|config| config.protocol_version = "murmur/99".into()).await;
    let tmp = tempfile::tempdir().unwrap();
    let (_handle, task) = spawn_client(
        client_config(&running.url(), "alice", &[CHAT]),
        &tmp.path().join("hosts.json"),
    );
    let err = tokio::time::timeout(WAIT, task)
        .await
        .expect("client kept retrying")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClientError::MustUpgrade(_)), "{err}");
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_receive_only_channel_gets_not_allowed() {
    let running = start_server(|_| {}).await;
    let (mut reader, mut writer, reply) =
        raw_identify(running.addr, "rude", &[USERS], PROTOCOL_VERSION).await;
    assert_eq!(reply.status, Status::Ok);

    writer
        .send(USERS, &UserList { users: Vec::new() }.into())
        .await
        .unwrap();

    // The join may push a user list first.
    loop {
        let channel = reader.read_channel().await.unwrap();
        if channel == STATUS {
            let Message::StatusNotice(notice) = reader
                .read(MessageKind::StatusNotice, CONTROL_MAX_SIZE)
                .await
                .unwrap()
            else {
                panic!("expected status notice");
            };
            assert_eq!(notice.status, Status::NotAllowed);
            break;
        }
        reader
            .read(MessageKind::UserList, CONTROL_MAX_SIZE)
            .await
            .unwrap();
    }
}

// ── Trust ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_first_connection_pins_fingerprint() {
    let running = start_server(|_| {}).await;
    let tmp = tempfile::tempdir().unwrap();
    let hosts = tmp.path().join("hosts.json");
    let (handle, _task) = spawn_client(client_config(&running.url(), "alice", &[CHAT]), &hosts);
    wait_active(&handle).await;

    let pinned = KnownHosts::load(&hosts).unwrap();
    assert_eq!(pinned.get(&running.url()), Some(running.server.fingerprint().as_str()));
}

#[tokio::test]
async fn test_fingerprint_mismatch_is_fatal() {
    let running = start_server(|_| {}).await;
    let tmp = tempfile::tempdir().unwrap();
    let hosts = tmp.path().join("hosts.json");
    let imposter = ServerKey::generate().public_key().fingerprint();
    KnownHosts::load(&hosts)
        .unwrap()
        .pin(&running.url(), &imposter)
        .unwrap();

    let (handle, task) = spawn_client(client_config(&running.url(), "alice", &[CHAT]), &hosts);
    let err = tokio::time::timeout(WAIT, task)
        .await
        .expect("client kept retrying")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClientError::FingerprintMismatch { .. }), "{err}");
    assert_eq!(*handle.state().borrow(), ConnectionState::Disconnected);
    assert_eq!(running.server.registry().session_count().await, 0);
    assert_eq!(
        KnownHosts::load(&hosts).unwrap().get(&running.url()),
        Some(imposter.as_str())
    );
}
