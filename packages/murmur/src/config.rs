use anyhow::{Context, Result, bail};
use murmur_proto::{Format, PROTOCOL_VERSION, ServerKey};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [server]
//                    workers = 8
//
//   env var:         MURMUR_SERVER__WORKERS=8   (double underscore = nesting)
//
//   (single underscore stays within field names: MURMUR_SERVER__TCP_PORT)

/// Reconnect attempts never start closer together than this.
pub const RECONNECT_FLOOR: Duration = Duration::from_millis(2000);

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub client: ClientFileConfig,
}

/// Server tuning knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// 0 disables the WebSocket listener.
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_job_queue")]
    pub job_queue: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// A session whose peer takes longer than this to accept one write is
    /// dropped.
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
    /// Channel files are `<store_prefix><channel>`. Defaults to
    /// `<data_dir>/store/`.
    #[serde(default)]
    pub store_prefix: Option<String>,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Append every chat line to `<data_dir>/logs/chat.log`.
    #[serde(default)]
    pub history_log: bool,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            tcp_port: default_tcp_port(),
            ws_port: default_ws_port(),
            workers: default_workers(),
            job_queue: default_job_queue(),
            idle_timeout_secs: default_idle_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            save_interval_secs: default_save_interval_secs(),
            store_prefix: None,
            history_capacity: default_history_capacity(),
            history_log: false,
            protocol_version: default_protocol_version(),
        }
    }
}

/// Client settings (lives under `[client]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientFileConfig {
    #[serde(default = "default_server_url")]
    pub server: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_client_channels")]
    pub channels: Vec<String>,
    #[serde(default = "default_format")]
    pub format: Format,
    #[serde(default = "default_history_depth")]
    pub history_depth: u32,
    #[serde(default = "default_min_reconnect_interval_ms")]
    pub min_reconnect_interval_ms: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for ClientFileConfig {
    fn default() -> Self {
        Self {
            server: default_server_url(),
            name: None,
            channels: default_client_channels(),
            format: default_format(),
            history_depth: default_history_depth(),
            min_reconnect_interval_ms: default_min_reconnect_interval_ms(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_tcp_port() -> u16 {
    4790
}
fn default_ws_port() -> u16 {
    4791
}
fn default_workers() -> usize {
    4
}
fn default_job_queue() -> usize {
    1024
}
fn default_idle_timeout_secs() -> u64 {
    120
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_write_timeout_secs() -> u64 {
    10
}
fn default_save_interval_secs() -> u64 {
    30
}
fn default_history_capacity() -> usize {
    500
}
fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}
fn default_server_url() -> String {
    "tcp://127.0.0.1:4790".to_string()
}
fn default_client_channels() -> Vec<String> {
    ["chat", "history", "users", "ping", "typing"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_format() -> Format {
    Format::Binary
}
fn default_history_depth() -> u32 {
    50
}
fn default_min_reconnect_interval_ms() -> u64 {
    2000
}
fn default_ping_interval_secs() -> u64 {
    10
}

/// Build a figment that layers: defaults → config.toml → MURMUR_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `MURMUR_SERVER__WORKERS=8`  →  `server.workers = 8`
///   `MURMUR_CLIENT__NAME=alice`  →  `client.name = "alice"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("MURMUR_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub tcp_port: u16,
    pub ws_port: Option<u16>,
    pub workers: usize,
    pub job_queue: usize,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub save_interval: Duration,
    pub store_prefix: String,
    pub history_capacity: usize,
    pub history_log: bool,
    pub audit_log_path: PathBuf,
    pub protocol_version: String,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig, dirs: &MurmurConfig) -> Self {
        let store_prefix = fc.store_prefix.clone().unwrap_or_else(|| {
            let mut prefix = dirs.store_dir.display().to_string();
            prefix.push(std::path::MAIN_SEPARATOR);
            prefix
        });
        Self {
            host: fc.host.clone(),
            tcp_port: fc.tcp_port,
            ws_port: (fc.ws_port != 0).then_some(fc.ws_port),
            workers: fc.workers.max(1),
            job_queue: fc.job_queue.max(1),
            idle_timeout: Duration::from_secs(fc.idle_timeout_secs),
            handshake_timeout: Duration::from_secs(fc.handshake_timeout_secs),
            write_timeout: Duration::from_secs(fc.write_timeout_secs.max(1)),
            save_interval: Duration::from_secs(fc.save_interval_secs.max(1)),
            store_prefix,
            history_capacity: fc.history_capacity.max(1),
            history_log: fc.history_log,
            audit_log_path: dirs.logs_dir.join("chat.log"),
            protocol_version: fc.protocol_version.clone(),
        }
    }

    /// Store file for one channel.
    pub fn store_path(&self, channel: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.store_prefix, channel))
    }

    /// Defaults rooted at `data_dir`, listening on an ephemeral TCP port
    /// with WebSocket disabled.
    #[cfg(test)]
    pub(crate) fn for_tests(data_dir: &Path) -> Self {
        let dirs = MurmurConfig::new(Some(data_dir.to_path_buf()))
            .expect("test data dir should be creatable");
        let mut config = Self::from_file(&ServerFileConfig::default(), &dirs);
        config.host = "127.0.0.1".into();
        config.tcp_port = 0;
        config.ws_port = None;
        config
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server: String,
    pub name: String,
    pub channels: Vec<String>,
    pub format: Format,
    pub history_depth: u32,
    pub min_reconnect_interval: Duration,
    pub ping_interval: Duration,
    pub handshake_timeout: Duration,
}

impl ClientConfig {
    pub fn from_file(fc: &ClientFileConfig) -> Result<Self> {
        let Some(name) = fc.name.clone().filter(|n| !n.trim().is_empty()) else {
            bail!("no client name configured (set [client] name or MURMUR_CLIENT__NAME)");
        };
        Ok(Self {
            server: fc.server.clone(),
            name,
            channels: fc.channels.clone(),
            format: fc.format,
            history_depth: fc.history_depth,
            min_reconnect_interval: Duration::from_millis(fc.min_reconnect_interval_ms)
                .max(RECONNECT_FLOOR),
            ping_interval: Duration::from_secs(fc.ping_interval_secs.max(1)),
            handshake_timeout: Duration::from_secs(default_handshake_timeout_secs()),
        })
    }
}

// =============================================================================
// Directory layout config (not tunable via figment; derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct MurmurConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub known_hosts_path: PathBuf,
    pub store_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl MurmurConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".murmur"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let store_dir = data_dir.join("store");
        std::fs::create_dir_all(&store_dir)
            .with_context(|| format!("Failed to create store directory: {:?}", store_dir))?;

        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            key_path: data_dir.join("server.key"),
            known_hosts_path: data_dir.join("known_hosts.json"),
            data_dir,
            store_dir,
            logs_dir,
        })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Load the long-term server key, creating it on first boot.
    pub fn load_or_create_server_key(&self) -> Result<ServerKey> {
        match std::fs::read(&self.key_path) {
            Ok(bytes) => {
                let raw: [u8; 32] = bytes.try_into().map_err(|_| {
                    anyhow::anyhow!("{} is not a 32-byte key", self.key_path.display())
                })?;
                Ok(ServerKey::from_bytes(raw))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = ServerKey::generate();
                write_private(&self.key_path, &key.to_bytes())?;
                info!(
                    "Generated server key {} at {}",
                    key.public_key().fingerprint(),
                    self.key_path.display()
                );
                Ok(key)
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read {}", self.key_path.display()))
            }
        }
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {:?}", path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions on {:?}", path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_server_file_config_defaults() {
        let d = ServerFileConfig::default();
        assert_eq!(d.tcp_port, 4790);
        assert_eq!(d.ws_port, 4791);
        assert_eq!(d.workers, 4);
        assert_eq!(d.write_timeout_secs, 10);
        assert_eq!(d.history_capacity, 500);
        assert!(!d.history_log);
        assert_eq!(d.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_client_file_config_defaults() {
        let d = ClientFileConfig::default();
        assert_eq!(d.min_reconnect_interval_ms, 2000);
        assert_eq!(d.history_depth, 50);
        assert_eq!(d.format, Format::Binary);
        assert!(d.channels.iter().any(|c| c == "chat"));
    }

    // ── runtime views ───────────────────────────────────────────────────

    #[test]
    fn test_ws_port_zero_disables() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = MurmurConfig::new(Some(tmp.path().to_path_buf())).unwrap();
        let fc = ServerFileConfig {
            ws_port: 0,
            ..Default::default()
        };
        assert!(ServerConfig::from_file(&fc, &dirs).ws_port.is_none());
    }

    #[test]
    fn test_store_path_defaults_under_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = MurmurConfig::new(Some(tmp.path().to_path_buf())).unwrap();
        let sc = ServerConfig::from_file(&ServerFileConfig::default(), &dirs);
        assert_eq!(sc.store_path("chat"), tmp.path().join("store").join("chat"));
        assert_eq!(sc.audit_log_path, tmp.path().join("logs").join("chat.log"));
    }

    #[test]
    fn test_explicit_store_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = MurmurConfig::new(Some(tmp.path().to_path_buf())).unwrap();
        let fc = ServerFileConfig {
            store_prefix: Some("/var/lib/murmur/state-".into()),
            ..Default::default()
        };
        let sc = ServerConfig::from_file(&fc, &dirs);
        assert_eq!(
            sc.store_path("music"),
            PathBuf::from("/var/lib/murmur/state-music")
        );
    }

    #[test]
    fn test_reconnect_interval_floor() {
        let fc = ClientFileConfig {
            name: Some("alice".into()),
            min_reconnect_interval_ms: 100,
            ..Default::default()
        };
        let cc = ClientConfig::from_file(&fc).unwrap();
        assert_eq!(cc.min_reconnect_interval, RECONNECT_FLOOR);

        let fc = ClientFileConfig {
            name: Some("alice".into()),
            min_reconnect_interval_ms: 5000,
            ..Default::default()
        };
        let cc = ClientConfig::from_file(&fc).unwrap();
        assert_eq!(cc.min_reconnect_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_client_requires_name() {
        assert!(ClientConfig::from_file(&ClientFileConfig::default()).is_err());
        let blank = ClientFileConfig {
            name: Some("   ".into()),
            ..Default::default()
        };
        assert!(ClientConfig::from_file(&blank).is_err());
    }

    // ── MurmurConfig ────────────────────────────────────────────────────

    #[test]
    fn test_murmur_config_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = MurmurConfig::new(Some(tmp.path().to_path_buf())).unwrap();

        assert_eq!(config.data_dir, tmp.path());
        assert_eq!(config.key_path, tmp.path().join("server.key"));
        assert_eq!(config.known_hosts_path, tmp.path().join("known_hosts.json"));
        assert_eq!(config.config_toml_path(), tmp.path().join("config.toml"));
        assert!(tmp.path().join("store").exists());
        assert!(tmp.path().join("logs").exists());
    }

    #[test]
    fn test_server_key_created_once() {
        let tmp = tempfile::tempdir().unwrap();
        let config = MurmurConfig::new(Some(tmp.path().to_path_buf())).unwrap();

        let first = config.load_or_create_server_key().unwrap();
        let second = config.load_or_create_server_key().unwrap();
        assert_eq!(first.public_key(), second.public_key());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&config.key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_truncated_key_file_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let config = MurmurConfig::new(Some(tmp.path().to_path_buf())).unwrap();
        std::fs::write(&config.key_path, [1u8; 7]).unwrap();
        assert!(config.load_or_create_server_key().is_err());
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.tcp_port, 4790);
        assert!(fc.client.name.is_none());
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[server]\nworkers = 8\nhistory_log = true\n\n[client]\nname = \"alice\"\nformat = \"json\"\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.workers, 8);
        assert!(fc.server.history_log);
        assert_eq!(fc.client.name.as_deref(), Some("alice"));
        assert_eq!(fc.client.format, Format::Json);
    }
}
