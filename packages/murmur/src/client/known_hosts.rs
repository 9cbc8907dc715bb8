//! Trust-on-first-use store of server fingerprints, keyed by server URL.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug)]
pub struct KnownHosts {
    path: PathBuf,
    hosts: BTreeMap<String, String>,
}

impl KnownHosts {
    /// Load the store; a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        let hosts = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            hosts,
        })
    }

    pub fn get(&self, server: &str) -> Option<&str> {
        self.hosts.get(server).map(String::as_str)
    }

    /// Record the first fingerprint seen for `server`. An existing pin is
    /// never replaced.
    pub fn pin(&mut self, server: &str, fingerprint: &str) -> Result<bool> {
        if self.hosts.contains_key(server) {
            return Ok(false);
        }
        self.hosts
            .insert(server.to_string(), fingerprint.to_string());
        self.save()?;
        Ok(true)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(&self.hosts)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_pins_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("known_hosts.json");

        let mut hosts = KnownHosts::load(&path).unwrap();
        assert!(hosts.get("tcp://a:1").is_none());
        assert!(hosts.pin("tcp://a:1", "mm_FIRST").unwrap());

        let reloaded = KnownHosts::load(&path).unwrap();
        assert_eq!(reloaded.get("tcp://a:1"), Some("mm_FIRST"));
    }

    #[test]
    fn existing_pin_is_never_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("known_hosts.json");
        let mut hosts = KnownHosts::load(&path).unwrap();
        hosts.pin("tcp://a:1", "mm_FIRST").unwrap();
        assert!(!hosts.pin("tcp://a:1", "mm_SECOND").unwrap());
        assert_eq!(
            KnownHosts::load(&path).unwrap().get("tcp://a:1"),
            Some("mm_FIRST")
        );
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("known_hosts.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(KnownHosts::load(&path).is_err());
    }
}
