//! Device configuration
//!
//! `config.json` in the config directory holds the device name, database
//! location, server settings and the peer seeds. A missing file yields the
//! defaults. Selected values can be overridden from the environment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Peer, PeerRegistration};
use crate::transport::{ResponderOptions, ServerOptions, TransportOptions, MAX_PAGE_SIZE};
use crate::util::normalize_text_option;

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_DATABASE_FILE: &str = "grove.db";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8384";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GroveConfig {
    #[serde(default)]
    pub device_name: Option<String>,
    /// Database path; relative paths resolve against the config directory
    #[serde(default)]
    pub database_file: Option<PathBuf>,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SyncSettings {
    pub enabled: bool,
    pub bind_addr: String,
    pub tls: bool,
    pub accepting: bool,
    pub require_known_peers: bool,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub page_size: usize,
    pub peers: Vec<PeerRegistration>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            tls: true,
            accepting: true,
            require_known_peers: false,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            page_size: crate::transport::DEFAULT_PAGE_SIZE,
            peers: Vec::new(),
        }
    }
}

impl GroveConfig {
    pub fn path_in(config_dir: &Path) -> PathBuf {
        config_dir.join(CONFIG_FILE_NAME)
    }

    /// Load `config.json` from `config_dir`, applying process environment overrides.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let values: HashMap<String, String> = std::env::vars().collect();
        let mut config = Self::load_from_path(&Self::path_in(config_dir))?;
        config.apply_overrides(|name| values.get(name).cloned())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|error| {
            Error::Config(format!("failed to read {}: {error}", path.display()))
        })?;
        let mut config = serde_json::from_str::<Self>(&raw).map_err(|error| {
            Error::Config(format!("failed to parse {}: {error}", path.display()))
        })?;
        config.normalize();
        Ok(config)
    }

    pub fn save(&self, config_dir: &Path) -> Result<PathBuf> {
        let path = Self::path_in(config_dir);
        self.save_to_path(&path)?;
        Ok(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                Error::Config(format!(
                    "failed to create config directory {}: {error}",
                    parent.display()
                ))
            })?;
        }
        let mut normalized = self.clone();
        normalized.normalize();
        let serialized = serde_json::to_string_pretty(&normalized)?;
        std::fs::write(path, serialized).map_err(|error| {
            Error::Config(format!("failed to write {}: {error}", path.display()))
        })
    }

    /// Apply `GROVE_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(name) = optional_trimmed(&lookup, "GROVE_DEVICE_NAME") {
            self.device_name = Some(name);
        }
        if let Some(addr) = optional_trimmed(&lookup, "GROVE_SYNC_BIND_ADDR") {
            self.sync.bind_addr = addr;
        }
        if let Some(raw) = optional_trimmed(&lookup, "GROVE_SYNC_TIMEOUT_SECS") {
            self.sync.request_timeout_secs = raw.parse().map_err(|_| {
                Error::Config("GROVE_SYNC_TIMEOUT_SECS must be a positive integer".to_string())
            })?;
        }
        if let Some(raw) = optional_trimmed(&lookup, "GROVE_SYNC_PAGE_SIZE") {
            self.sync.page_size = raw.parse().map_err(|_| {
                Error::Config(format!(
                    "GROVE_SYNC_PAGE_SIZE must be an integer in [1, {MAX_PAGE_SIZE}]"
                ))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;
        if !(1..=MAX_PAGE_SIZE).contains(&sync.page_size) {
            return Err(Error::Config(format!(
                "sync.page_size must be in [1, {MAX_PAGE_SIZE}], got {}",
                sync.page_size
            )));
        }
        if sync.request_timeout_secs == 0 || sync.connect_timeout_secs == 0 {
            return Err(Error::Config(
                "sync timeouts must be greater than 0".to_string(),
            ));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.sync.bind_addr.parse().map_err(|_| {
            Error::Config(format!(
                "sync.bind_addr is not a socket address: {}",
                self.sync.bind_addr
            ))
        })
    }

    pub fn database_path(&self, config_dir: &Path) -> PathBuf {
        match &self.database_file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => config_dir.join(path),
            None => config_dir.join(DEFAULT_DATABASE_FILE),
        }
    }

    pub const fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            request_timeout: Duration::from_secs(self.sync.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.sync.connect_timeout_secs),
        }
    }

    pub const fn responder_options(&self) -> ResponderOptions {
        ResponderOptions {
            accepting: self.sync.accepting,
            page_size: self.sync.page_size,
            require_known_peers: self.sync.require_known_peers,
        }
    }

    pub fn server_options(&self) -> Result<ServerOptions> {
        Ok(ServerOptions {
            bind_addr: self.bind_addr()?,
            tls: self.sync.tls,
        })
    }

    /// Mirror a registration into the peer seeds, replacing any seed with the same id.
    pub fn upsert_peer_seed(&mut self, peer: &Peer) {
        let seed = PeerRegistration {
            peer_id: peer.peer_id.to_string(),
            peer_name: peer.peer_name.clone(),
            peer_url: peer.peer_url.clone(),
            certificate_fingerprint: peer
                .certificate_fingerprint
                .as_ref()
                .map(ToString::to_string),
        };
        match self.seed_index(&seed.peer_id) {
            Some(index) => self.sync.peers[index] = seed,
            None => self.sync.peers.push(seed),
        }
    }

    /// Drop the seed for `peer_id`; returns whether one existed.
    pub fn remove_peer_seed(&mut self, peer_id: &str) -> bool {
        let before = self.sync.peers.len();
        let wanted = seed_key(peer_id);
        self.sync
            .peers
            .retain(|seed| seed_key(&seed.peer_id) != wanted);
        self.sync.peers.len() != before
    }

    /// Copy fingerprints pinned in the registry into seeds that lack one.
    ///
    /// Returns whether any seed changed.
    pub fn record_pinned_fingerprints(&mut self, peers: &[Peer]) -> bool {
        let mut changed = false;
        for peer in peers {
            let Some(fingerprint) = &peer.certificate_fingerprint else {
                continue;
            };
            let Some(index) = self.seed_index(&peer.peer_id.to_string()) else {
                continue;
            };
            let seed = &mut self.sync.peers[index];
            if seed.certificate_fingerprint.is_none() {
                seed.certificate_fingerprint = Some(fingerprint.to_string());
                changed = true;
            }
        }
        changed
    }

    fn seed_index(&self, peer_id: &str) -> Option<usize> {
        let wanted = seed_key(peer_id);
        self.sync
            .peers
            .iter()
            .position(|seed| seed_key(&seed.peer_id) == wanted)
    }

    fn normalize(&mut self) {
        self.device_name = normalize_text_option(self.device_name.take());
        self.sync.bind_addr = self.sync.bind_addr.trim().to_string();
        for seed in &mut self.sync.peers {
            seed.certificate_fingerprint =
                normalize_text_option(seed.certificate_fingerprint.take());
        }
    }
}

/// Seeds may spell ids hyphenated or in upper case.
fn seed_key(peer_id: &str) -> String {
    peer_id.trim().replace('-', "").to_ascii_lowercase()
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| normalize_text_option(Some(value)))
}
