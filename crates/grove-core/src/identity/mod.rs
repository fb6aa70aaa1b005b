//! Device identity and TLS key material
//!
//! The identity lives next to the configuration:
//!
//! ```text
//! <config_dir>/identity.json      device id and name
//! <config_dir>/certs/device.crt   self-signed certificate (PEM)
//! <config_dir>/certs/device.key   private key (PEM, 0600 on Unix)
//! ```

mod fingerprint;
mod trust;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::models::{Device, DeviceId};
use crate::util::{normalize_text_option, now_millis};

pub use fingerprint::Fingerprint;
pub use trust::{check_pinned, TrustDecision, TrustStore};

const IDENTITY_FILE: &str = "identity.json";
const CERTS_DIR: &str = "certs";
const CERT_FILE: &str = "device.crt";
const KEY_FILE: &str = "device.key";

/// This device's identity and TLS credentials.
#[derive(Clone)]
pub struct DeviceIdentity {
    device: Device,
    created_at: i64,
    certificate_pem: String,
    private_key_pem: String,
    fingerprint: Fingerprint,
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device", &self.device)
            .field("created_at", &self.created_at)
            .field("fingerprint", &self.fingerprint)
            .field("private_key_pem", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    /// Build an identity that is never written to disk.
    pub fn ephemeral(device_name: impl Into<String>) -> Result<Self> {
        let device_id = DeviceId::new();
        let (certificate_pem, private_key_pem) = generate_certificate(&device_id)?;
        Self::from_parts(
            Device {
                device_id,
                device_name: device_name.into(),
            },
            now_millis(),
            certificate_pem,
            private_key_pem,
        )
    }

    fn from_parts(
        device: Device,
        created_at: i64,
        certificate_pem: String,
        private_key_pem: String,
    ) -> Result<Self> {
        let fingerprint = Fingerprint::of_pem(&certificate_pem)?;
        Ok(Self {
            device,
            created_at,
            certificate_pem,
            private_key_pem,
            fingerprint,
        })
    }

    pub const fn device(&self) -> &Device {
        &self.device
    }

    pub const fn device_id(&self) -> DeviceId {
        self.device.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.device.device_name
    }

    pub const fn created_at(&self) -> i64 {
        self.created_at
    }

    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    device_id: DeviceId,
    device_name: String,
    created_at: i64,
}

/// Loads or creates the persisted device identity under one directory.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE)
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.dir.join(CERTS_DIR)
    }

    /// Load the identity, creating whatever is missing.
    ///
    /// `device_name` renames an existing identity when it differs from the stored name.
    pub fn ensure_identity(&self, device_name: Option<&str>) -> Result<DeviceIdentity> {
        fs::create_dir_all(&self.dir)?;
        let requested_name = normalize_text_option(device_name.map(str::to_string));

        let record = match self.load_identity_file()? {
            Some(mut record) => {
                if let Some(name) = requested_name.filter(|name| *name != record.device_name) {
                    record.device_name = name;
                    self.write_identity_file(&record)?;
                }
                record
            }
            None => {
                let record = IdentityFile {
                    device_id: DeviceId::new(),
                    device_name: requested_name.unwrap_or_else(default_device_name),
                    created_at: now_millis(),
                };
                self.write_identity_file(&record)?;
                tracing::info!(device_id = %record.device_id, "Created device identity");
                record
            }
        };

        let (certificate_pem, private_key_pem) = self.ensure_certificate(&record.device_id)?;
        DeviceIdentity::from_parts(
            Device {
                device_id: record.device_id,
                device_name: record.device_name,
            },
            record.created_at,
            certificate_pem,
            private_key_pem,
        )
    }

    fn load_identity_file(&self) -> Result<Option<IdentityFile>> {
        let path = self.identity_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        match serde_json::from_str::<IdentityFile>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(error) => {
                let quarantined = quarantine(&path)?;
                tracing::warn!(
                    path = %quarantined.display(),
                    "Unreadable identity file quarantined ({error}); generating a new device id"
                );
                Ok(None)
            }
        }
    }

    fn write_identity_file(&self, record: &IdentityFile) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        fs::write(self.identity_path(), json)?;
        Ok(())
    }

    fn ensure_certificate(&self, device_id: &DeviceId) -> Result<(String, String)> {
        let certs_dir = self.certs_dir();
        let cert_path = certs_dir.join(CERT_FILE);
        let key_path = certs_dir.join(KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let certificate_pem = fs::read_to_string(&cert_path)?;
            let private_key_pem = fs::read_to_string(&key_path)?;
            if Fingerprint::of_pem(&certificate_pem).is_ok() {
                return Ok((certificate_pem, private_key_pem));
            }
            tracing::warn!(
                path = %cert_path.display(),
                "Stored certificate is unreadable; regenerating (peers will need to re-pin)"
            );
        }

        fs::create_dir_all(&certs_dir)?;
        let (certificate_pem, private_key_pem) = generate_certificate(device_id)?;
        fs::write(&cert_path, &certificate_pem)?;
        write_private_key(&key_path, &private_key_pem)?;
        tracing::info!(path = %cert_path.display(), "Generated device certificate");
        Ok((certificate_pem, private_key_pem))
    }
}

fn generate_certificate(device_id: &DeviceId) -> Result<(String, String)> {
    let subject_alt_names = vec!["localhost".to_string(), format!("grove-{device_id}")];
    let certified = rcgen::generate_simple_self_signed(subject_alt_names)
        .map_err(|error| Error::Identity(format!("certificate generation failed: {error}")))?;
    Ok((certified.cert.pem(), certified.key_pair.serialize_pem()))
}

#[cfg(unix)]
fn write_private_key(path: &Path, pem: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::write(path, pem)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_key(path: &Path, pem: &str) -> Result<()> {
    fs::write(path, pem)?;
    Ok(())
}

fn quarantine(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .map_or_else(|| IDENTITY_FILE.into(), |name| name.to_string_lossy());
    let target = path.with_file_name(format!("{file_name}.corrupt-{}", now_millis()));
    fs::rename(path, &target)?;
    Ok(target)
}

/// `Grove on <hostname>`, falling back to a generic label.
pub fn default_device_name() -> String {
    let host = ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|key| normalize_text_option(std::env::var(key).ok()))
        .unwrap_or_else(|| "this device".to_string());
    format!("Grove on {host}")
}
