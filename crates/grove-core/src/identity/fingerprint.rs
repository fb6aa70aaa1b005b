//! Certificate fingerprints

use regex::Regex;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;

use crate::error::{Error, Result};

const ALGORITHM_TAG: &str = "SHA256";

fn fingerprint_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^SHA256(:[0-9a-f]{2}){32}$").expect("Invalid regex"))
}

/// SHA-256 fingerprint of a DER certificate, rendered as `SHA256:aa:bb:...`.
///
/// Always stored normalized (upper-case tag, lower-case hex), so equality is exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of a DER-encoded certificate.
    pub fn of_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        let pairs = digest
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(":");
        Self(format!("{ALGORITHM_TAG}:{pairs}"))
    }

    /// Fingerprint of the first certificate in a PEM document.
    pub fn of_pem(pem: &str) -> Result<Self> {
        let der = CertificateDer::from_pem_slice(pem.as_bytes())
            .map_err(|error| Error::Identity(format!("invalid certificate PEM: {error}")))?;
        Ok(Self::of_der(der.as_ref()))
    }

    /// Parse an operator-supplied fingerprint, tolerating case differences.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let Some((tag, hex)) = raw.split_once(':') else {
            return Err(invalid_fingerprint(raw));
        };
        if !tag.eq_ignore_ascii_case(ALGORITHM_TAG) {
            return Err(invalid_fingerprint(raw));
        }
        let normalized = format!("{ALGORITHM_TAG}:{}", hex.to_ascii_lowercase());
        if !fingerprint_pattern().is_match(&normalized) {
            return Err(invalid_fingerprint(raw));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn invalid_fingerprint(raw: &str) -> Error {
    Error::validation(
        "certificate_fingerprint",
        format!("expected SHA256:<32 colon-separated hex pairs>, got {raw:?}"),
    )
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn der_fingerprint_has_expected_shape() {
        let fingerprint = Fingerprint::of_der(b"not really a certificate");
        let rendered = fingerprint.to_string();
        assert!(rendered.starts_with("SHA256:"));
        assert_eq!(rendered.len(), "SHA256:".len() + 32 * 3 - 1);
        assert!(fingerprint_pattern().is_match(&rendered));
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(Fingerprint::of_der(b"abc"), Fingerprint::of_der(b"abc"));
        assert_ne!(Fingerprint::of_der(b"abc"), Fingerprint::of_der(b"abd"));
    }

    #[test]
    fn parse_normalizes_case() {
        let original = Fingerprint::of_der(b"cert");
        let shouted = original.to_string().to_ascii_uppercase().replacen("SHA256", "sha256", 1);
        assert_eq!(Fingerprint::parse(&shouted).unwrap(), original);
    }

    #[test]
    fn parse_rejects_malformed_values() {
        assert!(Fingerprint::parse("").is_err());
        assert!(Fingerprint::parse("SHA1:aa:bb").is_err());
        assert!(Fingerprint::parse("SHA256:zz").is_err());
        assert!(Fingerprint::parse("aa:bb:cc").is_err());
    }

    #[test]
    fn serde_rejects_malformed_values() {
        assert!(serde_json::from_str::<Fingerprint>("\"SHA256:00\"").is_err());
        let fingerprint = Fingerprint::of_der(b"cert");
        let json = serde_json::to_string(&fingerprint).unwrap();
        assert_eq!(serde_json::from_str::<Fingerprint>(&json).unwrap(), fingerprint);
    }
}
