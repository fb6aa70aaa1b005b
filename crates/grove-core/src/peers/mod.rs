//! Peer registry
//!
//! CRUD over configured peers plus the per-peer `last_sync_at` watermark.
//! Registration input is validated before it reaches the database, so a bad
//! id or URL never causes network activity.

use libsql::{Connection, Row};
use url::Url;

use crate::db::{nullable_text, parse_column};
use crate::error::{Error, Result};
use crate::identity::Fingerprint;
use crate::models::{DeviceId, Peer, PeerRegistration};
use crate::util::{compact_text, now_millis};

/// Maximum peer display name length in characters
pub const MAX_PEER_NAME_CHARS: usize = 100;

const PEER_COLUMNS: &str =
    "peer_id, peer_name, peer_url, certificate_fingerprint, last_sync_at, created_at, updated_at";

/// Registration input after validation and normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPeer {
    pub peer_id: DeviceId,
    pub peer_name: String,
    pub peer_url: String,
    pub certificate_fingerprint: Option<Fingerprint>,
}

/// Parse a peer id: 32 hex characters, or a hyphenated UUID.
pub fn parse_peer_id(raw: &str) -> Result<DeviceId> {
    let compact: String = raw.trim().chars().filter(|c| *c != '-').collect();
    if compact.len() != 32 || !compact.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::validation(
            "peer_id",
            format!("expected 32 hex characters, got {:?}", compact_text(raw)),
        ));
    }
    compact
        .parse()
        .map_err(|_| Error::validation("peer_id", format!("not a valid id: {raw}")))
}

/// Normalize a peer base URL: http(s) with a host, no query, no trailing slash.
pub fn normalize_peer_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed)
        .map_err(|error| Error::validation("peer_url", format!("{error}: {trimmed:?}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::validation(
            "peer_url",
            format!("scheme must be http or https, got {}", url.scheme()),
        ));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::validation("peer_url", "missing host"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(Error::validation(
            "peer_url",
            "must not contain a query or fragment",
        ));
    }
    Ok(trimmed.to_string())
}

/// Validate registration input; `local_device` rejects self-registration.
pub fn validate_registration(
    registration: &PeerRegistration,
    local_device: Option<DeviceId>,
) -> Result<ValidatedPeer> {
    let peer_id = parse_peer_id(&registration.peer_id)?;
    if Some(peer_id) == local_device {
        return Err(Error::validation(
            "peer_id",
            "cannot register this device as its own peer",
        ));
    }

    let peer_name = registration.peer_name.trim();
    if peer_name.is_empty() {
        return Err(Error::validation("peer_name", "cannot be empty"));
    }
    if peer_name.chars().count() > MAX_PEER_NAME_CHARS {
        return Err(Error::validation(
            "peer_name",
            format!("exceeds {MAX_PEER_NAME_CHARS} characters"),
        ));
    }

    let certificate_fingerprint = registration
        .certificate_fingerprint
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(Fingerprint::parse)
        .transpose()?;

    Ok(ValidatedPeer {
        peer_id,
        peer_name: peer_name.to_string(),
        peer_url: normalize_peer_url(&registration.peer_url)?,
        certificate_fingerprint,
    })
}

fn parse_peer(row: &Row) -> Result<Peer> {
    let peer_id: String = row.get(0)?;
    let certificate_fingerprint = row
        .get::<Option<String>>(3)?
        .map(|raw| {
            Fingerprint::parse(&raw)
                .map_err(|_| Error::Database(format!("invalid stored fingerprint: {raw}")))
        })
        .transpose()?;
    Ok(Peer {
        peer_id: parse_column(&peer_id, "sync_peers.peer_id")?,
        peer_name: row.get(1)?,
        peer_url: row.get(2)?,
        certificate_fingerprint,
        last_sync_at: row.get::<Option<i64>>(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// libSQL-backed peer registry
pub struct PeerRegistry<'a> {
    conn: &'a Connection,
}

impl<'a> PeerRegistry<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Register a peer, or update name/URL of an existing one.
    ///
    /// An explicit fingerprint replaces the pin; otherwise the pin and the
    /// watermark are left untouched.
    pub async fn register(
        &self,
        registration: PeerRegistration,
        local_device: Option<DeviceId>,
    ) -> Result<Peer> {
        let peer = validate_registration(&registration, local_device)?;
        let now = now_millis();
        self.conn
            .execute(
                "INSERT INTO sync_peers
                    (peer_id, peer_name, peer_url, certificate_fingerprint,
                     last_sync_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4,
                    (SELECT completed_at FROM inbound_rounds WHERE device_id = ?1), ?5, ?6)
                 ON CONFLICT(peer_id) DO UPDATE SET
                    peer_name = excluded.peer_name,
                    peer_url = excluded.peer_url,
                    certificate_fingerprint =
                        COALESCE(excluded.certificate_fingerprint, certificate_fingerprint),
                    updated_at = excluded.updated_at",
                libsql::params![
                    peer.peer_id.to_string(),
                    peer.peer_name.clone(),
                    peer.peer_url.clone(),
                    nullable_text(peer.certificate_fingerprint.as_ref().map(ToString::to_string)),
                    now,
                    now,
                ],
            )
            .await?;

        tracing::info!(peer_id = %peer.peer_id, peer_url = %peer.peer_url, "Registered peer");
        self.require(&peer.peer_id).await
    }

    /// Register every seed from configuration, skipping invalid entries.
    pub async fn seed(
        &self,
        seeds: &[PeerRegistration],
        local_device: Option<DeviceId>,
    ) -> Result<usize> {
        let mut registered = 0;
        for seed in seeds {
            match self.register(seed.clone(), local_device).await {
                Ok(_) => registered += 1,
                Err(error @ Error::Validation { .. }) => {
                    tracing::warn!(peer_id = %seed.peer_id, "Skipping configured peer: {error}");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(registered)
    }

    pub async fn get(&self, peer_id: &DeviceId) -> Result<Option<Peer>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {PEER_COLUMNS} FROM sync_peers WHERE peer_id = ?"),
                [peer_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_peer(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn require(&self, peer_id: &DeviceId) -> Result<Peer> {
        self.get(peer_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("peer {peer_id}")))
    }

    /// All peers ordered by name
    pub async fn list(&self) -> Result<Vec<Peer>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {PEER_COLUMNS} FROM sync_peers ORDER BY peer_name COLLATE NOCASE, peer_id"
                ),
                (),
            )
            .await?;
        let mut peers = Vec::new();
        while let Some(row) = rows.next().await? {
            peers.push(parse_peer(&row)?);
        }
        Ok(peers)
    }

    pub async fn remove(&self, peer_id: &DeviceId) -> Result<()> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM sync_peers WHERE peer_id = ?",
                [peer_id.to_string()],
            )
            .await?;
        if removed == 0 {
            return Err(Error::NotFound(format!("peer {peer_id}")));
        }
        self.conn
            .execute(
                "DELETE FROM inbound_rounds WHERE device_id = ?",
                [peer_id.to_string()],
            )
            .await?;
        tracing::info!(peer_id = %peer_id, "Removed peer");
        Ok(())
    }

    /// Pin `fingerprint` only if nothing is pinned yet; returns whether it was stored.
    pub async fn pin_fingerprint(&self, peer_id: &DeviceId, fingerprint: &Fingerprint) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE sync_peers SET certificate_fingerprint = ?, updated_at = ?
                 WHERE peer_id = ? AND certificate_fingerprint IS NULL",
                libsql::params![fingerprint.to_string(), now_millis(), peer_id.to_string()],
            )
            .await?;
        Ok(updated > 0)
    }

    /// Record a completed round that started at `round_started_at`.
    pub async fn advance_watermark(&self, peer_id: &DeviceId, round_started_at: i64) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE sync_peers SET last_sync_at = ?, updated_at = ? WHERE peer_id = ?",
                libsql::params![round_started_at, now_millis(), peer_id.to_string()],
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("peer {peer_id}")));
        }
        Ok(())
    }

    /// Record a round that `device_id` initiated against this device and
    /// completed; a registered peer's watermark moves up to its start time.
    ///
    /// Returns whether the registry entry moved.
    pub async fn record_inbound_round(
        &self,
        device_id: &DeviceId,
        device_name: &str,
        round_started_at: i64,
    ) -> Result<bool> {
        self.conn
            .execute(
                "INSERT INTO inbound_rounds (device_id, device_name, completed_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT(device_id) DO UPDATE SET
                    device_name = excluded.device_name,
                    completed_at = MAX(completed_at, excluded.completed_at)",
                libsql::params![device_id.to_string(), device_name.to_string(), round_started_at],
            )
            .await?;
        let updated = self
            .conn
            .execute(
                "UPDATE sync_peers SET last_sync_at = ?, updated_at = ?
                 WHERE peer_id = ? AND (last_sync_at IS NULL OR last_sync_at < ?)",
                libsql::params![
                    round_started_at,
                    now_millis(),
                    device_id.to_string(),
                    round_started_at
                ],
            )
            .await?;
        Ok(updated > 0)
    }

    /// Forget the watermark so the next round requests everything.
    pub async fn reset_watermark(&self, peer_id: &DeviceId) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE sync_peers SET last_sync_at = NULL, updated_at = ? WHERE peer_id = ?",
                libsql::params![now_millis(), peer_id.to_string()],
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("peer {peer_id}")));
        }
        tracing::info!(peer_id = %peer_id, "Reset sync watermark");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    fn registration(peer_id: &DeviceId) -> PeerRegistration {
        PeerRegistration {
            peer_id: peer_id.to_string(),
            peer_name: "Desk".into(),
            peer_url: "https://desk.local:8384/".into(),
            certificate_fingerprint: None,
        }
    }

    #[test]
    fn parse_peer_id_accepts_simple_and_hyphenated() {
        let id = DeviceId::new();
        assert_eq!(parse_peer_id(&id.to_string()).unwrap(), id);

        let simple = id.to_string();
        let hyphenated = format!(
            "{}-{}-{}-{}-{}",
            &simple[0..8],
            &simple[8..12],
            &simple[12..16],
            &simple[16..20],
            &simple[20..32]
        );
        assert_eq!(parse_peer_id(&hyphenated).unwrap(), id);
    }

    #[test]
    fn parse_peer_id_rejects_malformed() {
        for raw in ["", "abc", &"g".repeat(32), &"a".repeat(33)] {
            assert!(matches!(
                parse_peer_id(raw),
                Err(Error::Validation { ref field, .. }) if field == "peer_id"
            ));
        }
    }

    #[test]
    fn normalize_peer_url_rules() {
        assert_eq!(
            normalize_peer_url(" https://desk.local:8384/ ").unwrap(),
            "https://desk.local:8384"
        );
        assert!(normalize_peer_url("ftp://desk.local").is_err());
        assert!(normalize_peer_url("desk.local:8384").is_err());
        assert!(normalize_peer_url("https://desk.local/?x=1").is_err());
        assert!(normalize_peer_url("not a url").is_err());
    }

    #[test]
    fn validate_registration_rejects_self() {
        let local = DeviceId::new();
        let result = validate_registration(&registration(&local), Some(local));
        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    #[test]
    fn validate_registration_checks_name_and_fingerprint() {
        let id = DeviceId::new();
        let mut input = registration(&id);
        input.peer_name = "   ".into();
        assert!(validate_registration(&input, None).is_err());

        let mut input = registration(&id);
        input.certificate_fingerprint = Some("SHA256:nope".into());
        assert!(validate_registration(&input, None).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_and_list() {
        let db = Database::open_in_memory().await.unwrap();
        let registry = PeerRegistry::new(db.connection());
        let id = DeviceId::new();

        let peer = registry.register(registration(&id), None).await.unwrap();
        assert_eq!(peer.peer_id, id);
        assert_eq!(peer.peer_url, "https://desk.local:8384");
        assert_eq!(peer.certificate_fingerprint, None);
        assert_eq!(peer.last_sync_at, None);

        assert_eq!(registry.list().await.unwrap(), vec![peer]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reregister_updates_without_duplicating() {
        let db = Database::open_in_memory().await.unwrap();
        let registry = PeerRegistry::new(db.connection());
        let id = DeviceId::new();

        registry.register(registration(&id), None).await.unwrap();
        let fingerprint = Fingerprint::of_der(b"cert");
        registry.pin_fingerprint(&id, &fingerprint).await.unwrap();
        registry.advance_watermark(&id, 1_234).await.unwrap();

        let mut updated = registration(&id);
        updated.peer_name = "Desk (office)".into();
        updated.peer_url = "http://10.0.0.2:8384".into();
        let peer = registry.register(updated, None).await.unwrap();

        assert_eq!(registry.list().await.unwrap().len(), 1);
        assert_eq!(peer.peer_name, "Desk (office)");
        assert_eq!(peer.peer_url, "http://10.0.0.2:8384");
        assert_eq!(peer.certificate_fingerprint, Some(fingerprint));
        assert_eq!(peer.last_sync_at, Some(1_234));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pin_only_when_unpinned() {
        let db = Database::open_in_memory().await.unwrap();
        let registry = PeerRegistry::new(db.connection());
        let id = DeviceId::new();
        registry.register(registration(&id), None).await.unwrap();

        let first = Fingerprint::of_der(b"a");
        let second = Fingerprint::of_der(b"b");
        assert!(registry.pin_fingerprint(&id, &first).await.unwrap());
        assert!(!registry.pin_fingerprint(&id, &second).await.unwrap());

        let peer = registry.require(&id).await.unwrap();
        assert_eq!(peer.certificate_fingerprint, Some(first));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watermark_advance_and_reset() {
        let db = Database::open_in_memory().await.unwrap();
        let registry = PeerRegistry::new(db.connection());
        let id = DeviceId::new();
        registry.register(registration(&id), None).await.unwrap();

        registry.advance_watermark(&id, 5_000).await.unwrap();
        assert_eq!(registry.require(&id).await.unwrap().last_sync_at, Some(5_000));

        registry.reset_watermark(&id).await.unwrap();
        assert_eq!(registry.require(&id).await.unwrap().last_sync_at, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_unknown_peer_is_not_found() {
        let db = Database::open_in_memory().await.unwrap();
        let registry = PeerRegistry::new(db.connection());
        let id = DeviceId::new();

        assert!(matches!(registry.remove(&id).await, Err(Error::NotFound(_))));

        registry.register(registration(&id), None).await.unwrap();
        registry.remove(&id).await.unwrap();
        assert!(registry.get(&id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn seed_skips_invalid_entries() {
        let db = Database::open_in_memory().await.unwrap();
        let registry = PeerRegistry::new(db.connection());

        let good = registration(&DeviceId::new());
        let bad = PeerRegistration {
            peer_id: "nope".into(),
            ..good.clone()
        };
        let count = registry.seed(&[good, bad], None).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }
}
