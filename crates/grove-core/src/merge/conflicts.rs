//! Conflict records
//!
//! Snapshots are stored as their wire JSON so a conflict can be resolved
//! without the remote peer being reachable.

use libsql::{Connection, Row};

use crate::db::{nullable_text, parse_column};
use crate::error::{Error, Result};
use crate::models::{
    Conflict, ConflictId, ConflictStatus, DeviceId, EntitySnapshot, EntityType,
};
use crate::util::now_millis;

const CONFLICT_COLUMNS: &str = "id, entity_type, entity_id, local_snapshot, remote_snapshot, \
     remote_device_id, remote_device_name, detected_at, status, resolved_at";

fn parse_conflict(row: &Row) -> Result<Conflict> {
    let id: String = row.get(0)?;
    let entity_type: String = row.get(1)?;
    let local_snapshot: String = row.get(3)?;
    let remote_snapshot: String = row.get(4)?;
    let status: String = row.get(8)?;
    let remote_device_id = row
        .get::<Option<String>>(5)?
        .map(|raw| parse_column(&raw, "sync_conflicts.remote_device_id"))
        .transpose()?;

    Ok(Conflict {
        id: parse_column(&id, "sync_conflicts.id")?,
        entity_type: entity_type
            .parse::<EntityType>()
            .map_err(|_| Error::Database(format!("unknown stored entity type: {entity_type}")))?,
        entity_id: row.get(2)?,
        local_snapshot: serde_json::from_str(&local_snapshot)?,
        remote_snapshot: serde_json::from_str(&remote_snapshot)?,
        remote_device_id,
        remote_device_name: row.get::<Option<String>>(6)?,
        detected_at: row.get(7)?,
        status: status.parse()?,
        resolved_at: row.get::<Option<i64>>(9)?,
    })
}

/// libSQL-backed store for detected conflicts
pub struct ConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Record a conflict unless an open one already holds the same remote snapshot.
    ///
    /// Returns the conflict and whether it was newly created.
    pub async fn record(
        &self,
        local: &EntitySnapshot,
        remote: &EntitySnapshot,
        remote_device_id: Option<DeviceId>,
        remote_device_name: Option<&str>,
    ) -> Result<(Conflict, bool)> {
        let entity_type = remote.entity_type();
        let entity_id = remote.entity_id();
        let remote_json = serde_json::to_string(remote)?;

        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                     WHERE entity_type = ? AND entity_id = ? AND status = 'open'
                       AND remote_snapshot = ?
                     LIMIT 1"
                ),
                libsql::params![entity_type.as_str(), entity_id.clone(), remote_json.clone()],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            return Ok((parse_conflict(&row)?, false));
        }

        let conflict = Conflict {
            id: ConflictId::new(),
            entity_type,
            entity_id,
            local_snapshot: local.clone(),
            remote_snapshot: remote.clone(),
            remote_device_id,
            remote_device_name: remote_device_name.map(str::to_string),
            detected_at: now_millis(),
            status: ConflictStatus::Open,
            resolved_at: None,
        };
        self.conn
            .execute(
                &format!(
                    "INSERT INTO sync_conflicts ({CONFLICT_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)"
                ),
                libsql::params![
                    conflict.id.to_string(),
                    entity_type.as_str(),
                    conflict.entity_id.clone(),
                    serde_json::to_string(local)?,
                    remote_json,
                    nullable_text(remote_device_id.map(|id| id.to_string())),
                    nullable_text(conflict.remote_device_name.clone()),
                    conflict.detected_at,
                    ConflictStatus::Open.as_str(),
                ],
            )
            .await?;

        tracing::info!(
            conflict_id = %conflict.id,
            entity_type = %entity_type,
            entity_id = %conflict.entity_id,
            "Recorded sync conflict"
        );
        Ok((conflict, true))
    }

    pub async fn get(&self, id: &ConflictId) -> Result<Option<Conflict>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?"),
                [id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_conflict(&row)?)),
            None => Ok(None),
        }
    }

    /// Conflicts newest first; resolved ones only when asked for.
    pub async fn list(&self, include_resolved: bool) -> Result<Vec<Conflict>> {
        let filter = if include_resolved {
            ""
        } else {
            "WHERE status = 'open'"
        };
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts {filter}
                     ORDER BY detected_at DESC, id DESC"
                ),
                (),
            )
            .await?;
        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(parse_conflict(&row)?);
        }
        Ok(conflicts)
    }

    pub async fn count_open(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_conflicts WHERE status = 'open'",
                (),
            )
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Move an open conflict to a terminal status.
    pub async fn mark_resolved(&self, id: &ConflictId, status: ConflictStatus) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE sync_conflicts SET status = ?, resolved_at = ?
                 WHERE id = ? AND status = 'open'",
                libsql::params![status.as_str(), now_millis(), id.to_string()],
            )
            .await?;
        if updated == 0 {
            return match self.get(id).await? {
                Some(_) => Err(Error::ConflictResolved(id.to_string())),
                None => Err(Error::NotFound(format!("conflict {id}"))),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Note;
    use pretty_assertions::assert_eq;

    fn pair() -> (EntitySnapshot, EntitySnapshot) {
        let local = Note::new("local").unwrap();
        let mut remote = local.clone();
        remote.content = "remote".into();
        remote.modified_at += 10;
        (EntitySnapshot::Note(local), EntitySnapshot::Note(remote))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn record_and_get() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = ConflictRepository::new(db.connection());
        let (local, remote) = pair();
        let device = DeviceId::new();

        let (conflict, created) = repo
            .record(&local, &remote, Some(device), Some("Laptop"))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(conflict.status, ConflictStatus::Open);

        let stored = repo.get(&conflict.id).await.unwrap().unwrap();
        assert_eq!(stored, conflict);
        assert_eq!(stored.remote_device_name.as_deref(), Some("Laptop"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identical_remote_snapshot_is_deduplicated() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = ConflictRepository::new(db.connection());
        let (local, remote) = pair();

        let (first, _) = repo.record(&local, &remote, None, None).await.unwrap();
        let (second, created) = repo.record(&local, &remote, None, None).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(repo.count_open().await.unwrap(), 1);

        let newer = remote.clone().with_modified_at(remote.modified_at() + 1);
        let (_, created) = repo.record(&local, &newer, None, None).await.unwrap();
        assert!(created);
        assert_eq!(repo.count_open().await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolved_conflicts_are_hidden_by_default() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = ConflictRepository::new(db.connection());
        let (local, remote) = pair();
        let (conflict, _) = repo.record(&local, &remote, None, None).await.unwrap();

        repo.mark_resolved(&conflict.id, ConflictStatus::ResolvedLocal)
            .await
            .unwrap();

        assert!(repo.list(false).await.unwrap().is_empty());
        let all = repo.list(true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, ConflictStatus::ResolvedLocal);
        assert!(all[0].resolved_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolving_twice_fails() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = ConflictRepository::new(db.connection());
        let (local, remote) = pair();
        let (conflict, _) = repo.record(&local, &remote, None, None).await.unwrap();

        repo.mark_resolved(&conflict.id, ConflictStatus::ResolvedRemote)
            .await
            .unwrap();
        let again = repo
            .mark_resolved(&conflict.id, ConflictStatus::ResolvedMerge)
            .await;
        assert!(matches!(again, Err(Error::ConflictResolved(_))));

        let missing = repo
            .mark_resolved(&ConflictId::new(), ConflictStatus::ResolvedLocal)
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }
}
