use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use grove_core::config::GroveConfig;
use grove_core::identity::{DeviceIdentity, IdentityStore};
use grove_core::models::{Note, NoteId, Tag, TagId};
use grove_core::services::{DatabaseService, SyncService};

use crate::error::CliError;

const CONFIG_DIR_ENV: &str = "GROVE_CONFIG_DIR";

/// Paths resolved from the global flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub db_path: Option<PathBuf>,
}

impl Paths {
    pub fn resolve(cli_config_dir: Option<PathBuf>, cli_db_path: Option<PathBuf>) -> Result<Self, CliError> {
        Ok(Self {
            config_dir: resolve_config_dir(cli_config_dir, env::var(CONFIG_DIR_ENV).ok())?,
            db_path: cli_db_path,
        })
    }
}

/// `--config-dir`, then `GROVE_CONFIG_DIR`, then the platform config directory.
pub fn resolve_config_dir(
    explicit: Option<PathBuf>,
    from_env: Option<String>,
) -> Result<PathBuf, CliError> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    if let Some(dir) = from_env.and_then(|value| normalize_content(&value)) {
        return Ok(PathBuf::from(dir));
    }
    dirs::config_dir()
        .map(|dir| dir.join("grove"))
        .ok_or_else(|| CliError::Config("could not determine a config directory".to_string()))
}

/// Everything a command needs to act as this device.
pub struct AppContext {
    pub paths: Paths,
    pub config: GroveConfig,
    pub identity: Arc<DeviceIdentity>,
    pub db: DatabaseService,
}

impl AppContext {
    pub async fn load(paths: Paths) -> Result<Self, CliError> {
        let config = GroveConfig::load(&paths.config_dir)?;
        let identity = load_identity(&paths, &config)?;
        let db_path = paths
            .db_path
            .clone()
            .unwrap_or_else(|| config.database_path(&paths.config_dir));
        tracing::debug!(
            config_dir = %paths.config_dir.display(),
            database = %db_path.display(),
            device_id = %identity.device_id(),
            "Opening local store"
        );
        let db = open_database(&db_path).await?;
        Ok(Self {
            paths,
            config,
            identity: Arc::new(identity),
            db,
        })
    }

    pub async fn sync_service(&self) -> Result<SyncService, CliError> {
        Ok(SyncService::from_config(
            self.db.clone(),
            self.identity.clone(),
            &self.config,
            &self.paths.config_dir,
        )
        .await?)
    }

    pub fn require_sync_enabled(&self) -> Result<(), CliError> {
        if self.config.sync.enabled {
            Ok(())
        } else {
            Err(CliError::SyncDisabled(
                GroveConfig::path_in(&self.paths.config_dir)
                    .display()
                    .to_string(),
            ))
        }
    }
}

pub fn load_identity(paths: &Paths, config: &GroveConfig) -> Result<DeviceIdentity, CliError> {
    Ok(IdentityStore::new(&paths.config_dir).ensure_identity(config.device_name.as_deref())?)
}

pub async fn open_database(path: &Path) -> Result<DatabaseService, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(DatabaseService::open_path(path.to_path_buf()).await?)
}

pub fn parse_note_id(raw: &str) -> Result<NoteId, CliError> {
    raw.trim().parse().map_err(|_| CliError::InvalidId {
        kind: "note",
        value: raw.to_string(),
    })
}

/// Find a live tag by id or case-insensitive name.
pub fn find_tag<'a>(tags: &'a [Tag], query: &str) -> Option<&'a Tag> {
    let query = query.trim();
    if let Ok(id) = query.parse::<TagId>() {
        if let Some(tag) = tags.iter().find(|tag| tag.id == id) {
            return Some(tag);
        }
    }
    tags.iter().find(|tag| tag.name.eq_ignore_ascii_case(query))
}

pub fn resolve_note_content(content_parts: &[String]) -> Result<String, CliError> {
    if let Some(content) = normalize_content(&content_parts.join(" ")) {
        return Ok(content);
    }
    if let Some(content) = read_piped_stdin()? {
        return Ok(content);
    }
    Err(CliError::EmptyContent)
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}

pub fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

pub fn format_note_lines(notes: &[Note]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    notes
        .iter()
        .map(|note| {
            let id = short_id(&note.id.to_string());
            let preview = note.preview(40);
            let relative_time = format_relative_time(note.modified_at, now_ms);
            format!("{id:<12}  {preview:<40}  {relative_time}")
        })
        .collect()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map_or_else(|| timestamp_ms.to_string(), |time| time.to_rfc3339())
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn format_optional_time(timestamp_ms: Option<i64>) -> String {
    let now_ms = Utc::now().timestamp_millis();
    timestamp_ms.map_or_else(|| "never".to_string(), |ms| format_relative_time(ms, now_ms))
}
