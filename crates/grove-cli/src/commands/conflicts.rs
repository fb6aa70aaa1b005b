use grove_core::models::{Conflict, ConflictId, ResolutionChoice};

use crate::commands::common::{format_timestamp, short_id, AppContext};
use crate::error::CliError;

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let from = conflict
                .remote_device_name
                .clone()
                .or_else(|| conflict.remote_device_id.map(|id| short_id(&id.to_string())))
                .unwrap_or_else(|| "unknown device".to_string());
            format!(
                "{}  {:<10}  {:<12}  {:<15}  {}  from {from}",
                conflict.id,
                conflict.entity_type,
                short_id(&conflict.entity_id),
                conflict.status.as_str(),
                format_timestamp(conflict.detected_at),
            )
        })
        .collect()
}

pub async fn run_conflicts_list(
    include_resolved: bool,
    as_json: bool,
    ctx: &AppContext,
) -> Result<(), CliError> {
    let conflicts = ctx.db.list_conflicts(include_resolved).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflicts_resolve(
    id: &str,
    choice: ResolutionChoice,
    ctx: &AppContext,
) -> Result<(), CliError> {
    let conflict_id = id.trim().parse::<ConflictId>().map_err(|_| CliError::InvalidId {
        kind: "conflict",
        value: id.to_string(),
    })?;
    let conflict = ctx.db.resolve_conflict(&conflict_id, choice).await?;

    println!(
        "{} {} {}: {}",
        conflict.entity_type,
        conflict.entity_id,
        conflict.id,
        conflict.status.as_str()
    );
    Ok(())
}
