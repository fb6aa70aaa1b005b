use grove_core::peers::parse_peer_id;
use grove_core::services::{PeerSyncResult, SyncTarget};
use grove_core::sync::{SyncMode, SyncReport};
use serde::Serialize;

use crate::commands::common::{format_timestamp, short_id, AppContext};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct SyncResultItem {
    pub peer_id: String,
    pub peer_name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<SyncReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn sync_result_to_item(result: &PeerSyncResult) -> SyncResultItem {
    let (report, error) = match &result.result {
        Ok(report) => (Some(report.clone()), None),
        Err(error) => (None, Some(error.to_string())),
    };
    SyncResultItem {
        peer_id: result.peer.peer_id.to_string(),
        peer_name: result.peer.peer_name.clone(),
        ok: error.is_none(),
        report,
        error,
    }
}

pub fn format_report_line(peer_name: &str, report: &SyncReport) -> String {
    format!(
        "{peer_name}: pulled {} (applied {}, conflicts {}, rejected {}), pushed {} (applied {}, conflicts {}, rejected {})",
        report.pulled,
        report.applied,
        report.conflicts,
        report.rejected,
        report.pushed,
        report.remote_applied,
        report.remote_conflicts,
        report.remote_rejected,
    )
}

pub async fn run_sync(
    peer_id: Option<&str>,
    full: bool,
    as_json: bool,
    ctx: &AppContext,
) -> Result<(), CliError> {
    ctx.require_sync_enabled()?;
    let target = match peer_id {
        Some(raw) => SyncTarget::Peer(parse_peer_id(raw)?),
        None => SyncTarget::All,
    };
    let mode = if full { SyncMode::Full } else { SyncMode::Incremental };

    let service = ctx.sync_service().await?;
    let results = service.sync_now(target, mode).await?;

    if as_json {
        let items = results.iter().map(sync_result_to_item).collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if results.is_empty() {
        println!("No peers registered. Add one with `grove peers add`.");
    } else {
        for result in &results {
            match &result.result {
                Ok(report) => println!("{}", format_report_line(&result.peer.peer_name, report)),
                Err(error) => println!("{}: failed: {error}", result.peer.peer_name),
            }
        }
    }

    let failed = results.iter().filter(|result| result.result.is_err()).count();
    if failed > 0 {
        return Err(CliError::SyncFailed {
            failed,
            total: results.len(),
        });
    }
    Ok(())
}

pub async fn run_status(peer_id: &str, ctx: &AppContext) -> Result<(), CliError> {
    let peer_id = parse_peer_id(peer_id)?;
    let service = ctx.sync_service().await?;
    let status = service.peer_status(&peer_id).await?;

    println!(
        "{} ({}) is {}",
        status.device_name,
        short_id(&status.device_id.to_string()),
        if status.accepting {
            "accepting syncs"
        } else {
            "not accepting syncs"
        }
    );
    println!("Protocol:    {}", status.protocol_version);
    println!("Server time: {}", format_timestamp(status.server_time));
    Ok(())
}
