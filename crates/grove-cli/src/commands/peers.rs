use grove_core::models::{Peer, PeerRegistration};
use grove_core::peers::parse_peer_id;
use serde::Serialize;

use crate::commands::common::{format_optional_time, short_id, AppContext};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct PeerListItem {
    pub peer_id: String,
    pub peer_name: String,
    pub peer_url: String,
    pub certificate_fingerprint: Option<String>,
    pub last_sync_at: Option<i64>,
}

pub fn peer_to_list_item(peer: &Peer) -> PeerListItem {
    PeerListItem {
        peer_id: peer.peer_id.to_string(),
        peer_name: peer.peer_name.clone(),
        peer_url: peer.peer_url.clone(),
        certificate_fingerprint: peer
            .certificate_fingerprint
            .as_ref()
            .map(ToString::to_string),
        last_sync_at: peer.last_sync_at,
    }
}

pub fn format_peer_lines(peers: &[Peer]) -> Vec<String> {
    peers
        .iter()
        .map(|peer| {
            let id = short_id(&peer.peer_id.to_string());
            let pin = if peer.certificate_fingerprint.is_some() {
                "pinned"
            } else if peer.uses_tls() {
                "unpinned"
            } else {
                "plain http"
            };
            format!(
                "{id:<12}  {:<20}  {:<32}  {pin:<10}  synced {}",
                peer.peer_name,
                peer.peer_url,
                format_optional_time(peer.last_sync_at)
            )
        })
        .collect()
}

pub async fn run_peers_list(as_json: bool, ctx: &AppContext) -> Result<(), CliError> {
    let peers = ctx.db.list_peers().await?;

    if as_json {
        let items = peers.iter().map(peer_to_list_item).collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if peers.is_empty() {
        println!("No peers registered. Add one with `grove peers add`.");
    } else {
        for line in format_peer_lines(&peers) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_peers_add(
    registration: PeerRegistration,
    ctx: &AppContext,
) -> Result<(), CliError> {
    let service = ctx.sync_service().await?;
    let peer = service.add_peer(registration).await?;

    println!("Registered {} ({})", peer.peer_name, peer.peer_id);
    if peer.certificate_fingerprint.is_none() && peer.uses_tls() {
        println!("The certificate will be pinned on first contact.");
    }
    Ok(())
}

pub async fn run_peers_remove(peer_id: &str, ctx: &AppContext) -> Result<(), CliError> {
    let peer_id = parse_peer_id(peer_id)?;
    let service = ctx.sync_service().await?;
    service.remove_peer(&peer_id).await?;

    println!("Removed {peer_id}");
    Ok(())
}

pub async fn run_peers_reset_watermark(peer_id: &str, ctx: &AppContext) -> Result<(), CliError> {
    let peer_id = parse_peer_id(peer_id)?;
    let service = ctx.sync_service().await?;
    service.reset_watermark(&peer_id).await?;

    println!("Next sync with {peer_id} will exchange everything");
    Ok(())
}
