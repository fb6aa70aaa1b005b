//! Grove CLI - notes on every device, synchronized peer to peer
//!
//! Manages the local note store, the device identity and the peers it
//! syncs with, and runs the sync server.

mod cli;
mod commands;
mod error;


use clap::Parser;
use grove_core::models::PeerRegistration;

use crate::cli::{Cli, Commands, ConflictsCommand, NoteCommand, PeersCommand, TagCommand};
use crate::commands::common::{AppContext, Paths};
use crate::commands::conflicts::{run_conflicts_list, run_conflicts_resolve};
use crate::commands::identity::run_identity;
use crate::commands::notes::{run_note_add, run_note_delete, run_note_list};
use crate::commands::peers::{
    run_peers_add, run_peers_list, run_peers_remove, run_peers_reset_watermark,
};
use crate::commands::serve::run_serve;
use crate::commands::sync::{run_status, run_sync};
use crate::commands::tags::{run_tag_add, run_tag_assign, run_tag_list};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("grove=info".parse().unwrap())
                .add_directive("grove_core=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let paths = Paths::resolve(cli.config_dir, cli.db_path)?;

    match cli.command {
        // The identity must be readable before any database exists.
        Commands::Identity { name } => run_identity(name.as_deref(), &paths),
        command => run_command(command, &AppContext::load(paths).await?).await,
    }
}

async fn run_command(command: Commands, ctx: &AppContext) -> Result<(), CliError> {
    match command {
        Commands::Identity { name } => run_identity(name.as_deref(), &ctx.paths)?,
        Commands::Serve => run_serve(ctx).await?,
        Commands::Sync {
            peer_id,
            full,
            json,
        } => run_sync(peer_id.as_deref(), full, json, ctx).await?,
        Commands::Status { peer_id } => run_status(&peer_id, ctx).await?,
        Commands::Peers(command) => run_peers(command, ctx).await?,
        Commands::Conflicts(ConflictsCommand::List { all, json }) => {
            run_conflicts_list(all, json, ctx).await?;
        }
        Commands::Conflicts(ConflictsCommand::Resolve { id, choice }) => {
            run_conflicts_resolve(&id, choice.into(), ctx).await?;
        }
        Commands::Note(NoteCommand::Add { content }) => run_note_add(&content, ctx).await?,
        Commands::Note(NoteCommand::List { limit, json }) => {
            run_note_list(limit, json, ctx).await?;
        }
        Commands::Note(NoteCommand::Delete { id }) => run_note_delete(&id, ctx).await?,
        Commands::Tag(TagCommand::Add { name, parent }) => {
            run_tag_add(&name, parent.as_deref(), ctx).await?;
        }
        Commands::Tag(TagCommand::Assign { note_id, tag }) => {
            run_tag_assign(&note_id, &tag, ctx).await?;
        }
        Commands::Tag(TagCommand::List) => run_tag_list(ctx).await?,
    }

    Ok(())
}

async fn run_peers(command: PeersCommand, ctx: &AppContext) -> Result<(), CliError> {
    match command {
        PeersCommand::List { json } => run_peers_list(json, ctx).await,
        PeersCommand::Add {
            peer_id,
            name,
            url,
            fingerprint,
        } => {
            let registration = PeerRegistration {
                peer_id,
                peer_name: name,
                peer_url: url,
                certificate_fingerprint: fingerprint,
            };
            run_peers_add(registration, ctx).await
        }
        PeersCommand::Remove { peer_id } => run_peers_remove(&peer_id, ctx).await,
        PeersCommand::ResetWatermark { peer_id } => run_peers_reset_watermark(&peer_id, ctx).await,
    }
}
