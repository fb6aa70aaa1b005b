use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use grove_core::models::ResolutionChoice;

#[derive(Parser)]
#[command(name = "grove")]
#[command(about = "Hierarchical notes, synchronized directly between your devices")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding config.json, the device identity and certificates
    #[arg(long, global = true, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show this device's id, name and certificate fingerprint
    Identity {
        /// Rename this device
        #[arg(long)]
        name: Option<String>,
    },
    /// Answer sync requests from peers until interrupted
    Serve,
    /// Sync with one peer, or with every registered peer
    Sync {
        /// Peer device id (all peers when omitted)
        peer_id: Option<String>,
        /// Exchange everything, ignoring the watermark
        #[arg(long)]
        full: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Ask a peer whether it is reachable and accepting syncs
    Status {
        /// Peer device id
        peer_id: String,
    },
    /// Manage registered peers
    #[command(subcommand)]
    Peers(PeersCommand),
    /// Inspect and resolve sync conflicts
    #[command(subcommand)]
    Conflicts(ConflictsCommand),
    /// Create, list and delete notes
    #[command(subcommand)]
    Note(NoteCommand),
    /// Create tags and attach them to notes
    #[command(subcommand)]
    Tag(TagCommand),
}

#[derive(Subcommand)]
pub enum PeersCommand {
    /// List registered peers
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Register a peer, or update an existing registration
    Add {
        /// Peer device id (32 hex characters)
        peer_id: String,
        /// Display name
        name: String,
        /// Base URL, e.g. https://desk.local:8384
        url: String,
        /// Pin this SHA-256 certificate fingerprint instead of trusting on first use
        #[arg(long)]
        fingerprint: Option<String>,
    },
    /// Forget a peer
    Remove { peer_id: String },
    /// Clear the sync watermark so the next sync is a full exchange
    ResetWatermark { peer_id: String },
}

#[derive(Subcommand)]
pub enum ConflictsCommand {
    /// List conflicts
    List {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a conflict
    Resolve {
        /// Conflict id
        id: String,
        #[arg(value_enum)]
        choice: ResolutionArg,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResolutionArg {
    /// Keep this device's version
    Local,
    /// Take the peer's version
    Remote,
    /// Combine both versions
    Merge,
}

impl From<ResolutionArg> for ResolutionChoice {
    fn from(value: ResolutionArg) -> Self {
        match value {
            ResolutionArg::Local => Self::Local,
            ResolutionArg::Remote => Self::Remote,
            ResolutionArg::Merge => Self::Merge,
        }
    }
}

#[derive(Subcommand)]
pub enum NoteCommand {
    /// Create a new note
    #[command(alias = "new")]
    Add {
        /// Note content (read from stdin when omitted)
        content: Vec<String>,
    },
    /// List recent notes
    List {
        /// Number of notes to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a note
    Delete {
        /// Note id
        id: String,
    },
}

#[derive(Subcommand)]
pub enum TagCommand {
    /// Create a tag
    Add {
        name: String,
        /// Parent tag name or id
        #[arg(long)]
        parent: Option<String>,
    },
    /// Attach a tag to a note
    Assign {
        /// Note id
        note_id: String,
        /// Tag name or id
        tag: String,
    },
    /// List tags
    List,
}
