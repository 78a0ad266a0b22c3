use crate::sync::{HttpTransport, SyncCredentials};
use crate::{CollectionError, Result};

use clap::{Parser, Subcommand};
use log::trace;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "cardsync", version, about, long_about = None)]
pub struct Args {
    /// Path of the collection file
    #[arg(short, long, env = "CARDSYNC_COLLECTION")]
    pub collection: PathBuf,
    /// Print results as JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create an empty collection
    Init,
    /// Create or extend a note type from a JSON definition (inline or @file)
    EnsureModel { definition: String },
    /// List note types
    ListModels,
    /// Look up a deck by name, creating it if needed
    EnsureDeck { name: String },
    /// List decks
    ListDecks,
    /// Add a note from a JSON record (inline or @file)
    AddNote { note: String },
    /// Update a note from a JSON record (inline or @file)
    UpdateNote { note: String },
    /// Delete a note and its cards
    DeleteNote { id: i64 },
    /// Show a note
    GetNote { id: i64 },
    /// Print the ids of notes matching a search
    FindNotes { query: String },
    /// Check credentials against the sync server
    Login(ServerArgs),
    /// Run an incremental sync
    Sync(ServerArgs),
    /// Replace the server's collection with the local one
    FullUpload(ServerArgs),
    /// Replace the local collection with the server's
    FullDownload(ServerArgs),
}

#[derive(clap::Args)]
pub struct ServerArgs {
    #[arg(long, env = "CARDSYNC_USERNAME")]
    pub username: String,
    #[arg(long, env = "CARDSYNC_PASSWORD", hide_env_values = true)]
    pub password: String,
    /// Base URL of the sync server
    #[arg(long, env = "CARDSYNC_ENDPOINT")]
    pub endpoint: String,
    /// Seconds to wait for a connection
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}

impl ServerArgs {
    #[must_use]
    pub fn credentials(&self) -> SyncCredentials {
        SyncCredentials {
            username: self.username.clone(),
            password: self.password.clone(),
            endpoint: self.endpoint.clone(),
        }
    }

    /// # Errors
    ///
    /// `NetworkError` if the HTTP client cannot be built
    pub fn transport(&self) -> Result<HttpTransport> {
        HttpTransport::new(Duration::from_secs(self.timeout_secs)).map_err(CollectionError::from)
    }
}

impl fmt::Debug for ServerArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerArgs")
            .field("username", &"<redacted>")
            .field("password", &"<redacted>")
            .field("endpoint", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Loads `.env` and parses command-line arguments, falling back to environment variables
#[must_use]
pub fn handle_args() -> Args {
    if let Err(e) = dotenv::dotenv() {
        trace!("No .env loaded: {e}");
    }
    Args::parse()
}

/// Returns `arg` itself, or the contents of the file it names when written as `@path`
///
/// # Errors
///
/// `InvalidDefinition` if the file cannot be read
pub fn read_json_arg(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)
            .map_err(|e| CollectionError::InvalidDefinition(format!("cannot read '{path}': {e}"))),
        None => Ok(arg.to_string()),
    }
}
