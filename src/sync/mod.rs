//! Synchronization with a remote server.
//!
//! Every call authenticates from scratch, so no session state outlives a call. The
//! server decides whether an incremental sync is enough; when it is not, the caller
//! picks a direction and runs [`SyncOrchestrator::full_upload`] or
//! [`SyncOrchestrator::full_download`].

pub mod http;

pub use http::HttpTransport;

use crate::{Card, Collection, Deck, Note, NoteType, Result, SyncError};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}

/// Local state sent to the server so it can classify the required action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub modified: i64,
    pub schema_modified: i64,
    pub usn: i64,
    pub last_sync: i64,
    pub empty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraveKind {
    Card,
    Note,
}

/// A local deletion the server has not heard about yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Grave {
    pub oid: i64,
    pub kind: GraveKind,
}

/// Everything changed locally since the last completed sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingChanges {
    pub notetypes: Vec<NoteType>,
    pub decks: Vec<Deck>,
    pub notes: Vec<Note>,
    pub cards: Vec<Card>,
    pub graves: Vec<Grave>,
}

impl PendingChanges {
    #[must_use]
    pub fn len(&self) -> usize {
        self.notetypes.len() + self.decks.len() + self.notes.len() + self.cards.len() + self.graves.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the server says needs to happen next.
///
/// Codes this client does not know are kept as `Unknown` so newer servers do not
/// break older clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    NoChanges,
    NormalSync,
    FullSync,
    FullDownload,
    FullUpload,
    Unknown(i64),
}

impl SyncStatus {
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            0 => Self::NoChanges,
            1 => Self::NormalSync,
            2 => Self::FullSync,
            3 => Self::FullDownload,
            4 => Self::FullUpload,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::NoChanges => 0,
            Self::NormalSync => 1,
            Self::FullSync => 2,
            Self::FullDownload => 3,
            Self::FullUpload => 4,
            Self::Unknown(code) => code,
        }
    }

    /// Whether the server left the direction of a full sync up to the caller
    #[must_use]
    pub const fn needs_direction(self) -> bool {
        matches!(self, Self::FullSync)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChanges => write!(f, "no_changes"),
            Self::NormalSync => write!(f, "normal_sync"),
            Self::FullSync => write!(f, "full_sync"),
            Self::FullDownload => write!(f, "full_download"),
            Self::FullUpload => write!(f, "full_upload"),
            Self::Unknown(code) => write!(f, "unknown_{code}"),
        }
    }
}

impl Serialize for SyncStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub status: SyncStatus,
    pub server_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FullSyncStatus {
    Uploaded,
    Downloaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FullSyncOutcome {
    pub status: FullSyncStatus,
}

/// Session obtained from the server. Lives only as long as one orchestrator call
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct SyncAuth {
    pub hkey: String,
    pub endpoint: String,
}

impl fmt::Debug for SyncAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncAuth")
            .field("hkey", &"<redacted>")
            .field("endpoint", &"<redacted>")
            .finish()
    }
}

/// Username, password and endpoint, passed through verbatim to the server. The
/// endpoint can carry credentials of its own, so `Debug` hides it too
#[derive(Clone)]
pub struct SyncCredentials {
    pub username: String,
    pub password: String,
    pub endpoint: String,
}

impl fmt::Debug for SyncCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCredentials")
            .field("username", &"<redacted>")
            .field("password", &"<redacted>")
            .field("endpoint", &"<redacted>")
            .finish()
    }
}

/// The server's answer to a metadata exchange
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerVerdict {
    pub required: i64,
    #[serde(default)]
    pub server_message: Option<String>,
    #[serde(default)]
    pub usn: i64,
}

/// Wire-level access to a sync server
pub trait SyncTransport {
    /// Exchanges credentials for a session key
    ///
    /// # Errors
    ///
    /// `AuthenticationFailed` if the server rejects the credentials, `NetworkError` if it
    /// cannot be reached
    fn login(
        &self,
        endpoint: &str,
        username: &str,
        password: &str,
    ) -> std::result::Result<SyncAuth, SyncError>;

    /// Sends local metadata and receives the required action
    ///
    /// # Errors
    ///
    /// `NetworkError` on transport failure, `Protocol` on a malformed answer
    fn meta(
        &self,
        auth: &SyncAuth,
        local: &SyncMeta,
    ) -> std::result::Result<ServerVerdict, SyncError>;

    /// Hands local changes and deletions to the server for merging
    ///
    /// # Errors
    ///
    /// `NetworkError` on transport failure, `Protocol` if the server refuses the changes
    fn push_changes(
        &self,
        auth: &SyncAuth,
        changes: &PendingChanges,
    ) -> std::result::Result<(), SyncError>;

    /// Replaces the server's collection with `collection`
    ///
    /// # Errors
    ///
    /// `NetworkError` on transport failure, `Protocol` if the server refuses the data
    fn upload(&self, auth: &SyncAuth, collection: Vec<u8>) -> std::result::Result<(), SyncError>;

    /// Fetches the server's whole collection
    ///
    /// # Errors
    ///
    /// `NetworkError` on transport failure, `Protocol` on an unexpected answer
    fn download(&self, auth: &SyncAuth) -> std::result::Result<Vec<u8>, SyncError>;
}

pub struct SyncOrchestrator<T: SyncTransport> {
    transport: T,
}

impl<T: SyncTransport> SyncOrchestrator<T> {
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Authenticates against the endpoint.
    ///
    /// # Errors
    ///
    /// `AuthenticationFailed` or `NetworkError`
    pub fn login(&self, credentials: &SyncCredentials) -> Result<SyncAuth> {
        debug!("Logging in to sync server");
        let auth = self.transport.login(
            &credentials.endpoint,
            &credentials.username,
            &credentials.password,
        )?;
        Ok(auth)
    }

    /// Runs a trial sync and reports what the server requires.
    ///
    /// On `no_changes` and `normal_sync` the local changes are sent to the server and
    /// only then recorded as synced. Full sync results leave the collection untouched;
    /// `full_sync` means the caller has to choose between uploading and downloading.
    ///
    /// # Errors
    ///
    /// `AuthenticationFailed`, `NetworkError`, `Protocol`, or a store error while reading
    /// or recording sync metadata
    pub fn sync_collection(
        &self,
        col: &mut Collection,
        credentials: &SyncCredentials,
    ) -> Result<SyncOutcome> {
        let auth = self.login(credentials)?;
        let local = col.sync_meta()?;
        let verdict = self.transport.meta(&auth, &local)?;
        let status = SyncStatus::from_code(verdict.required);

        match status {
            SyncStatus::NoChanges | SyncStatus::NormalSync => {
                let changes = col.pending_changes()?;
                if changes.is_empty() {
                    debug!("No local changes to send");
                } else {
                    self.transport.push_changes(&auth, &changes)?;
                    debug!("Sent {} local change(s)", changes.len());
                }
                col.mark_synced(verdict.usn)?;
                info!("Sync finished: {status}");
            }
            SyncStatus::Unknown(code) => warn!("Server asked for unknown sync action {code}"),
            _ => info!("Server requires {status}"),
        }

        Ok(SyncOutcome {
            status,
            server_message: verdict.server_message.filter(|m| !m.trim().is_empty()),
        })
    }

    /// Replaces the server's collection with the local one.
    ///
    /// # Errors
    ///
    /// `AuthenticationFailed` or `NetworkError` before anything is touched, a store
    /// error if the collection cannot be released, `FullSyncInterrupted` if the
    /// transfer fails, `StorageUnavailable` if the collection cannot be reopened
    /// afterwards
    pub fn full_upload(
        &self,
        col: &mut Collection,
        credentials: &SyncCredentials,
    ) -> Result<FullSyncOutcome> {
        self.full_sync(col, credentials, Direction::Upload)?;
        Ok(FullSyncOutcome {
            status: FullSyncStatus::Uploaded,
        })
    }

    /// Replaces the local collection with the server's.
    ///
    /// The local file is only replaced once the downloaded copy has been verified to
    /// open as a collection.
    ///
    /// # Errors
    ///
    /// Same as [`SyncOrchestrator::full_upload`]
    pub fn full_download(
        &self,
        col: &mut Collection,
        credentials: &SyncCredentials,
    ) -> Result<FullSyncOutcome> {
        self.full_sync(col, credentials, Direction::Download)?;
        Ok(FullSyncOutcome {
            status: FullSyncStatus::Downloaded,
        })
    }

    fn full_sync(
        &self,
        col: &mut Collection,
        credentials: &SyncCredentials,
        direction: Direction,
    ) -> Result<()> {
        let auth = self.login(credentials)?;

        if let Err(e) = col.close_for_full_sync() {
            // The store may have dropped its connection anyway
            if let Err(reopen_err) = col.reopen() {
                error!("Failed reconnecting collection after a failed close: {reopen_err}");
            }
            return Err(e);
        }
        info!("Starting full {direction}");
        let path = col.path().to_path_buf();
        let transfer = match direction {
            Direction::Upload => self.push(&path, &auth),
            Direction::Download => self.pull(&path, &auth),
        };

        // Reconnect no matter how the transfer went
        let reopened = col.reopen();
        match (transfer, reopened) {
            (Ok(()), Ok(())) => {
                info!("Full {direction} finished");
                Ok(())
            }
            (Ok(()), Err(e)) => Err(e),
            (Err(reason), reopened) => {
                if let Err(e) = reopened {
                    error!("Failed reconnecting collection after interrupted full {direction}: {e}");
                }
                Err(SyncError::FullSyncInterrupted { direction, reason }.into())
            }
        }
    }

    fn push(&self, path: &Path, auth: &SyncAuth) -> std::result::Result<(), String> {
        let data = fs::read(path).map_err(|e| format!("failed reading collection: {e}"))?;
        debug!("Uploading {} bytes", data.len());
        self.transport
            .upload(auth, data)
            .map_err(|e| e.to_string())
    }

    fn pull(&self, path: &Path, auth: &SyncAuth) -> std::result::Result<(), String> {
        let data = self.transport.download(auth).map_err(|e| e.to_string())?;
        debug!("Downloaded {} bytes", data.len());
        if !data.starts_with(SQLITE_HEADER) {
            return Err("downloaded data is not a collection".to_string());
        }

        let staged = staging_path(path);
        let installed = fs::write(&staged, &data)
            .map_err(|e| format!("failed writing downloaded collection: {e}"))
            .and_then(|()| {
                Collection::open(&staged)
                    .and_then(Collection::close)
                    .map_err(|e| format!("downloaded collection is unusable: {e}"))
            })
            .and_then(|()| {
                fs::rename(&staged, path)
                    .map_err(|e| format!("failed replacing local collection: {e}"))
            });

        if installed.is_err() && staged.exists() {
            if let Err(e) = fs::remove_file(&staged) {
                warn!("Failed removing {}: {e}", staged.display());
            }
        }
        installed
    }
}

// Sibling file so the final rename stays on one filesystem
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".download");
    path.with_file_name(name)
}
