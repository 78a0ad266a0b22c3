use crate::notes::{NewNote, NoteUpdate, NoteView};
use crate::schema::NoteTypeDefinition;
use crate::sync::{
    FullSyncOutcome, SyncAuth, SyncCredentials, SyncOrchestrator, SyncOutcome, SyncTransport,
};
use crate::{Collection, Deck, NoteTypeSummary, Result, decks, notes, query, schema, with_collection};
use log::trace;
use std::path::{Path, PathBuf};

/// Collection operations addressed by path.
///
/// Each call opens the collection, does one thing, and releases it again, so callers
/// only have to make sure two calls on the same path never run at the same time.
pub struct CollectionService {
    path: PathBuf,
}

impl CollectionService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates an empty collection at the service's path
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if something already exists there or it cannot be written
    pub fn init(&self) -> Result<()> {
        trace!("Creating collection at {}", self.path.display());
        Collection::create(&self.path)?.close()
    }

    /// See [`schema::ensure_schema`]
    ///
    /// # Errors
    ///
    /// Forwards errors from opening the collection and from the reconciler
    pub fn ensure_model(&self, definition: &NoteTypeDefinition) -> Result<i64> {
        with_collection(&self.path, |col| schema::ensure_schema(col, definition))
    }

    /// See [`schema::list_notetypes`]
    ///
    /// # Errors
    ///
    /// Forwards errors from opening or querying the collection
    pub fn list_models(&self) -> Result<Vec<NoteTypeSummary>> {
        with_collection(&self.path, |col| schema::list_notetypes(col))
    }

    /// See [`decks::ensure_deck`]
    ///
    /// # Errors
    ///
    /// Forwards errors from opening the collection and from the resolver
    pub fn ensure_deck(&self, name: &str) -> Result<i64> {
        with_collection(&self.path, |col| decks::ensure_deck(col, name))
    }

    /// See [`decks::list_decks`]
    ///
    /// # Errors
    ///
    /// Forwards errors from opening or querying the collection
    pub fn list_decks(&self) -> Result<Vec<Deck>> {
        with_collection(&self.path, |col| decks::list_decks(col))
    }

    /// See [`notes::add_note`]
    ///
    /// # Errors
    ///
    /// Forwards errors from opening the collection and from the note service
    pub fn add_note(&self, note: &NewNote) -> Result<i64> {
        with_collection(&self.path, |col| notes::add_note(col, note))
    }

    /// See [`notes::update_note`]
    ///
    /// # Errors
    ///
    /// Forwards errors from opening the collection and from the note service
    pub fn update_note(&self, update: &NoteUpdate) -> Result<()> {
        with_collection(&self.path, |col| notes::update_note(col, update))
    }

    /// See [`notes::delete_note`]
    ///
    /// # Errors
    ///
    /// Forwards errors from opening the collection and from the note service
    pub fn delete_note(&self, id: i64) -> Result<()> {
        with_collection(&self.path, |col| notes::delete_note(col, id))
    }

    /// See [`notes::get_note`]
    ///
    /// # Errors
    ///
    /// Forwards errors from opening the collection and from the note service
    pub fn get_note(&self, id: i64) -> Result<NoteView> {
        with_collection(&self.path, |col| notes::get_note(col, id))
    }

    /// See [`query::find_notes`]
    ///
    /// # Errors
    ///
    /// Forwards errors from opening the collection and `QuerySyntaxError`
    pub fn find_notes(&self, search: &str) -> Result<Vec<i64>> {
        with_collection(&self.path, |col| query::find_notes(col, search))
    }
}

/// Sync operations addressed by path. Each call opens and releases its own handle
pub struct SyncService<T: SyncTransport> {
    path: PathBuf,
    orchestrator: SyncOrchestrator<T>,
}

impl<T: SyncTransport> SyncService<T> {
    pub fn new(path: impl Into<PathBuf>, transport: T) -> Self {
        Self {
            path: path.into(),
            orchestrator: SyncOrchestrator::new(transport),
        }
    }

    /// Checks the credentials and returns the session key. The collection is not touched
    ///
    /// # Errors
    ///
    /// `AuthenticationFailed` or `NetworkError`
    pub fn login(&self, credentials: &SyncCredentials) -> Result<SyncAuth> {
        self.orchestrator.login(credentials)
    }

    /// See [`SyncOrchestrator::sync_collection`]
    ///
    /// # Errors
    ///
    /// Forwards errors from opening the collection and from the orchestrator
    pub fn sync(&self, credentials: &SyncCredentials) -> Result<SyncOutcome> {
        with_collection(&self.path, |col| {
            self.orchestrator.sync_collection(col, credentials)
        })
    }

    /// See [`SyncOrchestrator::full_upload`]
    ///
    /// # Errors
    ///
    /// Forwards errors from opening the collection and from the orchestrator
    pub fn full_upload(&self, credentials: &SyncCredentials) -> Result<FullSyncOutcome> {
        with_collection(&self.path, |col| self.orchestrator.full_upload(col, credentials))
    }

    /// See [`SyncOrchestrator::full_download`]
    ///
    /// # Errors
    ///
    /// Forwards errors from opening the collection and from the orchestrator
    pub fn full_download(&self, credentials: &SyncCredentials) -> Result<FullSyncOutcome> {
        with_collection(&self.path, |col| {
            self.orchestrator.full_download(col, credentials)
        })
    }
}
