#![deny(clippy::complexity)]
#![deny(clippy::correctness)]
#![deny(clippy::perf)]
#![deny(clippy::style)]
#![deny(clippy::suspicious)]

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tabled::Tabled;
use thiserror::Error;

pub mod app;
pub mod backends;
pub mod collection;
pub mod decks;
pub mod notes;
pub mod query;
pub mod schema;
pub mod setup;
pub mod sync;
pub mod ui;

pub use collection::{Collection, with_collection};
pub use sync::{PendingChanges, SyncMeta, SyncStatus};

// More convenient Result type
pub type Result<T> = std::result::Result<T, CollectionError>;

/// A single named slot of a note type. `ord` is the position in the note's field list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    pub ord: u32,
}

/// Question/answer formats producing one card per note
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Template {
    pub name: String,
    pub ord: u32,
    pub qfmt: String,
    pub afmt: String,
}

/// Schema shared by a family of notes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteType {
    /// Zero until the store assigns an id
    pub id: i64,
    pub name: String,
    pub fields: Vec<Field>,
    pub templates: Vec<Template>,
    pub css: String,
    /// Last modification in ms, maintained by the store
    pub mtime: i64,
}

impl NoteType {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            fields: Vec::new(),
            templates: Vec::new(),
            css: String::new(),
            mtime: 0,
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Position of the field called `name`, if the note type declares it
    #[must_use]
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Appends a field at the end. Existing fields keep their positions
    pub fn add_field(&mut self, name: &str) {
        let ord = ord_for(self.fields.len());
        self.fields.push(Field {
            name: name.to_string(),
            ord,
        });
    }

    /// Appends a template at the end. Existing templates keep their positions
    pub fn add_template(&mut self, name: &str, qfmt: &str, afmt: &str) {
        let ord = ord_for(self.templates.len());
        self.templates.push(Template {
            name: name.to_string(),
            ord,
            qfmt: qfmt.to_string(),
            afmt: afmt.to_string(),
        });
    }

    pub fn template_mut(&mut self, name: &str) -> Option<&mut Template> {
        self.templates.iter_mut().find(|t| t.name == name)
    }
}

fn ord_for(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Row shown by `list-models`
#[derive(Tabled, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteTypeSummary {
    pub id: i64,
    pub name: String,
    pub fields: usize,
    pub templates: usize,
    pub notes: usize,
}

#[derive(Tabled, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deck {
    pub id: i64,
    pub name: String,
}

/// A stored note. Field values are positional and aligned with the note type's fields;
/// records written before a field was added are shorter than the field list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Note {
    pub id: i64,
    pub notetype_id: i64,
    pub fields: Vec<String>,
    pub tags: BTreeSet<String>,
    pub mtime: i64,
}

impl Note {
    /// An unsaved note with one empty value per declared field
    #[must_use]
    pub fn new(notetype: &NoteType) -> Self {
        Self {
            id: 0,
            notetype_id: notetype.id,
            fields: vec![String::new(); notetype.fields.len()],
            tags: BTreeSet::new(),
            mtime: 0,
        }
    }

    /// Sets the value at `index`, padding older, shorter records with empty values
    pub fn set_field(&mut self, index: usize, value: &str) {
        if self.fields.len() <= index {
            self.fields.resize(index + 1, String::new());
        }
        self.fields[index] = value.to_string();
    }

    /// Adds a tag. Whitespace separates tags, so "a b" adds two
    pub fn add_tag(&mut self, tag: &str) {
        for t in tag.split_whitespace() {
            self.tags.insert(t.to_string());
        }
    }

    pub fn set_tags<S: AsRef<str>>(&mut self, tags: &[S]) {
        self.tags.clear();
        for t in tags {
            self.add_tag(t.as_ref());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Card {
    pub id: i64,
    pub note_id: i64,
    pub deck_id: i64,
    pub ord: u32,
}

/// The collaborator that persists note types, decks, notes and cards.
///
/// Every service in this crate talks to the collection only through this trait
pub trait CollectionStore {
    /// Location of the collection file
    fn path(&self) -> &Path;

    /// Looks up a note type by exact name
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    fn notetype_by_name(&self, name: &str) -> Result<Option<NoteType>>;

    /// Looks up a note type by id
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    fn notetype_by_id(&self, id: i64) -> Result<Option<NoteType>>;

    /// Persists a new note type, assigns its id and returns it
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or the insert fails
    fn add_notetype(&self, notetype: &mut NoteType) -> Result<i64>;

    /// Replaces the stored fields, templates and styling of an existing note type
    ///
    /// # Errors
    ///
    /// Returns an error if the note type does not exist or the write fails
    fn update_notetype(&self, notetype: &mut NoteType) -> Result<()>;

    /// Lists all note types with field, template and note counts
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    fn notetypes(&self) -> Result<Vec<NoteTypeSummary>>;

    /// Looks up a deck id by exact name
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    fn deck_id(&self, name: &str) -> Result<Option<i64>>;

    /// Creates a deck and returns its id
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or the insert fails
    fn add_deck(&self, name: &str) -> Result<i64>;

    /// Looks up a deck by id
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    fn deck_by_id(&self, id: i64) -> Result<Option<Deck>>;

    /// Lists all decks sorted by name
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    fn decks(&self) -> Result<Vec<Deck>>;

    /// Persists a new note, generates its cards into `deck_id` and returns the note id
    ///
    /// # Errors
    ///
    /// Returns an error if the note type is unknown or the insert fails
    fn add_note(&self, note: &mut Note, deck_id: i64) -> Result<i64>;

    /// Loads a note by id
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    fn get_note(&self, id: i64) -> Result<Option<Note>>;

    /// Writes the fields and tags of an existing note
    ///
    /// # Errors
    ///
    /// Returns an error if the note is not found or the write fails
    fn update_note(&self, note: &mut Note) -> Result<()>;

    /// Removes notes and their cards, returning how many notes were removed
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails
    fn remove_notes(&self, ids: &[i64]) -> Result<usize>;

    /// Cards derived from a note, ordered by template position
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    fn cards_of_note(&self, note_id: i64) -> Result<Vec<Card>>;

    /// Moves cards to another deck
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails
    fn set_deck(&self, card_ids: &[i64], deck_id: i64) -> Result<()>;

    /// Runs a search query and returns the matching note ids
    ///
    /// # Errors
    ///
    /// Returns `QuerySyntaxError` for malformed queries
    fn find_notes(&self, query: &str) -> Result<Vec<i64>>;

    /// Metadata sent to the sync server to classify the required action
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    fn sync_meta(&self) -> Result<SyncMeta>;

    /// Note types, decks, notes and cards changed since the last sync, plus deletions
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a deletion record is malformed
    fn pending_changes(&self) -> Result<PendingChanges>;

    /// Records a completed incremental sync: pending changes take `server_usn` and the
    /// deletion records are dropped. Only call once the changes have reached the server
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails
    fn mark_synced(&self, server_usn: i64) -> Result<()>;

    /// Releases the underlying file so it can be copied or replaced wholesale
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be released cleanly
    fn close_for_full_sync(&mut self) -> Result<()>;

    /// Reopens the file after a full sync
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the file can no longer be opened
    fn reopen(&mut self) -> Result<()>;

    /// Releases the handle
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file could not be closed cleanly
    fn close(self: Box<Self>) -> Result<()>;
}

// Every error this crate surfaces to its callers
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("Collection at '{}' is unavailable: {reason}", path.display())]
    StorageUnavailable { path: PathBuf, reason: String },

    #[error("Note type not found: {0}")]
    ModelNotFound(String),

    #[error("Note not found with ID: {0}")]
    NoteNotFound(i64),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid search query: {0}")]
    QuerySyntaxError(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl CollectionError {
    pub(crate) fn unavailable(path: &Path, reason: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

// Failures while talking to the sync server
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync server rejected the username or password")]
    AuthenticationFailed,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Full {direction} was interrupted: {reason}")]
    FullSyncInterrupted {
        direction: sync::Direction,
        reason: String,
    },

    #[error("Unexpected response from sync server: {0}")]
    Protocol(String),
}

// Failures inside the storage backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Database is locked or busy")]
    Busy,

    #[error("Insufficient permissions")]
    PermissionDenied,

    #[error("Database file is not a valid SQLite database")]
    NotADatabase,

    #[error("Database corruption or file I/O error")]
    CorruptOrIo,

    #[error("Database schema has changed unexpectedly")]
    SchemaChanged,

    #[error("Collection is closed for a full sync")]
    Closed,

    #[error("Duplicate name: {0}")]
    Duplicate(String),

    #[error("Stored record is improperly formatted: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error), // Used as fallback
}
