#[cfg(test)]
pub mod recording;
pub mod search;
pub mod sqlite;

pub use sqlite::SqliteStore;

pub use crate::{
    BackendError, Card, CollectionError, CollectionStore, Deck, Note, NoteType, NoteTypeSummary,
    PendingChanges, Result, SyncMeta,
};
