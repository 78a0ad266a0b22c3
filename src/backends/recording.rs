//! A store wrapper for tests that logs every call and can fail on request.

use super::{
    BackendError, Card, CollectionError, CollectionStore, Deck, Note, NoteType, NoteTypeSummary,
    PendingChanges, Result, SqliteStore, SyncMeta,
};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

pub type CallLog = Rc<RefCell<Vec<&'static str>>>;

pub struct RecordingStore {
    inner: SqliteStore,
    calls: CallLog,
    pub fail_close_for_full_sync: bool,
}

impl RecordingStore {
    pub fn new(inner: SqliteStore) -> (Self, CallLog) {
        let calls = CallLog::default();
        let store = Self {
            inner,
            calls: Rc::clone(&calls),
            fail_close_for_full_sync: false,
        };
        (store, calls)
    }

    fn record(&self, call: &'static str) {
        self.calls.borrow_mut().push(call);
    }
}

impl CollectionStore for RecordingStore {
    fn path(&self) -> &Path {
        self.inner.path()
    }

    fn notetype_by_name(&self, name: &str) -> Result<Option<NoteType>> {
        self.record("notetype_by_name");
        self.inner.notetype_by_name(name)
    }

    fn notetype_by_id(&self, id: i64) -> Result<Option<NoteType>> {
        self.record("notetype_by_id");
        self.inner.notetype_by_id(id)
    }

    fn add_notetype(&self, notetype: &mut NoteType) -> Result<i64> {
        self.record("add_notetype");
        self.inner.add_notetype(notetype)
    }

    fn update_notetype(&self, notetype: &mut NoteType) -> Result<()> {
        self.record("update_notetype");
        self.inner.update_notetype(notetype)
    }

    fn notetypes(&self) -> Result<Vec<NoteTypeSummary>> {
        self.record("notetypes");
        self.inner.notetypes()
    }

    fn deck_id(&self, name: &str) -> Result<Option<i64>> {
        self.record("deck_id");
        self.inner.deck_id(name)
    }

    fn add_deck(&self, name: &str) -> Result<i64> {
        self.record("add_deck");
        self.inner.add_deck(name)
    }

    fn deck_by_id(&self, id: i64) -> Result<Option<Deck>> {
        self.record("deck_by_id");
        self.inner.deck_by_id(id)
    }

    fn decks(&self) -> Result<Vec<Deck>> {
        self.record("decks");
        self.inner.decks()
    }

    fn add_note(&self, note: &mut Note, deck_id: i64) -> Result<i64> {
        self.record("add_note");
        self.inner.add_note(note, deck_id)
    }

    fn get_note(&self, id: i64) -> Result<Option<Note>> {
        self.record("get_note");
        self.inner.get_note(id)
    }

    fn update_note(&self, note: &mut Note) -> Result<()> {
        self.record("update_note");
        self.inner.update_note(note)
    }

    fn remove_notes(&self, ids: &[i64]) -> Result<usize> {
        self.record("remove_notes");
        self.inner.remove_notes(ids)
    }

    fn cards_of_note(&self, note_id: i64) -> Result<Vec<Card>> {
        self.record("cards_of_note");
        self.inner.cards_of_note(note_id)
    }

    fn set_deck(&self, card_ids: &[i64], deck_id: i64) -> Result<()> {
        self.record("set_deck");
        self.inner.set_deck(card_ids, deck_id)
    }

    fn find_notes(&self, query: &str) -> Result<Vec<i64>> {
        self.record("find_notes");
        self.inner.find_notes(query)
    }

    fn sync_meta(&self) -> Result<SyncMeta> {
        self.record("sync_meta");
        self.inner.sync_meta()
    }

    fn pending_changes(&self) -> Result<PendingChanges> {
        self.record("pending_changes");
        self.inner.pending_changes()
    }

    fn mark_synced(&self, server_usn: i64) -> Result<()> {
        self.record("mark_synced");
        self.inner.mark_synced(server_usn)
    }

    // A failed close still releases the connection, the way SQLite drops a handle it
    // could not close cleanly
    fn close_for_full_sync(&mut self) -> Result<()> {
        self.record("close_for_full_sync");
        self.inner.close_for_full_sync()?;
        if self.fail_close_for_full_sync {
            return Err(CollectionError::Backend(BackendError::CorruptOrIo));
        }
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        self.record("reopen");
        self.inner.reopen()
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.record("close");
        let store = *self;
        Box::new(store.inner).close()
    }
}
