use super::search::{Candidate, Search};
use super::{
    BackendError, Card, CollectionError, CollectionStore, Deck, Note, NoteType, NoteTypeSummary,
    PendingChanges, Result, SyncMeta,
};
use crate::sync::{Grave, GraveKind};
use crate::{Field, Template};
use log::{debug, trace, warn};
use regex::Regex;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, Row, params};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SCHEMA_VERSION: i64 = 1;
const DEFAULT_DECK_ID: i64 = 1;
const DEFAULT_DECK_NAME: &str = "Default";
const FIELD_SEPARATOR: char = '\x1f';
// Objects changed locally since the last sync
const PENDING_USN: i64 = -1;

const SCHEMA: &str = "
    CREATE TABLE col (
        id      INTEGER PRIMARY KEY,
        ver     INTEGER NOT NULL,
        crt     INTEGER NOT NULL,
        mod     INTEGER NOT NULL,
        scm     INTEGER NOT NULL,
        usn     INTEGER NOT NULL,
        ls      INTEGER NOT NULL
    );
    CREATE TABLE notetypes (
        id      INTEGER PRIMARY KEY,
        name    TEXT NOT NULL UNIQUE,
        mtime   INTEGER NOT NULL,
        usn     INTEGER NOT NULL,
        css     TEXT NOT NULL
    );
    CREATE TABLE fields (
        ntid    INTEGER NOT NULL,
        ord     INTEGER NOT NULL,
        name    TEXT NOT NULL,
        PRIMARY KEY (ntid, ord)
    );
    CREATE TABLE templates (
        ntid    INTEGER NOT NULL,
        ord     INTEGER NOT NULL,
        name    TEXT NOT NULL,
        qfmt    TEXT NOT NULL,
        afmt    TEXT NOT NULL,
        PRIMARY KEY (ntid, ord)
    );
    CREATE TABLE decks (
        id      INTEGER PRIMARY KEY,
        name    TEXT NOT NULL UNIQUE,
        mtime   INTEGER NOT NULL,
        usn     INTEGER NOT NULL
    );
    CREATE TABLE notes (
        id      INTEGER PRIMARY KEY,
        mid     INTEGER NOT NULL,
        mod     INTEGER NOT NULL,
        usn     INTEGER NOT NULL,
        tags    TEXT NOT NULL,
        flds    TEXT NOT NULL
    );
    CREATE TABLE cards (
        id      INTEGER PRIMARY KEY,
        nid     INTEGER NOT NULL,
        did     INTEGER NOT NULL,
        ord     INTEGER NOT NULL,
        mod     INTEGER NOT NULL,
        usn     INTEGER NOT NULL
    );
    CREATE TABLE graves (
        usn     INTEGER NOT NULL,
        oid     INTEGER NOT NULL,
        type    INTEGER NOT NULL
    );
    CREATE INDEX ix_notes_mid ON notes (mid);
    CREATE INDEX ix_cards_nid ON cards (nid);
    CREATE INDEX ix_cards_did ON cards (did);
";

// Grave types recorded for deletions so the next sync can propagate them
const GRAVE_CARD: i64 = 0;
const GRAVE_NOTE: i64 = 1;

#[derive(Debug)]
pub struct SqliteStore {
    path: PathBuf,
    connection: Option<Connection>,
}

impl SqliteStore {
    /// Opens an existing collection and takes an exclusive lock on it.
    ///
    /// # Errors
    ///
    /// `CollectionError::StorageUnavailable` if the file is missing, is not a collection,
    /// or is locked by another handle.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(CollectionError::unavailable(
                path,
                "collection file does not exist",
            ));
        }

        let connection = connect(path)?;
        debug!("Opened collection: {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            connection: Some(connection),
        })
    }

    /// Creates a new collection with an empty `Default` deck, then opens it.
    ///
    /// # Errors
    ///
    /// `CollectionError::StorageUnavailable` if something already exists at `path` or the
    /// file cannot be created.
    pub fn create(path: &Path) -> Result<Self> {
        Self::create_with_schema(path, SCHEMA)
    }

    fn create_with_schema(path: &Path, schema: &str) -> Result<Self> {
        if path.exists() {
            return Err(CollectionError::unavailable(
                path,
                "a file already exists at this path",
            ));
        }

        if let Err(e) = initialize(path, schema) {
            discard_partial(path);
            return Err(e);
        }
        debug!("Initialized collection: {}", path.display());

        Self::open(path)
    }

    fn conn(&self) -> Result<&Connection> {
        self.connection
            .as_ref()
            .ok_or(CollectionError::Backend(BackendError::Closed))
    }

    fn load_notetype(
        conn: &Connection,
        (id, name, mtime, css): (i64, String, i64, String),
    ) -> Result<NoteType> {
        let mut stmt = conn
            .prepare("SELECT ord, name FROM fields WHERE ntid = ?1 ORDER BY ord")
            .map_err(map_sqlite_error)?;
        let fields = stmt
            .query_map([id], |row| {
                Ok(Field {
                    ord: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .map_err(map_sqlite_error)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(map_sqlite_error)?;

        let mut stmt = conn
            .prepare("SELECT ord, name, qfmt, afmt FROM templates WHERE ntid = ?1 ORDER BY ord")
            .map_err(map_sqlite_error)?;
        let templates = stmt
            .query_map([id], |row| {
                Ok(Template {
                    ord: row.get(0)?,
                    name: row.get(1)?,
                    qfmt: row.get(2)?,
                    afmt: row.get(3)?,
                })
            })
            .map_err(map_sqlite_error)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(map_sqlite_error)?;

        Ok(NoteType {
            id,
            name,
            fields,
            templates,
            css,
            mtime,
        })
    }

    fn query_notetype(&self, filter: &str, param: &dyn rusqlite::ToSql) -> Result<Option<NoteType>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT id, name, mtime, css FROM notetypes WHERE {filter} = ?1"),
                [param],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(map_sqlite_error)?;

        row.map(|r| Self::load_notetype(conn, r)).transpose()
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if self.connection.is_some() {
            trace!("Dropping open collection handle: {}", self.path.display());
        }
    }
}

// Writes the tables, collection row and default deck into a new file
fn initialize(path: &Path, schema: &str) -> Result<()> {
    let unavailable = |e: rusqlite::Error| CollectionError::unavailable(path, e.to_string());
    let connection = Connection::open(path).map_err(unavailable)?;
    let now = now_millis();
    connection.execute_batch(schema).map_err(unavailable)?;
    connection
        .execute(
            "INSERT INTO col (id, ver, crt, mod, scm, usn, ls) VALUES (1, ?1, ?2, ?2, ?2, 0, 0)",
            params![SCHEMA_VERSION, now],
        )
        .map_err(unavailable)?;
    connection
        .execute(
            "INSERT INTO decks (id, name, mtime, usn) VALUES (?1, ?2, ?3, 0)",
            params![DEFAULT_DECK_ID, DEFAULT_DECK_NAME, now],
        )
        .map_err(unavailable)?;
    connection
        .close()
        .map_err(|(_, e)| CollectionError::unavailable(path, e.to_string()))
}

// A half-written file would block the next create at the same path
fn discard_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed removing partial collection {}: {e}", path.display());
        }
    }
}

// Open with an exclusive lock held for the lifetime of the connection
fn connect(path: &Path) -> Result<Connection> {
    let unavailable = |e: rusqlite::Error| CollectionError::unavailable(path, describe_open_error(&e));

    let connection = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(unavailable)?;
    connection.busy_timeout(Duration::ZERO).map_err(unavailable)?;
    connection
        .pragma_update(None, "locking_mode", "EXCLUSIVE")
        .map_err(unavailable)?;
    // Take the lock now so a second handle fails on open instead of on its first write
    connection
        .execute_batch("BEGIN EXCLUSIVE; COMMIT;")
        .map_err(unavailable)?;

    let version: Option<i64> = connection
        .query_row("SELECT ver FROM col WHERE id = 1", [], |row| row.get(0))
        .optional()
        .map_err(unavailable)?;
    match version {
        Some(SCHEMA_VERSION) => Ok(connection),
        Some(other) => Err(CollectionError::unavailable(
            path,
            format!("unsupported collection version {other}"),
        )),
        None => Err(CollectionError::unavailable(
            path,
            "collection metadata is missing",
        )),
    }
}

fn describe_open_error(e: &rusqlite::Error) -> String {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            "locked by another process".to_string()
        }
        Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt) => {
            "not a valid collection file".to_string()
        }
        Some(ErrorCode::CannotOpen | ErrorCode::PermissionDenied) => {
            format!("file cannot be opened: {e}")
        }
        _ => e.to_string(),
    }
}

/// Maps a `rusqlite::Error` into a `CollectionError`, wrapping known SQLite-specific codes into domain-specific variants.
///
/// This function is used internally by all database operations.
fn map_sqlite_error(e: rusqlite::Error) -> CollectionError {
    let backend = match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => BackendError::Busy,
        Some(ErrorCode::PermissionDenied | ErrorCode::ReadOnly) => BackendError::PermissionDenied,
        Some(ErrorCode::NotADatabase) => BackendError::NotADatabase,
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::SystemIoFailure) => BackendError::CorruptOrIo,
        Some(ErrorCode::SchemaChanged) => BackendError::SchemaChanged,
        _ => BackendError::Other(anyhow::Error::new(e)),
    };
    CollectionError::Backend(backend)
}

// Unique-name violations get their own variant, everything else goes through the usual mapping
fn map_insert_error(e: rusqlite::Error, name: &str) -> CollectionError {
    if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        CollectionError::Backend(BackendError::Duplicate(name.to_string()))
    } else {
        map_sqlite_error(e)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

// Ids are creation timestamps in ms, bumped past the current maximum on collision
fn next_id(conn: &Connection, table: &str) -> Result<i64> {
    let max: Option<i64> = conn
        .query_row(&format!("SELECT MAX(id) FROM {table}"), [], |row| row.get(0))
        .map_err(map_sqlite_error)?;
    Ok(now_millis().max(max.map_or(0, |m| m + 1)))
}

fn touch_col(conn: &Connection, mtime: i64, schema_changed: bool) -> Result<()> {
    let sql = if schema_changed {
        "UPDATE col SET mod = ?1, scm = ?1 WHERE id = 1"
    } else {
        "UPDATE col SET mod = ?1 WHERE id = 1"
    };
    conn.execute(sql, [mtime]).map_err(map_sqlite_error)?;
    Ok(())
}

fn write_notetype_children(conn: &Connection, notetype: &NoteType) -> Result<()> {
    conn.execute("DELETE FROM fields WHERE ntid = ?1", [notetype.id])
        .map_err(map_sqlite_error)?;
    conn.execute("DELETE FROM templates WHERE ntid = ?1", [notetype.id])
        .map_err(map_sqlite_error)?;

    for field in &notetype.fields {
        conn.execute(
            "INSERT INTO fields (ntid, ord, name) VALUES (?1, ?2, ?3)",
            params![notetype.id, field.ord, field.name],
        )
        .map_err(|e| map_insert_error(e, &field.name))?;
    }
    for template in &notetype.templates {
        conn.execute(
            "INSERT INTO templates (ntid, ord, name, qfmt, afmt) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                notetype.id,
                template.ord,
                template.name,
                template.qfmt,
                template.afmt
            ],
        )
        .map_err(|e| map_insert_error(e, &template.name))?;
    }
    Ok(())
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    let tags: String = row.get(3)?;
    let flds: String = row.get(4)?;
    Ok(Note {
        id: row.get(0)?,
        notetype_id: row.get(1)?,
        mtime: row.get(2)?,
        tags: split_tags(&tags),
        fields: split_fields(&flds),
    })
}

fn card_from_row(row: &Row<'_>) -> rusqlite::Result<Card> {
    Ok(Card {
        id: row.get(0)?,
        note_id: row.get(1)?,
        deck_id: row.get(2)?,
        ord: row.get(3)?,
    })
}

fn deck_from_row(row: &Row<'_>) -> rusqlite::Result<Deck> {
    Ok(Deck {
        id: row.get(0)?,
        name: row.get(1)?,
    })
}

fn grave_kind(code: i64) -> Result<GraveKind> {
    match code {
        GRAVE_CARD => Ok(GraveKind::Card),
        GRAVE_NOTE => Ok(GraveKind::Note),
        other => Err(CollectionError::Backend(BackendError::Corrupted(format!(
            "unknown deletion type {other}"
        )))),
    }
}

// Runs a pending-rows query and collects every row through `map`
fn pending_rows<T>(
    conn: &Connection,
    sql: &str,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
    let rows = stmt
        .query_map([PENDING_USN], map)
        .map_err(map_sqlite_error)?;
    rows.collect::<std::result::Result<_, _>>()
        .map_err(map_sqlite_error)
}

fn join_fields(fields: &[String]) -> String {
    fields.join(&FIELD_SEPARATOR.to_string())
}

fn split_fields(flds: &str) -> Vec<String> {
    flds.split(FIELD_SEPARATOR).map(ToString::to_string).collect()
}

// Stored space-wrapped so a tag can be matched with `LIKE '% tag %'`
fn join_tags(tags: &BTreeSet<String>) -> String {
    if tags.is_empty() {
        String::new()
    } else {
        format!(" {} ", tags.iter().cloned().collect::<Vec<_>>().join(" "))
    }
}

fn split_tags(tags: &str) -> BTreeSet<String> {
    tags.split_whitespace().map(ToString::to_string).collect()
}

fn count(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

// `{{Name}}`, `{{#Name}}`, `{{/Name}}`, `{{!comment}}`, `{{cloze:Name}}`
static FIELD_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([#^/!]?)([^}]+?)\s*\}\}").expect("field reference pattern compiles")
});

/// Field names a question format refers to, e.g. `{{Front}}`, `{{#Back}}`, `{{cloze:Text}}`
fn referenced_fields(format: &str) -> Vec<&str> {
    FIELD_REFERENCE
        .captures_iter(format)
        .filter(|caps| !matches!(&caps[1], "/" | "!"))
        .filter_map(|caps| caps.get(2))
        .map(|tag| {
            let tag = tag.as_str();
            tag.rsplit_once(':').map_or(tag, |(_, name)| name).trim()
        })
        .filter(|name| !name.is_empty() && *name != "FrontSide")
        .collect()
}

// A template yields a card when its question refers to at least one non-empty field
fn template_applies(notetype: &NoteType, template: &Template, fields: &[String]) -> bool {
    let refs = referenced_fields(&template.qfmt);
    refs.is_empty()
        || refs.iter().any(|name| {
            notetype
                .field_index(name)
                .and_then(|idx| fields.get(idx))
                .is_some_and(|value| !value.trim().is_empty())
        })
}

impl CollectionStore for SqliteStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn notetype_by_name(&self, name: &str) -> Result<Option<NoteType>> {
        self.query_notetype("name", &name)
    }

    fn notetype_by_id(&self, id: i64) -> Result<Option<NoteType>> {
        self.query_notetype("id", &id)
    }

    fn add_notetype(&self, notetype: &mut NoteType) -> Result<i64> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().map_err(map_sqlite_error)?;
        let id = next_id(&tx, "notetypes")?;
        let mtime = now_millis();

        tx.execute(
            "INSERT INTO notetypes (id, name, mtime, usn, css) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, notetype.name, mtime, PENDING_USN, notetype.css],
        )
        .map_err(|e| map_insert_error(e, &notetype.name))?;
        notetype.id = id;
        write_notetype_children(&tx, notetype)?;
        touch_col(&tx, mtime, true)?;
        tx.commit().map_err(map_sqlite_error)?;

        notetype.mtime = mtime;
        debug!("Added note type '{}' with ID: {}", notetype.name, id);
        Ok(id)
    }

    fn update_notetype(&self, notetype: &mut NoteType) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().map_err(map_sqlite_error)?;
        let mtime = now_millis();

        let rows = tx
            .execute(
                "UPDATE notetypes SET name = ?1, mtime = ?2, usn = ?3, css = ?4 WHERE id = ?5",
                params![notetype.name, mtime, PENDING_USN, notetype.css, notetype.id],
            )
            .map_err(|e| map_insert_error(e, &notetype.name))?;
        if rows == 0 {
            return Err(CollectionError::ModelNotFound(notetype.name.clone()));
        }
        write_notetype_children(&tx, notetype)?;
        touch_col(&tx, mtime, true)?;
        tx.commit().map_err(map_sqlite_error)?;

        notetype.mtime = mtime;
        debug!("Saved note type '{}'", notetype.name);
        Ok(())
    }

    fn notetypes(&self) -> Result<Vec<NoteTypeSummary>> {
        let mut stmt = self
            .conn()?
            .prepare(
                "
                SELECT nt.id, nt.name,
                    (SELECT COUNT(*) FROM fields f WHERE f.ntid = nt.id),
                    (SELECT COUNT(*) FROM templates t WHERE t.ntid = nt.id),
                    (SELECT COUNT(*) FROM notes n WHERE n.mid = nt.id)
                FROM notetypes nt
                ORDER BY nt.name ASC
                ",
            )
            .map_err(map_sqlite_error)?;

        let summaries = stmt
            .query_map([], |row| {
                Ok(NoteTypeSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    fields: count(row.get(2)?),
                    templates: count(row.get(3)?),
                    notes: count(row.get(4)?),
                })
            })
            .map_err(map_sqlite_error)?;

        summaries
            .collect::<std::result::Result<_, _>>()
            .map_err(map_sqlite_error)
    }

    fn deck_id(&self, name: &str) -> Result<Option<i64>> {
        self.conn()?
            .query_row("SELECT id FROM decks WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()
            .map_err(map_sqlite_error)
    }

    fn add_deck(&self, name: &str) -> Result<i64> {
        let conn = self.conn()?;
        let id = next_id(conn, "decks")?;
        let mtime = now_millis();

        conn.execute(
            "INSERT INTO decks (id, name, mtime, usn) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, mtime, PENDING_USN],
        )
        .map_err(|e| map_insert_error(e, name))?;
        touch_col(conn, mtime, false)?;

        debug!("Added deck '{name}' with ID: {id}");
        Ok(id)
    }

    fn deck_by_id(&self, id: i64) -> Result<Option<Deck>> {
        self.conn()?
            .query_row("SELECT id, name FROM decks WHERE id = ?1", [id], deck_from_row)
            .optional()
            .map_err(map_sqlite_error)
    }

    fn decks(&self) -> Result<Vec<Deck>> {
        let mut stmt = self
            .conn()?
            .prepare("SELECT id, name FROM decks ORDER BY name ASC")
            .map_err(map_sqlite_error)?;

        let decks = stmt
            .query_map([], deck_from_row)
            .map_err(map_sqlite_error)?;

        decks
            .collect::<std::result::Result<_, _>>()
            .map_err(map_sqlite_error)
    }

    fn add_note(&self, note: &mut Note, deck_id: i64) -> Result<i64> {
        let notetype = self
            .notetype_by_id(note.notetype_id)?
            .ok_or_else(|| CollectionError::ModelNotFound(note.notetype_id.to_string()))?;

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().map_err(map_sqlite_error)?;
        let id = next_id(&tx, "notes")?;
        let mtime = now_millis();

        tx.execute(
            "INSERT INTO notes (id, mid, mod, usn, tags, flds) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                note.notetype_id,
                mtime,
                PENDING_USN,
                join_tags(&note.tags),
                join_fields(&note.fields)
            ],
        )
        .map_err(map_sqlite_error)?;

        let mut card_id = next_id(&tx, "cards")?;
        for template in notetype
            .templates
            .iter()
            .filter(|t| template_applies(&notetype, t, &note.fields))
        {
            tx.execute(
                "INSERT INTO cards (id, nid, did, ord, mod, usn) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![card_id, id, deck_id, template.ord, mtime, PENDING_USN],
            )
            .map_err(map_sqlite_error)?;
            trace!("Generated card {card_id} from template '{}'", template.name);
            card_id += 1;
        }

        touch_col(&tx, mtime, false)?;
        tx.commit().map_err(map_sqlite_error)?;

        note.id = id;
        note.mtime = mtime;
        debug!("Added note with ID: {id}");
        Ok(id)
    }

    fn get_note(&self, id: i64) -> Result<Option<Note>> {
        self.conn()?
            .query_row(
                "SELECT id, mid, mod, tags, flds FROM notes WHERE id = ?1",
                [id],
                note_from_row,
            )
            .optional()
            .map_err(map_sqlite_error)
    }

    fn update_note(&self, note: &mut Note) -> Result<()> {
        let conn = self.conn()?;
        let mtime = now_millis();

        let rows = conn
            .execute(
                "UPDATE notes SET mod = ?1, usn = ?2, tags = ?3, flds = ?4 WHERE id = ?5",
                params![
                    mtime,
                    PENDING_USN,
                    join_tags(&note.tags),
                    join_fields(&note.fields),
                    note.id
                ],
            )
            .map_err(map_sqlite_error)?;
        if rows == 0 {
            return Err(CollectionError::NoteNotFound(note.id));
        }
        touch_col(conn, mtime, false)?;

        note.mtime = mtime;
        debug!("Updated note with ID: {}", note.id);
        Ok(())
    }

    fn remove_notes(&self, ids: &[i64]) -> Result<usize> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().map_err(map_sqlite_error)?;
        let mut removed = 0;

        for id in ids {
            tx.execute(
                "INSERT INTO graves (usn, oid, type) SELECT ?1, id, ?2 FROM cards WHERE nid = ?3",
                params![PENDING_USN, GRAVE_CARD, id],
            )
            .map_err(map_sqlite_error)?;
            tx.execute("DELETE FROM cards WHERE nid = ?1", [id])
                .map_err(map_sqlite_error)?;

            let rows = tx
                .execute("DELETE FROM notes WHERE id = ?1", [id])
                .map_err(map_sqlite_error)?;
            if rows > 0 {
                tx.execute(
                    "INSERT INTO graves (usn, oid, type) VALUES (?1, ?2, ?3)",
                    params![PENDING_USN, id, GRAVE_NOTE],
                )
                .map_err(map_sqlite_error)?;
                removed += rows;
            }
        }

        touch_col(&tx, now_millis(), false)?;
        tx.commit().map_err(map_sqlite_error)?;
        debug!("Removed {removed} note(s)");
        Ok(removed)
    }

    fn cards_of_note(&self, note_id: i64) -> Result<Vec<Card>> {
        let mut stmt = self
            .conn()?
            .prepare("SELECT id, nid, did, ord FROM cards WHERE nid = ?1 ORDER BY ord ASC, id ASC")
            .map_err(map_sqlite_error)?;

        let cards = stmt
            .query_map([note_id], card_from_row)
            .map_err(map_sqlite_error)?;

        cards
            .collect::<std::result::Result<_, _>>()
            .map_err(map_sqlite_error)
    }

    fn set_deck(&self, card_ids: &[i64], deck_id: i64) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().map_err(map_sqlite_error)?;
        let mtime = now_millis();

        for id in card_ids {
            tx.execute(
                "UPDATE cards SET did = ?1, mod = ?2, usn = ?3 WHERE id = ?4",
                params![deck_id, mtime, PENDING_USN, id],
            )
            .map_err(map_sqlite_error)?;
        }
        touch_col(&tx, mtime, false)?;
        tx.commit().map_err(map_sqlite_error)?;

        trace!("Moved {} card(s) to deck {deck_id}", card_ids.len());
        Ok(())
    }

    fn find_notes(&self, query: &str) -> Result<Vec<i64>> {
        let search = Search::parse(query)?;
        let conn = self.conn()?;

        let mut notetypes: HashMap<i64, (String, Vec<String>)> = HashMap::new();
        let mut stmt = conn
            .prepare(
                "SELECT nt.id, nt.name, f.name FROM notetypes nt
                 LEFT JOIN fields f ON f.ntid = nt.id
                 ORDER BY nt.id, f.ord",
            )
            .map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(map_sqlite_error)?;
        for row in rows {
            let (id, name, field) = row.map_err(map_sqlite_error)?;
            let entry = notetypes.entry(id).or_insert_with(|| (name, Vec::new()));
            entry.1.extend(field);
        }

        let mut decks_by_note: HashMap<i64, Vec<String>> = HashMap::new();
        let mut stmt = conn
            .prepare("SELECT c.nid, d.name FROM cards c JOIN decks d ON d.id = c.did")
            .map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .map_err(map_sqlite_error)?;
        for row in rows {
            let (nid, deck) = row.map_err(map_sqlite_error)?;
            decks_by_note.entry(nid).or_default().push(deck);
        }

        let unknown = (String::new(), Vec::new());
        let no_decks: Vec<String> = Vec::new();
        let mut matches = Vec::new();
        let mut stmt = conn
            .prepare("SELECT id, mid, tags, flds FROM notes ORDER BY id ASC")
            .map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(map_sqlite_error)?;

        for row in rows {
            let (id, mid, tags, flds) = row.map_err(map_sqlite_error)?;
            let (notetype, field_names) = notetypes.get(&mid).unwrap_or(&unknown);
            let tags: Vec<String> = tags.split_whitespace().map(ToString::to_string).collect();
            let fields = split_fields(&flds);
            let candidate = Candidate {
                id,
                notetype,
                field_names,
                fields: &fields,
                tags: &tags,
                decks: decks_by_note.get(&id).unwrap_or(&no_decks),
            };
            if search.matches(&candidate) {
                matches.push(id);
            }
        }

        trace!("Query '{query}' matched {} note(s)", matches.len());
        Ok(matches)
    }

    fn sync_meta(&self) -> Result<SyncMeta> {
        self.conn()?
            .query_row(
                "SELECT mod, scm, usn, ls, NOT EXISTS (SELECT 1 FROM notes) FROM col WHERE id = 1",
                [],
                |row| {
                    Ok(SyncMeta {
                        modified: row.get(0)?,
                        schema_modified: row.get(1)?,
                        usn: row.get(2)?,
                        last_sync: row.get(3)?,
                        empty: row.get(4)?,
                    })
                },
            )
            .map_err(map_sqlite_error)
    }

    fn pending_changes(&self) -> Result<PendingChanges> {
        let conn = self.conn()?;

        let headers: Vec<(i64, String, i64, String)> = pending_rows(
            conn,
            "SELECT id, name, mtime, css FROM notetypes WHERE usn = ?1 ORDER BY id",
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        let notetypes = headers
            .into_iter()
            .map(|header| Self::load_notetype(conn, header))
            .collect::<Result<Vec<_>>>()?;

        let decks = pending_rows(
            conn,
            "SELECT id, name FROM decks WHERE usn = ?1 ORDER BY id",
            deck_from_row,
        )?;
        let notes = pending_rows(
            conn,
            "SELECT id, mid, mod, tags, flds FROM notes WHERE usn = ?1 ORDER BY id",
            note_from_row,
        )?;
        let cards = pending_rows(
            conn,
            "SELECT id, nid, did, ord FROM cards WHERE usn = ?1 ORDER BY id",
            card_from_row,
        )?;
        let graves = pending_rows(
            conn,
            "SELECT oid, type FROM graves WHERE usn = ?1 ORDER BY rowid",
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?
        .into_iter()
        .map(|(oid, kind)| Ok(Grave { oid, kind: grave_kind(kind)? }))
        .collect::<Result<Vec<_>>>()?;

        let changes = PendingChanges {
            notetypes,
            decks,
            notes,
            cards,
            graves,
        };
        trace!("{} local change(s) pending", changes.len());
        Ok(changes)
    }

    fn mark_synced(&self, server_usn: i64) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().map_err(map_sqlite_error)?;
        let now = now_millis();

        for table in ["notetypes", "decks", "notes", "cards"] {
            tx.execute(
                &format!("UPDATE {table} SET usn = ?1 WHERE usn = ?2"),
                params![server_usn, PENDING_USN],
            )
            .map_err(map_sqlite_error)?;
        }
        tx.execute("DELETE FROM graves", [])
            .map_err(map_sqlite_error)?;
        tx.execute(
            "UPDATE col SET usn = ?1, mod = ?2, ls = ?2 WHERE id = 1",
            params![server_usn, now],
        )
        .map_err(map_sqlite_error)?;
        tx.commit().map_err(map_sqlite_error)?;

        debug!("Recorded sync at server usn {server_usn}");
        Ok(())
    }

    fn close_for_full_sync(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.take() {
            connection.close().map_err(|(_, e)| map_sqlite_error(e))?;
            debug!("Closed collection for full sync: {}", self.path.display());
        }
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        if self.connection.is_none() {
            self.connection = Some(connect(&self.path)?);
            debug!("Reopened collection: {}", self.path.display());
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let mut store = *self;
        if let Some(connection) = store.connection.take() {
            connection.close().map_err(|(_, e)| map_sqlite_error(e))?;
            trace!("Closed collection: {}", store.path.display());
        }
        Ok(())
    }
}
