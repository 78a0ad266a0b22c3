//! Creating, reading, updating and deleting notes.
//!
//! Note types are never created here; a note naming an unknown note type fails with
//! `ModelNotFound`. Decks are created on demand. Field names the note type does not
//! declare are ignored rather than rejected.
//!
//! Tags are added to on creation but replaced wholesale on update.

use crate::decks::ensure_deck;
use crate::{Collection, CollectionError, Note, NoteType, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Input for [`add_note`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNote {
    pub model_name: String,
    pub deck_name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Input for [`update_note`]. A missing `tags` list clears the note's tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteUpdate {
    pub id: i64,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deck_name: Option<String>,
}

/// A note as returned by [`get_note`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteView {
    pub id: i64,
    pub model_name: String,
    pub fields: BTreeMap<String, String>,
    pub tags: Vec<String>,
    /// Deck of the note's first card, if it has any
    pub deck_name: Option<String>,
}

fn notetype_of(col: &Collection, note: &Note) -> Result<NoteType> {
    col.notetype_by_id(note.notetype_id)?
        .ok_or_else(|| CollectionError::ModelNotFound(note.notetype_id.to_string()))
}

// Only fields declared by the note type are written
fn assign_fields(notetype: &NoteType, note: &mut Note, fields: &BTreeMap<String, String>) {
    for (name, value) in fields {
        match notetype.field_index(name) {
            Some(idx) => note.set_field(idx, value),
            None => debug!("Ignoring field '{name}' unknown to '{}'", notetype.name),
        }
    }
}

/// Adds a note to `deck_name`, creating the deck if needed. Returns the new note id
///
/// # Errors
///
/// `ModelNotFound` if no note type is called `model_name`, `InvalidDefinition` for a
/// blank deck name, or a store error
pub fn add_note(col: &Collection, new: &NewNote) -> Result<i64> {
    let notetype = col
        .notetype_by_name(&new.model_name)?
        .ok_or_else(|| CollectionError::ModelNotFound(new.model_name.clone()))?;
    let deck_id = ensure_deck(col, &new.deck_name)?;

    let mut note = Note::new(&notetype);
    assign_fields(&notetype, &mut note, &new.fields);
    for tag in &new.tags {
        note.add_tag(tag);
    }

    let id = col.add_note(&mut note, deck_id)?;
    info!("Added note {id} to deck '{}'", new.deck_name);
    Ok(id)
}

/// Overwrites the given fields, replaces the tags, and optionally moves all cards of the
/// note to another deck
///
/// # Errors
///
/// `NoteNotFound` if there is no note with that id, or a store error
pub fn update_note(col: &Collection, update: &NoteUpdate) -> Result<()> {
    let mut note = col
        .get_note(update.id)?
        .ok_or(CollectionError::NoteNotFound(update.id))?;
    let notetype = notetype_of(col, &note)?;
    // Resolved up front so a bad deck name leaves the note untouched
    let target_deck = match &update.deck_name {
        Some(name) => Some((name, ensure_deck(col, name)?)),
        None => None,
    };

    assign_fields(&notetype, &mut note, &update.fields);
    note.set_tags(&update.tags);
    col.update_note(&mut note)?;

    if let Some((deck_name, deck_id)) = target_deck {
        let card_ids: Vec<i64> = col.cards_of_note(note.id)?.iter().map(|c| c.id).collect();
        if card_ids.is_empty() {
            debug!("Note {} has no cards to move", note.id);
        } else {
            col.set_deck(&card_ids, deck_id)?;
            info!("Moved {} card(s) of note {} to '{deck_name}'", card_ids.len(), note.id);
        }
    }
    Ok(())
}

/// Removes a note and its cards
///
/// # Errors
///
/// `NoteNotFound` if there is no note with that id, or a store error
pub fn delete_note(col: &Collection, id: i64) -> Result<()> {
    if col.remove_notes(&[id])? == 0 {
        return Err(CollectionError::NoteNotFound(id));
    }
    info!("Deleted note {id}");
    Ok(())
}

/// Loads a note with its note type name, fields, tags and current deck
///
/// # Errors
///
/// `NoteNotFound` if there is no note with that id, or a store error
pub fn get_note(col: &Collection, id: i64) -> Result<NoteView> {
    let note = col.get_note(id)?.ok_or(CollectionError::NoteNotFound(id))?;
    let notetype = notetype_of(col, &note)?;

    // Records older than a field simply lack it
    let fields = notetype
        .field_names()
        .zip(&note.fields)
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect();

    let deck_name = match col.cards_of_note(id)?.first() {
        Some(card) => col.deck_by_id(card.deck_id)?.map(|d| d.name),
        None => None,
    };

    Ok(NoteView {
        id: note.id,
        model_name: notetype.name,
        fields,
        tags: note.tags.into_iter().collect(),
        deck_name,
    })
}
