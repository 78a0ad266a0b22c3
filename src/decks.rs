use crate::{Collection, CollectionError, Deck, Result};
use log::info;

/// Returns the id of the deck called `name`, creating it first if needed
///
/// # Errors
///
/// `InvalidDefinition` if the name is blank, or a store error
pub fn ensure_deck(col: &Collection, name: &str) -> Result<i64> {
    if name.trim().is_empty() {
        return Err(CollectionError::InvalidDefinition(
            "deck name is empty".to_string(),
        ));
    }

    if let Some(id) = col.deck_id(name)? {
        return Ok(id);
    }
    let id = col.add_deck(name)?;
    info!("Created deck '{name}' with ID: {id}");
    Ok(id)
}

/// All decks, sorted by name
///
/// # Errors
///
/// Returns an error if the store query fails
pub fn list_decks(col: &Collection) -> Result<Vec<Deck>> {
    col.decks()
}
