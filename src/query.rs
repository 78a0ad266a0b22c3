use crate::{Collection, Result};
use log::debug;

/// Runs `query` against the collection and returns the ids of matching notes.
///
/// The syntax belongs to the store; see [`crate::backends::search`] for the one
/// understood by the SQLite store.
///
/// # Errors
///
/// `QuerySyntaxError` for a malformed query, or a store error
pub fn find_notes(col: &Collection, query: &str) -> Result<Vec<i64>> {
    let ids = col.find_notes(query)?;
    debug!("Found {} note(s) for '{query}'", ids.len());
    Ok(ids)
}
