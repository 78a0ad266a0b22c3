use crate::backends::SqliteStore;
use crate::{CollectionStore, Result};
use log::{trace, warn};
use std::ops::{Deref, DerefMut};
use std::path::Path;

/// An open collection. Only one handle should be live per collection file at a time.
///
/// The handle is released when dropped, so an early return or a panic inside an
/// operation never leaves the file locked. Use [`Collection::close`] to observe
/// close failures.
pub struct Collection {
    store: Box<dyn CollectionStore>,
}

impl Collection {
    /// Opens an existing collection file.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the file is missing, is not a collection, or is locked
    /// by another handle.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = SqliteStore::open(path.as_ref())?;
        Ok(Self::from_store(Box::new(store)))
    }

    /// Creates a new, empty collection file and opens it.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` if the path already exists or cannot be written.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let store = SqliteStore::create(path.as_ref())?;
        Ok(Self::from_store(Box::new(store)))
    }

    /// Wraps any store implementation in a handle
    #[must_use]
    pub fn from_store(store: Box<dyn CollectionStore>) -> Self {
        trace!("Acquired collection handle: {}", store.path().display());
        Self { store }
    }

    /// Releases the handle
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be closed cleanly
    pub fn close(self) -> Result<()> {
        trace!("Releasing collection handle: {}", self.store.path().display());
        self.store.close()
    }
}

impl Deref for Collection {
    type Target = dyn CollectionStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

impl DerefMut for Collection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.store.as_mut()
    }
}

/// Opens the collection at `path`, runs `operation` on it, and releases the handle
/// on every exit path.
///
/// If both the operation and the close fail, the operation's error is returned.
///
/// # Errors
///
/// `StorageUnavailable` if the collection cannot be opened, otherwise whatever the
/// operation or the close returns.
pub fn with_collection<P, T, F>(path: P, operation: F) -> Result<T>
where
    P: AsRef<Path>,
    F: FnOnce(&mut Collection) -> Result<T>,
{
    let mut col = Collection::open(path)?;
    let outcome = operation(&mut col);
    let closed = col.close();

    match (outcome, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!("Failed closing collection after an error: {close_err}");
            Err(e)
        }
    }
}
