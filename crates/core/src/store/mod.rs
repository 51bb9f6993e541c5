//! Revision store capabilities consumed by the resolution engine.
//!
//! The engine never talks to a concrete database. It is handed a
//! [`RevisionStore`] for the local side and a [`BlobSource`] for the remote
//! peer, and performs every mutation through a single-document
//! [`DocumentTxn`]. [`SqliteStore`] is the reference implementation.

pub mod queries;
pub mod schema;
pub mod sqlite;

use crate::errors::StoreError;
use crate::models::{BlobRef, Revision, StoreHandle};

pub use sqlite::SqliteStore;

/// Read access to the blobs held by a store.
pub trait BlobSource: Send + Sync {
    /// Identity of this store.
    fn handle(&self) -> StoreHandle;

    /// Fetch the bytes of a blob held by this store.
    fn blob(&self, blob: &BlobRef) -> Result<Option<Vec<u8>>, StoreError>;
}

/// A document store that keeps one current revision per document.
pub trait RevisionStore: BlobSource {
    /// Read the current revision of a document, tombstones included.
    /// Returns `None` if the document does not exist (or was purged).
    fn read(&self, document_id: &str) -> Result<Option<Revision>, StoreError>;

    /// Open a transaction scoped to a single document.
    fn begin(&self, document_id: &str) -> Result<Box<dyn DocumentTxn + '_>, StoreError>;
}

/// A transaction over one document.
///
/// Dropping an unfinished transaction rolls it back.
pub trait DocumentTxn {
    /// Read the document's current revision inside the transaction.
    fn read(&mut self) -> Result<Option<Revision>, StoreError>;

    /// Replace the document's current revision.
    ///
    /// Every blob the revision references must already be held by this store.
    fn write(&mut self, revision: &Revision) -> Result<(), StoreError>;

    /// Remove every trace of the document.
    fn purge(&mut self) -> Result<(), StoreError>;

    /// Store blob content, returning a reference owned by this store.
    fn put_blob(&mut self, content: &[u8]) -> Result<BlobRef, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn abort(self: Box<Self>) -> Result<(), StoreError>;
}
