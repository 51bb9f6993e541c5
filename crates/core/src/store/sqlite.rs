//! SQLite-backed revision store.
//!
//! Provides a [`SqliteStore`] handle with WAL-mode journaling, automatic
//! schema migrations, single-document transactions for the resolution engine,
//! and the application-level document operations a local-first database
//! exposes (save, delete, purge, replicate).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use super::{queries, schema, BlobSource, DocumentTxn, RevisionStore};
use crate::config::StoreConfig;
use crate::errors::StoreError;
use crate::models::{BlobRef, Document, Revision, StoreHandle};

/// Revision store backed by a single SQLite connection.
///
/// The connection is wrapped in a `Mutex` so the store is `Send + Sync` and
/// can be shared through `Arc`. Closing the store drops the connection; every
/// later operation fails with [`StoreError::Closed`].
pub struct SqliteStore {
    handle: StoreHandle,
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store at `path` with default settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let config = StoreConfig {
            path: Some(path.as_ref().to_path_buf()),
            ..StoreConfig::default()
        };
        Self::open_with(&config)
    }

    /// Open a store as described by `config`. Without a path the store lives
    /// in memory.
    pub fn open_with(config: &StoreConfig) -> Result<Self, StoreError> {
        let conn = match &config.path {
            Some(path) => {
                info!(path = %path.display(), "opening revision store");
                let conn = Connection::open(path)?;
                if config.wal {
                    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                }
                conn
            }
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        schema::run_migrations(&conn)?;

        let store = Self {
            handle: StoreHandle::new(),
            conn: Mutex::new(Some(conn)),
        };
        debug!(store = %store.handle, "revision store ready");
        Ok(store)
    }

    /// Open an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open_with(&StoreConfig::default())
    }

    /// Close the store. In-flight transactions finish first.
    pub fn close(&self) {
        let mut guard = self.lock();
        if guard.take().is_some() {
            info!(store = %self.handle, "revision store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// If the Mutex is poisoned (a previous holder panicked), the lock is
    /// recovered rather than propagating a panic.
    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        f(conn)
    }

    // -- application-level operations ---------------------------------------

    /// Save document content as a new revision (generation + 1).
    ///
    /// Every blob the document references must already be held by this store.
    pub fn save(&self, doc: &Document) -> Result<Revision, StoreError> {
        let mut txn = self.begin(&doc.id)?;
        let current = txn.read()?;
        let revision = Revision {
            document_id: doc.id.clone(),
            revision_id: Revision::mint_id(),
            generation: current.as_ref().map_or(0, |r| r.generation) + 1,
            deleted: false,
            body: doc.body.clone(),
            blobs: doc
                .blobs
                .iter()
                .map(|(key, blob)| (key.clone(), BlobRef::new(blob.digest.clone(), self.handle.clone())))
                .collect(),
            owning_store: self.handle.clone(),
            merged_remote: None,
        };
        txn.write(&revision)?;
        txn.commit()?;
        Ok(revision)
    }

    /// Write a tombstone over the document's current revision.
    ///
    /// Returns `None` if the document does not exist or is already deleted.
    pub fn delete(&self, doc_id: &str) -> Result<Option<Revision>, StoreError> {
        let mut txn = self.begin(doc_id)?;
        let current = match txn.read()? {
            Some(rev) if !rev.deleted => rev,
            _ => return Ok(None),
        };
        let tombstone = Revision {
            document_id: doc_id.to_string(),
            revision_id: Revision::mint_id(),
            generation: current.generation + 1,
            deleted: true,
            body: Default::default(),
            blobs: Default::default(),
            owning_store: self.handle.clone(),
            merged_remote: None,
        };
        txn.write(&tombstone)?;
        txn.commit()?;
        Ok(Some(tombstone))
    }

    /// Remove a document entirely. Returns whether it existed.
    pub fn purge(&self, doc_id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| queries::purge_document(conn, doc_id))
    }

    /// Install a revision received from another store verbatim (same id and
    /// generation), copying the blobs it references from `source`.
    pub fn put_revision(
        &self,
        revision: &Revision,
        source: &dyn BlobSource,
    ) -> Result<Revision, StoreError> {
        // Read the source before taking our own lock.
        let contents = revision
            .blobs
            .iter()
            .map(|(key, blob)| -> Result<(String, Vec<u8>), StoreError> {
                let content = source
                    .blob(blob)?
                    .ok_or_else(|| StoreError::BlobNotFound(blob.digest.clone()))?;
                Ok((key.clone(), content))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let mut txn = self.begin(&revision.document_id)?;
        let mut local = revision.clone();
        local.owning_store = self.handle.clone();
        for (key, content) in contents {
            local.blobs.insert(key, txn.put_blob(&content)?);
        }
        txn.write(&local)?;
        txn.commit()?;
        Ok(local)
    }

    /// Current content of a live document.
    pub fn read_document(&self, doc_id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.read(doc_id)?.and_then(|rev| rev.to_document()))
    }

    /// Store blob content and return a reference owned by this store.
    pub fn put_blob(&self, content: &[u8]) -> Result<BlobRef, StoreError> {
        let digest = self.with_conn(|conn| queries::insert_blob(conn, content))?;
        Ok(BlobRef::new(digest, self.handle.clone()))
    }

    /// Number of live (non-deleted) documents.
    pub fn document_count(&self) -> Result<i64, StoreError> {
        self.with_conn(queries::count_live_documents)
    }
}

impl BlobSource for SqliteStore {
    fn handle(&self) -> StoreHandle {
        self.handle.clone()
    }

    fn blob(&self, blob: &BlobRef) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_conn(|conn| queries::load_blob(conn, &blob.digest))
    }
}

impl RevisionStore for SqliteStore {
    fn read(&self, document_id: &str) -> Result<Option<Revision>, StoreError> {
        self.with_conn(|conn| queries::read_revision(conn, &self.handle, document_id))
    }

    fn begin(&self, document_id: &str) -> Result<Box<dyn DocumentTxn + '_>, StoreError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        debug!(document_id, "opened document transaction");
        Ok(Box::new(SqliteTxn {
            guard,
            handle: self.handle.clone(),
            document_id: document_id.to_string(),
            finished: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// A single-document transaction holding the store's connection lock.
struct SqliteTxn<'a> {
    guard: MutexGuard<'a, Option<Connection>>,
    handle: StoreHandle,
    document_id: String,
    finished: bool,
}

impl SqliteTxn<'_> {
    fn conn(&self) -> Result<&Connection, StoreError> {
        self.guard.as_ref().ok_or(StoreError::Closed)
    }

    fn finish(&mut self, sql: &str) -> Result<(), StoreError> {
        self.conn()?.execute_batch(sql)?;
        self.finished = true;
        Ok(())
    }
}

impl DocumentTxn for SqliteTxn<'_> {
    fn read(&mut self) -> Result<Option<Revision>, StoreError> {
        queries::read_revision(self.conn()?, &self.handle, &self.document_id)
    }

    fn write(&mut self, revision: &Revision) -> Result<(), StoreError> {
        queries::write_revision(self.conn()?, revision)?;
        Ok(())
    }

    fn purge(&mut self) -> Result<(), StoreError> {
        queries::purge_document(self.conn()?, &self.document_id)?;
        Ok(())
    }

    fn put_blob(&mut self, content: &[u8]) -> Result<BlobRef, StoreError> {
        let digest = queries::insert_blob(self.conn()?, content)?;
        Ok(BlobRef::new(digest, self.handle.clone()))
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT")?;
        debug!(document_id = %self.document_id, "committed document transaction");
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK")?;
        debug!(document_id = %self.document_id, "aborted document transaction");
        Ok(())
    }
}

impl Drop for SqliteTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Ok(conn) = self.conn() {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    warn!(document_id = %self.document_id, error = %e, "rollback failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, key: &str, value: &str) -> Document {
        let mut doc = Document::new(id);
        doc.set(key, value);
        doc
    }

    #[test]
    fn test_in_memory_store() {
        let store = SqliteStore::in_memory().expect("failed to create in-memory store");
        assert_eq!(store.document_count().unwrap(), 0);
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs.db");
        let store = SqliteStore::open(&path).expect("failed to create file store");
        store.save(&doc("doc1", "k", "v")).unwrap();
        assert!(path.exists());
        assert_eq!(store.document_count().unwrap(), 1);
    }

    #[test]
    fn test_save_increments_generation() {
        let store = SqliteStore::in_memory().unwrap();
        let r1 = store.save(&doc("doc1", "k", "v1")).unwrap();
        let r2 = store.save(&doc("doc1", "k", "v2")).unwrap();
        assert_eq!(r1.generation, 1);
        assert_eq!(r2.generation, 2);
        assert_ne!(r1.revision_id, r2.revision_id);

        let current = store.read_document("doc1").unwrap().unwrap();
        assert_eq!(current.get_string("k"), Some("v2"));
    }

    #[test]
    fn test_delete_writes_tombstone() {
        let store = SqliteStore::in_memory().unwrap();
        store.save(&doc("doc1", "k", "v")).unwrap();
        let tomb = store.delete("doc1").unwrap().unwrap();
        assert!(tomb.deleted);
        assert_eq!(tomb.generation, 2);
        assert!(store.read("doc1").unwrap().unwrap().deleted);
        assert!(store.read_document("doc1").unwrap().is_none());
        assert!(store.delete("doc1").unwrap().is_none());
    }

    #[test]
    fn test_purge_removes_document() {
        let store = SqliteStore::in_memory().unwrap();
        store.save(&doc("doc1", "k", "v")).unwrap();
        assert!(store.purge("doc1").unwrap());
        assert!(store.read("doc1").unwrap().is_none());
    }

    #[test]
    fn test_transaction_rollback_on_drop() {
        let store = SqliteStore::in_memory().unwrap();
        let original = store.save(&doc("doc1", "k", "v")).unwrap();
        {
            let mut txn = store.begin("doc1").unwrap();
            txn.purge().unwrap();
        }
        let current = store.read("doc1").unwrap().unwrap();
        assert_eq!(current.revision_id, original.revision_id);
    }

    #[test]
    fn test_transaction_abort() {
        let store = SqliteStore::in_memory().unwrap();
        let original = store.save(&doc("doc1", "k", "v")).unwrap();
        let mut txn = store.begin("doc1").unwrap();
        txn.purge().unwrap();
        txn.abort().unwrap();
        assert_eq!(
            store.read("doc1").unwrap().unwrap().revision_id,
            original.revision_id
        );
    }

    #[test]
    fn test_put_revision_copies_blobs() {
        let remote = SqliteStore::in_memory().unwrap();
        let local = SqliteStore::in_memory().unwrap();

        let blob = remote.put_blob(b"attachment").unwrap();
        let mut d = doc("doc1", "k", "v");
        d.set_blob("att", blob);
        let rev = remote.save(&d).unwrap();

        let installed = local.put_revision(&rev, &remote).unwrap();
        assert_eq!(installed.revision_id, rev.revision_id);
        assert_eq!(installed.generation, rev.generation);

        let read = local.read("doc1").unwrap().unwrap();
        let att = read.blobs.get("att").unwrap();
        assert_eq!(att.owning_store, local.handle());
        assert_eq!(local.blob(att).unwrap().as_deref(), Some(&b"attachment"[..]));
    }

    #[test]
    fn test_replication_in_both_directions_does_not_block() {
        use std::sync::{mpsc, Arc, Barrier};
        use std::time::Duration;

        let a = Arc::new(SqliteStore::in_memory().unwrap());
        let b = Arc::new(SqliteStore::in_memory().unwrap());
        let barrier = Arc::new(Barrier::new(2));
        let (done_tx, done_rx) = mpsc::channel();

        for (target, source, doc_id) in [(a.clone(), b.clone(), "from-b"), (b, a, "from-a")] {
            let barrier = barrier.clone();
            let done_tx = done_tx.clone();
            std::thread::spawn(move || {
                let mut d = doc(doc_id, "k", "v");
                d.set_blob("att", source.put_blob(doc_id.as_bytes()).unwrap());
                let rev = source.save(&d).unwrap();
                barrier.wait();
                for _ in 0..500 {
                    target.put_revision(&rev, &*source).unwrap();
                }
                done_tx.send(doc_id).unwrap();
            });
        }
        drop(done_tx);

        for _ in 0..2 {
            done_rx
                .recv_timeout(Duration::from_secs(30))
                .expect("replication in both directions did not finish");
        }
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let store = SqliteStore::in_memory().unwrap();
        store.close();
        assert!(store.is_closed());
        assert!(matches!(store.read("doc1"), Err(StoreError::Closed)));
        assert!(matches!(store.begin("doc1"), Err(StoreError::Closed)));
        assert!(matches!(store.save(&doc("doc1", "k", "v")), Err(StoreError::Closed)));
    }
}
