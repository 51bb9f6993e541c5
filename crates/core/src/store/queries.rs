//! Typed query helpers for the `documents` and `blobs` tables.
//!
//! Every helper takes a plain [`Connection`] so it can run either inside a
//! document transaction or directly against the store.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::StoreError;
use crate::models::{BlobRef, Revision, StoreHandle};

/// Raw `documents` row before JSON decoding.
type DocumentRow = (String, i64, bool, String, String, Option<String>);

/// Read the current revision of `doc_id`, attributing it (and its blobs) to
/// `store`.
pub fn read_revision(
    conn: &Connection,
    store: &StoreHandle,
    doc_id: &str,
) -> Result<Option<Revision>, StoreError> {
    let row: Option<DocumentRow> = conn
        .query_row(
            "SELECT revision_id, generation, deleted, body, blobs, merged_remote
             FROM documents WHERE doc_id = ?1",
            params![doc_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;

    let Some((revision_id, generation, deleted, body, blobs, merged_remote)) = row else {
        return Ok(None);
    };

    let body: Map<String, Value> = serde_json::from_str(&body)?;
    let digests: BTreeMap<String, String> = serde_json::from_str(&blobs)?;
    let blobs = digests
        .into_iter()
        .map(|(key, digest)| (key, BlobRef::new(digest, store.clone())))
        .collect();

    Ok(Some(Revision {
        document_id: doc_id.to_string(),
        revision_id,
        generation: generation as u64,
        deleted,
        body,
        blobs,
        owning_store: store.clone(),
        merged_remote,
    }))
}

/// Insert or replace the current revision of a document.
///
/// Fails with [`StoreError::BlobNotFound`] if a referenced blob is not held by
/// this store.
pub fn write_revision(conn: &Connection, revision: &Revision) -> Result<i64, StoreError> {
    for blob in revision.blobs.values() {
        if !blob_exists(conn, &blob.digest)? {
            return Err(StoreError::BlobNotFound(blob.digest.clone()));
        }
    }

    let digests: BTreeMap<&str, &str> = revision
        .blobs
        .iter()
        .map(|(key, blob)| (key.as_str(), blob.digest.as_str()))
        .collect();
    let body = serde_json::to_string(&revision.body)?;
    let blobs = serde_json::to_string(&digests)?;

    let sequence: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM documents",
        [],
        |row| row.get(0),
    )?;
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT OR REPLACE INTO documents
            (doc_id, revision_id, generation, deleted, body, blobs, merged_remote, sequence, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            revision.document_id,
            revision.revision_id,
            revision.generation as i64,
            revision.deleted,
            body,
            blobs,
            revision.merged_remote,
            sequence,
            now
        ],
    )?;
    debug!(
        document_id = %revision.document_id,
        revision_id = %revision.revision_id,
        generation = revision.generation,
        deleted = revision.deleted,
        sequence,
        "wrote revision"
    );
    Ok(sequence)
}

/// Delete a document row entirely. Returns whether a row existed.
pub fn purge_document(conn: &Connection, doc_id: &str) -> Result<bool, StoreError> {
    let changed = conn.execute("DELETE FROM documents WHERE doc_id = ?1", params![doc_id])?;
    debug!(document_id = doc_id, purged = changed > 0, "purged document");
    Ok(changed > 0)
}

/// Store blob content (idempotent) and return its digest.
pub fn insert_blob(conn: &Connection, content: &[u8]) -> Result<String, StoreError> {
    let digest = BlobRef::digest_of(content);
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT OR IGNORE INTO blobs (digest, content, length, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![digest, content, content.len() as i64, now],
    )?;
    Ok(digest)
}

pub fn load_blob(conn: &Connection, digest: &str) -> Result<Option<Vec<u8>>, StoreError> {
    let content = conn
        .query_row(
            "SELECT content FROM blobs WHERE digest = ?1",
            params![digest],
            |row| row.get(0),
        )
        .optional()?;
    Ok(content)
}

pub fn blob_exists(conn: &Connection, digest: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM blobs WHERE digest = ?1",
        params![digest],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Number of documents whose current revision is not a tombstone.
pub fn count_live_documents(conn: &Connection) -> Result<i64, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM documents WHERE deleted = 0",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}
