//! Domain model types shared by the store, the resolution pipeline and the
//! notification layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::ResolutionError;

// ---------------------------------------------------------------------------
// Store identity
// ---------------------------------------------------------------------------

/// Opaque identity of a revision store.
///
/// Two handles compare equal only if they name the same store instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreHandle(Uuid);

impl StoreHandle {
    /// Mint a new, unique store identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StoreHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Blobs
// ---------------------------------------------------------------------------

/// A reference to content-addressed binary data held by a particular store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobRef {
    /// Hex-encoded SHA-256 of the blob content.
    pub digest: String,
    /// The store the bytes physically live in.
    pub owning_store: StoreHandle,
}

impl BlobRef {
    pub fn new(digest: impl Into<String>, owning_store: StoreHandle) -> Self {
        Self {
            digest: digest.into(),
            owning_store,
        }
    }

    /// Compute the digest for a blob's content.
    pub fn digest_of(content: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(content))
    }

    /// Same content, regardless of which store holds it.
    pub fn same_content(&self, other: &BlobRef) -> bool {
        self.digest == other.digest
    }
}

// ---------------------------------------------------------------------------
// Revisions
// ---------------------------------------------------------------------------

/// One revision of a document as held by a store.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub document_id: String,
    /// Opaque id, unique within the document's history, ordered as a string.
    pub revision_id: String,
    /// Depth of this revision in the document's history (>= 1).
    pub generation: u64,
    /// Whether this revision is a tombstone.
    pub deleted: bool,
    pub body: Map<String, Value>,
    /// Blob attachments keyed by property name.
    pub blobs: BTreeMap<String, BlobRef>,
    pub owning_store: StoreHandle,
    /// For revisions written by a conflict resolution: the remote revision id
    /// that was merged in.
    pub merged_remote: Option<String>,
}

impl Revision {
    /// Mint a fresh revision id.
    pub fn mint_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// A resolver-facing copy of this revision, or `None` for a tombstone.
    pub fn to_document(&self) -> Option<Document> {
        if self.deleted {
            return None;
        }
        Some(Document {
            id: self.document_id.clone(),
            body: self.body.clone(),
            blobs: self.blobs.clone(),
            owning_store: Some(self.owning_store.clone()),
            source_revision: Some(self.revision_id.clone()),
        })
    }

    /// Whether `doc` carries exactly this revision's content.
    pub fn has_content_of(&self, doc: &Document) -> bool {
        !self.deleted
            && self.body == doc.body
            && self.blobs.len() == doc.blobs.len()
            && self
                .blobs
                .iter()
                .zip(doc.blobs.iter())
                .all(|((ka, a), (kb, b))| ka == kb && a.same_content(b))
    }
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Document content as seen and produced by resolvers.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub body: Map<String, Value>,
    pub blobs: BTreeMap<String, BlobRef>,
    /// The store this instance was read from; `None` for documents built from
    /// scratch.
    pub owning_store: Option<StoreHandle>,
    /// The revision this instance was read from.
    pub source_revision: Option<String>,
}

impl Document {
    /// An empty, store-less document.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: Map::new(),
            blobs: BTreeMap::new(),
            owning_store: None,
            source_revision: None,
        }
    }

    /// Build a store-less document from a JSON object.
    pub fn with_body(id: impl Into<String>, body: Map<String, Value>) -> Self {
        let mut doc = Self::new(id);
        doc.body = body;
        doc
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.body.insert(key.into(), value.into());
        self
    }

    pub fn blob(&self, key: &str) -> Option<&BlobRef> {
        self.blobs.get(key)
    }

    pub fn set_blob(&mut self, key: impl Into<String>, blob: BlobRef) -> &mut Self {
        self.blobs.insert(key.into(), blob);
        self
    }

    /// Number of properties, blobs included.
    pub fn property_count(&self) -> usize {
        self.body.len() + self.blobs.len()
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Flags attached to a replication event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFlags {
    /// The resolved document is a tombstone.
    pub deleted: bool,
}

impl DocumentFlags {
    pub fn deleted() -> Self {
        Self { deleted: true }
    }
}

/// The result of a successful commit of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub document_id: String,
    pub flags: DocumentFlags,
    /// The local current revision after the commit, if the document exists.
    pub revision_id: Option<String>,
    /// Whether the local store now holds a revision the remote peer has not
    /// seen.
    pub needs_push: bool,
}

/// Terminal event published once per resolved conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentReplication {
    pub document_id: String,
    pub flags: DocumentFlags,
    pub error: Option<ResolutionError>,
}
