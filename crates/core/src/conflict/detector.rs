//! The conflict snapshot handed to resolvers.
//!
//! The storage layer's revision-tree diffing decides *that* two revisions
//! diverged; [`Conflict::detect`] only filters out the divergences that need
//! no resolution at all.

use tracing::debug;

use crate::models::{Document, Revision};

/// Two divergent revisions of the same document.
///
/// A side is `None` when the document does not exist in that store. At least
/// one side is present.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub document_id: String,
    pub local: Option<Revision>,
    pub remote: Option<Revision>,
}

impl Conflict {
    pub fn new(
        document_id: impl Into<String>,
        local: Option<Revision>,
        remote: Option<Revision>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            local,
            remote,
        }
    }

    /// Build a conflict only if the two sides actually need resolving.
    pub fn detect(
        document_id: impl Into<String>,
        local: Option<Revision>,
        remote: Option<Revision>,
    ) -> Option<Self> {
        let conflict = Self::new(document_id, local, remote);
        if conflict.is_settled() {
            debug!(document_id = %conflict.document_id, "divergence needs no resolution");
            return None;
        }
        Some(conflict)
    }

    /// The local side as document content; `None` if absent or deleted.
    pub fn local_document(&self) -> Option<Document> {
        self.local.as_ref().and_then(Revision::to_document)
    }

    /// The remote side as document content; `None` if absent or deleted.
    pub fn remote_document(&self) -> Option<Document> {
        self.remote.as_ref().and_then(Revision::to_document)
    }

    pub fn is_local_deleted(&self) -> bool {
        self.local.as_ref().map_or(true, |r| r.deleted)
    }

    pub fn is_remote_deleted(&self) -> bool {
        self.remote.as_ref().map_or(true, |r| r.deleted)
    }

    /// Both sides are deletions (or absent).
    pub fn both_deleted(&self) -> bool {
        self.is_local_deleted() && self.is_remote_deleted()
    }

    /// The local side already equals, or has already merged, the remote side.
    pub fn is_merged(&self) -> bool {
        match (&self.local, &self.remote) {
            (Some(local), Some(remote)) => {
                local.revision_id == remote.revision_id
                    || local.merged_remote.as_deref() == Some(remote.revision_id.as_str())
            }
            _ => false,
        }
    }

    /// Nothing is left to resolve.
    pub fn is_settled(&self) -> bool {
        self.both_deleted() || self.is_merged()
    }

    /// The highest generation on either side (0 if both are absent).
    pub fn max_generation(&self) -> u64 {
        let local = self.local.as_ref().map_or(0, |r| r.generation);
        let remote = self.remote.as_ref().map_or(0, |r| r.generation);
        local.max(remote)
    }
}
