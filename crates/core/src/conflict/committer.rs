//! Applies a resolution outcome to the local store atomically.
//!
//! The committer re-reads the document inside a single-document transaction
//! and only writes if the local revision is still the one the resolver saw.
//! If the document moved underneath the resolver, the caller is told to
//! retry with a fresh snapshot.
//!
//! Remote blob bytes are fetched before the transaction opens. A transaction
//! holds the local store for its whole lifetime, so reading the remote store
//! inside it would let two sessions syncing in opposite directions wait on
//! each other forever.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use super::{BlobValidator, Conflict, Resolution};
use crate::errors::ResolutionError;
use crate::models::{BlobRef, CommitResult, Document, DocumentFlags, Revision};
use crate::store::{BlobSource, DocumentTxn, RevisionStore};

/// What happened to a commit attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitDecision {
    /// The outcome is durable.
    Committed(CommitResult),
    /// The local document changed since the conflict was captured.
    Retry,
}

/// Remote blob bytes keyed by digest. `None` marks a blob the remote store
/// does not hold.
type Fetched = HashMap<String, Option<Vec<u8>>>;

/// Writes resolution outcomes into `store`, pulling blob bytes from `remote`.
pub struct Committer<'a> {
    store: &'a dyn RevisionStore,
    remote: &'a dyn BlobSource,
}

impl<'a> Committer<'a> {
    pub fn new(store: &'a dyn RevisionStore, remote: &'a dyn BlobSource) -> Self {
        Self { store, remote }
    }

    /// Commit `outcome` as the resolution of `conflict`.
    ///
    /// Every path other than a successful write aborts the transaction.
    pub fn commit(
        &self,
        conflict: &Conflict,
        outcome: Result<Resolution, ResolutionError>,
    ) -> Result<CommitDecision, ResolutionError> {
        let fetched = match &outcome {
            Ok(Resolution::Document(doc)) => self.fetch_remote_blobs(conflict, doc)?,
            _ => Fetched::new(),
        };
        let mut txn = self.store.begin(&conflict.document_id)?;

        match self.stage(txn.as_mut(), conflict, outcome, &fetched) {
            Ok(CommitDecision::Committed(result)) => {
                txn.commit()?;
                info!(
                    document_id = %result.document_id,
                    revision_id = ?result.revision_id,
                    deleted = result.flags.deleted,
                    needs_push = result.needs_push,
                    "conflict resolution committed"
                );
                Ok(CommitDecision::Committed(result))
            }
            other => {
                if let Err(e) = txn.abort() {
                    warn!(document_id = %conflict.document_id, error = %e, "failed to abort transaction");
                }
                other
            }
        }
    }

    fn stage(
        &self,
        txn: &mut (dyn DocumentTxn + '_),
        conflict: &Conflict,
        outcome: Result<Resolution, ResolutionError>,
        fetched: &Fetched,
    ) -> Result<CommitDecision, ResolutionError> {
        let document_id = conflict.document_id.as_str();
        let basis = conflict.local.as_ref();
        let remote = conflict.remote.as_ref();
        let current = txn.read()?;

        if basis.is_some() && current.is_none() {
            warn!(document_id, "document disappeared during resolution");
            return Err(ResolutionError::NotFound(document_id.to_string()));
        }

        let moved =
            current.as_ref().map(|r| &r.revision_id) != basis.map(|r| &r.revision_id);
        if moved {
            let resolved_elsewhere = match (&current, remote) {
                (Some(cur), Some(rem)) => {
                    cur.revision_id == rem.revision_id
                        || cur.merged_remote.as_deref() == Some(rem.revision_id.as_str())
                }
                _ => false,
            };
            if !resolved_elsewhere {
                debug!(document_id, "local revision changed during resolution, retrying");
                return Ok(CommitDecision::Retry);
            }
            info!(
                document_id,
                "remote revision already merged by another session, last write wins"
            );
        }

        let (revision, needs_push) = match outcome? {
            Resolution::Tombstone => self.tombstone(conflict, current.as_ref()),
            Resolution::Document(doc) => {
                let (revision, needs_push) = self.live(conflict, current.as_ref(), doc)?;
                (Some(self.localize(txn, revision, fetched)?), needs_push)
            }
        };

        let written = match revision {
            Some(revision) => {
                if current.as_ref().map(|r| &r.revision_id) != Some(&revision.revision_id) {
                    txn.write(&revision)?;
                }
                Some(revision)
            }
            None => current,
        };

        Ok(CommitDecision::Committed(CommitResult {
            document_id: document_id.to_string(),
            flags: DocumentFlags {
                deleted: written.as_ref().map_or(true, |r| r.deleted),
            },
            revision_id: written.map(|r| r.revision_id),
            needs_push,
        }))
    }

    /// The deletion revision to write, if any.
    fn tombstone(&self, conflict: &Conflict, current: Option<&Revision>) -> (Option<Revision>, bool) {
        let local_dead = current.map_or(true, |r| r.deleted);
        match conflict.remote.as_ref() {
            Some(remote) if remote.deleted => {
                if local_dead {
                    (None, false)
                } else {
                    let mut adopted = remote.clone();
                    adopted.owning_store = self.store.handle();
                    (Some(adopted), false)
                }
            }
            None if local_dead => (None, false),
            _ => {
                let tombstone = Revision {
                    document_id: conflict.document_id.clone(),
                    revision_id: Revision::mint_id(),
                    generation: next_generation(conflict, current),
                    deleted: true,
                    body: Default::default(),
                    blobs: BTreeMap::new(),
                    owning_store: self.store.handle(),
                    merged_remote: conflict.remote.as_ref().map(|r| r.revision_id.clone()),
                };
                (Some(tombstone), true)
            }
        }
    }

    /// The live revision to write for `doc`, with blob refs not yet localized.
    fn live(
        &self,
        conflict: &Conflict,
        current: Option<&Revision>,
        doc: Document,
    ) -> Result<(Revision, bool), ResolutionError> {
        let local = self.store.handle();
        let remote = self.remote.handle();

        if let Some(owner) = &doc.owning_store {
            if *owner != local && *owner != remote {
                warn!(document_id = %conflict.document_id, owner = %owner, "resolved document belongs to another store");
                return Err(ResolutionError::UnexpectedError(format!(
                    "resolved document '{}' belongs to store {owner}, which is neither the local nor the remote store",
                    conflict.document_id
                )));
            }
        }
        BlobValidator::validate(&doc, &local, &remote)?;

        if let Some(rem) = conflict.remote.as_ref() {
            let verbatim = doc.source_revision.as_deref() == Some(rem.revision_id.as_str())
                && rem.has_content_of(&doc);
            if verbatim {
                debug!(document_id = %conflict.document_id, revision_id = %rem.revision_id, "adopting remote revision");
                return Ok((rem.clone(), false));
            }
        }

        let revision = Revision {
            document_id: conflict.document_id.clone(),
            revision_id: Revision::mint_id(),
            generation: next_generation(conflict, current),
            deleted: false,
            body: doc.body,
            blobs: doc.blobs,
            owning_store: local,
            merged_remote: conflict.remote.as_ref().map(|r| r.revision_id.clone()),
        };
        Ok((revision, true))
    }

    /// Read the bytes of every remote-owned blob `doc` references, plus those
    /// of the remote revision when `doc` may be adopted as it. Blobs of any
    /// other store are left to the validator.
    fn fetch_remote_blobs(
        &self,
        conflict: &Conflict,
        doc: &Document,
    ) -> Result<Fetched, ResolutionError> {
        let remote = self.remote.handle();
        let adoptable = conflict
            .remote
            .as_ref()
            .filter(|rem| doc.source_revision.as_deref() == Some(rem.revision_id.as_str()));
        let candidates = doc
            .blobs
            .iter()
            .chain(adoptable.into_iter().flat_map(|r| r.blobs.iter()));

        let mut fetched = Fetched::new();
        for (key, blob) in candidates {
            if blob.owning_store != remote || fetched.contains_key(&blob.digest) {
                continue;
            }
            let content = self.remote.blob(blob).map_err(|e| {
                ResolutionError::UnexpectedError(format!(
                    "failed to read blob '{key}' from the remote store: {e}"
                ))
            })?;
            fetched.insert(blob.digest.clone(), content);
        }
        Ok(fetched)
    }

    /// Re-home every blob of `revision` in the local store, copying bytes
    /// fetched from the remote store.
    fn localize(
        &self,
        txn: &mut (dyn DocumentTxn + '_),
        mut revision: Revision,
        fetched: &Fetched,
    ) -> Result<Revision, ResolutionError> {
        let local = self.store.handle();
        let mut blobs = BTreeMap::new();
        for (key, blob) in std::mem::take(&mut revision.blobs) {
            let localized = if blob.owning_store == local {
                blob
            } else {
                let content = fetched
                    .get(&blob.digest)
                    .and_then(Option::as_deref)
                    .ok_or_else(|| {
                        ResolutionError::UnexpectedError(format!(
                            "blob '{key}' ({}) is missing from the remote store",
                            blob.digest
                        ))
                    })?;
                let copied: BlobRef = txn.put_blob(content)?;
                debug!(document_id = %revision.document_id, key = %key, digest = %copied.digest, "copied remote blob");
                copied
            };
            blobs.insert(key, localized);
        }
        revision.blobs = blobs;
        revision.owning_store = local;
        Ok(revision)
    }
}

fn next_generation(conflict: &Conflict, current: Option<&Revision>) -> u64 {
    let current = current.map_or(0, |r| r.generation);
    conflict.max_generation().max(current) + 1
}
