//! Reachability check for blobs in resolved content.

use tracing::warn;

use crate::errors::ResolutionError;
use crate::models::{Document, StoreHandle};

/// Checks that every blob in a candidate document can be written locally.
///
/// A blob is reachable if the destination store holds it, or if it belongs to
/// the remote revision's store (its bytes are copied over at commit time).
pub struct BlobValidator;

impl BlobValidator {
    pub fn validate(
        candidate: &Document,
        local: &StoreHandle,
        remote: &StoreHandle,
    ) -> Result<(), ResolutionError> {
        for (key, blob) in &candidate.blobs {
            if blob.owning_store != *local && blob.owning_store != *remote {
                warn!(
                    document_id = %candidate.id,
                    key = %key,
                    owner = %blob.owning_store,
                    "blob belongs to an unrelated store"
                );
                return Err(ResolutionError::UnexpectedError(format!(
                    "blob '{key}' of document '{}' belongs to store {} which is neither \
                     the local nor the remote store",
                    candidate.id, blob.owning_store
                )));
            }
        }
        Ok(())
    }

    pub fn is_valid(candidate: &Document, local: &StoreHandle, remote: &StoreHandle) -> bool {
        Self::validate(candidate, local, remote).is_ok()
    }
}
