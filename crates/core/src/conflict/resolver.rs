//! Pluggable conflict resolvers and the invoker that isolates them.
//!
//! A resolver is arbitrary application code: it may block, read or mutate the
//! store (including the document being resolved), fail, or panic. The
//! [`ResolverInvoker`] turns every one of those into an explicit outcome.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, info, warn};

use super::Conflict;
use crate::errors::ResolutionError;
use crate::models::Document;

/// The content a resolver decided on.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Persist this content.
    Document(Document),
    /// Delete the document.
    Tombstone,
}

impl From<Document> for Resolution {
    fn from(doc: Document) -> Self {
        Self::Document(doc)
    }
}

impl From<Option<Document>> for Resolution {
    fn from(doc: Option<Document>) -> Self {
        doc.map_or(Self::Tombstone, Self::Document)
    }
}

/// Decides the winning content for a conflict.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &Conflict) -> anyhow::Result<Resolution>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict) -> anyhow::Result<Resolution> + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict) -> anyhow::Result<Resolution> {
        self(conflict)
    }
}

/// Runs resolvers and maps their failures.
pub struct ResolverInvoker;

impl ResolverInvoker {
    /// Invoke `resolver` on `conflict`.
    ///
    /// Errors and panics become [`ResolutionError::UnexpectedError`]. A
    /// returned document with a different id is accepted and re-targeted at the
    /// conflicting document. Documents from foreign stores are passed through;
    /// the committer rejects them.
    pub fn invoke(
        resolver: &dyn ConflictResolver,
        conflict: &Conflict,
        attempt: u32,
    ) -> Result<Resolution, ResolutionError> {
        let document_id = conflict.document_id.as_str();
        info!(document_id, attempt, "invoking conflict resolver");

        let result = catch_unwind(AssertUnwindSafe(|| resolver.resolve(conflict)));

        match result {
            Ok(Ok(Resolution::Document(mut doc))) => {
                if doc.id != conflict.document_id {
                    debug!(
                        document_id,
                        returned_id = %doc.id,
                        "resolver returned a different document id, retargeting"
                    );
                    doc.id = conflict.document_id.clone();
                }
                Ok(Resolution::Document(doc))
            }
            Ok(Ok(Resolution::Tombstone)) => {
                debug!(document_id, "resolver chose deletion");
                Ok(Resolution::Tombstone)
            }
            Ok(Err(e)) => {
                warn!(document_id, attempt, error = %e, "conflict resolver failed");
                Err(ResolutionError::UnexpectedError(format!(
                    "conflict resolver failed: {e:#}"
                )))
            }
            Err(payload) => {
                let detail = panic_message(payload.as_ref());
                warn!(document_id, attempt, panic = %detail, "conflict resolver panicked");
                Err(ResolutionError::UnexpectedError(format!(
                    "conflict resolver panicked: {detail}"
                )))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Revision, StoreHandle};

    fn conflict() -> Conflict {
        let store = StoreHandle::new();
        let side = |id: &str, key: &str| {
            let mut body = serde_json::Map::new();
            body.insert(key.into(), serde_json::Value::from("value"));
            Revision {
                document_id: "doc1".into(),
                revision_id: id.into(),
                generation: 2,
                deleted: false,
                body,
                blobs: Default::default(),
                owning_store: store.clone(),
                merged_remote: None,
            }
        };
        Conflict::new("doc1", Some(side("a", "key1")), Some(side("b", "key2")))
    }

    #[test]
    fn test_returns_chosen_document() {
        let resolver = |c: &Conflict| -> anyhow::Result<Resolution> { Ok(c.remote_document().into()) };
        let outcome = ResolverInvoker::invoke(&resolver, &conflict(), 1).unwrap();
        match outcome {
            Resolution::Document(doc) => assert_eq!(doc.get_string("key2"), Some("value")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_none_means_tombstone() {
        let resolver = |_: &Conflict| -> anyhow::Result<Resolution> { Ok(Resolution::from(None::<Document>)) };
        let outcome = ResolverInvoker::invoke(&resolver, &conflict(), 1).unwrap();
        assert_eq!(outcome, Resolution::Tombstone);
    }

    #[test]
    fn test_wrong_document_id_is_retargeted() {
        let resolver = |_: &Conflict| -> anyhow::Result<Resolution> {
            let mut doc = Document::new("template");
            doc.set("key3", "value3");
            Ok(doc.into())
        };
        let outcome = ResolverInvoker::invoke(&resolver, &conflict(), 1).unwrap();
        match outcome {
            Resolution::Document(doc) => {
                assert_eq!(doc.id, "doc1");
                assert_eq!(doc.get_string("key3"), Some("value3"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_error_becomes_unexpected_error() {
        let resolver = |_: &Conflict| -> anyhow::Result<Resolution> { anyhow::bail!("boom") };
        let err = ResolverInvoker::invoke(&resolver, &conflict(), 1).unwrap_err();
        assert!(matches!(err, ResolutionError::UnexpectedError(ref m) if m.contains("boom")));
    }

    #[test]
    fn test_panic_becomes_unexpected_error() {
        let resolver = |_: &Conflict| -> anyhow::Result<Resolution> { panic!("freak out") };
        let err = ResolverInvoker::invoke(&resolver, &conflict(), 1).unwrap_err();
        assert!(matches!(err, ResolutionError::UnexpectedError(ref m) if m.contains("freak out")));
    }

    #[test]
    fn test_foreign_document_passes_through() {
        let foreign = StoreHandle::new();
        let resolver = move |_: &Conflict| -> anyhow::Result<Resolution> {
            let mut doc = Document::new("doc1");
            doc.owning_store = Some(foreign.clone());
            Ok(doc.into())
        };
        assert!(ResolverInvoker::invoke(&resolver, &conflict(), 1).is_ok());
    }
}
