//! Coordination-free default resolution.
//!
//! Every peer that sees the same pair of revisions picks the same winner, so
//! replicas converge without talking to each other.

use std::cmp::Ordering;

use tracing::debug;

use super::{Conflict, ConflictResolver, Resolution};
use crate::models::Revision;

/// Which side of a conflict won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// The resolver used when the application configures none.
///
/// Rules, in order:
/// 1. If exactly one side is deleted (or absent), the live side wins.
/// 2. Otherwise the higher generation wins.
/// 3. Otherwise the lexicographically greater revision id wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl DefaultPolicy {
    pub fn winner(conflict: &Conflict) -> Side {
        match (conflict.is_local_deleted(), conflict.is_remote_deleted()) {
            (false, true) => return Side::Local,
            (true, false) => return Side::Remote,
            _ => {}
        }

        let generation = |side: &Option<Revision>| {
            side.as_ref().map_or(0, |r| r.generation)
        };
        match generation(&conflict.local).cmp(&generation(&conflict.remote)) {
            Ordering::Greater => return Side::Local,
            Ordering::Less => return Side::Remote,
            Ordering::Equal => {}
        }

        let revision_id = |side: &Option<Revision>| {
            side.as_ref()
                .map(|r| r.revision_id.clone())
                .unwrap_or_default()
        };
        if revision_id(&conflict.local) > revision_id(&conflict.remote) {
            Side::Local
        } else {
            Side::Remote
        }
    }
}

impl ConflictResolver for DefaultPolicy {
    fn resolve(&self, conflict: &Conflict) -> anyhow::Result<Resolution> {
        let side = Self::winner(conflict);
        debug!(document_id = %conflict.document_id, ?side, "default policy picked winner");
        Ok(match side {
            Side::Local => conflict.local_document().into(),
            Side::Remote => conflict.remote_document().into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StoreHandle;

    fn rev(id: &str, generation: u64, deleted: bool) -> Revision {
        let mut body = serde_json::Map::new();
        if !deleted {
            body.insert("rev".into(), serde_json::Value::from(id));
        }
        Revision {
            document_id: "doc1".into(),
            revision_id: id.into(),
            generation,
            deleted,
            body,
            blobs: Default::default(),
            owning_store: StoreHandle::new(),
            merged_remote: None,
        }
    }

    fn conflict(local: Option<Revision>, remote: Option<Revision>) -> Conflict {
        Conflict::new("doc1", local, remote)
    }

    #[test]
    fn test_live_side_beats_deletion() {
        let c = conflict(Some(rev("a", 2, false)), Some(rev("z", 9, true)));
        assert_eq!(DefaultPolicy::winner(&c), Side::Local);

        let c = conflict(Some(rev("z", 9, true)), Some(rev("a", 2, false)));
        assert_eq!(DefaultPolicy::winner(&c), Side::Remote);

        let c = conflict(None, Some(rev("a", 1, false)));
        assert_eq!(DefaultPolicy::winner(&c), Side::Remote);
    }

    #[test]
    fn test_higher_generation_wins() {
        let c = conflict(Some(rev("a", 3, false)), Some(rev("z", 2, false)));
        assert_eq!(DefaultPolicy::winner(&c), Side::Local);

        let c = conflict(Some(rev("z", 2, false)), Some(rev("a", 3, false)));
        assert_eq!(DefaultPolicy::winner(&c), Side::Remote);
    }

    #[test]
    fn test_greater_revision_id_breaks_ties() {
        let c = conflict(Some(rev("abc", 2, false)), Some(rev("abd", 2, false)));
        assert_eq!(DefaultPolicy::winner(&c), Side::Remote);

        let c = conflict(Some(rev("abd", 2, false)), Some(rev("abc", 2, false)));
        assert_eq!(DefaultPolicy::winner(&c), Side::Local);
    }

    #[test]
    fn test_peers_agree_on_winner() {
        let a = rev("abc", 2, false);
        let b = rev("abd", 2, false);
        let here = DefaultPolicy.resolve(&conflict(Some(a.clone()), Some(b.clone()))).unwrap();
        let there = DefaultPolicy.resolve(&conflict(Some(b), Some(a))).unwrap();

        let winning_rev = |r: &Resolution| match r {
            Resolution::Document(doc) => doc.get_string("rev").map(str::to_string),
            Resolution::Tombstone => None,
        };
        assert_eq!(winning_rev(&here).as_deref(), Some("abd"));
        assert_eq!(winning_rev(&here), winning_rev(&there));
    }

    #[test]
    fn test_resolves_to_document_of_winner() {
        let c = conflict(Some(rev("a", 2, false)), Some(rev("b", 2, true)));
        match DefaultPolicy.resolve(&c).unwrap() {
            Resolution::Document(doc) => assert_eq!(doc.source_revision.as_deref(), Some("a")),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }
}
