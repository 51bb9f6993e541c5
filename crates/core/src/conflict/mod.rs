//! Conflict description, resolution policies, validation and commit.
//!
//! The conflict subsystem is responsible for:
//! 1. **Description** -- the immutable [`Conflict`] snapshot handed to resolvers.
//! 2. **Resolution** -- invoking a custom [`ConflictResolver`] or the
//!    coordination-free [`DefaultPolicy`].
//! 3. **Validation** -- checking that blobs in the winning content are reachable.
//! 4. **Commit** -- applying the outcome atomically, detecting re-conflicts.

pub mod blobs;
pub mod committer;
pub mod detector;
pub mod policy;
pub mod resolver;

pub use blobs::BlobValidator;
pub use committer::{CommitDecision, Committer};
pub use detector::Conflict;
pub use policy::{DefaultPolicy, Side};
pub use resolver::{ConflictResolver, Resolution, ResolverInvoker};
