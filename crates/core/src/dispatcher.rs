//! Per-document scheduling of conflict resolutions.
//!
//! The [`Dispatcher`] keeps at most one resolution in flight per document id.
//! Distinct documents resolve concurrently on the tokio runtime; resolver
//! calls and store transactions run on the blocking pool because resolvers
//! are arbitrary application code that may block.
//!
//! A submission for a document that is already being resolved is queued.
//! When the running resolution finishes, the queued work is replayed against
//! the document's freshly read local revision. Several queued submissions for
//! the same document coalesce into a single follow-up resolution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use crate::config::ResolutionConfig;
use crate::conflict::{
    CommitDecision, Committer, Conflict, ConflictResolver, DefaultPolicy, ResolverInvoker,
};
use crate::errors::ResolutionError;
use crate::models::{CommitResult, DocumentFlags};
use crate::notify::{NotificationEmitter, Subscription};
use crate::store::{BlobSource, RevisionStore};

/// Terminal result of one resolution.
pub type Outcome = Result<CommitResult, ResolutionError>;

/// One conflict being worked on, and how many times its resolver has run.
pub struct ResolutionTask {
    pub conflict: Conflict,
    pub resolver: Arc<dyn ConflictResolver>,
    pub attempt: u32,
}

/// Work waiting behind the in-flight resolution of a document.
#[derive(Default)]
struct Queued {
    next: Option<Conflict>,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

struct Inner {
    local: Arc<dyn RevisionStore>,
    remote: Arc<dyn BlobSource>,
    resolver: Arc<dyn ConflictResolver>,
    config: ResolutionConfig,
    emitter: NotificationEmitter,
    tasks: Mutex<HashMap<String, Queued>>,
    stopped: AtomicBool,
    /// Set once the local store has been seen closed.
    closing: AtomicBool,
    idle: Notify,
    runtime: Handle,
}

/// Schedules conflict resolutions against one local store.
///
/// Dispatchers are independent: two dispatchers over the same store do not
/// coordinate, and races between them end last-write-wins.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher resolving conflicts between `local` and the peer
    /// whose blobs are reachable through `remote`. Without a custom resolver
    /// the [`DefaultPolicy`] is used. A `max_attempts` of zero is raised to
    /// one so every conflict reaches its resolver at least once.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(
        local: Arc<dyn RevisionStore>,
        remote: Arc<dyn BlobSource>,
        resolver: Option<Arc<dyn ConflictResolver>>,
        mut config: ResolutionConfig,
    ) -> Self {
        if config.max_attempts == 0 {
            warn!("resolution.max_attempts is 0, using 1");
            config.max_attempts = 1;
        }
        let custom = resolver.is_some();
        let resolver: Arc<dyn ConflictResolver> = match resolver {
            Some(resolver) => resolver,
            None => Arc::new(DefaultPolicy),
        };
        info!(
            local = %local.handle(),
            remote = %remote.handle(),
            custom_resolver = custom,
            max_attempts = config.max_attempts,
            "conflict dispatcher created"
        );
        Self {
            inner: Arc::new(Inner {
                local,
                remote,
                resolver,
                config,
                emitter: NotificationEmitter::new(),
                tasks: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                idle: Notify::new(),
                runtime: Handle::current(),
            }),
        }
    }

    /// Hand a conflict to the dispatcher.
    ///
    /// Conflicts that need no resolution (both sides deleted, or the remote
    /// revision already merged) complete immediately without a resolver call.
    pub fn submit(&self, conflict: Conflict) -> PendingResolution {
        let (tx, rx) = oneshot::channel();
        let document_id = conflict.document_id.clone();
        let pending = PendingResolution {
            document_id: document_id.clone(),
            rx,
        };

        if self.inner.stopped.load(Ordering::SeqCst) {
            warn!(document_id = %document_id, "dispatcher stopped, rejecting conflict");
            let _ = tx.send(Err(ResolutionError::DispatcherStopped));
            return pending;
        }

        if conflict.is_settled() {
            debug!(document_id = %document_id, "conflict needs no resolution");
            self.inner.finish(&document_id, Ok(settled(&conflict)), vec![tx]);
            return pending;
        }

        let mut tasks = self.inner.lock_tasks();
        if let Some(queued) = tasks.get_mut(&document_id) {
            debug!(
                document_id = %document_id,
                waiting = queued.waiters.len() + 1,
                "document already in flight, queueing"
            );
            queued.next = Some(conflict);
            queued.waiters.push(tx);
            return pending;
        }
        tasks.insert(document_id.clone(), Queued::default());
        drop(tasks);

        info!(document_id = %document_id, "conflict submitted");
        let inner = Arc::clone(&self.inner);
        self.inner
            .runtime
            .spawn(async move { inner.run_document(conflict, tx).await });
        pending
    }

    /// Listen for replication events.
    pub fn subscribe(&self) -> Subscription {
        self.inner.emitter.subscribe()
    }

    pub fn emitter(&self) -> &NotificationEmitter {
        &self.inner.emitter
    }

    /// Refuse new submissions. Resolutions already running are allowed to
    /// finish; work queued behind them completes with
    /// [`ResolutionError::DispatcherStopped`].
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            info!(in_flight = self.in_flight(), "conflict dispatcher stopping");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Number of documents with a resolution in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.lock_tasks().len()
    }

    /// Wait until no resolution is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<String, Queued>> {
        self.tasks.lock().unwrap_or_else(|poisoned| {
            warn!("dispatcher task map was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Drive one document until nothing is queued behind it.
    async fn run_document(self: Arc<Self>, conflict: Conflict, waiter: oneshot::Sender<Outcome>) {
        let document_id = conflict.document_id.clone();
        let mut work = Some((conflict, vec![waiter]));
        let mut follow_up = false;

        while let Some((conflict, waiters)) = work.take() {
            let outcome = self.process(conflict, follow_up).await;
            self.finish(&document_id, outcome, waiters);
            work = self.take_queued(&document_id);
            follow_up = true;
        }
    }

    async fn process(self: &Arc<Self>, conflict: Conflict, follow_up: bool) -> Outcome {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ResolutionError::StoreClosed);
        }
        if !follow_up {
            return self.resolve(conflict).await;
        }

        if self.stopped.load(Ordering::SeqCst) {
            return Err(ResolutionError::DispatcherStopped);
        }
        let conflict = self.reread(conflict).await?;
        if conflict.is_settled() {
            debug!(document_id = %conflict.document_id, "queued conflict already resolved");
            return Ok(settled(&conflict));
        }
        self.resolve(conflict).await
    }

    /// Invoke and commit until the commit sticks, re-reading the local side on
    /// every re-conflict.
    async fn resolve(self: &Arc<Self>, conflict: Conflict) -> Outcome {
        let document_id = conflict.document_id.clone();
        let mut task = ResolutionTask {
            conflict,
            resolver: Arc::clone(&self.resolver),
            attempt: 0,
        };

        loop {
            task.attempt += 1;
            if task.attempt > self.config.max_attempts {
                warn!(
                    document_id = %document_id,
                    attempts = self.config.max_attempts,
                    "document keeps changing, giving up"
                );
                return Err(ResolutionError::RetriesExhausted {
                    document_id,
                    attempts: self.config.max_attempts,
                });
            }

            let this = Arc::clone(self);
            let (returned, decision) = tokio::task::spawn_blocking(move || {
                let outcome =
                    ResolverInvoker::invoke(task.resolver.as_ref(), &task.conflict, task.attempt);
                let decision = Committer::new(this.local.as_ref(), this.remote.as_ref())
                    .commit(&task.conflict, outcome);
                (task, decision)
            })
            .await
            .map_err(join_error)?;
            task = returned;

            match decision? {
                CommitDecision::Committed(result) => return Ok(result),
                CommitDecision::Retry => {
                    debug!(document_id = %document_id, attempt = task.attempt, "re-conflict, resolving again");
                    task.conflict = self.reread(task.conflict).await?;
                    if task.conflict.is_settled() {
                        return Ok(settled(&task.conflict));
                    }
                }
            }
        }
    }

    /// Replace the local side of `conflict` with the store's current revision.
    async fn reread(&self, conflict: Conflict) -> Result<Conflict, ResolutionError> {
        let local = Arc::clone(&self.local);
        let id = conflict.document_id.clone();
        let current = tokio::task::spawn_blocking(move || local.read(&id))
            .await
            .map_err(join_error)??;
        Ok(Conflict {
            local: current,
            ..conflict
        })
    }

    /// Publish the outcome and wake every handle waiting on it.
    fn finish(&self, document_id: &str, outcome: Outcome, waiters: Vec<oneshot::Sender<Outcome>>) {
        match &outcome {
            Ok(result) => self.emitter.emit(document_id, result.flags, None),
            Err(e) => {
                if *e == ResolutionError::StoreClosed
                    && !self.closing.swap(true, Ordering::SeqCst)
                {
                    warn!("local store closed, failing queued resolutions");
                }
                self.emitter
                    .emit(document_id, DocumentFlags::default(), Some(e.clone()));
            }
        }
        for tx in waiters {
            let _ = tx.send(outcome.clone());
        }
    }

    /// Take the coalesced follow-up for `document_id`, or release the
    /// document if nothing is queued.
    fn take_queued(&self, document_id: &str) -> Option<(Conflict, Vec<oneshot::Sender<Outcome>>)> {
        let mut tasks = self.lock_tasks();
        if let Some(queued) = tasks.get_mut(document_id) {
            if let Some(next) = queued.next.take() {
                return Some((next, std::mem::take(&mut queued.waiters)));
            }
        }
        tasks.remove(document_id);
        if tasks.is_empty() {
            self.idle.notify_waiters();
        }
        None
    }
}

/// The result reported for a conflict that needed no resolver.
fn settled(conflict: &Conflict) -> CommitResult {
    let local = conflict.local.as_ref();
    CommitResult {
        document_id: conflict.document_id.clone(),
        flags: DocumentFlags {
            deleted: conflict.both_deleted(),
        },
        revision_id: local.map(|r| r.revision_id.clone()),
        needs_push: false,
    }
}

fn join_error(e: tokio::task::JoinError) -> ResolutionError {
    ResolutionError::UnexpectedError(format!("resolution task failed: {e}"))
}

/// Handle on one submitted conflict.
pub struct PendingResolution {
    document_id: String,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingResolution {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(self) -> Outcome {
        self.rx
            .await
            .unwrap_or(Err(ResolutionError::DispatcherStopped))
    }
}
