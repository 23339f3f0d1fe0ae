//! Per-repository serialization of event handling.
//!
//! Each repository key gets one async mutex, created the first time the key
//! is seen and kept for the life of the serializer. Work for a key runs with
//! that mutex held, so events for one repository never overlap and are
//! handled in the order they were queued. Distinct keys run concurrently.
//!
//! Tokio's mutex grants the lock to waiters in FIFO order, which is what
//! turns "queued first" into "handled first".

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use async_trait::async_trait;
use firehose_protocol::{Cursor, RepoKey};
use parking_lot::Mutex;
use tokio::sync::{Mutex as KeyLock, OwnedMutexGuard};
use tracing::trace;

use crate::error::{BoxError, FirehoseError, FirehoseResult};

/// Persists stream positions after successful handling.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Records that everything up to `cursor` for `repo` has been handled.
    async fn update_cursor(&self, repo: &RepoKey, cursor: &Cursor) -> Result<(), BoxError>;
}

/// A cursor store that discards updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCursorStore;

#[async_trait]
impl CursorStore for NoopCursorStore {
    async fn update_cursor(&self, _repo: &RepoKey, _cursor: &Cursor) -> Result<(), BoxError> {
        Ok(())
    }
}

/// An in-memory cursor store.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    updates: Mutex<Vec<(RepoKey, Cursor)>>,
}

impl MemoryCursorStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest cursor recorded for `repo`.
    pub fn get(&self, repo: &RepoKey) -> Option<Cursor> {
        self.updates
            .lock()
            .iter()
            .rev()
            .find(|(key, _)| key == repo)
            .map(|(_, cursor)| cursor.clone())
    }

    /// Most recent update across all repositories.
    pub fn latest(&self) -> Option<Cursor> {
        self.updates.lock().last().map(|(_, cursor)| cursor.clone())
    }

    /// Every update, in the order it was recorded.
    pub fn updates(&self) -> Vec<(RepoKey, Cursor)> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn update_cursor(&self, repo: &RepoKey, cursor: &Cursor) -> Result<(), BoxError> {
        self.updates.lock().push((repo.clone(), cursor.clone()));
        Ok(())
    }
}

type PendingLock = Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send>>;

enum TicketState {
    Held(OwnedMutexGuard<()>),
    Queued(PendingLock),
}

/// A place in a repository's queue.
///
/// Obtained from [`RepoSerializer::reserve`]. The ticket is already queued
/// on the repository's lock, so tickets for one key are served in the order
/// they were reserved, even if they are awaited from different tasks.
/// Dropping a ticket gives up its place.
pub struct RepoTicket {
    repo: RepoKey,
    state: TicketState,
}

impl RepoTicket {
    /// Repository this ticket is queued on.
    pub fn repo(&self) -> &RepoKey {
        &self.repo
    }

    /// True when the lock was free at reservation time.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, TicketState::Held(_))
    }

    async fn acquire(self) -> OwnedMutexGuard<()> {
        match self.state {
            TicketState::Held(guard) => guard,
            TicketState::Queued(pending) => pending.await,
        }
    }
}

impl fmt::Debug for RepoTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoTicket")
            .field("repo", &self.repo)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Serializes work per repository and advances cursors on success.
pub struct RepoSerializer {
    locks: Mutex<HashMap<RepoKey, Arc<KeyLock<()>>>>,
    cursor_store: Arc<dyn CursorStore>,
}

impl RepoSerializer {
    /// Creates a serializer that reports progress to `cursor_store`.
    pub fn new(cursor_store: Arc<dyn CursorStore>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            cursor_store,
        }
    }

    fn lock_for(&self, repo: &RepoKey) -> Arc<KeyLock<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(repo.clone())
                .or_insert_with(|| Arc::new(KeyLock::new(()))),
        )
    }

    /// Number of repositories seen so far.
    pub fn key_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// True while work for `repo` is running.
    pub fn is_busy(&self, repo: &RepoKey) -> bool {
        let lock = self.locks.lock().get(repo).cloned();
        lock.is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Takes a place in `repo`'s queue without waiting for the lock.
    pub async fn reserve(&self, repo: &RepoKey) -> RepoTicket {
        let mut pending: PendingLock = Box::pin(self.lock_for(repo).lock_owned());
        // One poll registers this waiter in the lock's queue.
        let state = match futures::poll!(pending.as_mut()) {
            Poll::Ready(guard) => TicketState::Held(guard),
            Poll::Pending => TicketState::Queued(pending),
        };
        RepoTicket {
            repo: repo.clone(),
            state,
        }
    }

    /// Runs `handler` while holding `repo`'s lock, then records `cursor`.
    ///
    /// The lock is released on every path: success, handler failure, cursor
    /// store failure and cancellation. A failed handler leaves the cursor
    /// where it was, so the event is delivered again after a resume.
    ///
    /// # Errors
    ///
    /// `Handler` when the handler fails, `Cursor` when the store fails.
    pub async fn process<F, Fut>(
        &self,
        repo: &RepoKey,
        cursor: Cursor,
        handler: F,
    ) -> FirehoseResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), BoxError>>,
    {
        let ticket = self.reserve(repo).await;
        self.process_reserved(ticket, cursor, handler).await
    }

    /// Like [`RepoSerializer::process`], for a place reserved earlier.
    pub async fn process_reserved<F, Fut>(
        &self,
        ticket: RepoTicket,
        cursor: Cursor,
        handler: F,
    ) -> FirehoseResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), BoxError>>,
    {
        let repo = ticket.repo.clone();
        let _guard = ticket.acquire().await;
        trace!(repo = %repo, cursor = %cursor, "repository lock acquired");

        handler().await.map_err(FirehoseError::Handler)?;
        self.cursor_store
            .update_cursor(&repo, &cursor)
            .await
            .map_err(FirehoseError::Cursor)?;
        Ok(())
    }
}

impl fmt::Debug for RepoSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoSerializer")
            .field("keys", &self.key_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Barrier, Notify};

    fn serializer() -> (Arc<RepoSerializer>, Arc<MemoryCursorStore>) {
        let store = Arc::new(MemoryCursorStore::new());
        (Arc::new(RepoSerializer::new(store.clone())), store)
    }

    fn repo(name: &str) -> RepoKey {
        RepoKey::new(format!("did:plc:{name}"))
    }

    #[tokio::test]
    async fn process_updates_cursor_on_success() {
        let (serializer, store) = serializer();
        serializer
            .process(&repo("a"), Cursor::from_seq(1), || async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(store.get(&repo("a")), Some(Cursor::from_seq(1)));
        assert_eq!(serializer.key_count(), 1);
        assert!(!serializer.is_busy(&repo("a")));
    }

    #[tokio::test]
    async fn handler_failure_keeps_cursor_and_releases_lock() {
        let (serializer, store) = serializer();
        let err = serializer
            .process(&repo("a"), Cursor::from_seq(1), || async {
                Err::<(), BoxError>("handler exploded".into())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, FirehoseError::Handler(_)));
        assert_eq!(store.get(&repo("a")), None);
        assert!(!serializer.is_busy(&repo("a")));

        serializer
            .process(&repo("a"), Cursor::from_seq(2), || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(store.get(&repo("a")), Some(Cursor::from_seq(2)));
    }

    #[tokio::test]
    async fn cursor_store_failure_is_reported() {
        struct FailingStore;

        #[async_trait]
        impl CursorStore for FailingStore {
            async fn update_cursor(&self, _: &RepoKey, _: &Cursor) -> Result<(), BoxError> {
                Err("disk full".into())
            }
        }

        let serializer = RepoSerializer::new(Arc::new(FailingStore));
        let err = serializer
            .process(&repo("a"), Cursor::from_seq(1), || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, FirehoseError::Cursor(_)));
        assert!(!serializer.is_busy(&repo("a")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_never_overlaps() {
        let (serializer, store) = serializer();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for seq in 0..16 {
            let serializer = Arc::clone(&serializer);
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            tasks.push(tokio::spawn(async move {
                serializer
                    .process(&repo("a"), Cursor::from_seq(seq), || async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(store.updates().len(), 16);
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let (serializer, _store) = serializer();
        let barrier = Arc::new(Barrier::new(2));

        let run = |name: &'static str| {
            let serializer = Arc::clone(&serializer);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                serializer
                    .process(&repo(name), Cursor::from_seq(1), || async {
                        // Both handlers must be inside their critical sections at once.
                        barrier.wait().await;
                        Ok(())
                    })
                    .await
            })
        };
        let a = run("a");
        let b = run("b");

        tokio::time::timeout(Duration::from_secs(5), async {
            a.await.unwrap().unwrap();
            b.await.unwrap().unwrap();
        })
        .await
        .expect("distinct repositories were serialized");
    }

    #[tokio::test]
    async fn reserved_tickets_are_served_in_order() {
        let (serializer, store) = serializer();
        let key = repo("a");

        // Hold the lock so every reservation queues.
        let gate = Arc::new(Notify::new());
        let first = serializer.reserve(&key).await;
        assert!(first.is_ready());
        let tickets = vec![
            serializer.reserve(&key).await,
            serializer.reserve(&key).await,
            serializer.reserve(&key).await,
        ];
        assert!(tickets.iter().all(|ticket| !ticket.is_ready()));

        let holder = {
            let serializer = Arc::clone(&serializer);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                serializer
                    .process_reserved(first, Cursor::from_seq(0), || async move {
                        gate.notified().await;
                        Ok(())
                    })
                    .await
            })
        };

        // Await the queued tickets from tasks spawned in reverse order.
        let mut tasks = Vec::new();
        for (seq, ticket) in tickets.into_iter().enumerate().rev() {
            let serializer = Arc::clone(&serializer);
            tasks.push(tokio::spawn(async move {
                serializer
                    .process_reserved(ticket, Cursor::from_seq(seq as i64 + 1), || async {
                        Ok(())
                    })
                    .await
            }));
        }
        tokio::task::yield_now().await;
        gate.notify_one();

        holder.await.unwrap().unwrap();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let order: Vec<_> = store
            .updates()
            .into_iter()
            .map(|(_, cursor)| cursor.seq().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn cancellation_releases_lock() {
        let (serializer, store) = serializer();
        let started = Arc::new(Notify::new());

        let stuck = {
            let serializer = Arc::clone(&serializer);
            let started = Arc::clone(&started);
            tokio::spawn(async move {
                serializer
                    .process(&repo("a"), Cursor::from_seq(1), || async move {
                        started.notify_one();
                        std::future::pending::<()>().await;
                        Ok(())
                    })
                    .await
            })
        };
        started.notified().await;
        assert!(serializer.is_busy(&repo("a")));

        stuck.abort();
        let _ = stuck.await;

        tokio::time::timeout(
            Duration::from_secs(5),
            serializer.process(&repo("a"), Cursor::from_seq(2), || async { Ok(()) }),
        )
        .await
        .expect("lock was not released on cancellation")
        .unwrap();
        assert_eq!(store.get(&repo("a")), Some(Cursor::from_seq(2)));
    }
}
