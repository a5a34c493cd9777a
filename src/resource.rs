//! Caller-side handle to a connection borrowed from the pool.

use std::{fmt, sync::Arc};

use opentelemetry::KeyValue;
use tokio::{
    sync::{MappedMutexGuard, MutexGuard, Notify},
    time::Instant,
};
use tracing::trace;

use crate::{
    connector::Connection,
    entry::{Entry, EntryStatus},
    error::Error,
    metrics::Metrics,
};

/// Exclusive access to a physical connection, obtained via [`PooledConnection::conn`].
pub type ConnectionGuard<'a, C> = MappedMutexGuard<'a, C>;

/// Connection borrowed from the pool.
///
/// Connection is returned to the pool either explicitly via [`Self::release`], or when this
/// object is dropped. Any access after that fails with [`Error::UseAfterRelease`]. The same
/// happens if pool maintenance has reclaimed the connection after it was held for too long.
pub struct PooledConnection<C: Connection> {
    /// Pool entry this handle is assigned to.
    entry: Arc<Entry<C>>,
    /// Assignment ticket, used to detect stale handles.
    ticket: u64,
    /// Wakes up callers waiting for a connection.
    notify: Arc<Notify>,
    /// Linked metrics storage.
    metrics: Arc<Metrics>,
    /// Premade label used to record metrics.
    label: [KeyValue; 1],
    /// Retrieval time.
    time: Instant,
}

impl<C: Connection> PooledConnection<C> {
    /// Bundle assigned entry with pool notifier and metrics.
    pub(crate) fn new(
        entry: Arc<Entry<C>>,
        ticket: u64,
        notify: Arc<Notify>,
        metrics: Arc<Metrics>,
        label: [KeyValue; 1],
    ) -> Self {
        Self {
            entry,
            ticket,
            notify,
            metrics,
            label,
            // This is different from time used in wait_time metric.
            time: Instant::now(),
        }
    }

    /// Pool-unique identifier of the underlying pool entry.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.entry.id()
    }

    /// Number of times the underlying pool entry was lent out, including this time.
    #[must_use]
    pub fn usage(&self) -> u64 {
        self.ticket
    }

    /// Current status of the underlying pool entry.
    #[must_use]
    pub fn status(&self) -> EntryStatus {
        self.entry.status()
    }

    /// Whether this handle was released or reclaimed.
    #[must_use]
    pub fn is_released(&self) -> bool {
        !self.entry.holds_ticket(self.ticket)
    }

    /// Get exclusive access to the physical connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UseAfterRelease`] if this handle was already released, or if the
    /// connection was reclaimed by the pool.
    pub async fn conn(&self) -> Result<ConnectionGuard<'_, C>, Error<C::Error>> {
        if self.is_released() {
            return Err(Error::UseAfterRelease);
        }
        let guard = self.entry.lock_conn().await;
        // Could have been reclaimed while waiting for the lock.
        if self.is_released() {
            return Err(Error::UseAfterRelease);
        }
        MutexGuard::try_map(guard, Option::as_mut).map_err(|_| Error::UseAfterRelease)
    }

    /// Execute a statement on the physical connection, discarding any results.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UseAfterRelease`] if this handle is no longer valid, or
    /// [`Error::Connection`] if the statement failed.
    pub async fn execute(&self, statement: &str) -> Result<(), Error<C::Error>> {
        self.conn()
            .await?
            .execute(statement)
            .await
            .map_err(Error::Connection)
    }

    /// Return connection to the pool.
    ///
    /// Calling this more than once is a no-op.
    pub fn release(&self) {
        if self.entry.release_ticket(self.ticket) {
            // Record time spent outside the pool.
            self.metrics
                .use_time
                .record(self.time.elapsed().as_secs_f64(), &self.label);
            trace!(id = self.entry.id(), "connection released");
            self.notify.notify_waiters();
        }
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<C: Connection> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.entry.id())
            .field("usage", &self.ticket)
            .field("released", &self.is_released())
            .finish()
    }
}

impl<C: Connection> fmt::Display for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.entry, f)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{metrics::pool_kv, testing::TestConnection};

    fn handle(entry: &Arc<Entry<TestConnection>>) -> PooledConnection<TestConnection> {
        let ticket = entry.assign().unwrap();
        PooledConnection::new(
            entry.clone(),
            ticket,
            Arc::new(Notify::new()),
            Arc::new(Metrics::new()),
            pool_kv("test".into()),
        )
    }

    #[tokio::test]
    async fn access_while_assigned() {
        let conn = TestConnection::default();
        let statements = conn.statements.clone();
        let entry = Arc::new(Entry::new(1, conn));
        let pooled = handle(&entry);
        assert_eq!(pooled.id(), 1);
        assert_eq!(pooled.usage(), 1);
        assert_eq!(pooled.status(), EntryStatus::Assigned);
        pooled.execute("SELECT 2").await.unwrap();
        assert_eq!(statements.lock().as_slice(), ["SELECT 2"]);
    }

    #[tokio::test]
    async fn use_after_release() {
        let entry = Arc::new(Entry::new(1, TestConnection::default()));
        let pooled = handle(&entry);
        pooled.release();
        assert!(pooled.is_released());
        assert!(!entry.is_assigned());
        assert!(matches!(pooled.conn().await, Err(Error::UseAfterRelease)));
        // Idempotent.
        pooled.release();
        assert!(!entry.is_assigned());
    }

    #[tokio::test]
    async fn stale_handle_does_not_release_new_assignment() {
        let entry = Arc::new(Entry::new(1, TestConnection::default()));
        let first = handle(&entry);
        first.release();
        let second = handle(&entry);
        assert_eq!(second.usage(), 2);
        drop(first);
        assert!(entry.is_assigned());
        assert!(matches!(
            second.execute("SELECT 1").await,
            Ok(())
        ));
        drop(second);
        assert!(!entry.is_assigned());
    }

    #[tokio::test]
    async fn reclaimed_handle_fails() {
        let conn = TestConnection::default();
        let closed = conn.closed.clone();
        let entry = Arc::new(Entry::new(1, conn));
        let pooled = handle(&entry);
        entry.real_close().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(matches!(
            pooled.execute("SELECT 1").await,
            Err(Error::UseAfterRelease)
        ));
    }

    #[tokio::test]
    async fn drop_releases() {
        let entry = Arc::new(Entry::new(1, TestConnection::default()));
        drop(handle(&entry));
        assert!(!entry.is_assigned());
        assert_eq!(entry.usage(), 1);
    }
}
