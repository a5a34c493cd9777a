//! Connection pool.

use std::{
    borrow::Cow,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Local};
use opentelemetry::KeyValue;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{Mutex as AsyncMutex, Notify},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::{
    config::PoolConfig,
    connector::{ConnectionError, Connector},
    entry::{Entry, Stamp},
    error::{ConfigError, Error},
    maintenance,
    metrics::{pool_kv, Metrics, PoolState, POOL_METRICS},
    resource::PooledConnection,
    status,
};

/// Interval between acquisition retries, unless woken up earlier by a released connection.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pool entry type for a given connector.
pub(crate) type PoolEntry<C> = Arc<Entry<<C as Connector>::Connection>>;

/// Pooled connection type for a given connector.
pub type Pooled<C> = PooledConnection<<C as Connector>::Connection>;

/// Pool state shared with the maintenance task.
pub(crate) struct Shared<C: Connector> {
    /// Physical connection factory.
    connector: C,
    /// All pool entries, in order of creation.
    pub(crate) entries: AsyncMutex<Vec<PoolEntry<C>>>,
    /// Current pool configuration.
    pub(crate) config: RwLock<PoolConfig>,
    /// Source of entry identifiers.
    next_id: AtomicU64,
    /// Time of last completed maintenance sweep.
    pub(crate) last_sweep: Mutex<Option<Stamp>>,
    /// Pool was shut down.
    pub(crate) closed: AtomicBool,
    /// Signalled when a connection is returned to the pool.
    notify: Arc<Notify>,
    /// Linked metrics storage.
    pub(crate) metrics: Arc<Metrics>,
    /// Pool label.
    pub(crate) label: [KeyValue; 1],
}

impl<C: Connector> Shared<C> {
    /// Snapshot of current configuration.
    pub(crate) fn config(&self) -> PoolConfig {
        self.config.read().clone()
    }

    /// Whether the pool was shut down.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pool name, as used in logs and metrics.
    pub(crate) fn name(&self) -> Cow<'_, str> {
        self.label[0].value.as_str()
    }

    /// Open a new physical connection and wrap it into a pool entry.
    pub(crate) async fn open_entry(&self) -> Result<PoolEntry<C>, ConnectionError<C>> {
        let started = Instant::now();
        let conn = self.connector.connect().await?;
        self.metrics
            .create_time
            .record(started.elapsed().as_secs_f64(), &self.label);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, "connection opened");
        Ok(Arc::new(Entry::new(id, conn)))
    }

    /// Top up `entries` to configured minimum size.
    ///
    /// Connection errors are logged, and remaining slots are still attempted.
    pub(crate) async fn initialize(&self, entries: &mut Vec<PoolEntry<C>>, min_size: usize) {
        let missing = min_size.saturating_sub(entries.len());
        for _ in 0..missing {
            match self.open_entry().await {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(%err, "unable to open connection while filling the pool"),
            }
        }
    }

    /// Count pool entries by state.
    pub(crate) fn state_of(&self, entries: &[PoolEntry<C>]) -> PoolState {
        let in_use = entries.iter().filter(|e| e.is_assigned()).count();
        let config = self.config.read();
        PoolState {
            max_size: config.max_size,
            min_size: config.min_size,
            size: entries.len(),
            idle: entries.len() - in_use,
            in_use,
        }
    }

    /// Update pool gauges.
    pub(crate) fn record_state(&self, entries: &[PoolEntry<C>]) {
        self.metrics
            .record_state(&self.label, &self.state_of(entries));
    }

    /// Single acquisition attempt.
    ///
    /// Returns [`None`] if nothing could be assigned.
    async fn try_assign(&self) -> Result<Option<Pooled<C>>, Error<ConnectionError<C>>> {
        let mut entries = self.entries.lock().await;
        // Pool might have been shut down while waiting for the lock.
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        let config = self.config();
        if entries.len() < config.min_size {
            self.initialize(&mut entries, config.min_size).await;
        }
        // Newest first, so that older idle connections get to age out.
        for entry in entries.iter().rev() {
            if entry.is_assigned() || !entry.is_alive() {
                continue;
            }
            if let Some(ticket) = entry.assign() {
                return Ok(Some(self.lend(entry, ticket)));
            }
        }
        if entries.len() < config.max_size {
            let entry = self.open_entry().await.map_err(Error::Connect)?;
            entries.push(entry.clone());
            if !entry.is_alive() {
                warn!(id = entry.id(), "newly opened connection is not alive");
                return Ok(None);
            }
            if let Some(ticket) = entry.assign() {
                return Ok(Some(self.lend(&entry, ticket)));
            }
        }
        Ok(None)
    }

    /// Create caller handle for an assigned entry.
    fn lend(&self, entry: &PoolEntry<C>, ticket: u64) -> Pooled<C> {
        debug!(id = entry.id(), usage = ticket, "connection assigned");
        PooledConnection::new(
            entry.clone(),
            ticket,
            self.notify.clone(),
            self.metrics.clone(),
            self.label.clone(),
        )
    }

    /// Real-close and remove all entries.
    pub(crate) async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        for entry in entries.drain(..) {
            entry.safe_real_close().await;
        }
        self.record_state(&entries);
        if count > 0 {
            info!(count, "all connections closed");
        }
    }
}

/// Bounded connection pool with background maintenance.
///
/// Connections are opened lazily on first acquisition. A maintenance task is started when the
/// pool is created, and periodically closes connections that are stale, idle or lent out for
/// too long, keeps idle connections alive, and tops up the pool to its minimum size.
pub struct Pool<C: Connector> {
    /// State shared with maintenance task.
    shared: Arc<Shared<C>>,
    /// Stops maintenance task.
    cancel: CancellationToken,
    /// Maintenance task handle.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Pool<C> {
    /// Create new pool, and start its maintenance task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Err` if provided configuration is invalid.
    pub fn new(connector: C, mut config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let label = pool_kv(Cow::Owned(config.name.clone()));
        info!(name = %config.name, %config, "creating connection pool");
        let shared = Arc::new(Shared {
            connector,
            entries: AsyncMutex::new(Vec::with_capacity(config.max_size)),
            config: RwLock::new(config),
            next_id: AtomicU64::new(1),
            last_sweep: Mutex::new(None),
            closed: AtomicBool::new(false),
            notify: Arc::new(Notify::new()),
            metrics: POOL_METRICS.deref().clone(),
            label,
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(maintenance::task(shared.clone(), cancel.clone()));
        Ok(Self {
            shared,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Acquire a connection from the pool.
    ///
    /// Waits until a connection is returned to the pool, or until the pool can grow, but no
    /// longer than [`PoolConfig::max_wait`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::AcquireTimeout`] if no connection became available in time,
    /// [`Error::Connect`] if a new connection could not be opened, or [`Error::PoolClosed`] if
    /// the pool was shut down.
    pub async fn acquire(&self) -> Result<Pooled<C>, Error<ConnectionError<C>>> {
        let started = Instant::now();
        let max_wait = self.shared.config.read().max_wait;
        let span = debug_span!("pool_acquire", name = self.shared.name().as_ref());
        async {
            loop {
                if self.is_closed() {
                    return Err(Error::PoolClosed);
                }
                // Register interest before scanning, so that no release can slip by.
                let notified = self.shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(conn) = self.shared.try_assign().await? {
                    self.shared
                        .metrics
                        .wait_time
                        .record(started.elapsed().as_secs_f64(), &self.shared.label);
                    return Ok(conn);
                }
                let elapsed = started.elapsed();
                if elapsed >= max_wait {
                    self.shared.metrics.timeouts.add(1, &self.shared.label);
                    warn!(?max_wait, "timed out waiting for a connection");
                    return Err(Error::AcquireTimeout(max_wait));
                }
                let pause = POLL_INTERVAL.min(max_wait - elapsed);
                // Either outcome means it is time to retry.
                let _ = tokio::time::timeout(pause, notified).await;
            }
        }
        .instrument(span)
        .await
    }

    /// Acquire a connection from the pool without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if no live connection is available and none could be
    /// added,
    /// [`Error::Connect`] if a new connection could not be opened, or [`Error::PoolClosed`] if
    /// the pool was shut down.
    pub async fn try_acquire(&self) -> Result<Pooled<C>, Error<ConnectionError<C>>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        self.shared.try_assign().await?.ok_or(Error::PoolExhausted)
    }

    /// Close all connections, including ones currently lent out.
    ///
    /// Holders of reclaimed connections will get [`Error::UseAfterRelease`] on next use.
    pub async fn clear(&self) {
        self.shared.clear().await;
    }

    /// Shut down the pool.
    ///
    /// Closes all connections, including ones currently lent out, then stops the maintenance
    /// task and waits for it to finish.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.clear().await;
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(%err, "maintenance task failed");
            }
        }
        info!(name = self.shared.name().as_ref(), "connection pool closed");
    }

    /// Whether the pool was shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Run a maintenance sweep right now, without waiting for the next scheduled one.
    pub async fn sweep(&self) {
        maintenance::sweep(&self.shared).await;
    }

    /// Human-readable multi-line pool status report.
    ///
    /// Format of this report is not stable, and is not meant to be parsed.
    pub async fn status(&self) -> String {
        let entries = self.shared.entries.lock().await;
        let last_sweep = self.last_sweep_at();
        status::report(&entries, last_sweep, &self.shared.config())
    }

    /// Current pool counts.
    pub async fn state(&self) -> PoolState {
        let entries = self.shared.entries.lock().await;
        self.shared.state_of(&entries)
    }

    /// Current number of connections in the pool.
    pub async fn size(&self) -> usize {
        self.shared.entries.lock().await.len()
    }

    /// Snapshot of current pool configuration.
    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.shared.config()
    }

    /// Time of last completed maintenance sweep.
    #[must_use]
    pub fn last_sweep_at(&self) -> Option<DateTime<Local>> {
        self.shared.last_sweep.lock().map(|s| s.wall)
    }

    /// Set minimum pool size.
    ///
    /// Raises maximum pool size if needed. Pool is topped up on next acquisition or sweep.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `min_size` is zero.
    pub fn set_min_size(&self, min_size: usize) -> Result<(), ConfigError> {
        if min_size < 1 {
            return Err(ConfigError::MinSize(min_size));
        }
        let mut config = self.shared.config.write();
        config.min_size = min_size;
        if config.max_size < min_size {
            config.max_size = min_size;
        }
        Ok(())
    }

    /// Set maximum pool size.
    ///
    /// Lowering maximum size doesn't close any connections, surplus ones are retired by
    /// maintenance once idle.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `max_size` is lower than current minimum pool size.
    pub fn set_max_size(&self, max_size: usize) -> Result<(), ConfigError> {
        let mut config = self.shared.config.write();
        if max_size < config.min_size {
            return Err(ConfigError::MaxSize {
                max: max_size,
                min: config.min_size,
            });
        }
        config.max_size = max_size;
        Ok(())
    }

    /// Set maximum time to wait for a connection.
    ///
    /// Acquisitions already in progress keep their original deadline.
    pub fn set_max_wait(&self, max_wait: Duration) {
        self.shared.config.write().max_wait = max_wait;
    }

    /// Set maximum time a connection may stay lent out.
    pub fn set_assigned_timeout(&self, timeout: Duration) {
        self.shared.config.write().assigned_timeout = timeout;
    }

    /// Set idle time after which surplus connections are closed.
    pub fn set_retire_after_idle(&self, idle: Duration) {
        self.shared.config.write().retire_after_idle = idle;
    }

    /// Set idle time after which connections are probed with the keep-alive statement.
    pub fn set_keep_alive_after(&self, idle: Duration) {
        self.shared.config.write().keep_alive_after = idle;
    }

    /// Set maximum age of an available connection.
    pub fn set_retire_after_stale(&self, age: Duration) {
        self.shared.config.write().retire_after_stale = age;
    }

    /// Set interval between maintenance sweeps.
    ///
    /// Takes effect after the currently scheduled sweep.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `interval` is zero.
    pub fn set_sweep_interval(&self, interval: Duration) -> Result<(), ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        self.shared.config.write().sweep_interval = interval;
        Ok(())
    }

    /// Set statement used to keep idle connections alive.
    pub fn set_keep_alive_statement(&self, statement: impl ToString) {
        self.shared.config.write().keep_alive_statement = statement.to_string();
    }
}

impl<C: Connector> Drop for Pool<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
