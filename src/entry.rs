//! Pool entry wrapping a single physical connection.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Local, NaiveDate};
use parking_lot::Mutex;
use tokio::{sync::Mutex as AsyncMutex, time::Instant};
use tracing::warn;

use crate::connector::Connection;

/// Point in time, recorded both on a monotonic clock and on a wall clock.
///
/// Monotonic time is used for all policy decisions, wall-clock time only for reporting.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Stamp {
    pub(crate) at: Instant,
    pub(crate) wall: DateTime<Local>,
}

impl Stamp {
    pub(crate) fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Local::now(),
        }
    }
}

/// Format wall-clock time for reports.
///
/// Date is only included if it differs from `today`.
pub(crate) fn format_stamp(wall: &DateTime<Local>, today: NaiveDate) -> String {
    if wall.date_naive() < today {
        wall.format("%b %-d %H:%M:%S").to_string()
    } else {
        wall.format("%H:%M:%S").to_string()
    }
}

/// Externally visible status of a pool entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum EntryStatus {
    /// Lent out to a caller.
    Assigned,
    /// Idle, with a live physical connection.
    Available,
    /// Physical connection was closed.
    Closed,
    /// Physical connection state could not be determined.
    Unknown,
}

impl EntryStatus {
    /// Status as a static string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "Assigned",
            Self::Available => "Available",
            Self::Closed => "Closed",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable bookkeeping of an entry, guarded by a per-entry lock.
#[derive(Debug, Default)]
struct EntryState {
    /// Entry is lent out to a caller.
    assigned: bool,
    /// Entry was real-closed, and must never be assigned again.
    retired: bool,
    /// Number of successful assignments.
    usage: u64,
    /// Time of the most recent successful assignment.
    last_assigned: Option<Stamp>,
}

/// Single pooled connection along with its bookkeeping.
pub(crate) struct Entry<C> {
    /// Pool-unique identifier.
    id: u64,
    /// Creation time.
    created: Stamp,
    /// Assignment state and counters.
    state: Mutex<EntryState>,
    /// Physical connection. Taken out on real close.
    conn: AsyncMutex<Option<C>>,
}

impl<C: Connection> Entry<C> {
    /// Wrap freshly opened physical connection.
    pub(crate) fn new(id: u64, conn: C) -> Self {
        Self::with_created(id, conn, Stamp::now())
    }

    /// Wrap physical connection with an explicit creation time.
    pub(crate) fn with_created(id: u64, conn: C, created: Stamp) -> Self {
        Self {
            id,
            created,
            state: Mutex::new(EntryState::default()),
            conn: AsyncMutex::new(Some(conn)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created.at
    }

    pub(crate) fn usage(&self) -> u64 {
        self.state.lock().usage
    }

    pub(crate) fn last_assigned(&self) -> Option<Stamp> {
        self.state.lock().last_assigned
    }

    pub(crate) fn is_assigned(&self) -> bool {
        self.state.lock().assigned
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    /// Try to lend this entry out.
    ///
    /// Returns assignment ticket on success, or [`None`] if entry is already assigned or
    /// retired.
    pub(crate) fn assign(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if state.assigned || state.retired {
            return None;
        }
        state.assigned = true;
        state.usage += 1;
        state.last_assigned = Some(Stamp::now());
        Some(state.usage)
    }

    /// Return entry to available state.
    ///
    /// Returns `true` if entry was assigned before the call.
    pub(crate) fn release(&self) -> bool {
        std::mem::take(&mut self.state.lock().assigned)
    }

    /// Return entry to available state, but only if it is still held under `ticket`.
    pub(crate) fn release_ticket(&self, ticket: u64) -> bool {
        let mut state = self.state.lock();
        if state.assigned && state.usage == ticket {
            state.assigned = false;
            true
        } else {
            false
        }
    }

    /// Check whether assignment identified by `ticket` is still current.
    pub(crate) fn holds_ticket(&self, ticket: u64) -> bool {
        let state = self.state.lock();
        state.assigned && !state.retired && state.usage == ticket
    }

    /// Lock physical connection for the duration of a caller operation.
    pub(crate) async fn lock_conn(&self) -> tokio::sync::MutexGuard<'_, Option<C>> {
        self.conn.lock().await
    }

    /// Time since last assignment, or since creation if never assigned.
    pub(crate) fn idle_time(&self, now: Instant) -> Duration {
        let base = self
            .state
            .lock()
            .last_assigned
            .map_or(self.created.at, |s| s.at);
        now.saturating_duration_since(base)
    }

    /// Check liveness of the physical connection.
    ///
    /// Missing connection, connection locked by someone else, or failing check all count as
    /// not alive.
    pub(crate) fn is_alive(&self) -> bool {
        self.liveness() == Some(true)
    }

    /// Check liveness of the physical connection, if it is not locked right now.
    ///
    /// Returns [`None`] if someone holds the connection lock, since its state can't be
    /// determined then.
    pub(crate) fn liveness(&self) -> Option<bool> {
        let guard = self.conn.try_lock().ok()?;
        Some(matches!(guard.as_ref().map(C::is_closed), Some(Ok(false))))
    }

    /// Derive current status of this entry.
    pub(crate) fn status(&self) -> EntryStatus {
        if self.is_assigned() {
            return EntryStatus::Assigned;
        }
        let Ok(guard) = self.conn.try_lock() else {
            return EntryStatus::Unknown;
        };
        match guard.as_ref().map(C::is_closed) {
            None | Some(Ok(true)) => EntryStatus::Closed,
            Some(Ok(false)) => EntryStatus::Available,
            Some(Err(_)) => EntryStatus::Unknown,
        }
    }

    /// Execute keep-alive statement on the physical connection.
    ///
    /// Does not count as a use. Probe is skipped if the connection is currently locked.
    pub(crate) async fn keep_alive(&self, statement: &str) -> Result<(), C::Error> {
        let Ok(mut guard) = self.conn.try_lock() else {
            return Ok(());
        };
        match guard.as_mut() {
            Some(conn) => conn.execute(statement).await,
            None => Ok(()),
        }
    }

    /// Release this entry, and close its physical connection.
    ///
    /// Calling this more than once is a no-op. If the connection is in use by a caller right
    /// now, closing is deferred until the caller is done with it.
    pub(crate) async fn real_close(self: &Arc<Self>) -> Result<(), C::Error> {
        self.state.lock().retired = true;
        self.release();
        let conn = match self.conn.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                let entry = Arc::clone(self);
                tokio::spawn(async move {
                    let conn = entry.conn.lock().await.take();
                    if let Some(conn) = conn {
                        if let Err(err) = conn.close().await {
                            warn!(id = entry.id, %err, "deferred connection close failed");
                        }
                    }
                });
                return Ok(());
            }
        };
        match conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }

    /// Same as [`Self::real_close`], but only logs errors.
    pub(crate) async fn safe_real_close(self: &Arc<Self>) {
        if let Err(err) = self.real_close().await {
            warn!(id = self.id, %err, "error while closing connection");
        }
    }

    /// Format entry for reports, given current date.
    pub(crate) fn describe(&self, today: NaiveDate) -> String {
        let status = self.status();
        let (usage, last) = {
            let state = self.state.lock();
            (state.usage, state.last_assigned)
        };
        let mut out = format!(
            "#{}: {}, created at: {}",
            self.id,
            status,
            format_stamp(&self.created.wall, today)
        );
        if let Some(last) = last {
            out.push_str(", last used: ");
            out.push_str(&format_stamp(&last.wall, today));
        }
        out.push_str(&format!(", usage: {usage}"));
        out
    }
}

impl<C: Connection> fmt::Display for Entry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe(Local::now().date_naive()))
    }
}

impl<C> fmt::Debug for Entry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
