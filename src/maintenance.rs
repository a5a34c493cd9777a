//! Periodic pool maintenance.

use std::{future::Future, sync::Arc};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, trace_span, warn, Instrument};

use crate::{
    connector::{Connection, Connector},
    entry::{Entry, Stamp},
    pool::{PoolEntry, Shared},
};

/// Reason for closing a connection during a sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Eviction {
    /// Lent out for longer than allowed.
    Assigned,
    /// Available, and older than allowed.
    Stale,
    /// Available, but physical connection is closed or broken.
    Dead,
    /// Keep-alive statement failed.
    KeepAlive,
    /// Surplus connection, idle for too long.
    Idle,
}

impl Eviction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Assigned => "assigned_timeout",
            Self::Stale => "stale",
            Self::Dead => "dead",
            Self::KeepAlive => "keep_alive_failed",
            Self::Idle => "idle",
        }
    }
}

/// Create maintenance task future.
///
/// Sweeps the pool every `sweep_interval`, re-reading the interval before each wait, until
/// `cancel` is triggered.
pub(crate) fn task<C: Connector>(
    shared: Arc<Shared<C>>,
    cancel: CancellationToken,
) -> impl Future<Output = ()> {
    let span = trace_span!("pool_maintenance", name = shared.name().as_ref());
    async move {
        debug!("maintenance task started");
        loop {
            let interval = shared.config.read().sweep_interval;
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => sweep(&shared).await,
            }
        }
        debug!("maintenance task stopped");
    }
    .instrument(span)
}

/// Run a single maintenance sweep.
///
/// Rules are applied to every entry in creation order, first match wins:
///
/// 1. Assigned for longer than `assigned_timeout`: forcibly reclaimed and closed.
/// 2. Available and older than `retire_after_stale`: closed.
/// 3. Available with a dead physical connection: closed. Connections still locked by a
///    caller are left alone until the next sweep.
/// 4. Available and idle for at least `keep_alive_after`: probed with keep-alive statement,
///    closed if the probe fails.
/// 5. Available, idle for at least `retire_after_idle`, and the pool is above its minimum
///    size: closed.
///
/// Afterwards the pool is topped up to its minimum size.
pub(crate) async fn sweep<C: Connector>(shared: &Shared<C>) {
    let mut entries = shared.entries.lock().await;
    if shared.is_closed() {
        return;
    }
    let config = shared.config();
    let now = Instant::now();
    let mut remaining = entries.len();
    // Collection is replaced only after a complete pass. If cancelled midway, entries closed
    // so far stay in place as retired, and get dropped by the next sweep.
    let snapshot = entries.clone();
    let mut kept: Vec<PoolEntry<C>> = Vec::with_capacity(snapshot.len());
    for entry in snapshot {
        let eviction = if entry.is_retired() {
            // Already closed elsewhere.
            remaining -= 1;
            continue;
        } else if entry.is_assigned() {
            let held = entry
                .last_assigned()
                .map(|s| now.saturating_duration_since(s.at))
                .unwrap_or_default();
            (held > config.assigned_timeout).then_some(Eviction::Assigned)
        } else if now.saturating_duration_since(entry.created_at()) > config.retire_after_stale {
            Some(Eviction::Stale)
        } else {
            match entry.liveness() {
                // Still locked by a caller that has released the entry already.
                None => {
                    trace!(id = entry.id(), "skipping busy connection");
                    None
                }
                Some(false) => Some(Eviction::Dead),
                Some(true) => {
                    let idle = entry.idle_time(now);
                    if idle >= config.keep_alive_after
                        && !keep_alive(&*entry, &config.keep_alive_statement).await
                    {
                        Some(Eviction::KeepAlive)
                    } else if remaining > config.min_size && idle >= config.retire_after_idle {
                        Some(Eviction::Idle)
                    } else {
                        None
                    }
                }
            }
        };
        match eviction {
            Some(reason) => {
                match reason {
                    Eviction::Assigned => warn!(
                        id = entry.id(),
                        usage = entry.usage(),
                        "reclaiming connection held for too long"
                    ),
                    _ => info!(id = entry.id(), reason = reason.as_str(), "closing connection"),
                }
                entry.safe_real_close().await;
                shared.metrics.record_eviction(&shared.label, reason.as_str());
                remaining -= 1;
            }
            None => kept.push(entry),
        }
    }
    *entries = kept;
    if entries.len() < config.min_size {
        shared.initialize(&mut entries, config.min_size).await;
    }
    *shared.last_sweep.lock() = Some(Stamp::now());
    shared.record_state(&entries);
    trace!(size = entries.len(), "maintenance sweep done");
}

/// Probe idle connection with keep-alive statement.
///
/// Returns `false` if the connection should be closed.
async fn keep_alive<C: Connection>(entry: &Entry<C>, statement: &str) -> bool {
    match entry.keep_alive(statement).await {
        Ok(()) => {
            trace!(id = entry.id(), "keep-alive done");
            true
        }
        Err(err) => {
            warn!(id = entry.id(), %err, "keep-alive failed");
            false
        }
    }
}
