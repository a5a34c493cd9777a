//! Human-readable pool status report.

use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::{config::PoolConfig, connector::Connection, entry::Entry};

/// Pools up to this size get every entry listed in the report.
const LIST_ALL_UP_TO: usize = 10;

/// Build status report for a list of pool entries.
pub(crate) fn report<C: Connection>(
    entries: &[Arc<Entry<C>>],
    last_sweep: Option<DateTime<Local>>,
    config: &PoolConfig,
) -> String {
    let today = Local::now().date_naive();
    let describe = |entry: &Arc<Entry<C>>| entry.describe(today);
    let mut lines = Vec::new();
    match entries {
        [] => lines.push("No connection in the pool.".to_string()),
        [single] => lines.push(format!(
            "A single connection in the pool: {}",
            describe(single)
        )),
        _ if entries.len() <= LIST_ALL_UP_TO => {
            lines.push("Connections in the pool:".to_string());
            lines.extend(entries.iter().map(|e| format!("  {}", describe(e))));
        }
        [first, .., last] => {
            let available: Vec<_> = entries
                .iter()
                .filter(|e| !e.is_assigned())
                .collect();
            let used = || {
                entries
                    .iter()
                    .filter_map(|e| e.last_assigned().map(|s| (s.at, e)))
            };
            let newest = used().max_by_key(|(at, _)| *at);
            let oldest = used().min_by_key(|(at, _)| *at);
            lines.push(format!(
                "Available connections: {} of {}",
                available.len(),
                entries.len()
            ));
            lines.push(format!("The first: {}", describe(first)));
            lines.push(format!("The last: {}", describe(last)));
            if let Some(entry) = available.last().copied() {
                lines.push(format!("The last available: {}", describe(entry)));
            }
            if let Some((newest_at, entry)) = newest {
                lines.push(format!("The most recently used: {}", describe(entry)));
                if let Some((oldest_at, entry)) = oldest {
                    if oldest_at < newest_at {
                        lines.push(format!("The least recently used: {}", describe(entry)));
                    }
                }
            }
        }
    }
    match last_sweep {
        Some(at) => lines.push(format!(
            "Last maintenance sweep at {}",
            at.format("%b %-d %H:%M:%S")
        )),
        None => lines.push("No maintenance sweep done yet.".to_string()),
    }
    lines.push(format!("Configuration: {config}"));
    lines.join("\n")
}
