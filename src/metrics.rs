use std::{
    borrow::Cow,
    sync::{Arc, LazyLock},
};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram},
    Key, KeyValue, StringValue, Value,
};

/// Central metrics singleton for pool metrics.
pub(crate) static POOL_METRICS: LazyLock<Arc<Metrics>> = LazyLock::new(|| Arc::new(Metrics::new()));

const KEY_POOL_NAME: Key = Key::from_static_str("db.client.connection.pool.name");
const KEY_STATE: Key = Key::from_static_str("db.client.connection.state");
const KEY_REASON: Key = Key::from_static_str("db.client.connection.eviction.reason");

/// Storage for pool metrics.
pub(crate) struct Metrics {
    /// The number of connections that are currently in state described by the state attribute.
    pub conn_count: Gauge<u64>,
    /// The time it took to obtain an open connection from the pool.
    pub wait_time: Histogram<f64>,
    /// The time between borrowing a connection and returning it to the pool.
    pub use_time: Histogram<f64>,
    /// The time it took to create a new connection.
    pub create_time: Histogram<f64>,
    /// The number of connection timeouts that have occurred trying to obtain a connection.
    pub timeouts: Counter<u64>,
    /// The number of connections closed by pool maintenance.
    pub evictions: Counter<u64>,
    /// The minimum number of idle open connections allowed.
    pub idle_min: Gauge<u64>,
    /// The maximum number of open connections allowed.
    pub conn_max: Gauge<u64>,
}

impl Metrics {
    /// Create new storage for pool metrics.
    ///
    /// You probably don't need this, as all pools use a central metrics singleton for storage.
    pub(crate) fn new() -> Self {
        let meter = global::meter("connpool");
        // db.client.connection.pool.name (string)
        // db.client.connection.state (idle / used)
        let conn_count = meter
            .u64_gauge("db.client.connection.count")
            .with_description("The number of connections that are currently in state described by the state attribute.")
            .build();
        // db.client.connection.pool.name (string)
        let wait_time = meter
            .f64_histogram("db.client.connection.wait_time")
            .with_unit("s")
            .with_description("The time it took to obtain an open connection from the pool.")
            .build();
        // db.client.connection.pool.name (string)
        let use_time = meter
            .f64_histogram("db.client.connection.use_time")
            .with_unit("s")
            .with_description(
                "The time between borrowing a connection and returning it to the pool.",
            )
            .build();
        // db.client.connection.pool.name (string)
        let create_time = meter
            .f64_histogram("db.client.connection.create_time")
            .with_unit("s")
            .with_description("The time it took to create a new connection.")
            .build();
        // db.client.connection.pool.name (string)
        let timeouts = meter
            .u64_counter("db.client.connection.timeouts")
            .with_description("The number of connection timeouts that have occurred trying to obtain a connection from the pool.")
            .build();
        // db.client.connection.pool.name (string)
        // db.client.connection.eviction.reason (string)
        let evictions = meter
            .u64_counter("db.client.connection.evictions")
            .with_description("The number of connections closed by pool maintenance.")
            .build();
        // db.client.connection.pool.name (string)
        let idle_min = meter
            .u64_gauge("db.client.connection.idle.min")
            .with_description("The minimum number of idle open connections allowed.")
            .build();
        // db.client.connection.pool.name (string)
        let conn_max = meter
            .u64_gauge("db.client.connection.max")
            .with_description("The maximum number of open connections allowed.")
            .build();
        Metrics {
            conn_count,
            wait_time,
            use_time,
            create_time,
            timeouts,
            evictions,
            idle_min,
            conn_max,
        }
    }

    pub(crate) fn record_state(&self, label: &[KeyValue], state: &PoolState) {
        self.conn_max.record(state.max_size as u64, label);
        self.idle_min.record(state.min_size as u64, label);
        let idle_label = status_kv(label[0].clone(), "idle");
        self.conn_count.record(state.idle as u64, &idle_label);
        let used_label = status_kv(label[0].clone(), "used");
        self.conn_count.record(state.in_use as u64, &used_label);
    }

    pub(crate) fn record_eviction(&self, label: &[KeyValue], reason: &'static str) {
        let reason_label = [
            label[0].clone(),
            KeyValue::new(KEY_REASON, Value::String(StringValue::from(reason))),
        ];
        self.evictions.add(1, &reason_label);
    }
}

pub(crate) fn pool_kv(name: Cow<'static, str>) -> [KeyValue; 1] {
    [KeyValue::new(KEY_POOL_NAME, name)]
}

pub(crate) fn status_kv(name: KeyValue, status: &'static str) -> [KeyValue; 2] {
    [
        name,
        KeyValue::new(KEY_STATE, Value::String(StringValue::from(status))),
    ]
}

/// Point-in-time counts of a pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolState {
    /// Configured maximum number of connections.
    pub max_size: usize,
    /// Configured minimum number of connections.
    pub min_size: usize,
    /// Current total (`idle` + `in_use`) number of connections in the pool.
    pub size: usize,
    /// Current number of idle (not acquired) connections.
    pub idle: usize,
    /// Current number of in-use (acquired) connections.
    pub in_use: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels() {
        let label = pool_kv("reports".into());
        assert_eq!(label[0].key.as_str(), "db.client.connection.pool.name");
        assert_eq!(label[0].value.as_str(), "reports");
        let state = status_kv(label[0].clone(), "idle");
        assert_eq!(state[1].key.as_str(), "db.client.connection.state");
        assert_eq!(state[1].value.as_str(), "idle");
    }

    #[test]
    fn record_with_noop_provider() {
        let metrics = Metrics::new();
        let label = pool_kv("default".into());
        metrics.record_state(
            &label,
            &PoolState {
                max_size: 3,
                min_size: 1,
                size: 2,
                idle: 1,
                in_use: 1,
            },
        );
        metrics.record_eviction(&label, "idle");
    }
}
