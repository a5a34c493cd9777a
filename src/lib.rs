#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

mod config;
mod connector;
mod entry;
mod error;
mod maintenance;
mod metrics;
mod pool;
mod resource;
mod status;
#[cfg(test)]
mod testing;

pub use self::{
    config::{ConnectorConfig, PoolConfig, PoolConfigBuilder},
    connector::{Connection, ConnectionError, Connector},
    entry::EntryStatus,
    error::{ConfigError, Error},
    metrics::PoolState,
    pool::{Pool, Pooled},
    resource::{ConnectionGuard, PooledConnection},
};
