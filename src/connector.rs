//! Interfaces to physical connections and their factories.

/// Physical connection managed by the pool.
#[async_trait::async_trait]
pub trait Connection: Send + 'static {
    /// Error type returned by connection operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Check whether connection was closed.
    ///
    /// This must be a cheap local check, not a round-trip to the server.
    ///
    /// # Errors
    ///
    /// Returns `Err` if connection state could not be determined.
    fn is_closed(&self) -> Result<bool, Self::Error>;

    /// Execute a statement, discarding any results.
    ///
    /// Used by the pool to keep idle connections alive.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the statement failed, which the pool treats as a dead connection.
    async fn execute(&mut self, statement: &str) -> Result<(), Self::Error>;

    /// Close physical connection.
    ///
    /// # Errors
    ///
    /// Returns `Err` if there was a problem while closing the connection.
    async fn close(self) -> Result<(), Self::Error>;
}

/// Factory for physical connections.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Physical connection type.
    type Connection: Connection;

    /// Open a new physical connection.
    ///
    /// # Errors
    ///
    /// Returns `Err` if connection could not be established.
    async fn connect(&self) -> Result<Self::Connection, <Self::Connection as Connection>::Error>;
}

/// Shorthand for the error type of connections produced by a connector.
pub type ConnectionError<C> = <<C as Connector>::Connection as Connection>::Error;
