//! Mock connector and connection for tests.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::connector::{Connection, Connector};

/// Mock physical connection.
///
/// All switches are shared between clones, so tests can keep a clone around to break or
/// inspect a connection owned by the pool.
#[derive(Clone, Debug, Default)]
pub(crate) struct TestConnection {
    pub(crate) closed: Arc<AtomicBool>,
    pub(crate) fail_check: Arc<AtomicBool>,
    pub(crate) fail_execute: Arc<AtomicBool>,
    pub(crate) slow_execute: Arc<AtomicBool>,
    pub(crate) fail_close: Arc<AtomicBool>,
    pub(crate) closes: Arc<AtomicUsize>,
    pub(crate) statements: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Connection for TestConnection {
    type Error = io::Error;

    fn is_closed(&self) -> Result<bool, Self::Error> {
        if self.fail_check.load(Ordering::SeqCst) {
            return Err(io::Error::other("check failed"));
        }
        Ok(self.closed.load(Ordering::SeqCst))
    }

    async fn execute(&mut self, statement: &str) -> Result<(), Self::Error> {
        if self.slow_execute.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        if self.fail_execute.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection reset"));
        }
        self.statements.lock().push(statement.to_string());
        Ok(())
    }

    async fn close(self) -> Result<(), Self::Error> {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::other("close failed"));
        }
        Ok(())
    }
}

/// Mock connector, remembering every connection it has opened.
#[derive(Clone, Debug, Default)]
pub(crate) struct TestConnector {
    pub(crate) connects: Arc<AtomicUsize>,
    pub(crate) fail_connect: Arc<AtomicBool>,
    pub(crate) connect_closed: Arc<AtomicBool>,
    pub(crate) opened: Arc<Mutex<Vec<TestConnection>>>,
}

impl TestConnector {
    /// Number of successfully opened connections.
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Handle to the n-th opened connection, counting from zero.
    pub(crate) fn opened(&self, n: usize) -> TestConnection {
        self.opened.lock()[n].clone()
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Connector for TestConnector {
    type Connection = TestConnection;

    async fn connect(&self) -> Result<Self::Connection, io::Error> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let conn = TestConnection::default();
        conn.closed
            .store(self.connect_closed.load(Ordering::SeqCst), Ordering::SeqCst);
        self.opened.lock().push(conn.clone());
        Ok(conn)
    }
}
