/// Errors surfaced by the bridge. Client-level failures keep their original
/// `anyhow` chain as the payload, the bridge never retries or downgrades.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failure while connecting, or use of a connection whose socket is gone.
    #[error("connection error: {0:#}")]
    Connection(anyhow::Error),
    /// The wrapped client reported a failure while executing or draining.
    #[error("driver error: {0:#}")]
    Driver(anyhow::Error),
    /// A second query was dispatched while one is still in flight. The wire
    /// protocol is not pipelined, queries on one connection never queue.
    #[error("a query is already pending on this connection")]
    QueryPending,
    /// Two policy toggles overlapped on the same connection.
    #[error("overlapping policy toggle on the same connection")]
    PolicyRace,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn not_connected() -> Self {
        Self::Connection(anyhow::anyhow!(
            "connection is closed, call reconnect before issuing queries"
        ))
    }
}
