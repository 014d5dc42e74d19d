use std::fmt::{self, Display};
use std::os::fd::RawFd;

/// Query parameter values. The bridge never interprets these, they travel to
/// the client verbatim.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Capability seam over a synchronous database client.
///
/// The bridge wraps any conforming client instead of inheriting from a
/// concrete driver type, so mocks substitute freely in tests. The method set
/// mirrors the nonblocking primitives of libpq-style clients: put the query
/// on the wire, consume available input when the socket turns readable, poll
/// busyness, then collect the finished result.
///
/// SQL text and parameters are opaque here. Statement caching, pooling and
/// transaction semantics belong to the client and its caller.
pub trait SyncClient: Send + Sized + 'static {
    /// Connection-url scheme, also used in the adapter identity.
    const NAME: &'static str;

    /// Finished result of one query.
    type Output: Send + 'static;

    fn connect(url: &str) -> anyhow::Result<Self>;

    /// Direct blocking execution. The synchronous fallback routes here and
    /// must observe exactly the rows and errors the client would report on
    /// its own.
    fn exec(&mut self, sql: &str, params: &[Value]) -> anyhow::Result<Self::Output>;

    /// Put the query bytes on the wire without waiting for the answer.
    fn send_query(&mut self, sql: &str, params: &[Value]) -> anyhow::Result<()>;

    /// Consume whatever input is currently available on the socket.
    fn consume_input(&mut self) -> anyhow::Result<()>;

    /// Whether the client still waits for more input for the current query.
    fn is_busy(&self) -> bool;

    /// Finished result of the last dispatched query.
    fn last_result(&mut self) -> anyhow::Result<Self::Output>;

    /// Descriptor to watch for readability.
    fn socket(&self) -> RawFd;

    /// Whether the underlying socket is still usable. Consulted after a
    /// failure to decide between keeping the connection and failing fast
    /// until reconnect.
    fn is_alive(&self) -> bool;
}
