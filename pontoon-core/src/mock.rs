//! In-process stand-in for a synchronous database client.
//!
//! [`MockClient`] speaks a trivial line protocol over a Unix socket and
//! implements [`SyncClient`], so the whole bridge can be exercised without a
//! database: a [`MockServer`] on the other end of the socket scripts the
//! responses. Requests are one line (SQL, then rendered parameters, tab
//! separated); a response is either a `rows` header followed by one line per
//! row and a lone `.` terminator, or a single `error <message>` line.
//!
//! Per-endpoint [`MockStats`] count how many queries took the direct path
//! versus the bridged one, which is how tests observe routing decisions.

use crate::{SyncClient, Value};
use anyhow::Context as _;
use std::{
    collections::HashMap,
    env, fs,
    io::{self, BufRead, BufReader, Read, Write},
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    process,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
};

/// Dispatch counters shared by every [`MockClient`] connected to the same
/// socket path.
#[derive(Clone, Default)]
pub struct MockStats {
    inner: Arc<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    sent: AtomicUsize,
    direct: AtomicUsize,
}

impl MockStats {
    /// Queries dispatched through the bridge (`send_query`).
    pub fn sent_queries(&self) -> usize {
        self.inner.sent.load(Ordering::Acquire)
    }

    /// Queries that took the direct blocking path (`exec`).
    pub fn direct_execs(&self) -> usize {
        self.inner.direct.load(Ordering::Acquire)
    }
}

static REGISTRY: OnceLock<Mutex<HashMap<String, MockStats>>> = OnceLock::new();

/// Counters for the endpoint at `path`, shared with any client that connects
/// there.
pub fn stats_for(path: impl AsRef<Path>) -> MockStats {
    let key = path.as_ref().display().to_string();
    REGISTRY
        .get_or_init(Default::default)
        .lock()
        .expect("mock stats registry poisoned")
        .entry(key)
        .or_default()
        .clone()
}

/// `SyncClient` over a Unix socket. Connection urls look like
/// `mock:///path/to/endpoint.sock`.
pub struct MockClient {
    stream: UnixStream,
    buffer: Vec<u8>,
    stats: MockStats,
    alive: bool,
}

impl SyncClient for MockClient {
    const NAME: &'static str = "mock";

    type Output = Vec<Vec<String>>;

    fn connect(url: &str) -> anyhow::Result<Self> {
        let path = url.strip_prefix("mock://").unwrap_or(url);
        let stream = UnixStream::connect(path)
            .with_context(|| format!("cannot reach the mock server at `{}`", path))?;
        Ok(Self {
            stream,
            buffer: Vec::new(),
            stats: stats_for(path),
            alive: true,
        })
    }

    fn exec(&mut self, sql: &str, params: &[Value]) -> anyhow::Result<Self::Output> {
        self.stats.inner.direct.fetch_add(1, Ordering::AcqRel);
        self.write_request(sql, params)?;
        while self.is_busy() {
            self.consume_input()?;
        }
        self.last_result()
    }

    fn send_query(&mut self, sql: &str, params: &[Value]) -> anyhow::Result<()> {
        self.stats.inner.sent.fetch_add(1, Ordering::AcqRel);
        self.write_request(sql, params)
    }

    fn consume_input(&mut self) -> anyhow::Result<()> {
        let mut chunk = [0u8; 4096];
        let read = self.stream.read(&mut chunk).inspect_err(|_| {
            self.alive = false;
        })?;
        if read == 0 {
            self.alive = false;
            anyhow::bail!("mock server closed the connection");
        }
        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(())
    }

    fn is_busy(&self) -> bool {
        !response_complete(&self.buffer)
    }

    fn last_result(&mut self) -> anyhow::Result<Self::Output> {
        let text = std::str::from_utf8(&self.buffer).context("mock response is not utf-8")?;
        let mut lines = text.lines();
        match lines.next() {
            Some("rows") => {
                let mut rows = Vec::new();
                for line in lines {
                    if line == "." {
                        return Ok(rows);
                    }
                    rows.push(line.split('\t').map(str::to_string).collect());
                }
                anyhow::bail!("mock response truncated")
            }
            Some(line) if line.starts_with("error ") => {
                anyhow::bail!("{}", &line["error ".len()..])
            }
            Some(line) => anyhow::bail!("malformed mock response header: {:?}", line),
            None => anyhow::bail!("empty mock response"),
        }
    }

    fn socket(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}

impl MockClient {
    fn write_request(&mut self, sql: &str, params: &[Value]) -> anyhow::Result<()> {
        self.buffer.clear();
        let mut line = sql.replace('\n', " ");
        for param in params {
            line.push('\t');
            line.push_str(&param.to_string());
        }
        line.push('\n');
        self.stream
            .write_all(line.as_bytes())
            .inspect_err(|_| {
                self.alive = false;
            })
            .context("mock request failed")?;
        Ok(())
    }
}

/// A full response is a terminated `rows` block, any single non-`rows` line,
/// or a leading `error` line.
fn response_complete(buffer: &[u8]) -> bool {
    if buffer.starts_with(b"rows") {
        return buffer.windows(3).any(|w| w == b"\n.\n");
    }
    // Errors and garbage complete on the first newline so the drain loop
    // hands them to `last_result` instead of waiting forever.
    buffer.contains(&b'\n')
}

/// Scripted peer for [`MockClient`]. Listens on a unique socket in the
/// system temp directory; clones share the listener.
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    listener: UnixListener,
    path: PathBuf,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

static ENDPOINT: AtomicUsize = AtomicUsize::new(0);

impl MockServer {
    pub fn start() -> io::Result<Self> {
        let path = env::temp_dir().join(format!(
            "pontoon-mock-{}-{}.sock",
            process::id(),
            ENDPOINT.fetch_add(1, Ordering::Relaxed),
        ));
        let _ = fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        Ok(Self {
            inner: Arc::new(ServerInner { listener, path }),
        })
    }

    /// Connection url for clients of this server.
    pub fn url(&self) -> String {
        format!("mock://{}", self.inner.path.display())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Block until a client connects.
    pub fn accept(&self) -> io::Result<MockSession> {
        let (stream, _) = self.inner.listener.accept()?;
        Ok(MockSession {
            reader: BufReader::new(stream.try_clone()?),
            stream,
        })
    }
}

/// One accepted client connection on the server side.
pub struct MockSession {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl MockSession {
    /// Next request line (SQL plus rendered parameters).
    pub fn recv_query(&mut self) -> io::Result<String> {
        let mut line = String::new();
        self.reader.read_line(&mut line)?;
        Ok(line.trim_end_matches('\n').to_string())
    }

    pub fn respond_rows(&mut self, rows: &[&[&str]]) -> io::Result<()> {
        self.stream.write_all(render_rows(rows, true).as_bytes())
    }

    /// Send a `rows` block without its terminator, to exercise partial
    /// drains; complete it with [`MockSession::finish_rows`].
    pub fn respond_rows_partial(&mut self, rows: &[&[&str]]) -> io::Result<()> {
        self.stream.write_all(render_rows(rows, false).as_bytes())
    }

    pub fn finish_rows(&mut self) -> io::Result<()> {
        self.stream.write_all(b".\n")
    }

    pub fn respond_error(&mut self, message: &str) -> io::Result<()> {
        self.stream
            .write_all(format!("error {}\n", message).as_bytes())
    }

    /// A response no client understands.
    pub fn respond_garbage(&mut self) -> io::Result<()> {
        self.stream.write_all(b"?!\n")
    }
}

fn render_rows(rows: &[&[&str]], terminated: bool) -> String {
    let mut out = String::from("rows\n");
    for row in rows {
        out.push_str(&row.join("\t"));
        out.push('\n');
    }
    if terminated {
        out.push_str(".\n");
    }
    out
}
