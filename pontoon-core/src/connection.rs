use crate::{
    Deferred, Error, PolicyToggle, Reactor, Result, SyncClient, Value,
    monitor,
    policy::BypassGuard,
    util::{lock, truncate_long},
};
use anyhow::anyhow;
use std::{
    env,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};
use url::Url;
use urlencoding::decode;

/// How a fresh connection decides between bridged and direct dispatch.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// Start with the async bridge enabled. An `async` parameter in the
    /// connection url overrides this; the `PONTOON_ASYNC` env var fills in
    /// when the url says nothing.
    pub async_queries: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            async_queries: true,
        }
    }
}

/// A synchronous client moored to a reactor.
///
/// [`BridgedConnection::execute`] looks like an ordinary awaitable query
/// call. While the reactor runs and the policy allows it, the query bytes go
/// on the wire, the socket is watched for readability and the caller's task
/// suspends on a one-shot cell that the readiness monitor settles. When the
/// reactor is off, or the caller opted out, the call falls back to the
/// client's own blocking execution on the current thread.
///
/// One connection owns one socket and carries at most one query in flight;
/// a second dispatch while one is pending fails with [`Error::QueryPending`].
pub struct BridgedConnection<C: SyncClient> {
    client: Arc<Mutex<Option<C>>>,
    policy: PolicyToggle,
    pending: AtomicBool,
    reactor: Option<Reactor>,
    url: String,
}

impl<C: SyncClient> BridgedConnection<C> {
    /// Open a connection. The url must carry the `{C::NAME}://` scheme; the
    /// `async` parameter is stripped before the rest is handed to the client
    /// opaquely.
    pub fn connect(url: &str, reactor: Option<Reactor>, options: ConnectOptions) -> Result<Self> {
        let context = || format!("while trying to connect to `{}`", url);
        let decoded = decode(url)
            .map_err(|e| Error::Connection(anyhow::Error::new(e).context(context())))?;
        let prefix = format!("{}://", C::NAME);
        if !decoded.starts_with(&prefix) {
            let error = Error::Connection(
                anyhow!("connection url must start with `{}`", prefix).context(context()),
            );
            log::error!("{:#}", error);
            return Err(error);
        }
        let mut url = Url::parse(&decoded)
            .map_err(|e| Error::Connection(anyhow::Error::new(e).context(context())))?;
        let async_queries = match take_url_param(&mut url, "async", "PONTOON_ASYNC").as_deref() {
            Some(value) => matches!(value, "1" | "true" | "on" | "yes"),
            None => options.async_queries,
        };
        let url: String = url.into();
        let client = C::connect(&url).map_err(|e| {
            let e = Error::Connection(e.context(context()));
            log::error!("{:#}", e);
            e
        })?;
        Ok(Self {
            client: Arc::new(Mutex::new(Some(client))),
            policy: PolicyToggle::new(async_queries),
            pending: AtomicBool::new(false),
            reactor,
            url,
        })
    }

    /// Identity string the ORM layer registers this adapter under.
    pub fn adapter_name(&self) -> String {
        format!("pontoon-{}", C::NAME)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.client).is_some()
    }

    pub fn async_enabled(&self) -> bool {
        self.policy.is_enabled()
    }

    /// Permanently flip the connection into or out of bridged dispatch.
    pub fn set_async(&self, enabled: bool) -> Result<()> {
        self.policy.set_enabled(enabled)
    }

    /// Force direct dispatch until the guard drops.
    pub fn bypass(&self) -> Result<BypassGuard<'_>> {
        self.policy.bypass()
    }

    /// Run one query. Bridged while the reactor runs and the policy allows
    /// it, a direct blocking call otherwise; either way the client's result
    /// or error reaches the caller unchanged.
    ///
    /// Dropping the returned future after the query went on the wire leaves
    /// the socket in an unknown state: the client is discarded on the spot
    /// and [`BridgedConnection::reconnect`] is the recovery path.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<C::Output> {
        if self.pending.swap(true, Ordering::AcqRel) {
            return Err(Error::QueryPending);
        }
        let mut pending = PendingGuard {
            connection: self,
            deferred: None,
        };
        let reactor = self
            .reactor
            .as_ref()
            .filter(|r| r.is_running() && self.policy.is_enabled());
        let outcome = match reactor {
            Some(reactor) => self.execute_bridged(reactor, sql, params, &mut pending).await,
            None => self.execute_direct(sql, params),
        };
        drop(pending);
        if let Err(Error::Driver(_)) = &outcome {
            // The connection stays usable after a driver error unless the
            // socket itself died with it.
            self.discard_if_dead();
        }
        outcome
    }

    /// Close then reopen the connection. Also the only way back after the
    /// socket died or a query was abandoned mid-flight.
    pub fn reconnect(&self) -> Result<()> {
        self.disconnect();
        let client = C::connect(&self.url).map_err(|e| {
            let e = Error::Connection(
                e.context(format!("while trying to reconnect to `{}`", self.url)),
            );
            log::error!("{:#}", e);
            e
        })?;
        *lock(&self.client) = Some(client);
        Ok(())
    }

    /// Drop the client, closing its socket. A pending watch that fires later
    /// finds the slot empty and fails its caller; queries issued after this
    /// fail fast until [`BridgedConnection::reconnect`].
    pub fn disconnect(&self) {
        *lock(&self.client) = None;
        self.pending.store(false, Ordering::Release);
    }

    async fn execute_bridged(
        &self,
        reactor: &Reactor,
        sql: &str,
        params: &[Value],
        pending: &mut PendingGuard<'_, C>,
    ) -> Result<C::Output> {
        let deferred = Deferred::new();
        let registration = {
            let mut slot = lock(&self.client);
            let client = slot.as_mut().ok_or_else(Error::not_connected)?;
            client.send_query(sql, params).map_err(|e| {
                let e = Error::Driver(
                    e.context(format!("while dispatching the query:\n{}", truncate_long(sql))),
                );
                log::error!("{:#}", e);
                e
            })?;
            // From here on the query is on the wire; an exit before the cell
            // settles has to poison the connection.
            pending.deferred = Some(deferred.clone());
            let handler_client = Arc::clone(&self.client);
            let handler_deferred = deferred.clone();
            reactor
                .watch(client.socket(), move || {
                    monitor::drain_and_settle(&handler_client, &handler_deferred)
                })
                .map_err(|e| {
                    let e = Error::Connection(
                        anyhow::Error::new(e)
                            .context("while registering the socket with the reactor"),
                    );
                    log::error!("{:#}", e);
                    e
                })?
        };
        let outcome = deferred.wait().await;
        drop(registration);
        outcome
    }

    fn execute_direct(&self, sql: &str, params: &[Value]) -> Result<C::Output> {
        let mut slot = lock(&self.client);
        let client = slot.as_mut().ok_or_else(Error::not_connected)?;
        client.exec(sql, params).map_err(|e| {
            let e = Error::Driver(
                e.context(format!("while running the query:\n{}", truncate_long(sql))),
            );
            log::error!("{:#}", e);
            e
        })
    }

    fn discard_if_dead(&self) {
        let mut slot = lock(&self.client);
        if slot.as_ref().is_some_and(|c| !c.is_alive()) {
            log::warn!("socket is no longer valid, dropping the client until reconnect");
            *slot = None;
        }
    }
}

struct PendingGuard<'c, C: SyncClient> {
    connection: &'c BridgedConnection<C>,
    deferred: Option<Deferred<C::Output>>,
}

impl<C: SyncClient> Drop for PendingGuard<'_, C> {
    fn drop(&mut self) {
        if let Some(deferred) = &self.deferred
            && !deferred.is_settled()
        {
            // The query is still on the wire, the socket state is unknown.
            log::warn!("query abandoned mid-flight, discarding the connection socket");
            *lock(&self.connection.client) = None;
        }
        self.connection.pending.store(false, Ordering::Release);
    }
}

fn take_url_param(url: &mut Url, key: &str, env_var: &str) -> Option<String> {
    let mut value = None;
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    if let Some(pos) = pairs.iter().position(|(k, _)| k == key) {
        let (_, v) = pairs.remove(pos);
        value = Some(v);
    }
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut()
            .clear()
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    value.or_else(|| env::var(env_var).ok())
}
