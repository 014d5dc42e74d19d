use crate::{Deferred, Error, SyncClient, util::lock};
use std::sync::{Arc, Mutex};

/// One-shot readiness handler for a pending query.
///
/// Runs on the reactor thread after the watch has been detached: drains the
/// client until it stops reporting busy, then settles the cell with the
/// finished result, or with the drain error. The failure settle is the single
/// funnel through which bridged-path errors reach the caller, there is no
/// retry here.
pub(crate) fn drain_and_settle<C: SyncClient>(
    client: &Arc<Mutex<Option<C>>>,
    deferred: &Deferred<C::Output>,
) {
    let mut slot = lock(client);
    let Some(client) = slot.as_mut() else {
        deferred.fail(Error::Connection(anyhow::anyhow!(
            "connection was closed while a query was pending"
        )));
        return;
    };
    match drain(client) {
        Ok(result) => {
            deferred.succeed(result);
        }
        Err(e) => {
            log::error!("{:#}", e);
            deferred.fail(Error::Driver(e));
        }
    }
}

fn drain<C: SyncClient>(client: &mut C) -> anyhow::Result<C::Output> {
    // Partial reads are expected: keep consuming until the client stops
    // reporting busy for the current query.
    while client.is_busy() {
        client.consume_input()?;
    }
    client.last_result()
}
