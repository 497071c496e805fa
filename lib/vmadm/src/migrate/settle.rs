// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for a VM to come to rest.

use std::time::Duration;

use slog::{debug, Logger};
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;
use vmadm_config::Settle;

use crate::error::Error;
use crate::host::{Interface, Observed, StateObserver};

/// Polls `observer` until the VM `id` reports a settled state, returning that
/// observation.
///
/// Polling stops at the earlier of `deadline` and the configured maximum
/// wait. Per-VM locks are never held here, so updates and deletes can run
/// while a VM is being waited on.
pub async fn settle(
    log: &Logger,
    observer: &dyn StateObserver,
    id: Uuid,
    cfg: &Settle,
    deadline: Option<Instant>,
) -> Result<Observed, Error> {
    let start = Instant::now();
    let limit = start + cfg.max_wait();
    let stop = deadline.map_or(limit, |d| d.min(limit));

    // A zero period would make `interval` panic.
    let period = cfg.poll_interval().max(Duration::from_millis(1));
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        let seen = observer
            .observe(id)
            .await
            .map_err(|e| Error::external(Interface::State, id, e))?;
        if seen.is_settled() {
            debug!(log, "VM settled";
                "state" => %seen.state,
                "waited" => ?start.elapsed());
            return Ok(seen);
        }
        debug!(log, "waiting for VM to settle";
            "state" => %seen.state,
            "to" => seen.transition.as_ref().map(|t| t.to.to_string()));

        if time::timeout_at(stop, ticker.tick()).await.is_err() {
            return Err(Error::TimedOut {
                vm: id,
                waited: start.elapsed(),
                last_state: seen.state,
            });
        }
    }
}
