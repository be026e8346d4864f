// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

enum Never {}

/// Creates a drain pair.
/// * DrainTrigger starts a drain and waits for it to complete.
/// * DrainWatcher is held by anything that wants to take part in the drain. It can be cloned,
///   and a drain does not complete until every clone, and every [`DrainBlocker`] obtained from
///   one, has been dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
    let (signal_tx, signal_rx) = watch::channel(false);
    let (done_tx, done_rx) = mpsc::channel(1);
    (
        DrainTrigger { signal_tx, done_rx },
        DrainWatcher { signal_rx, done_tx },
    )
}

/// run_with_drain runs the future built by `make_future` until it completes or `drain` is
/// signaled, and returns its output if it completed on its own.
///
/// `make_future` is handed a sub-drain watcher for the work it spawns, such as connections.
/// Once `drain` is signaled the future is dropped, and the spawned work gets up to `deadline`
/// to finish before this returns. The outer drain stays open until then.
pub async fn run_with_drain<F, Fut, O>(
    component: &str,
    drain: DrainWatcher,
    deadline: Duration,
    make_future: F,
) -> Option<O>
where
    F: FnOnce(DrainWatcher) -> Fut,
    Fut: Future<Output = O>,
{
    let (sub_drain_signal, sub_drain) = new();
    let fut = make_future(sub_drain);
    tokio::select! {
        res = fut => Some(res),
        blocker = drain.wait_for_drain() => {
            debug!(component, "drain started, waiting {deadline:?} for any connections to complete");
            if tokio::time::timeout(deadline, sub_drain_signal.start_drain_and_wait())
                .await
                .is_err()
            {
                warn!(component, "drain duration expired with pending connections, forcefully shutting down");
            }
            info!(component, "drain complete");
            drop(blocker);
            None
        }
    }
}

pub struct DrainTrigger {
    signal_tx: watch::Sender<bool>,
    done_rx: mpsc::Receiver<Never>,
}

impl DrainTrigger {
    /// Signals every watcher to drain and waits until they have all been released.
    pub async fn start_drain_and_wait(mut self) {
        let _ = self.signal_tx.send(true);
        // Nothing is ever sent; recv returns None once all senders are gone.
        if let Some(never) = self.done_rx.recv().await {
            match never {}
        }
    }
}

#[derive(Clone)]
pub struct DrainWatcher {
    signal_rx: watch::Receiver<bool>,
    done_tx: mpsc::Sender<Never>,
}

impl DrainWatcher {
    /// Completes once a drain has been signaled, or the trigger is gone. The returned blocker
    /// holds the drain open until it is dropped, giving the holder time to clean up.
    pub async fn wait_for_drain(mut self) -> DrainBlocker {
        // An error means the trigger was dropped, which is as good as a drain signal.
        let _ = self.signal_rx.wait_for(|draining| *draining).await;
        DrainBlocker(self.done_tx)
    }
}

/// Keeps a drain from completing while held.
#[must_use = "DrainBlocker should be held until cleanup completes"]
pub struct DrainBlocker(#[allow(dead_code)] mpsc::Sender<Never>);

impl fmt::Debug for DrainTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainTrigger").finish_non_exhaustive()
    }
}

impl fmt::Debug for DrainWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainWatcher").finish_non_exhaustive()
    }
}

impl fmt::Debug for DrainBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainBlocker").finish_non_exhaustive()
    }
}
