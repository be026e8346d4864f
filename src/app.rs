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
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Context;
use prometheus_client::registry::Registry;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tracing::{Instrument, error, info, warn};

use crate::drain::{self, DrainTrigger};
use crate::metrics::Metrics;
use crate::node::{NetworkProvider, Node};
use crate::rewrite::Rewriter;
use crate::telemetry::{LogHandle, NodeLogSink};
use crate::{admin, config, proxy, signal};

/// Lifecycle of the service. Every transition is logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    ListenerReady,
    Serving,
    ShuttingDown,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Uninitialized => "uninitialized",
            Phase::ListenerReady => "listener-ready",
            Phase::Serving => "serving",
            Phase::ShuttingDown => "shutting-down",
            Phase::Closed => "closed",
        })
    }
}

fn enter(phase: Phase) {
    info!(%phase, "service phase changed");
}

/// Brings the service up: starts the overlay node, listens on it, starts the admin server and
/// finally the proxy. A failure at any step releases what was already acquired.
pub async fn build(
    config: Arc<config::Config>,
    provider: &dyn NetworkProvider,
    log_handle: LogHandle,
) -> anyhow::Result<Bound> {
    enter(Phase::Uninitialized);
    let node = match provider
        .start_node(&config.hostname, NodeLogSink::new(config.node_log_level))
        .await
    {
        Ok(node) => node,
        Err(e) => {
            enter(Phase::Closed);
            return Err(e).context("failed to start overlay node");
        }
    };
    match start(config, node.as_ref(), log_handle).await {
        Ok(started) => Ok(Bound {
            proxy_address: started.proxy_address,
            admin_address: started.admin_address,
            shutdown: started.shutdown,
            config: started.config,
            node,
            ready: started.ready,
            proxy_drain: started.proxy_drain,
            admin_drain: started.admin_drain,
            proxy_done: started.proxy_done,
        }),
        Err(e) => {
            node.close().await;
            enter(Phase::Closed);
            Err(e)
        }
    }
}

struct Started {
    proxy_address: SocketAddr,
    admin_address: Option<SocketAddr>,
    shutdown: signal::Shutdown,
    config: Arc<config::Config>,
    ready: admin::Ready,
    proxy_drain: DrainTrigger,
    admin_drain: DrainTrigger,
    proxy_done: oneshot::Receiver<Result<(), proxy::Error>>,
}

async fn start(
    config: Arc<config::Config>,
    node: &dyn Node,
    log_handle: LogHandle,
) -> anyhow::Result<Started> {
    let mut registry = Registry::default();
    let metrics = Arc::new(Metrics::from(&mut registry));
    let shutdown = signal::Shutdown::new();
    let ready = admin::Ready::default();

    // Each component drains separately, so they can be released one after the other.
    let (proxy_drain, proxy_drain_rx) = drain::new();
    let (admin_drain, admin_drain_rx) = drain::new();

    let listener = node
        .listen(config.advertise.port)
        .await
        .with_context(|| format!("failed to listen on overlay port {}", config.advertise.port))?;
    let resolver = node
        .identity_client()
        .context("failed to get overlay identity client")?;
    let proxy_address = listener.local_addr()?;
    enter(Phase::ListenerReady);

    // Bound now, served only once the proxy thread is up.
    let admin_server = match config.admin_addr {
        Some(addr) => Some(
            admin::Server::new(
                addr,
                admin_drain_rx,
                admin::Service {
                    config: config.clone(),
                    registry: Arc::new(Mutex::new(registry)),
                    log_handle,
                    shutdown_trigger: shutdown.trigger(),
                    ready: ready.clone(),
                },
            )
            .await
            .context("admin server starts")?,
        ),
        None => None,
    };

    let rewriter = Rewriter::new(
        config.origin.clone(),
        resolver,
        config.identity_lookup_timeout,
        metrics.clone(),
    );
    let proxy = proxy::Proxy::new(&config, listener, rewriter, metrics, proxy_drain_rx);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.num_worker_threads)
        .thread_name_fn(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("tsproxy-proxy-{id}")
        })
        .enable_all()
        .build()
        .context("failed to build proxy runtime")?;
    let (done_tx, proxy_done) = oneshot::channel();
    let span = tracing::span::Span::current();
    thread::Builder::new()
        .name("tsproxy-proxy".to_string())
        .spawn(move || {
            let _span = span.enter();
            let res = runtime.block_on(proxy.run().in_current_span());
            let _ = done_tx.send(res);
        })
        .context("failed to spawn proxy thread")?;

    let admin_address = admin_server.map(|admin_server| {
        let address = admin_server.address();
        admin_server.spawn();
        address
    });

    ready.set(true);
    enter(Phase::Serving);
    Ok(Started {
        proxy_address,
        admin_address,
        shutdown,
        config,
        ready,
        proxy_drain,
        admin_drain,
        proxy_done,
    })
}

pub struct Bound {
    pub proxy_address: SocketAddr,
    pub admin_address: Option<SocketAddr>,

    pub shutdown: signal::Shutdown,
    config: Arc<config::Config>,
    node: Box<dyn Node>,
    ready: admin::Ready,
    proxy_drain: DrainTrigger,
    admin_drain: DrainTrigger,
    proxy_done: oneshot::Receiver<Result<(), proxy::Error>>,
}

impl Bound {
    /// Serves until shutdown is requested or the proxy fails, then drains and releases
    /// everything in reverse order. Returns an error if the proxy failed.
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        let Bound {
            shutdown,
            config,
            node,
            ready,
            proxy_drain,
            admin_drain,
            mut proxy_done,
            ..
        } = self;

        // Wait for a signal to shutdown from explicit admin shutdown or signal, unless the
        // proxy stops on its own first.
        let early = tokio::select! {
            _ = shutdown.wait() => None,
            res = &mut proxy_done => Some(res),
        };
        enter(Phase::ShuttingDown);
        ready.set(false);

        // If draining takes too long, terminate anyways.
        let deadline = Instant::now() + config.termination_grace_period;
        let graceful = time::timeout_at(deadline, async {
            proxy_drain.start_drain_and_wait().await;
            admin_drain.start_drain_and_wait().await;
        })
        .await;
        match graceful {
            Ok(()) => info!("Shutdown completed gracefully"),
            Err(_) => warn!(
                "Graceful shutdown did not complete in {:?}, terminating now",
                config.termination_grace_period
            ),
        }

        let result = match early {
            Some(res) => res,
            None => match time::timeout_at(deadline, proxy_done).await {
                Ok(res) => res,
                // Still running past the deadline; it goes away with the process.
                Err(_) => Ok(Ok(())),
            },
        };
        node.close().await;
        enter(Phase::Closed);

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("proxy failed: {e}");
                Err(e).context("proxy failed while serving")
            }
            Err(_) => anyhow::bail!("proxy thread exited unexpectedly"),
        }
    }
}
