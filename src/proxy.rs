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

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, header};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::drain::{self, DrainWatcher};
use crate::metrics::{
    ConnectionClose, ConnectionOpen, IncrementRecorder, Metrics, RequestCompleted, UpstreamFailure,
};
use crate::node::Listener;
use crate::rewrite::{self, Rewriter};
use crate::socket;

pub mod hop;
mod upgrade;

pub type ResponseBody = UnsyncBoxBody<Bytes, hyper::Error>;

type OriginClient = Client<HttpConnector, Incoming>;

// Backoff bounds for transient accept errors, such as running out of file descriptors.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("listener failed: {0}")]
    Accept(#[source] io::Error),

    #[error("invalid request: {0}")]
    Rewrite(#[from] rewrite::Error),

    #[error("origin request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("origin switched to protocol {1:?} when {0:?} was requested")]
    UpgradeMismatch(String, String),
}

/// Proxy accepts connections from the overlay listener and forwards every request on them to
/// the origin.
pub struct Proxy {
    listener: Listener,
    inner: Arc<Inner>,
    drain: DrainWatcher,
    drain_deadline: Duration,
}

struct Inner {
    rewriter: Rewriter,
    client: OriginClient,
    metrics: Arc<Metrics>,
}

impl Proxy {
    pub fn new(
        cfg: &Config,
        listener: Listener,
        rewriter: Rewriter,
        metrics: Arc<Metrics>,
        drain: DrainWatcher,
    ) -> Proxy {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(cfg.upstream_connect_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(cfg.pool_idle_timeout)
            .pool_timer(TokioTimer::new())
            .build(connector);

        Proxy {
            listener,
            inner: Arc::new(Inner {
                rewriter,
                client,
                metrics,
            }),
            drain,
            drain_deadline: cfg.termination_grace_period,
        }
    }

    pub fn address(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until a drain is signaled, then stops accepting and waits up to the drain deadline
    /// for open connections to finish. Returns an error only if the listener becomes unusable.
    pub async fn run(self) -> Result<(), Error> {
        let Proxy {
            listener,
            inner,
            drain,
            drain_deadline,
        } = self;
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, origin = %inner.rewriter.origin(), component = "proxy", "listener established");
        }

        drain::run_with_drain("proxy", drain, drain_deadline, move |connections| {
            accept_loop(listener, inner, connections)
        })
        .await
        .unwrap_or(Ok(()))
    }
}

// Connections hold a watcher on `connections` until they have shut down gracefully.
async fn accept_loop(listener: Listener, inner: Arc<Inner>, connections: DrainWatcher) -> Result<(), Error> {
    let mut backoff = ACCEPT_BACKOFF_MIN;
        loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => {
                backoff = ACCEPT_BACKOFF_MIN;
                conn
            }
            Err(e) if is_fatal_accept_error(&e) => return Err(Error::Accept(e)),
            Err(e) => {
                warn!("accept failed, retrying in {backoff:?}: {e}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                continue;
            }
        };
        debug!(%peer, "accepted connection");
        tokio::spawn(serve_connection(inner.clone(), stream, peer, connections.clone()));
    }
}

// Errors that mean the listening socket itself is unusable, rather than a single connection
// or a resource shortage.
fn is_fatal_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected | io::ErrorKind::Unsupported
    )
}

async fn serve_connection(inner: Arc<Inner>, stream: TcpStream, peer: SocketAddr, drain: DrainWatcher) {
    let _connection_close = inner
        .metrics
        .increment_defer::<_, ConnectionClose>(&ConnectionOpen);
    if let Err(e) = socket::configure_accepted(&stream) {
        debug!(%peer, "failed to configure connection: {e}");
    }

    let svc = service_fn(move |req| {
        let inner = inner.clone();
        async move { Ok::<_, Infallible>(inner.serve_request(req, peer).await) }
    });
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), svc);
    tokio::pin!(conn);
    let res = tokio::select! {
        res = conn.as_mut() => res,
        blocker = drain.wait_for_drain() => {
            conn.as_mut().graceful_shutdown();
            let res = conn.await;
            drop(blocker);
            res
        }
    };
    match res {
        Ok(()) => debug!(%peer, "connection closed"),
        Err(e) => debug!(%peer, "connection closed with error: {e}"),
    }
}

impl Inner {
    async fn serve_request(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ResponseBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let resp = match self.proxy_request(req, peer).await {
            Ok(resp) => resp,
            Err(Error::Rewrite(e)) => {
                warn!(%peer, %method, path = %path, "rejecting request: {e}");
                error_response(StatusCode::BAD_REQUEST, "bad request\n")
            }
            Err(e) => {
                warn!(%peer, %method, path = %path, origin = %self.rewriter.origin(), "{e}");
                self.metrics.increment(&UpstreamFailure);
                error_response(StatusCode::BAD_GATEWAY, "bad gateway\n")
            }
        };
        debug!(%peer, %method, path = %path, status = resp.status().as_u16(), "request complete");
        self.metrics.increment(&RequestCompleted {
            code: resp.status(),
        });
        resp
    }

    async fn proxy_request(
        &self,
        mut req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ResponseBody>, Error> {
        let upgrade = hop::upgrade_type(req.headers());
        hop::remove_hop_by_hop(req.headers_mut());
        let inbound_upgrade = match &upgrade {
            Some(proto) => {
                let headers = req.headers_mut();
                headers.insert(header::CONNECTION, header::HeaderValue::from_static("upgrade"));
                headers.insert(header::UPGRADE, proto.clone());
                Some(hyper::upgrade::on(&mut req))
            }
            None => None,
        };

        let mut req = self.rewriter.rewrite(req, peer).await?;
        hop::append_forwarded_for(req.headers_mut(), peer.ip());

        let mut resp = self.client.request(req).await?;
        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let (Some(inbound), Some(requested)) = (inbound_upgrade, &upgrade) {
                return upgrade::switch_protocols(inbound, resp, requested, peer);
            }
        }
        hop::remove_hop_by_hop(resp.headers_mut());
        Ok(resp.map(BodyExt::boxed_unsync))
    }
}

fn empty_body() -> ResponseBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

fn error_response(code: StatusCode, body: &'static str) -> Response<ResponseBody> {
    Response::builder()
        .status(code)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from_static(body.as_bytes()))
                .map_err(|never| match never {})
                .boxed_unsync(),
        )
        .expect("builder with known status code should not fail")
}
