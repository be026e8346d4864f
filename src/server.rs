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
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::drain::DrainWatcher;

pub fn empty_response(code: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .body(Full::default())
        .expect("builder with known status code should not fail")
}

pub fn plaintext_response(code: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(body.into())
        .expect("builder with known status code should not fail")
}

/// Server implements a generic HTTP server with the follow behavior:
/// * HTTP/1.1 plaintext only
/// * Draining
/// * Handler errors become 500 responses
pub struct Server<S> {
    name: String,
    addr: SocketAddr,
    listener: TcpListener,
    drain_rx: DrainWatcher,
    state: S,
}

impl<S> Server<S> {
    pub async fn bind(
        name: &str,
        addr: SocketAddr,
        drain_rx: DrainWatcher,
        state: S,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {name} server to {addr}"))?;
        let addr = listener.local_addr()?;
        Ok(Server {
            name: name.to_string(),
            addr,
            listener,
            drain_rx,
            state,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn spawn<F, R>(self, f: F)
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, Request<Incoming>) -> R + Send + Sync + 'static,
        R: Future<Output = Result<Response<Full<Bytes>>, anyhow::Error>> + Send + 'static,
    {
        let Server {
            name,
            addr: address,
            listener,
            drain_rx,
            state,
        } = self;
        let state = Arc::new(state);
        let f = Arc::new(f);
        info!(%address, component = %name, "listener established");

        tokio::spawn(async move {
            let stop = drain_rx.clone().wait_for_drain();
            tokio::pin!(stop);
            loop {
                let (stream, peer) = tokio::select! {
                    res = listener.accept() => match res {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(component = %name, "accept failed: {e}");
                            continue;
                        }
                    },
                    _blocker = &mut stop => {
                        info!(component = %name, "server drained");
                        return;
                    }
                };
                debug!(component = %name, %peer, "accepted connection");

                let state = state.clone();
                let f = f.clone();
                let drain = drain_rx.clone();
                tokio::spawn(async move {
                    let svc = hyper::service::service_fn(move |req| {
                        let state = state.clone();
                        let f = f.clone();
                        async move {
                            Ok::<_, Infallible>(f(state, req).await.unwrap_or_else(|err| {
                                plaintext_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    format!("{err}\n"),
                                )
                            }))
                        }
                    });
                    let conn = hyper::server::conn::http1::Builder::new()
                        .half_close(true)
                        .timer(TokioTimer::new())
                        .header_read_timeout(Duration::from_secs(2))
                        .max_buf_size(8 * 1024)
                        .serve_connection(TokioIo::new(stream), svc);
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
                    if let Err(e) = res {
                        debug!(%peer, "connection error: {e}");
                    }
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::Empty;

    use super::*;
    use crate::drain;
    use crate::test_helpers::{connect, read_body};

    #[tokio::test]
    async fn serves_until_drained() {
        let (trigger, watcher) = drain::new();
        let server = Server::bind("test", "127.0.0.1:0".parse().unwrap(), watcher, "state")
            .await
            .unwrap();
        let addr = server.address();
        server.spawn(|state, req| async move {
            match req.uri().path() {
                "/state" => Ok(plaintext_response(StatusCode::OK, state.to_string())),
                "/fail" => anyhow::bail!("handler failed"),
                _ => Ok(empty_response(StatusCode::NOT_FOUND)),
            }
        });

        let mut client = connect(addr).await;
        let get = |path: &str| {
            Request::get(path)
                .header("host", "test")
                .body(Empty::<Bytes>::new())
                .unwrap()
        };

        let resp = client.send_request(get("/state")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(read_body(resp.into_body()).await, "state");

        let resp = client.send_request(get("/fail")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(read_body(resp.into_body()).await, "handler failed\n");

        let resp = client.send_request(get("/other")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // The idle keep-alive connection is closed by the drain.
        tokio::time::timeout(Duration::from_secs(5), trigger.start_drain_and_wait())
            .await
            .expect("drain completes");
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
