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
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::UnsyncBoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version, header};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// What the origin saw of a request.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// Remote address of the connection the request arrived on.
    pub peer: SocketAddr,
}

/// HeaderEchoOrigin is an HTTP/1.1 origin that records every request it receives.
///
/// * `/echo` streams the request body back as the response body.
/// * `/status/<code>` answers with that status code.
/// * `/delay/<ms>` answers after waiting that many milliseconds. A wait that is cut short
///   because the connection went away is counted in [`HeaderEchoOrigin::cancelled_requests`].
/// * `/upgrade` accepts an `Upgrade` and then echoes raw bytes.
/// * anything else answers with a JSON description of the request.
pub struct HeaderEchoOrigin {
    addr: SocketAddr,
    state: Arc<State>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    requests: Mutex<Vec<RecordedRequest>>,
    cancelled: AtomicUsize,
}

impl HeaderEchoOrigin {
    pub async fn spawn() -> HeaderEchoOrigin {
        Self::bind("127.0.0.1:0".parse().unwrap()).await
    }

    /// Like [`HeaderEchoOrigin::spawn`], but on a given address.
    pub async fn bind(addr: SocketAddr) -> HeaderEchoOrigin {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());

        let shared = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    return;
                };
                let shared = shared.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let shared = shared.clone();
                        async move { Ok::<_, Infallible>(handle(&shared, peer, req).await) }
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .with_upgrades()
                        .await
                    {
                        debug!("origin connection error: {e}");
                    }
                });
            }
        });

        HeaderEchoOrigin { addr, state, task }
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Number of `/delay` requests abandoned before their response was ready.
    pub fn cancelled_requests(&self) -> usize {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Stops accepting connections. Established connections are left alone.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for HeaderEchoOrigin {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// Counts itself as cancelled if dropped while still armed.
struct PendingDelay<'a> {
    cancelled: &'a AtomicUsize,
    armed: bool,
}

impl Drop for PendingDelay<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("origin request dropped before completion");
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

async fn handle(
    state: &State,
    peer: SocketAddr,
    mut req: Request<Incoming>,
) -> Response<UnsyncBoxBody<Bytes, hyper::Error>> {
    state.requests.lock().unwrap().push(RecordedRequest {
        method: req.method().clone(),
        uri: req.uri().clone(),
        version: req.version(),
        headers: req.headers().clone(),
        peer,
    });

    let path = req.uri().path().to_string();
    if path == "/echo" {
        return Response::new(req.into_body().boxed_unsync());
    }
    if let Some(ms) = path.strip_prefix("/delay/") {
        let Ok(ms) = ms.parse() else {
            return full(StatusCode::BAD_REQUEST, "", "text/plain");
        };
        let mut pending = PendingDelay {
            cancelled: &state.cancelled,
            armed: true,
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
        pending.armed = false;
        return full(StatusCode::OK, &format!("waited {ms}ms"), "text/plain");
    }
    if let Some(code) = path.strip_prefix("/status/") {
        let status = code.parse().ok().and_then(|c| StatusCode::from_u16(c).ok());
        return full(status.unwrap_or(StatusCode::BAD_REQUEST), "", "text/plain");
    }
    if path == "/upgrade" && req.headers().contains_key(header::UPGRADE) {
        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            let Ok(upgraded) = on_upgrade.await else {
                return;
            };
            let mut io = TokioIo::new(upgraded);
            let mut buf = vec![0; 1024];
            loop {
                match io.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        trace!("origin upgrade echo {n} bytes");
                        if io.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        return Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "echo")
            .body(empty())
            .unwrap();
    }

    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect();
    let body = serde_json::json!({
        "method": req.method().as_str(),
        "uri": req.uri().to_string(),
        "headers": headers,
    });
    full(StatusCode::OK, &body.to_string(), "application/json")
}

fn full(status: StatusCode, body: &str, content_type: &str) -> Response<UnsyncBoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed_unsync(),
        )
        .unwrap()
}

fn empty() -> UnsyncBoxBody<Bytes, hyper::Error> {
    http_body_util::Empty::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}
