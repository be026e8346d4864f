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

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tracing::debug;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

struct State {
    backend_state: String,
    addresses: Vec<IpAddr>,
    host_name: String,
    peers: HashMap<IpAddr, Value>,
    whois_queries: Vec<String>,
}

/// FakeLocalApi serves the parts of tailscaled's LocalAPI that the proxy uses, on a unix
/// socket in the temp directory.
pub struct FakeLocalApi {
    path: PathBuf,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

impl FakeLocalApi {
    pub async fn spawn() -> FakeLocalApi {
        let path = std::env::temp_dir().join(format!(
            "tsproxy-localapi-{}-{}.sock",
            std::process::id(),
            NEXT_ID.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let state = Arc::new(Mutex::new(State {
            backend_state: "Running".to_string(),
            addresses: vec![IpAddr::from([127, 0, 0, 1])],
            host_name: "hello".to_string(),
            peers: HashMap::new(),
            whois_queries: Vec::new(),
        }));
        let task_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = task_state.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(&state, req)) }
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        debug!("fake localapi connection error: {e}");
                    }
                });
            }
        });

        FakeLocalApi { path, state, task }
    }

    pub fn socket(&self) -> &Path {
        &self.path
    }

    /// Registers the WhoIs answer for connections from `ip`.
    pub fn add_peer(&self, ip: IpAddr, whois: Value) {
        self.state.lock().unwrap().peers.insert(ip, whois);
    }

    pub fn set_backend_state(&self, state: &str) {
        self.state.lock().unwrap().backend_state = state.to_string();
    }

    pub fn set_addresses(&self, addresses: Vec<IpAddr>) {
        self.state.lock().unwrap().addresses = addresses;
    }

    /// The decoded `addr` parameter of every WhoIs request received so far.
    pub fn whois_queries(&self) -> Vec<String> {
        self.state.lock().unwrap().whois_queries.clone()
    }
}

impl Drop for FakeLocalApi {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

fn handle(state: &Mutex<State>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if req.headers().get(hyper::header::HOST).is_none() {
        return respond(StatusCode::BAD_REQUEST, "missing host\n".into());
    }
    let mut state = state.lock().unwrap();
    match req.uri().path() {
        "/localapi/v0/status" => {
            let body = json!({
                "BackendState": state.backend_state,
                "TailscaleIPs": state.addresses,
                "Self": {"HostName": state.host_name, "DNSName": format!("{}.tailnet.ts.net.", state.host_name)},
            });
            respond(StatusCode::OK, body.to_string())
        }
        "/localapi/v0/whois" => {
            let addr = url::form_urlencoded::parse(req.uri().query().unwrap_or_default().as_bytes())
                .find(|(k, _)| k == "addr")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default();
            state.whois_queries.push(addr.clone());
            let Ok(addr) = addr.parse::<SocketAddr>() else {
                return respond(StatusCode::BAD_REQUEST, "invalid 'addr' parameter\n".into());
            };
            match state.peers.get(&addr.ip()) {
                Some(who) => respond(StatusCode::OK, who.to_string()),
                None => respond(StatusCode::NOT_FOUND, "no match for IP:port\n".into()),
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "not found\n".into()),
    }
}

fn respond(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
