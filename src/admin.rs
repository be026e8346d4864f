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
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request, Response, StatusCode, header};
use prometheus_client::registry::Registry;
use serde::Serialize;

use crate::config::Config;
use crate::drain::DrainWatcher;
use crate::metrics;
use crate::server::{self, empty_response, plaintext_response};
use crate::signal::ShutdownTrigger;
use crate::telemetry::LogHandle;
use crate::version::BuildInfo;

/// Ready reports whether the proxy is serving. It starts out not ready.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<AtomicBool>);

impl Ready {
    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything the admin endpoints read or act on.
pub struct Service {
    pub config: Arc<Config>,
    pub registry: Arc<Mutex<Registry>>,
    pub log_handle: LogHandle,
    pub shutdown_trigger: ShutdownTrigger,
    pub ready: Ready,
}

pub struct Server {
    s: server::Server<Service>,
}

impl Server {
    pub async fn new(addr: SocketAddr, drain_rx: DrainWatcher, svc: Service) -> anyhow::Result<Self> {
        server::Server::bind("admin", addr, drain_rx, svc)
            .await
            .map(|s| Server { s })
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s
            .spawn(|svc, req| async move { Ok(handle(&svc, req).await) })
    }
}

async fn handle<B>(svc: &Service, req: Request<B>) -> Response<Full<Bytes>> {
    if req.uri().path() == "/quitquitquit" {
        let method = req.method().clone();
        return handle_server_shutdown(&svc.shutdown_trigger, method).await;
    }
    match req.uri().path() {
        "/metrics" | "/stats/prometheus" => handle_metrics(&svc.registry, &req),
        "/logging" => handle_logging(&svc.log_handle, &req),
        "/healthz/ready" => handle_ready(&svc.ready),
        "/config_dump" => handle_config_dump(&svc.config),
        _ => empty_response(StatusCode::NOT_FOUND),
    }
}

fn handle_metrics<B>(registry: &Mutex<Registry>, req: &Request<B>) -> Response<Full<Bytes>> {
    let encoded = match registry.lock() {
        Ok(reg) => metrics::encode_text(&reg).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    match encoded {
        Ok(buf) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type(req))
            .body(buf.into())
            .expect("builder with known status code should not fail"),
        Err(err) => plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err}\n")),
    }
}

const PLAIN_TEXT: &str = "text/plain; charset=utf-8";
const OPEN_METRICS: &str = "application/openmetrics-text;charset=utf-8;version=1.0.0";

fn content_type<B>(req: &Request<B>) -> &'static str {
    let wants_openmetrics = req.headers().get_all(header::ACCEPT).iter().any(|v| {
        v.to_str()
            .unwrap_or_default()
            .split(';')
            .next()
            .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/openmetrics-text"))
    });
    if wants_openmetrics {
        OPEN_METRICS
    } else {
        PLAIN_TEXT
    }
}

fn handle_ready(ready: &Ready) -> Response<Full<Bytes>> {
    if ready.is_ready() {
        plaintext_response(StatusCode::OK, "ready\n".into())
    } else {
        plaintext_response(StatusCode::SERVICE_UNAVAILABLE, "not ready\n".into())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigDump<'a> {
    version: BuildInfo,
    config: &'a Config,
}

fn handle_config_dump(config: &Config) -> Response<Full<Bytes>> {
    let dump = ConfigDump {
        version: BuildInfo::new(),
        config,
    };
    match serde_json::to_vec_pretty(&dump) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .expect("builder with known status code should not fail"),
        Err(e) => plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n")),
    }
}

async fn handle_server_shutdown(
    shutdown_trigger: &ShutdownTrigger,
    method: Method,
) -> Response<Full<Bytes>> {
    match method {
        Method::POST => {
            shutdown_trigger.shutdown_now().await;
            plaintext_response(StatusCode::OK, "shutdown now\n".into())
        }
        _ => empty_response(StatusCode::METHOD_NOT_ALLOWED),
    }
}

static HELP_STRING: &str = "
usage: GET /logging\t\t\t\t\t\t(To list current level)
usage: POST /logging?level=<level>\t\t\t\t(To change global levels)
usage: POST /logging?level={mod1}={level1},{mod2}={level2}\t(To change specific mods' logging level)
usage: POST /logging?reset=true\t\t\t\t(To restore the startup level)

hint: loglevel:\terror|warn|info|debug|trace|off
hint: mod_name:\tthe module name, i.e. tsproxy::proxy
";

fn handle_logging<B>(log_handle: &LogHandle, req: &Request<B>) -> Response<Full<Bytes>> {
    match *req.method() {
        Method::GET => list_loggers(log_handle),
        Method::POST => {
            let qp: HashMap<String, String> = req
                .uri()
                .query()
                .map(|v| {
                    url::form_urlencoded::parse(v.as_bytes())
                        .into_owned()
                        .collect()
                })
                .unwrap_or_default();
            let level = qp.get("level").cloned();
            let reset = qp.get("reset").is_some_and(|r| r == "true");
            match level {
                Some(level) => change_log_level(log_handle, reset, &level),
                None if reset => change_log_level(log_handle, true, ""),
                None => list_loggers(log_handle),
            }
        }
        _ => plaintext_response(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Invalid HTTP method\n {HELP_STRING}"),
        ),
    }
}

fn list_loggers(log_handle: &LogHandle) -> Response<Full<Bytes>> {
    match log_handle.current_level() {
        Ok(level) => plaintext_response(StatusCode::OK, format!("current log level is {level}\n")),
        Err(err) => plaintext_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to get the log level: {err}\n {HELP_STRING}"),
        ),
    }
}

fn change_log_level(log_handle: &LogHandle, reset: bool, level: &str) -> Response<Full<Bytes>> {
    match log_handle.set_level(reset, level) {
        Ok(()) => list_loggers(log_handle),
        Err(e) => plaintext_response(
            StatusCode::BAD_REQUEST,
            format!("failed to set new level: {e}\n{HELP_STRING}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{IncrementRecorder, Metrics, UpstreamFailure};
    use crate::signal::Shutdown;
    use crate::test_helpers::{initialize_telemetry, read_body, test_config};

    fn service(shutdown: &Shutdown) -> (Service, Arc<Metrics>) {
        let mut registry = Registry::default();
        let metrics = Arc::new(Metrics::from(&mut registry));
        let svc = Service {
            config: Arc::new(test_config("127.0.0.1:8080".parse().unwrap())),
            registry: Arc::new(Mutex::new(registry)),
            log_handle: initialize_telemetry(),
            shutdown_trigger: shutdown.trigger(),
            ready: Ready::default(),
        };
        (svc, metrics)
    }

    fn request(method: Method, uri: &str) -> Request<()> {
        Request::builder().method(method).uri(uri).body(()).unwrap()
    }

    async fn body(resp: Response<Full<Bytes>>) -> String {
        String::from_utf8(read_body(resp.into_body()).await.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn metrics_endpoint() {
        let shutdown = Shutdown::new();
        let (svc, metrics) = service(&shutdown);
        metrics.increment(&UpstreamFailure);

        let resp = handle(&svc, request(Method::GET, "/metrics")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], PLAIN_TEXT);
        let text = body(resp).await;
        assert!(text.contains("tsproxy_upstream_failures_total 1"), "{text}");
    }

    #[test]
    fn metrics_content_type() {
        let openmetrics = Request::builder()
            .header("Accept", "application/json")
            .header("Accept", "application/openmetrics-text; version=1.0.0")
            .body(())
            .unwrap();
        assert_eq!(content_type(&openmetrics), OPEN_METRICS);

        let json = Request::builder()
            .header("Accept", "application/json")
            .body(())
            .unwrap();
        assert_eq!(content_type(&json), PLAIN_TEXT);
    }

    #[tokio::test]
    async fn ready_endpoint() {
        let shutdown = Shutdown::new();
        let (svc, _) = service(&shutdown);

        let resp = handle(&svc, request(Method::GET, "/healthz/ready")).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        svc.ready.set(true);
        let resp = handle(&svc, request(Method::GET, "/healthz/ready")).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn logging_endpoint() {
        let shutdown = Shutdown::new();
        let (svc, _) = service(&shutdown);

        let resp = handle(&svc, request(Method::GET, "/logging")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body(resp).await.starts_with("current log level is"));

        let resp = handle(
            &svc,
            request(Method::POST, "/logging?level=tsproxy::admin=trace"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body(resp).await.contains("tsproxy::admin=trace"));

        let resp = handle(&svc, request(Method::POST, "/logging?reset=true")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!body(resp).await.contains("tsproxy::admin=trace"));

        let resp = handle(&svc, request(Method::POST, "/logging?level=tsproxy=loud")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = handle(&svc, request(Method::DELETE, "/logging")).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn config_dump_endpoint() {
        let shutdown = Shutdown::new();
        let (svc, _) = service(&shutdown);

        let resp = handle(&svc, request(Method::GET, "/config_dump")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let dump: serde_json::Value = serde_json::from_str(&body(resp).await).unwrap();
        assert_eq!(dump["config"]["origin"]["port"], 8080);
        assert!(dump["version"]["version"].is_string());
    }

    #[tokio::test]
    async fn quitquitquit_triggers_shutdown() {
        let shutdown = Shutdown::new();
        let (svc, _) = service(&shutdown);

        let resp = handle(&svc, request(Method::GET, "/quitquitquit")).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        let resp = handle(&svc, request(Method::POST, "/quitquitquit")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        tokio::time::timeout(std::time::Duration::from_secs(1), shutdown.wait())
            .await
            .expect("shutdown was triggered");
    }

    #[tokio::test]
    async fn unknown_path() {
        let shutdown = Shutdown::new();
        let (svc, _) = service(&shutdown);
        let resp = handle(&svc, request(Method::GET, "/nope")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
