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
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode, header};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::UnixStream;
use tracing::debug;

use super::{Error, Identity, IdentityResolver};
use crate::telemetry::NodeLogSink;

// tailscaled ignores the host, but requires this one to be set.
const LOCALAPI_HOST: &str = "local-tailscaled.sock";
const WHOIS_PATH: &str = "/localapi/v0/whois";
const STATUS_PATH: &str = "/localapi/v0/status";

/// LocalApiClient talks to the LocalAPI that tailscaled serves on its unix socket.
///
/// Every call uses its own connection, so a single client can be shared by any number of
/// concurrent lookups.
#[derive(Clone, Debug)]
pub struct LocalApiClient {
    socket: PathBuf,
    log: NodeLogSink,
}

/// The subset of tailscaled's status we care about.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "BackendState", default)]
    pub backend_state: String,
    #[serde(rename = "TailscaleIPs", default)]
    pub tailscale_ips: Vec<IpAddr>,
    #[serde(rename = "Self", default)]
    pub self_node: Option<SelfStatus>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct SelfStatus {
    #[serde(rename = "HostName", default)]
    pub host_name: String,
}

impl Status {
    pub fn is_running(&self) -> bool {
        self.backend_state == "Running"
    }
}

#[derive(Deserialize, Debug)]
struct WhoIsResponse {
    #[serde(rename = "Node")]
    node: WhoIsNode,
    #[serde(rename = "UserProfile")]
    user_profile: UserProfile,
}

#[derive(Deserialize, Debug)]
struct WhoIsNode {
    #[serde(rename = "ComputedName", default)]
    computed_name: String,
}

#[derive(Deserialize, Debug)]
struct UserProfile {
    #[serde(rename = "ID")]
    id: StableId,
    #[serde(rename = "LoginName", default)]
    login_name: String,
    #[serde(rename = "DisplayName", default)]
    display_name: String,
}

// User ids are numeric today, but are treated as opaque.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum StableId {
    Number(i64),
    Text(String),
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StableId::Number(n) => write!(f, "{n}"),
            StableId::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<WhoIsResponse> for Identity {
    fn from(w: WhoIsResponse) -> Self {
        Identity {
            user_id: w.user_profile.id.to_string(),
            login_name: w.user_profile.login_name,
            display_name: w.user_profile.display_name,
            node_name: w.node.computed_name,
        }
    }
}

impl LocalApiClient {
    pub fn new(socket: impl Into<PathBuf>, log: NodeLogSink) -> Self {
        LocalApiClient {
            socket: socket.into(),
            log,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub async fn status(&self) -> Result<Status, Error> {
        let (status, body) = self.get(STATUS_PATH).await?;
        if status != StatusCode::OK {
            return Err(Error::Status(status, body_text(&body)));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn whois(&self, caller: SocketAddr) -> Result<Identity, Error> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("addr", &caller.to_string())
            .finish();
        let (status, body) = self.get(&format!("{WHOIS_PATH}?{query}")).await?;
        match status {
            StatusCode::OK => {
                let who: WhoIsResponse = serde_json::from_slice(&body)?;
                Ok(who.into())
            }
            StatusCode::NOT_FOUND => Err(Error::NotFound(caller)),
            status => Err(Error::Status(status, body_text(&body))),
        }
    }

    async fn get(&self, path: &str) -> Result<(StatusCode, Bytes), Error> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(Error::Unavailable)?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("localapi connection closed with error: {e}");
            }
        });

        let req = Request::get(path)
            .header(header::HOST, LOCALAPI_HOST)
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::Generic(format!("invalid localapi request {path}: {e}")))?;
        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let body = resp.into_body().collect().await?.to_bytes();
        self.log
            .log(format_args!("localapi GET {path}: {status}, {} bytes", body.len()));
        Ok((status, body))
    }
}

fn body_text(body: &Bytes) -> String {
    String::from_utf8_lossy(body).trim().to_string()
}

#[async_trait::async_trait]
impl IdentityResolver for LocalApiClient {
    async fn resolve(&self, caller: SocketAddr) -> Result<Identity, Error> {
        self.whois(caller).await
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use super::*;
    use crate::test_helpers::localapi::FakeLocalApi;

    #[tokio::test]
    async fn whois_maps_identity() {
        let api = FakeLocalApi::spawn().await;
        let caller: SocketAddr = "100.64.0.2:51234".parse().unwrap();
        api.add_peer(
            caller.ip(),
            serde_json::json!({
                "Node": {"ID": 7, "ComputedName": "laptop", "Name": "laptop.tailnet.ts.net."},
                "UserProfile": {"ID": 1234567, "LoginName": "alice@example.com", "DisplayName": "Alice"},
                "CapMap": {}
            }),
        );

        let client = LocalApiClient::new(api.socket(), NodeLogSink::discard());
        let id = client.resolve(caller).await.unwrap();
        assert_eq!(
            id,
            Identity {
                user_id: "1234567".to_string(),
                login_name: "alice@example.com".to_string(),
                display_name: "Alice".to_string(),
                node_name: "laptop".to_string(),
            }
        );
        assert_eq!(api.whois_queries(), vec!["100.64.0.2:51234".to_string()]);
    }

    #[tokio::test]
    async fn whois_unknown_peer() {
        let api = FakeLocalApi::spawn().await;
        let client = LocalApiClient::new(api.socket(), NodeLogSink::discard());
        let caller: SocketAddr = "100.64.0.9:1000".parse().unwrap();
        let err = client.resolve(caller).await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
    }

    #[tokio::test]
    async fn whois_ipv6_caller_is_encoded() {
        let api = FakeLocalApi::spawn().await;
        let caller: SocketAddr = "[fd7a:115c:a1e0::1]:443".parse().unwrap();
        api.add_peer(
            caller.ip(),
            serde_json::json!({
                "Node": {"ComputedName": "phone"},
                "UserProfile": {"ID": "uid-abc", "LoginName": "bob", "DisplayName": "Bob"}
            }),
        );
        let client = LocalApiClient::new(api.socket(), NodeLogSink::discard());
        let id = client.resolve(caller).await.unwrap();
        assert_eq!(id.user_id, "uid-abc");
        assert_eq!(id.node_name, "phone");
        assert_eq!(api.whois_queries(), vec!["[fd7a:115c:a1e0::1]:443".to_string()]);
    }

    #[tokio::test]
    async fn whois_bad_payload() {
        let api = FakeLocalApi::spawn().await;
        let caller: SocketAddr = "100.64.0.3:80".parse().unwrap();
        api.add_peer(caller.ip(), serde_json::json!({"Node": "nope"}));
        let client = LocalApiClient::new(api.socket(), NodeLogSink::discard());
        assert_matches!(client.resolve(caller).await, Err(Error::Decode(_)));
    }

    #[tokio::test]
    async fn missing_socket_is_unavailable() {
        let client = LocalApiClient::new(
            std::env::temp_dir().join("tsproxy-does-not-exist.sock"),
            NodeLogSink::discard(),
        );
        let caller: SocketAddr = "100.64.0.3:80".parse().unwrap();
        assert_matches!(client.resolve(caller).await, Err(Error::Unavailable(_)));
        assert_matches!(client.status().await, Err(Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn status_reports_backend_state() {
        let api = FakeLocalApi::spawn().await;
        let client = LocalApiClient::new(api.socket(), NodeLogSink::discard());

        let status = client.status().await.unwrap();
        assert!(status.is_running());
        assert_eq!(status.tailscale_ips, vec![IpAddr::from([127, 0, 0, 1])]);
        assert_eq!(status.self_node.unwrap().host_name, "hello");

        api.set_backend_state("NeedsLogin");
        assert!(!client.status().await.unwrap().is_running());
    }
}
