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
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use http_body::Body;
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::{self, Config, Endpoint};
use crate::identity::{self, Identity, IdentityResolver};
use crate::telemetry::{self, LogHandle};

pub mod localapi;
pub mod origin;
pub mod overlay;

// Ensure that the `tracing` stack is only initialised once using `once_cell`
static TRACING: Lazy<LogHandle> = Lazy::new(telemetry::setup_logging);

pub fn initialize_telemetry() -> LogHandle {
    TRACING.clone()
}

pub fn identity(user_id: &str, login_name: &str, display_name: &str, node_name: &str) -> Identity {
    Identity {
        user_id: user_id.to_string(),
        login_name: login_name.to_string(),
        display_name: display_name.to_string(),
        node_name: node_name.to_string(),
    }
}

/// A config advertising on an ephemeral port and forwarding to `origin`, with the admin server
/// disabled and short timeouts.
pub fn test_config(origin: SocketAddr) -> Config {
    let advertise: Endpoint = "hello:0".parse().unwrap();
    let origin: Endpoint = origin.to_string().parse().unwrap();
    config::construct_config(advertise, origin, &|key| match key {
        "ADMIN_ADDR" => Some(String::new()),
        "IDENTITY_LOOKUP_TIMEOUT" => Some("1s".to_string()),
        "UPSTREAM_CONNECT_TIMEOUT" => Some("1s".to_string()),
        "TERMINATION_GRACE_PERIOD" => Some("1s".to_string()),
        _ => None,
    })
    .unwrap()
}

/// StaticResolver answers identity lookups from a table keyed by caller IP, and records every
/// lookup it serves.
#[derive(Default)]
pub struct StaticResolver {
    identities: RwLock<HashMap<IpAddr, Identity>>,
    failing: RwLock<bool>,
    delay: Option<Duration>,
    lookups: Mutex<Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every lookup by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets, or with `None` removes, the identity for `ip`.
    pub fn set(&self, ip: IpAddr, identity: Option<Identity>) {
        let mut identities = self.identities.write().unwrap();
        match identity {
            Some(id) => identities.insert(ip, id),
            None => identities.remove(&ip),
        };
    }

    /// Makes every lookup fail with an error other than NotFound.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.write().unwrap() = failing;
    }

    pub fn lookups(&self) -> Vec<SocketAddr> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl IdentityResolver for StaticResolver {
    async fn resolve(&self, caller: SocketAddr) -> Result<Identity, identity::Error> {
        self.lookups.lock().unwrap().push(caller);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if *self.failing.read().unwrap() {
            return Err(identity::Error::Generic("resolver is failing".to_string()));
        }
        self.identities
            .read()
            .unwrap()
            .get(&caller.ip())
            .cloned()
            .ok_or(identity::Error::NotFound(caller))
    }
}

/// Opens an HTTP/1.1 client connection to `addr`. The connection supports upgrades.
pub async fn connect<B>(addr: SocketAddr) -> SendRequest<B>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let stream = TcpStream::connect(addr).await.unwrap();
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("test client connection error: {e}");
        }
    });
    sender
}

/// Returns an address that nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Collects a body into bytes.
pub async fn read_body<B>(body: B) -> Bytes
where
    B: Body,
    B::Error: std::fmt::Debug,
{
    use http_body_util::BodyExt;
    body.collect().await.unwrap().to_bytes()
}
