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

//! The overlay network boundary: starting a node, listening on it, and looking up who is on
//! the other end of a connection.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::identity::{self, IdentityResolver, LocalApiClient};
use crate::socket;
use crate::telemetry::NodeLogSink;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("overlay node is not running (state {0:?}); is it logged in?")]
    NotRunning(String),
    #[error("overlay node has no addresses to listen on")]
    NoAddresses,
    #[error("failed to bind to address {0}: {1}")]
    Bind(SocketAddr, io::Error),
    #[error("overlay service: {0}")]
    Service(#[from] identity::Error),
}

/// NetworkProvider brings up this process's presence on the overlay network.
#[async_trait::async_trait]
pub trait NetworkProvider: Send + Sync {
    /// Starts (or attaches to) a node named `hostname`. Transport logs go to `log`.
    async fn start_node(&self, hostname: &str, log: NodeLogSink) -> Result<Box<dyn Node>, Error>;
}

/// Node is a running, authenticated member of the overlay network.
#[async_trait::async_trait]
pub trait Node: Send + Sync {
    /// Listens for TCP connections from overlay peers on `port`.
    async fn listen(&self, port: u16) -> Result<Listener, Error>;

    /// Returns a resolver for the identity of peers connecting to this node.
    fn identity_client(&self) -> Result<Arc<dyn IdentityResolver>, Error>;

    /// Releases the node. Listeners obtained from it should be dropped first.
    async fn close(&self) {}
}

/// Listener accepts connections from overlay peers.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub fn new(inner: TcpListener) -> Self {
        Listener { inner }
    }

    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        TcpListener::bind(addr)
            .await
            .map(Listener::new)
            .map_err(|e| Error::Bind(addr, e))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr().map(socket::to_canonical)
    }

    /// Accepts the next connection, returning it with the peer's canonical address.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        Ok((stream, socket::to_canonical(peer)))
    }
}

/// LocalApiProvider uses the tailscaled already running on this machine, reached through its
/// LocalAPI socket.
#[derive(Clone, Debug)]
pub struct LocalApiProvider {
    socket: PathBuf,
}

impl LocalApiProvider {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        LocalApiProvider {
            socket: socket.into(),
        }
    }
}

#[async_trait::async_trait]
impl NetworkProvider for LocalApiProvider {
    async fn start_node(&self, hostname: &str, log: NodeLogSink) -> Result<Box<dyn Node>, Error> {
        let client = LocalApiClient::new(self.socket.clone(), log);
        let status = client.status().await?;
        if !status.is_running() {
            return Err(Error::NotRunning(status.backend_state));
        }
        let host_name = status
            .self_node
            .as_ref()
            .map(|s| s.host_name.as_str())
            .unwrap_or_default();
        if !hostname.eq_ignore_ascii_case(host_name) {
            // The machine's name belongs to tailscaled; all we can do is point out the mismatch.
            warn!(
                requested = hostname,
                actual = host_name,
                "overlay node hostname differs from the requested one"
            );
        }
        info!(
            socket = %self.socket.display(),
            addresses = ?status.tailscale_ips,
            "overlay node is running"
        );
        Ok(Box::new(LocalNode {
            client,
            addresses: status.tailscale_ips,
        }))
    }
}

pub struct LocalNode {
    client: LocalApiClient,
    addresses: Vec<IpAddr>,
}

impl LocalNode {
    /// The address to listen on: the node's IPv4 address if it has one, otherwise its first.
    fn listen_ip(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| self.addresses.first())
            .copied()
    }
}

#[async_trait::async_trait]
impl Node for LocalNode {
    async fn listen(&self, port: u16) -> Result<Listener, Error> {
        let ip = self.listen_ip().ok_or(Error::NoAddresses)?;
        Listener::bind(SocketAddr::new(ip, port)).await
    }

    fn identity_client(&self) -> Result<Arc<dyn IdentityResolver>, Error> {
        Ok(Arc::new(self.client.clone()))
    }

    async fn close(&self) {
        info!(socket = %self.client.socket().display(), "detached from overlay node");
    }
}
