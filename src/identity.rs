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

pub mod localapi;
pub use localapi::LocalApiClient;

/// Identity holds what the overlay network knows about the caller behind a connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    /// Stable, opaque user id.
    pub user_id: String,
    pub login_name: String,
    pub display_name: String,
    /// Name of the overlay node the connection originates from.
    pub node_name: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.login_name, self.node_name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no identity known for {0}")]
    NotFound(SocketAddr),
    #[error("identity service unavailable: {0}")]
    Unavailable(#[source] std::io::Error),
    #[error("identity request failed: {0}")]
    Http(#[from] hyper::Error),
    #[error("identity service returned {0}: {1}")]
    Status(hyper::StatusCode, String),
    #[error("invalid identity response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Generic(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// IdentityResolver maps the remote address of an overlay connection to the caller's identity.
///
/// Implementations are shared between all in-flight requests and must be safe for
/// concurrent lookups. A lookup is a pure query; it must not have side effects.
#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Returns the identity of `caller`, or [`Error::NotFound`] if the address is unknown.
    async fn resolve(&self, caller: SocketAddr) -> Result<Identity, Error>;
}
