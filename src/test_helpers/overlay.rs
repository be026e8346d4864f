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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::identity::IdentityResolver;
use crate::node::{Error, Listener, NetworkProvider, Node};
use crate::telemetry::NodeLogSink;

use super::StaticResolver;

/// LoopbackProvider stands in for the overlay network: nodes listen on loopback, and peers are
/// identified by a [`StaticResolver`].
#[derive(Clone)]
pub struct LoopbackProvider {
    resolver: Arc<StaticResolver>,
    start_error: Option<String>,
    closed: Arc<AtomicBool>,
}

impl LoopbackProvider {
    pub fn new(resolver: Arc<StaticResolver>) -> Self {
        LoopbackProvider {
            resolver,
            start_error: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A provider whose node never starts, reporting `state` as the backend state.
    pub fn not_running(state: &str) -> Self {
        LoopbackProvider {
            start_error: Some(state.to_string()),
            ..Self::new(Arc::new(StaticResolver::new()))
        }
    }

    /// Whether a node started by this provider has been closed.
    pub fn node_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl NetworkProvider for LoopbackProvider {
    async fn start_node(&self, hostname: &str, log: NodeLogSink) -> Result<Box<dyn Node>, Error> {
        if let Some(state) = &self.start_error {
            return Err(Error::NotRunning(state.clone()));
        }
        log.log(format_args!("loopback node {hostname} started"));
        Ok(Box::new(LoopbackNode {
            resolver: self.resolver.clone(),
            closed: self.closed.clone(),
        }))
    }
}

pub struct LoopbackNode {
    resolver: Arc<StaticResolver>,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Node for LoopbackNode {
    async fn listen(&self, port: u16) -> Result<Listener, Error> {
        Listener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)).await
    }

    fn identity_client(&self) -> Result<Arc<dyn IdentityResolver>, Error> {
        Ok(self.resolver.clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
