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

use tokio::sync::mpsc;
use tracing::info;

/// Shutdown resolves once the process receives SIGINT/SIGTERM or a [`ShutdownTrigger`] fires.
pub struct Shutdown {
    trigger: ShutdownTrigger,
    rx: mpsc::Receiver<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Shutdown {
            trigger: ShutdownTrigger { tx },
            rx,
        }
    }

    /// Returns a handle that can be used to trigger shutdown from elsewhere.
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    pub async fn wait(mut self) {
        tokio::select! {
            _ = imp::shutdown() => {}
            _ = self.rx.recv() => {
                info!("received explicit shutdown signal")
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
    tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
    pub async fn shutdown_now(&self) {
        // Full channel means a shutdown is already pending.
        let _ = self.tx.try_send(());
    }
}

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{SignalKind, signal};
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        tokio::select! {
            _ = watch_signal(SignalKind::interrupt(), "SIGINT") => {}
            _ = watch_signal(SignalKind::terminate(), "SIGTERM") => {}
        };
    }

    async fn watch_signal(kind: SignalKind, name: &'static str) {
        match signal(kind) {
            Ok(mut s) => {
                s.recv().await;
                info!("received signal {name}, starting shutdown");
            }
            Err(e) => {
                error!("failed to register {name} handler: {e}");
                std::future::pending::<()>().await
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c, starting shutdown"),
            Err(e) => {
                error!("failed to register ctrl-c handler: {e}");
                std::future::pending::<()>().await
            }
        }
    }
}
