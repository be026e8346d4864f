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

use std::sync::Arc;

use tracing::info;
use tsproxy::*;

fn main() -> anyhow::Result<()> {
    // For now we don't need a complex CLI, so rather than pull in dependencies just use basic argv
    let (advertise, origin) = match cli::parse(std::env::args().skip(1)) {
        Ok(cli::Command::Run { advertise, origin }) => (advertise, origin),
        Ok(cli::Command::Help) => {
            println!("{}", cli::usage());
            return Ok(());
        }
        Ok(cli::Command::Version) => {
            println!("{}", version::BuildInfo::new());
            return Ok(());
        }
        Err(e) => {
            eprintln!("error: {e}");
            println!("{}", cli::usage());
            std::process::exit(1)
        }
    };

    let log_handle = telemetry::setup_logging();
    let config = Arc::new(config::parse_config(advertise, origin)?);

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async move { proxy(config, log_handle).await })
}

async fn proxy(cfg: Arc<config::Config>, log_handle: telemetry::LogHandle) -> anyhow::Result<()> {
    info!("version: {}", version::BuildInfo::new());
    info!("running with config: {}", serde_yaml::to_string(&cfg)?);
    let provider = node::LocalApiProvider::new(cfg.tailscale_socket.clone());
    app::build(cfg, &provider, log_handle)
        .await?
        .wait_termination()
        .await
}
