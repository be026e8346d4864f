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

use crate::config::{self, Endpoint};
use crate::version::BuildInfo;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("expected 2 arguments, got {0}")]
    ArgCount(usize),
    #[error("unknown flag {0:?}")]
    UnknownFlag(String),
    #[error(transparent)]
    Endpoint(#[from] config::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Run { advertise: Endpoint, origin: Endpoint },
    Help,
    Version,
}

/// Parses the command line, not including the program name.
///
/// Flags are only recognized on their own; anything else must be exactly two endpoints.
pub fn parse<I>(args: I) -> Result<Command, Error>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();
    if let [flag] = args.as_slice() {
        match flag.as_str() {
            "-h" | "--help" | "help" => return Ok(Command::Help),
            "-V" | "--version" | "version" => return Ok(Command::Version),
            _ => {}
        }
    }
    if let Some(flag) = args.iter().find(|a| a.starts_with('-')) {
        return Err(Error::UnknownFlag(flag.clone()));
    }
    match args.as_slice() {
        [advertise, origin] => Ok(Command::Run {
            advertise: advertise.parse()?,
            origin: origin.parse()?,
        }),
        other => Err(Error::ArgCount(other.len())),
    }
}

pub fn usage() -> String {
    format!(
        "
tsproxy ({version})

Exposes an HTTP service on the tailnet, telling it who is calling.

Usage: tsproxy <from-endpoint> <to-endpoint>

  <from-endpoint>  name and port to serve on the tailnet, e.g. hello:80
  <to-endpoint>    origin to forward requests to, e.g. localhost:8080

Ports default to {port}. Requests are forwarded with the caller's identity in the
x-tailscale-id, x-tailscale-username, x-tailscale-displayname and
x-tailscale-computed-node headers.

Example:
  tsproxy hello:80 localhost:8080",
        version = BuildInfo::new(),
        port = config::DEFAULT_PORT,
    )
}
