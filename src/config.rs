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
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::level_filters::LevelFilter;
use url::Url;

const OVERLAY_HOSTNAME: &str = "OVERLAY_HOSTNAME";
const TAILSCALE_SOCKET: &str = "TAILSCALE_SOCKET";
const NODE_LOG_LEVEL: &str = "NODE_LOG_LEVEL";
const IDENTITY_LOOKUP_TIMEOUT: &str = "IDENTITY_LOOKUP_TIMEOUT";
const UPSTREAM_CONNECT_TIMEOUT: &str = "UPSTREAM_CONNECT_TIMEOUT";
const POOL_IDLE_TIMEOUT: &str = "POOL_IDLE_TIMEOUT";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";
const WORKER_THREADS: &str = "WORKER_THREADS";
const ADMIN_ADDR: &str = "ADMIN_ADDR";

pub const DEFAULT_PORT: u16 = 80;
const DEFAULT_TAILSCALE_SOCKET: &str = "/var/run/tailscale/tailscaled.sock";
const DEFAULT_IDENTITY_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_WORKER_THREADS: usize = 2;
const DEFAULT_ADMIN_ADDR: &str = "127.0.0.1:15000";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("invalid endpoint {0:?}: {1}")]
    InvalidEndpoint(String, url::ParseError),
    #[error("invalid endpoint {0:?}: scheme {1:?} is not supported, only http is")]
    UnsupportedScheme(String, String),
    #[error("invalid endpoint {0:?}: missing host")]
    MissingHost(String),
}

/// Endpoint is an http host and port, optionally carrying a path prefix and query that are
/// merged into every request forwarded to it.
#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Empty, or a path starting with '/' and not ending with one.
    pub path: String,
    pub query: Option<String>,
}

impl Endpoint {
    /// host:port, with IPv6 hosts in brackets.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = if s.contains("://") {
            Url::parse(s)
        } else {
            Url::parse(&format!("http://{s}"))
        }
        .map_err(|e| Error::InvalidEndpoint(s.to_string(), e))?;

        if url.scheme() != "http" {
            return Err(Error::UnsupportedScheme(
                s.to_string(),
                url.scheme().to_string(),
            ));
        }
        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => return Err(Error::MissingHost(s.to_string())),
        };
        // Url drops a port equal to the scheme default, which is also our default.
        let port = url.port().unwrap_or(DEFAULT_PORT);

        Ok(Endpoint {
            host,
            port,
            path: url.path().trim_end_matches('/').to_string(),
            query: url.query().filter(|q| !q.is_empty()).map(str::to_string),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}{}", self.authority(), self.path)?;
        if let Some(q) = &self.query {
            write!(f, "?{q}")?;
        }
        Ok(())
    }
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Where we listen on the overlay network. Only the port is used for binding.
    pub advertise: Endpoint,
    /// Where requests are forwarded.
    pub origin: Endpoint,

    /// Hostname requested for the overlay node.
    pub hostname: String,
    /// Path to the tailscaled LocalAPI socket.
    pub tailscale_socket: PathBuf,
    /// Verbosity of logs emitted by the overlay transport. Off by default, they are noisy.
    #[serde(serialize_with = "display")]
    pub node_log_level: LevelFilter,

    pub identity_lookup_timeout: Duration,
    pub upstream_connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub termination_grace_period: Duration,

    /// Specify the number of worker threads the Tokio Runtime will use.
    pub num_worker_threads: usize,

    /// Address of the admin server. None disables it.
    pub admin_addr: Option<SocketAddr>,
}

fn display<T: fmt::Display, S: serde::Serializer>(t: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(t)
}

/// HumanDuration parses durations such as `5s` or `250ms`.
struct HumanDuration(Duration);

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s)
            .map(HumanDuration)
            .map_err(|e| e.to_string())
    }
}

/// Env is a source of configuration variables.
struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, Error> {
        match (self.0)(key) {
            Some(val) => val
                .parse()
                .map(Some)
                .map_err(|_| Error::EnvVar(key.to_string(), val)),
            None => Ok(None),
        }
    }

    fn parse_default<T: FromStr>(&self, key: &str, default: T) -> Result<T, Error> {
        self.parse(key).map(|v| v.unwrap_or(default))
    }

    fn duration(&self, key: &str, default: Duration) -> Result<Duration, Error> {
        Ok(self
            .parse::<HumanDuration>(key)?
            .map(|d| d.0)
            .unwrap_or(default))
    }
}

/// parse_config builds the config for the two endpoints, reading tunables from the process
/// environment.
pub fn parse_config(advertise: Endpoint, origin: Endpoint) -> Result<Config, Error> {
    construct_config(advertise, origin, &|key| std::env::var(key).ok())
}

pub fn construct_config(
    advertise: Endpoint,
    origin: Endpoint,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Config, Error> {
    let env = Env(env);

    // Set but empty disables the admin server.
    let admin_addr = match (env.0)(ADMIN_ADDR) {
        Some(addr) if addr.is_empty() => None,
        Some(_) => env.parse::<SocketAddr>(ADMIN_ADDR)?,
        None => DEFAULT_ADMIN_ADDR.parse().ok(),
    };

    Ok(Config {
        hostname: empty_to_none(env.parse(OVERLAY_HOSTNAME)?)
            .unwrap_or_else(|| advertise.host.clone()),
        tailscale_socket: env
            .parse(TAILSCALE_SOCKET)?
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TAILSCALE_SOCKET)),
        node_log_level: env.parse_default(NODE_LOG_LEVEL, LevelFilter::OFF)?,

        identity_lookup_timeout: env
            .duration(IDENTITY_LOOKUP_TIMEOUT, DEFAULT_IDENTITY_LOOKUP_TIMEOUT)?,
        upstream_connect_timeout: env
            .duration(UPSTREAM_CONNECT_TIMEOUT, DEFAULT_UPSTREAM_CONNECT_TIMEOUT)?,
        pool_idle_timeout: env.duration(POOL_IDLE_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT)?,
        termination_grace_period: env
            .duration(TERMINATION_GRACE_PERIOD, DEFAULT_DRAIN_DURATION)?,

        num_worker_threads: env.parse_default(WORKER_THREADS, DEFAULT_WORKER_THREADS)?,
        admin_addr,

        advertise,
        origin,
    })
}

pub fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
    inp.filter(|s| !s.as_ref().is_empty())
}

#[cfg(test)]
pub mod tests {
    use std::collections::HashMap;

    use matches::assert_matches;
    use test_case::test_case;

    use super::*;

    #[test_case("hello", "hello:80"; "bare host")]
    #[test_case("hello:8080", "hello:8080"; "host and port")]
    #[test_case("localhost:80", "localhost:80"; "explicit default port")]
    #[test_case("http://127.0.0.1", "127.0.0.1:80"; "scheme without port")]
    #[test_case("http://127.0.0.1:3000/", "127.0.0.1:3000"; "scheme with port")]
    #[test_case("[::1]:9000", "[::1]:9000"; "ipv6 with port")]
    #[test_case("[::1]", "[::1]:80"; "ipv6 without port")]
    fn endpoint_authority(input: &str, want: &str) {
        let ep: Endpoint = input.parse().unwrap();
        assert_eq!(ep.authority(), want);
    }

    #[test]
    fn endpoint_path_and_query() {
        let ep: Endpoint = "localhost:8080/api/?v=2".parse().unwrap();
        assert_eq!(ep.path, "/api");
        assert_eq!(ep.query.as_deref(), Some("v=2"));
        assert_eq!(ep.to_string(), "http://localhost:8080/api?v=2");

        let ep: Endpoint = "localhost".parse().unwrap();
        assert_eq!(ep.path, "");
        assert_eq!(ep.query, None);
        assert_eq!(ep.to_string(), "http://localhost:80");
    }

    #[test]
    fn endpoint_errors() {
        assert_matches!(
            "https://example.com".parse::<Endpoint>(),
            Err(Error::UnsupportedScheme(_, _))
        );
        assert_matches!(
            "localhost:notaport".parse::<Endpoint>(),
            Err(Error::InvalidEndpoint(_, _))
        );
        assert_matches!("".parse::<Endpoint>(), Err(Error::InvalidEndpoint(_, _)));
    }

    fn env_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| vars.get(k).cloned()
    }

    fn endpoints() -> (Endpoint, Endpoint) {
        ("hello".parse().unwrap(), "localhost:8080".parse().unwrap())
    }

    #[test]
    fn config_defaults() {
        let (from, to) = endpoints();
        let cfg = construct_config(from, to, &env_from(&[])).unwrap();
        assert_eq!(cfg.hostname, "hello");
        assert_eq!(cfg.tailscale_socket, PathBuf::from(DEFAULT_TAILSCALE_SOCKET));
        assert_eq!(cfg.node_log_level, LevelFilter::OFF);
        assert_eq!(cfg.identity_lookup_timeout, Duration::from_secs(5));
        assert_eq!(cfg.upstream_connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.termination_grace_period, Duration::from_secs(5));
        assert_eq!(cfg.num_worker_threads, 2);
        assert_eq!(cfg.admin_addr, Some("127.0.0.1:15000".parse().unwrap()));
    }

    #[test]
    fn config_from_env() {
        let (from, to) = endpoints();
        let env = env_from(&[
            (OVERLAY_HOSTNAME, "whoami"),
            (NODE_LOG_LEVEL, "debug"),
            (IDENTITY_LOOKUP_TIMEOUT, "250ms"),
            (TERMINATION_GRACE_PERIOD, "1m"),
            (WORKER_THREADS, "8"),
            (ADMIN_ADDR, ""),
        ]);
        let cfg = construct_config(from, to, &env).unwrap();
        assert_eq!(cfg.hostname, "whoami");
        assert_eq!(cfg.node_log_level, LevelFilter::DEBUG);
        assert_eq!(cfg.identity_lookup_timeout, Duration::from_millis(250));
        assert_eq!(cfg.termination_grace_period, Duration::from_secs(60));
        assert_eq!(cfg.num_worker_threads, 8);
        assert_eq!(cfg.admin_addr, None);
    }

    #[test]
    fn config_rejects_bad_env() {
        let (from, to) = endpoints();
        let err = construct_config(
            from.clone(),
            to.clone(),
            &env_from(&[(WORKER_THREADS, "many")]),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "invalid env var WORKER_THREADS=many");

        assert_matches!(
            construct_config(from, to, &env_from(&[(ADMIN_ADDR, "nope")])),
            Err(Error::EnvVar(_, _))
        );
    }
}
