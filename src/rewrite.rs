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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::uri::Scheme;
use http::{HeaderValue, Request, Uri, Version, header};
use tracing::{debug, warn};

use crate::config::Endpoint;
use crate::headers;
use crate::identity::{Identity, IdentityResolver};
use crate::metrics::{IncrementRecorder, LookupOutcome, Metrics};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid target uri: {0}")]
    InvalidUri(#[from] http::Error),
    #[error("invalid origin authority {0:?}")]
    InvalidAuthority(String),
}

/// Points `req` at `origin`: scheme and authority are replaced, the origin's path prefix is
/// joined to the request path and the two queries are merged. The Host header follows the new
/// authority. The version is reset to HTTP/1.1, which is what the origin is spoken to with.
pub fn rewrite_target<B>(mut req: Request<B>, origin: &Endpoint) -> Result<Request<B>, Error> {
    let authority = origin.authority();
    let host = HeaderValue::from_str(&authority)
        .map_err(|_| Error::InvalidAuthority(authority.clone()))?;

    let path = join_path(&origin.path, req.uri().path());
    let path_and_query = match (origin.query.as_deref(), req.uri().query()) {
        (Some(a), Some(b)) if !b.is_empty() => format!("{path}?{a}&{b}"),
        (Some(q), _) | (None, Some(q)) => format!("{path}?{q}"),
        (None, None) => path,
    };
    let uri = Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()?;

    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_11;
    req.headers_mut().insert(header::HOST, host);
    Ok(req)
}

// Joins with exactly one slash between prefix and path.
fn join_path(prefix: &str, path: &str) -> String {
    match (prefix.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{prefix}{}", &path[1..]),
        (false, false) => format!("{prefix}/{path}"),
        _ => format!("{prefix}{path}"),
    }
}

/// Rewriter turns an inbound request into the request sent to the origin, annotated with the
/// identity of the caller.
///
/// Identity annotation is best effort: a caller that cannot be identified, for whatever
/// reason, is forwarded without identity headers rather than rejected.
pub struct Rewriter {
    origin: Endpoint,
    resolver: Arc<dyn IdentityResolver>,
    lookup_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Rewriter {
    pub fn new(
        origin: Endpoint,
        resolver: Arc<dyn IdentityResolver>,
        lookup_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Rewriter {
            origin,
            resolver,
            lookup_timeout,
            metrics,
        }
    }

    pub fn origin(&self) -> &Endpoint {
        &self.origin
    }

    /// Rewrites `req` for the origin and appends the identity of `caller`, the peer address
    /// of the inbound connection.
    pub async fn rewrite<B>(&self, req: Request<B>, caller: SocketAddr) -> Result<Request<B>, Error> {
        let mut req = rewrite_target(req, &self.origin)?;
        let identity = self.lookup(caller).await;
        headers::inject(req.headers_mut(), identity.as_ref());
        Ok(req)
    }

    // Every request asks the resolver again; identities can change between requests on the
    // same connection.
    async fn lookup(&self, caller: SocketAddr) -> Option<Identity> {
        let (outcome, identity) =
            match tokio::time::timeout(self.lookup_timeout, self.resolver.resolve(caller)).await {
                Ok(Ok(identity)) => {
                    debug!(peer = %caller, %identity, "resolved caller identity");
                    (LookupOutcome::Found, Some(identity))
                }
                Ok(Err(e)) if e.is_not_found() => {
                    debug!(peer = %caller, "caller has no identity");
                    (LookupOutcome::NotFound, None)
                }
                Ok(Err(e)) => {
                    warn!(peer = %caller, "identity lookup failed, forwarding without identity: {e}");
                    (LookupOutcome::Error, None)
                }
                Err(_) => {
                    warn!(
                        peer = %caller,
                        timeout = ?self.lookup_timeout,
                        "identity lookup timed out, forwarding without identity"
                    );
                    (LookupOutcome::Timeout, None)
                }
            };
        self.metrics.increment(&outcome);
        identity
    }
}

#[cfg(test)]
mod tests {
    use prometheus_client::registry::Registry;
    use test_case::test_case;

    use super::*;
    use crate::headers::{IDENTITY_HEADERS, IDENTITY_ID, IDENTITY_USERNAME};
    use crate::metrics;
    use crate::test_helpers::{StaticResolver, identity};

    fn origin(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    fn get(uri: &str) -> Request<()> {
        Request::get(uri)
            .header(header::HOST, "hello")
            .body(())
            .unwrap()
    }

    #[test_case("", "/foo", "/foo"; "no prefix")]
    #[test_case("", "", "/"; "empty path")]
    #[test_case("/api", "/foo", "/api/foo"; "prefix")]
    #[test_case("/api/", "/foo", "/api/foo"; "prefix with slash")]
    #[test_case("/api", "foo", "/api/foo"; "relative path")]
    #[test_case("/api", "/", "/api/"; "root under prefix")]
    fn join(prefix: &str, path: &str, want: &str) {
        assert_eq!(join_path(prefix, path), want);
    }

    #[test_case("localhost:8080", "/foo?x=1", "http://localhost:8080/foo?x=1"; "path and query kept")]
    #[test_case("localhost", "/", "http://localhost:80/"; "default port")]
    #[test_case("http://origin:3000/base", "/foo", "http://origin:3000/base/foo"; "path prefix")]
    #[test_case("origin/base?a=1", "/foo?b=2", "http://origin:80/base/foo?a=1&b=2"; "queries merged")]
    #[test_case("origin?a=1", "/foo", "http://origin:80/foo?a=1"; "origin query only")]
    #[test_case("[::1]:9000", "/x", "http://[::1]:9000/x"; "ipv6 origin")]
    fn target(origin_str: &str, uri: &str, want: &str) {
        let req = rewrite_target(get(uri), &origin(origin_str)).unwrap();
        assert_eq!(req.uri().to_string(), want);
    }

    #[test]
    fn target_sets_host_and_version() {
        let mut req = get("/foo");
        *req.version_mut() = Version::HTTP_2;
        req.headers_mut()
            .insert(header::ACCEPT, HeaderValue::from_static("text/html"));

        let req = rewrite_target(req, &origin("localhost:8080")).unwrap();
        assert_eq!(req.headers()[header::HOST], "localhost:8080");
        assert_eq!(req.headers()[header::ACCEPT], "text/html");
        assert_eq!(req.version(), Version::HTTP_11);
        assert_eq!(req.headers().len(), 2);
    }

    #[test]
    fn target_keeps_absolute_form_path() {
        let req = rewrite_target(get("http://hello/foo?x=1"), &origin("origin:81")).unwrap();
        assert_eq!(req.uri().to_string(), "http://origin:81/foo?x=1");
        assert_eq!(req.headers()[header::HOST], "origin:81");
    }

    fn rewriter(resolver: Arc<StaticResolver>, timeout: Duration) -> (Registry, Rewriter) {
        let mut registry = Registry::default();
        let metrics = Arc::new(Metrics::from(&mut registry));
        let rw = Rewriter::new(origin("localhost:8080"), resolver, timeout, metrics);
        (registry, rw)
    }

    fn caller() -> SocketAddr {
        "100.64.0.2:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn rewrite_injects_identity() {
        let resolver = Arc::new(StaticResolver::new());
        resolver.set(caller().ip(), Some(identity("u1", "alice", "Alice", "laptop")));
        let (registry, rw) = rewriter(resolver, Duration::from_secs(1));

        let req = rw.rewrite(get("/foo?x=1"), caller()).await.unwrap();
        assert_eq!(req.uri().to_string(), "http://localhost:8080/foo?x=1");
        assert_eq!(req.headers()[&IDENTITY_ID], "u1");
        assert_eq!(req.headers()[&IDENTITY_USERNAME], "alice");

        let text = metrics::encode_text(&registry).unwrap();
        assert!(text.contains(r#"outcome="found"} 1"#), "{text}");
    }

    #[tokio::test]
    async fn rewrite_unknown_caller_forwards_without_identity() {
        let (registry, rw) = rewriter(Arc::new(StaticResolver::new()), Duration::from_secs(1));

        let req = rw.rewrite(get("/foo"), caller()).await.unwrap();
        for name in &IDENTITY_HEADERS {
            assert!(!req.headers().contains_key(name), "unexpected {name}");
        }
        let text = metrics::encode_text(&registry).unwrap();
        assert!(text.contains(r#"outcome="not_found"} 1"#), "{text}");
    }

    #[tokio::test]
    async fn rewrite_resolver_failure_forwards_without_identity() {
        let resolver = Arc::new(StaticResolver::new());
        resolver.set(caller().ip(), Some(identity("u1", "alice", "Alice", "laptop")));
        resolver.set_failing(true);
        let (registry, rw) = rewriter(resolver, Duration::from_secs(1));

        let req = rw.rewrite(get("/foo"), caller()).await.unwrap();
        assert!(!req.headers().contains_key(&IDENTITY_ID));
        let text = metrics::encode_text(&registry).unwrap();
        assert!(text.contains(r#"outcome="error"} 1"#), "{text}");
    }

    #[tokio::test(start_paused = true)]
    async fn rewrite_slow_resolver_times_out() {
        let resolver = Arc::new(StaticResolver::new().with_delay(Duration::from_secs(60)));
        resolver.set(caller().ip(), Some(identity("u1", "alice", "Alice", "laptop")));
        let (registry, rw) = rewriter(resolver, Duration::from_secs(5));

        let req = rw.rewrite(get("/foo"), caller()).await.unwrap();
        assert!(!req.headers().contains_key(&IDENTITY_ID));
        let text = metrics::encode_text(&registry).unwrap();
        assert!(text.contains(r#"outcome="timeout"} 1"#), "{text}");
    }

    #[tokio::test]
    async fn rewrite_resolves_every_request() {
        let resolver = Arc::new(StaticResolver::new());
        resolver.set(caller().ip(), Some(identity("u1", "alice", "Alice", "laptop")));
        let (_registry, rw) = rewriter(resolver.clone(), Duration::from_secs(1));

        let first = rw.rewrite(get("/"), caller()).await.unwrap();
        assert_eq!(first.headers()[&IDENTITY_USERNAME], "alice");

        resolver.set(caller().ip(), Some(identity("u2", "bob", "Bob", "desktop")));
        let second = rw.rewrite(get("/"), caller()).await.unwrap();
        assert_eq!(second.headers()[&IDENTITY_USERNAME], "bob");

        resolver.set(caller().ip(), None);
        let third = rw.rewrite(get("/"), caller()).await.unwrap();
        assert!(!third.headers().contains_key(&IDENTITY_USERNAME));

        assert_eq!(resolver.lookups(), vec![caller(); 3]);
    }

    #[tokio::test]
    async fn rewrite_appends_to_spoofed_headers() {
        let resolver = Arc::new(StaticResolver::new());
        resolver.set(caller().ip(), Some(identity("u1", "alice", "Alice", "laptop")));
        let (_registry, rw) = rewriter(resolver, Duration::from_secs(1));

        let mut req = get("/");
        req.headers_mut()
            .append(IDENTITY_ID, HeaderValue::from_static("spoofed"));
        let req = rw.rewrite(req, caller()).await.unwrap();
        let ids: Vec<_> = req.headers().get_all(&IDENTITY_ID).iter().collect();
        assert_eq!(ids, vec!["spoofed", "u1"]);
    }
}
