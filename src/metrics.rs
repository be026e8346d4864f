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

use std::fmt::{self, Write};
use std::mem;
use std::sync::Arc;

use hyper::StatusCode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use tracing::error;

const PREFIX: &str = "tsproxy";

/// Proxy metrics. Counters are registered under the `tsproxy_` prefix.
pub struct Metrics {
    connections_opened: Counter,
    connections_closed: Counter,
    requests: Family<RequestLabels, Counter>,
    upstream_failures: Counter,
    identity_lookups: Family<IdentityLookupLabels, Counter>,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let connections_opened = Counter::default();
        registry.register(
            "connections_opened",
            "The total number of inbound connections accepted",
            connections_opened.clone(),
        );
        let connections_closed = Counter::default();
        registry.register(
            "connections_closed",
            "The total number of inbound connections closed",
            connections_closed.clone(),
        );
        let requests = Family::default();
        registry.register(
            "requests",
            "The total number of proxied requests, by response status code",
            requests.clone(),
        );
        let upstream_failures = Counter::default();
        registry.register(
            "upstream_failures",
            "The total number of requests that failed to reach the origin",
            upstream_failures.clone(),
        );
        let identity_lookups = Family::default();
        registry.register(
            "identity_lookups",
            "The total number of caller identity lookups, by outcome",
            identity_lookups.clone(),
        );

        Self {
            connections_opened,
            connections_closed,
            requests,
            upstream_failures,
            identity_lookups,
        }
    }
}

impl From<&mut Registry> for Metrics {
    fn from(registry: &mut Registry) -> Self {
        Metrics::new(registry.sub_registry_with_prefix(PREFIX))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::default();
        Metrics::from(&mut registry)
    }
}

/// Renders `registry` in the Prometheus text format.
pub fn encode_text(registry: &Registry) -> Result<String, fmt::Error> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, registry)?;
    Ok(buf)
}

#[derive(Clone, Copy, Debug)]
pub struct ConnectionOpen;

#[derive(Clone, Copy, Debug)]
pub struct ConnectionClose;

impl From<&ConnectionOpen> for ConnectionClose {
    fn from(_: &ConnectionOpen) -> Self {
        ConnectionClose
    }
}

/// A request was answered with `code`, whether by the origin or by the proxy itself.
#[derive(Clone, Copy, Debug)]
pub struct RequestCompleted {
    pub code: StatusCode,
}

#[derive(Clone, Copy, Debug)]
pub struct UpstreamFailure;

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub enum LookupOutcome {
    Found,
    NotFound,
    Error,
    Timeout,
}

impl LookupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupOutcome::Found => "found",
            LookupOutcome::NotFound => "not_found",
            LookupOutcome::Error => "error",
            LookupOutcome::Timeout => "timeout",
        }
    }
}

impl EncodeLabelValue for LookupOutcome {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        writer.write_str(self.as_str())
    }
}

#[derive(Clone, Hash, PartialEq, Eq, Debug, EncodeLabelSet)]
struct RequestLabels {
    code: Code,
}

#[derive(Clone, Hash, PartialEq, Eq, Debug, EncodeLabelSet)]
struct IdentityLookupLabels {
    outcome: LookupOutcome,
}

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
struct Code(StatusCode);

impl EncodeLabelValue for Code {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        writer.write_str(self.0.as_str())
    }
}

pub trait Recorder<E, T> {
    /// Record the given event
    fn record(&self, event: &E, meta: T);
}

pub trait IncrementRecorder<E>: Recorder<E, u64> {
    /// Record the given event by incrementing the counter by one
    fn increment(&self, event: &E);
}

impl<E, R> IncrementRecorder<E> for R
where
    R: Recorder<E, u64>,
{
    fn increment(&self, event: &E) {
        self.record(event, 1);
    }
}

impl Recorder<ConnectionOpen, u64> for Metrics {
    fn record(&self, _: &ConnectionOpen, count: u64) {
        self.connections_opened.inc_by(count);
    }
}

impl Recorder<ConnectionClose, u64> for Metrics {
    fn record(&self, _: &ConnectionClose, count: u64) {
        self.connections_closed.inc_by(count);
    }
}

impl Recorder<RequestCompleted, u64> for Metrics {
    fn record(&self, event: &RequestCompleted, count: u64) {
        self.requests
            .get_or_create(&RequestLabels {
                code: Code(event.code),
            })
            .inc_by(count);
    }
}

impl Recorder<UpstreamFailure, u64> for Metrics {
    fn record(&self, _: &UpstreamFailure, count: u64) {
        self.upstream_failures.inc_by(count);
    }
}

impl Recorder<LookupOutcome, u64> for Metrics {
    fn record(&self, outcome: &LookupOutcome, count: u64) {
        self.identity_lookups
            .get_or_create(&IdentityLookupLabels { outcome: *outcome })
            .inc_by(count);
    }
}

impl Metrics {
    /// Increments `M1` now, and the `M2` derived from it once the returned guard is dropped.
    ///
    /// ```ignore
    /// // Record connection opened now, and closed when the guard goes away.
    /// let _close = metrics.increment_defer::<_, ConnectionClose>(&ConnectionOpen);
    /// ```
    #[must_use = "metric will be dropped (and thus recorded) immediately if not assigned"]
    pub fn increment_defer<M1, M2>(self: &Arc<Metrics>, event: &M1) -> Deferred<M2>
    where
        M2: for<'a> From<&'a M1>,
        Metrics: IncrementRecorder<M1> + IncrementRecorder<M2>,
    {
        self.increment(event);
        Deferred {
            metrics: self.clone(),
            event: Some(M2::from(event)),
        }
    }
}

/// Deferred increments its event when dropped.
pub struct Deferred<M>
where
    Metrics: IncrementRecorder<M>,
{
    metrics: Arc<Metrics>,
    event: Option<M>,
}

impl<M> Drop for Deferred<M>
where
    Metrics: IncrementRecorder<M>,
{
    fn drop(&mut self) {
        if let Some(event) = mem::take(&mut self.event) {
            self.metrics.increment(&event);
        } else {
            error!("defer record failed, event is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Registry, Arc<Metrics>) {
        let mut registry = Registry::default();
        let metrics = Arc::new(Metrics::from(&mut registry));
        (registry, metrics)
    }

    #[test]
    fn counters_are_prefixed() {
        let (registry, metrics) = setup();
        metrics.increment(&UpstreamFailure);
        metrics.increment(&UpstreamFailure);

        let text = encode_text(&registry).unwrap();
        assert!(text.contains("tsproxy_upstream_failures_total 2"), "{text}");
        assert!(text.contains("tsproxy_connections_opened_total 0"), "{text}");
    }

    #[test]
    fn labeled_counters() {
        let (registry, metrics) = setup();
        metrics.increment(&RequestCompleted {
            code: StatusCode::BAD_GATEWAY,
        });
        metrics.increment(&LookupOutcome::NotFound);
        metrics.increment(&LookupOutcome::Timeout);
        metrics.increment(&LookupOutcome::Timeout);

        let text = encode_text(&registry).unwrap();
        assert!(text.contains(r#"tsproxy_requests_total{code="502"} 1"#), "{text}");
        assert!(
            text.contains(r#"tsproxy_identity_lookups_total{outcome="not_found"} 1"#),
            "{text}"
        );
        assert!(
            text.contains(r#"tsproxy_identity_lookups_total{outcome="timeout"} 2"#),
            "{text}"
        );
    }

    #[test]
    fn deferred_close() {
        let (registry, metrics) = setup();
        let guard = metrics.increment_defer::<_, ConnectionClose>(&ConnectionOpen);
        let text = encode_text(&registry).unwrap();
        assert!(text.contains("tsproxy_connections_opened_total 1"), "{text}");
        assert!(text.contains("tsproxy_connections_closed_total 0"), "{text}");

        drop(guard);
        let text = encode_text(&registry).unwrap();
        assert!(text.contains("tsproxy_connections_closed_total 1"), "{text}");
    }
}
