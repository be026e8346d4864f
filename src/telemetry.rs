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

use std::env;
use std::fmt::{self, Debug};

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::{Event, Level, Subscriber, field, info};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry, filter, prelude::*, reload};

const DEFAULT_FILTER: &str = "info";

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, EnvFilter, Registry>;

/// LogHandle reads and changes the log filter of the subscriber installed by [`setup_logging`].
/// It is handed to whatever needs to adjust logging at runtime, such as the admin server.
#[derive(Clone)]
pub struct LogHandle {
    reload: reload::Handle<FilteredLayer, Registry>,
}

impl Debug for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandle").finish_non_exhaustive()
    }
}

/// Installs the global subscriber and returns the handle controlling it.
///
/// The output format is plain text unless `LOG_FORMAT=json`. The filter comes from `RUST_LOG`
/// and defaults to `info`.
pub fn setup_logging() -> LogHandle {
    let (layer, handle) = build_layer();
    tracing_subscriber::registry().with(layer).init();
    handle
}

fn build_layer() -> (reload::Layer<FilteredLayer, Registry>, LogHandle) {
    let format: BoxLayer = if env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        Box::new(
            tracing_subscriber::fmt::layer()
                .event_format(tracing_subscriber::fmt::format().json().flatten_event(true))
                .fmt_fields(format::JsonFields::default()),
        )
    } else {
        Box::new(
            tracing_subscriber::fmt::layer()
                .event_format(PlainFormat)
                .fmt_fields(PlainFormat),
        )
    };
    let (layer, reload) = reload::Layer::new(format.with_filter(default_env_filter()));
    (layer, LogHandle { reload })
}

fn default_env_filter() -> EnvFilter {
    let directives = env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    EnvFilter::builder()
        .with_regex(false)
        .parse(&directives)
        .unwrap_or_else(|e| {
            eprintln!("ignoring invalid {}={directives}: {e}", EnvFilter::DEFAULT_ENV);
            EnvFilter::new(DEFAULT_FILTER)
        })
}

impl LogHandle {
    /// Adds `level` to the current filter. If `reset` is true, the filter is first reset to
    /// its startup value.
    pub fn set_level(&self, reset: bool, level: &str) -> Result<(), Error> {
        let base = if reset {
            default_env_filter().to_string()
        } else {
            self.current_level()?
        };
        // Duplicated directives are fine, the later one wins.
        let directives = if level.is_empty() {
            base
        } else {
            format!("{base},{level}")
        };
        let new_filter = EnvFilter::builder().parse(directives)?;
        info!("new log filter is {new_filter}");
        Ok(self.reload.modify(|layer| {
            *layer.filter_mut() = new_filter;
        })?)
    }

    pub fn current_level(&self) -> Result<String, Error> {
        Ok(self.reload.with_current(|f| f.filter().to_string())?)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("parse failure: {0}")]
    InvalidFilter(#[from] filter::ParseError),
    #[error("reload failure: {0}")]
    Reload(#[from] reload::Error),
}

/// NodeLogSink receives log lines from the overlay network transport. Those are chatty and
/// mostly uninteresting, so they are emitted under their own target at a configurable level,
/// and dropped entirely when the level is `off`.
#[derive(Clone, Copy, Debug)]
pub struct NodeLogSink {
    level: LevelFilter,
}

impl NodeLogSink {
    pub fn new(level: LevelFilter) -> Self {
        NodeLogSink { level }
    }

    #[cfg(test)]
    pub fn discard() -> Self {
        Self::new(LevelFilter::OFF)
    }

    pub fn log(&self, msg: fmt::Arguments<'_>) {
        let Some(level) = self.level.into_level() else {
            return;
        };
        if level == Level::ERROR {
            tracing::error!(target: "overlay", "{msg}")
        } else if level == Level::WARN {
            tracing::warn!(target: "overlay", "{msg}")
        } else if level == Level::INFO {
            tracing::info!(target: "overlay", "{msg}")
        } else if level == Level::DEBUG {
            tracing::debug!(target: "overlay", "{msg}")
        } else {
            tracing::trace!(target: "overlay", "{msg}")
        }
    }
}

// PlainFormat writes `time<TAB>level<TAB>target[:span{fields}]<TAB>message<TAB>k=v ...`.
struct PlainFormat;

struct FieldWriter<'w> {
    writer: Writer<'w>,
    first: bool,
    res: fmt::Result,
}

impl field::Visit for FieldWriter<'_> {
    fn record_str(&mut self, field: &field::Field, value: &str) {
        if field.name() == "message" {
            self.record_debug(field, &format_args!("{value}"))
        } else {
            self.record_debug(field, &value)
        }
    }

    fn record_debug(&mut self, field: &field::Field, value: &dyn Debug) {
        if self.res.is_err() {
            return;
        }
        self.res = if field.name() == "message" {
            write!(self.writer, "{value:?}\t")
        } else {
            let sep = if std::mem::take(&mut self.first) { "" } else { " " };
            write!(self.writer, "{sep}{}={value:?}", field.name())
        };
    }
}

impl<'w> FormatFields<'w> for PlainFormat {
    fn format_fields<R: tracing_subscriber::field::RecordFields>(
        &self,
        writer: Writer<'w>,
        fields: R,
    ) -> fmt::Result {
        let mut visitor = FieldWriter {
            writer,
            first: true,
            res: Ok(()),
        };
        fields.record(&mut visitor);
        visitor.res
    }
}

impl<S, N> FormatEvent<S, N> for PlainFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        use tracing_log::NormalizeEvent;
        use tracing_subscriber::fmt::time::{FormatTime, SystemTime};

        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());
        SystemTime.format_time(&mut writer)?;
        let target = meta.target();
        write!(
            writer,
            "\t{}\t{}",
            meta.level().to_string().to_ascii_lowercase(),
            target.strip_prefix("tsproxy::").unwrap_or(target)
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, ":{}", span.metadata().name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
            }
        }
        if event.fields().next().is_some() {
            write!(writer, "\t")?;
        }
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_level_appends_directive() {
        let (layer, handle) = build_layer();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            handle.set_level(false, "tsproxy::proxy=debug").unwrap();
            let current = handle.current_level().unwrap();
            assert!(current.contains("tsproxy::proxy=debug"), "{current}");

            handle.set_level(true, "warn").unwrap();
            let current = handle.current_level().unwrap();
            assert!(!current.contains("tsproxy::proxy=debug"), "{current}");
            assert!(current.contains("warn"), "{current}");

            assert!(handle.set_level(false, "tsproxy=loud").is_err());
        });
    }

    #[test]
    fn node_log_sink_levels() {
        // Every level maps onto a tracing macro; off must not emit anything.
        for level in [LevelFilter::ERROR, LevelFilter::DEBUG, LevelFilter::TRACE] {
            NodeLogSink::new(level).log(format_args!("shown at {level}"));
        }
        NodeLogSink::discard().log(format_args!("hidden {}", 1));
    }
}
