//! Tracing subscriber setup, metric descriptions and per-operation spans.

use std::sync::Once;

use metrics::{Unit, describe_counter};
use thiserror::Error;
use tracing::{Span, info_span};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_CACHE_EVICT, METRIC_CACHE_FAIL, METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_SHARED,
    METRIC_STORE_FAIL,
};
use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Subscriber(err.to_string()))
}

/// Register descriptions for the cache counters with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Reads answered from the cache, including negative hits."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Reads that had to load from the repository."
        );
        describe_counter!(
            METRIC_CACHE_FAIL,
            Unit::Count,
            "Cache backend failures, labelled by operation."
        );
        describe_counter!(
            METRIC_STORE_FAIL,
            Unit::Count,
            "Repository loads that failed with an error other than not found."
        );
        describe_counter!(
            METRIC_CACHE_EVICT,
            Unit::Count,
            "Entries evicted from the in-memory backend due to capacity."
        );
        describe_counter!(
            METRIC_CACHE_SHARED,
            Unit::Count,
            "Reads that joined another caller's in-flight load."
        );
    });
}

/// Opens the span each cached-connection operation runs in.
pub trait SpanScope: Send + Sync {
    fn span(&self, op: &'static str) -> Span;
}

/// `info`-level span named after the operation, tagged with the component.
#[derive(Debug, Clone)]
pub struct TracingSpans {
    component: &'static str,
}

impl TracingSpans {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }
}

impl SpanScope for TracingSpans {
    fn span(&self, op: &'static str) -> Span {
        info_span!("repocache", component = self.component, op)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSpans;

impl SpanScope for NoopSpans {
    fn span(&self, _op: &'static str) -> Span {
        Span::none()
    }
}
