use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let default_directive = logging
        .level
        .parse()
        .map_err(|err| InfraError::telemetry(format!("bad log level `{}`: {err}", logging.level)))?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_directive)
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
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "veille_store_fast_hit_total",
            Unit::Count,
            "Total number of fast-tier hits."
        );
        describe_counter!(
            "veille_store_fast_miss_total",
            Unit::Count,
            "Total number of fast-tier misses."
        );
        describe_counter!(
            "veille_store_fast_evict_total",
            Unit::Count,
            "Total number of fast-tier evictions due to capacity."
        );
        describe_counter!(
            "veille_store_cascade_fanout_total",
            Unit::Count,
            "Total number of cascade re-publishes across all hops."
        );
        describe_histogram!(
            "veille_store_durable_write_ms",
            Unit::Milliseconds,
            "Coalesced durable write latency in milliseconds."
        );
        describe_counter!(
            "veille_bus_publish_total",
            Unit::Count,
            "Total number of messages handed to the publisher."
        );
        describe_counter!(
            "veille_bus_deliver_total",
            Unit::Count,
            "Total number of messages delivered to the local store."
        );
        describe_counter!(
            "veille_bus_broadcast_total",
            Unit::Count,
            "Total number of messages accepted and rebroadcast by the server."
        );
        describe_counter!(
            "veille_bus_replay_total",
            Unit::Count,
            "Total number of backlog messages replayed to late joiners."
        );
        describe_counter!(
            "veille_bus_reject_total",
            Unit::Count,
            "Total number of inbound frames rejected (auth or validation)."
        );
    });
}
