use crate::sync::identity::IdentifierResolver;
use crate::sync::sink::StateSink;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::debug;

pub const RUNTIME_FIELDS: [&str; 9] = [
    "summary",
    "data_push",
    "stop_levels",
    "logs",
    "phases",
    "phase_states",
    "subscriptions",
    "signals",
    "processing_log",
];

const STAMP_KEYS: [&str; 2] = ["refreshed_at", "updated_at"];

pub fn is_runtime_fragment(value: &Map<String, Value>) -> bool {
    RUNTIME_FIELDS.iter().any(|field| value.contains_key(*field))
}

/// Fans a market-data `telemetry` map out into per-strategy runtime snapshots.
/// Returns how many fragments were forwarded.
pub fn fan_out_telemetry(
    telemetry: &Map<String, Value>,
    updated_at: DateTime<Utc>,
    resolver: &mut IdentifierResolver,
    sink: &dyn StateSink,
) -> usize {
    let stamp = Value::String(updated_at.to_rfc3339_opts(SecondsFormat::Millis, true));
    let mut forwarded = 0;

    for (key, value) in telemetry {
        let Some(fragment) = value.as_object().filter(|fragment| is_runtime_fragment(fragment))
        else {
            continue;
        };
        let Some(id) = resolver.resolve_key(key, sink) else {
            debug!(key = %key, "telemetry key does not resolve to a strategy");
            continue;
        };

        let mut fragment = fragment.clone();
        if !STAMP_KEYS.iter().any(|stamp_key| fragment.contains_key(*stamp_key)) {
            fragment.insert("updated_at".to_string(), stamp.clone());
        }
        sink.set_strategy_runtime_snapshot(&id, fragment);
        forwarded += 1;
    }

    forwarded
}
