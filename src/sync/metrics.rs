use crate::error::AppError;
use crate::sync::identity::IdentifierResolver;
use crate::sync::refresh::RefreshRequest;
use crate::sync::sink::StateSink;
use crate::sync::types::{
    lookup_value, parse_timestamp, value_to_string, MetricMap, MetricValue, MetricsUpdate,
    PerformanceSnapshot, StrategyKind, DEFAULT_PERFORMANCE_PERIOD,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

const PERIOD_KEY: &str = "period";
const DATA_PUSH_KEY: &str = "data_push";

pub fn coerce_metric(value: &Value) -> Option<MetricValue> {
    match value {
        Value::Number(number) => number.as_f64().map(MetricValue::Number),
        Value::Bool(flag) => Some(MetricValue::Flag(*flag)),
        Value::String(text) => {
            let trimmed = text.trim();
            match trimmed.parse::<f64>() {
                Ok(parsed) if parsed.is_finite() => Some(MetricValue::Number(parsed)),
                _ => Some(MetricValue::Text(text.clone())),
            }
        }
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Numeric coercion of a metrics object; null and nested values are dropped.
pub fn coerce_metrics(map: &Map<String, Value>) -> MetricMap {
    map.iter()
        .filter_map(|(key, value)| coerce_metric(value).map(|metric| (key.clone(), metric)))
        .collect()
}

fn flatten_summary(map: &Map<String, Value>) -> MetricMap {
    map.iter()
        .filter(|(key, _)| key.as_str() != PERIOD_KEY)
        .filter_map(|(key, value)| coerce_metric(value).map(|metric| (key.clone(), metric)))
        .collect()
}

/// A nested `summary` object wins; otherwise every non-`period` key is the summary.
pub fn normalize_performance(
    performance: &Map<String, Value>,
    fallback_period: Option<&str>,
    updated_at: Option<DateTime<Utc>>,
) -> PerformanceSnapshot {
    let summary = match performance.get("summary").and_then(Value::as_object) {
        Some(nested) => coerce_metrics(nested),
        None => flatten_summary(performance),
    };
    let period = performance
        .get(PERIOD_KEY)
        .and_then(value_to_string)
        .or_else(|| fallback_period.map(str::to_string))
        .unwrap_or_else(|| DEFAULT_PERFORMANCE_PERIOD.to_string());

    PerformanceSnapshot {
        period,
        summary,
        updated_at,
    }
}

/// Picks the richest summary a metric payload carries:
/// `performance.summary` > flattened `performance` > `summary` > `realtime`.
pub fn resolve_performance_summary(
    payload: &Map<String, Value>,
    updated_at: Option<DateTime<Utc>>,
) -> Option<PerformanceSnapshot> {
    let payload_period = payload.get(PERIOD_KEY).and_then(value_to_string);
    let fallback_period = payload_period.as_deref();

    if let Some(performance) = payload.get("performance").and_then(Value::as_object) {
        let snapshot = normalize_performance(performance, fallback_period, updated_at);
        if !snapshot.summary.is_empty() {
            return Some(snapshot);
        }
    }

    for key in ["summary", "realtime"] {
        if let Some(candidate) = payload.get(key).and_then(Value::as_object) {
            let summary = flatten_summary(candidate);
            if !summary.is_empty() {
                return Some(PerformanceSnapshot {
                    period: fallback_period
                        .unwrap_or(DEFAULT_PERFORMANCE_PERIOD)
                        .to_string(),
                    summary,
                    updated_at,
                });
            }
        }
    }

    None
}

/// Applies one `strategy.metric` delta.
pub fn apply_metric_event(
    payload: &Value,
    resolver: &mut IdentifierResolver,
    sink: &dyn StateSink,
    received_at: DateTime<Utc>,
) -> Result<Vec<RefreshRequest>, AppError> {
    let map = payload.as_object().ok_or_else(|| {
        AppError::MalformedPayload("metric payload is not an object".to_string())
    })?;
    let id = resolver.resolve_payload(map, sink).ok_or_else(|| {
        AppError::UnresolvedIdentity("metric event carries no id or name".to_string())
    })?;

    let is_screener = sink
        .strategy(&id)
        .map(|record| record.kind == StrategyKind::Screener)
        .unwrap_or(false);
    if is_screener {
        debug!(strategy = %id, "dropping metric event for screener strategy");
        return Ok(Vec::new());
    }

    let updated_at = lookup_value(map, &["updated_at", "last_updated_at"])
        .and_then(parse_timestamp)
        .unwrap_or(received_at);
    let period = map.get(PERIOD_KEY).and_then(value_to_string);

    if let Some(metrics) = map.get("metrics").and_then(Value::as_object) {
        sink.set_strategy_metrics(
            &id,
            MetricsUpdate {
                metrics: coerce_metrics(metrics),
                period: period.clone(),
                updated_at: Some(updated_at),
            },
        );
    }

    if let Some(realtime) = map.get("realtime").and_then(Value::as_object) {
        let mut fragment = Map::new();
        fragment.insert(DATA_PUSH_KEY.to_string(), Value::Object(realtime.clone()));
        sink.set_strategy_runtime_snapshot(&id, fragment);
    }

    match resolve_performance_summary(map, Some(updated_at)) {
        Some(snapshot) => {
            sink.set_strategy_performance(&id, snapshot);
            Ok(Vec::new())
        }
        None => Ok(vec![RefreshRequest::PerformanceSummary(id)]),
    }
}

/// Applies a fetched metrics snapshot; accepts either `{ metrics: {...} }` or a bare object.
pub fn apply_metrics_snapshot(
    id: &str,
    payload: &Value,
    sink: &dyn StateSink,
    received_at: DateTime<Utc>,
) -> Result<(), AppError> {
    let map = payload.as_object().ok_or_else(|| {
        AppError::MalformedPayload("metrics snapshot is not an object".to_string())
    })?;
    let metrics = map
        .get("metrics")
        .and_then(Value::as_object)
        .unwrap_or(map);
    let updated_at = lookup_value(map, &["updated_at", "last_updated_at"])
        .and_then(parse_timestamp)
        .unwrap_or(received_at);

    sink.set_strategy_metrics(
        id,
        MetricsUpdate {
            metrics: coerce_metrics(metrics),
            period: map.get(PERIOD_KEY).and_then(value_to_string),
            updated_at: Some(updated_at),
        },
    );
    Ok(())
}
