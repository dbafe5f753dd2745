use crate::error::AppError;
use crate::sync::identity::{IdentifierResolver, LEGACY_ID_KEYS, NAME_KEYS};
use crate::sync::metrics::{coerce_metrics, normalize_performance};
use crate::sync::refresh::RefreshRequest;
use crate::sync::sink::StateSink;
use crate::sync::types::{
    lookup_field, lookup_value, parse_timestamp, value_to_bool, value_to_string,
    Field, StrategyKind, StrategyMode, StrategyRecord, StrategyStatus, StrategyStatusUpdate,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

const STATE_KEYS: [&str; 2] = ["state", "status"];
const MODE_KEYS: [&str; 2] = ["mode", "trading_mode"];
const KIND_KEYS: [&str; 3] = ["kind", "type", "strategy_type"];
const WINDOW_KEYS: [&str; 2] = ["windows", "schedule"];
const PARAMETER_KEYS: [&str; 2] = ["parameters", "params"];

pub fn infer_mode(token: &str) -> Option<StrategyMode> {
    match token.trim().to_ascii_lowercase().as_str() {
        "live" | "real" | "production" => Some(StrategyMode::Live),
        "paper" | "sim" | "simulated" | "simulation" | "demo" => Some(StrategyMode::Paper),
        "backtest" | "bt" | "backtesting" => Some(StrategyMode::Backtest),
        _ => None,
    }
}

pub fn infer_status(token: &str) -> Option<StrategyStatus> {
    match token.trim().to_ascii_lowercase().as_str() {
        "running" | "run" | "active" | "started" | "starting" | "on" => {
            Some(StrategyStatus::Running)
        }
        "stopped" | "stop" | "stopping" | "inactive" | "idle" | "paused" | "disabled" | "off"
        | "finished" | "completed" => Some(StrategyStatus::Stopped),
        "error" | "errored" | "failed" | "failure" | "crashed" => Some(StrategyStatus::Error),
        _ => None,
    }
}

fn infer_kind(token: &str) -> StrategyKind {
    if token.to_ascii_lowercase().contains("screener") {
        StrategyKind::Screener
    } else {
        StrategyKind::Trading
    }
}

fn text_field(map: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    lookup_value(map, aliases).and_then(value_to_string)
}

fn bool_field(map: &Map<String, Value>, aliases: &[&str]) -> Option<bool> {
    lookup_value(map, aliases).and_then(value_to_bool)
}

/// `Some` when the key is present: null or an array replaces the collection.
fn collection_field(map: &Map<String, Value>, aliases: &[&str]) -> Option<Vec<Value>> {
    match lookup_field(map, aliases) {
        Field::Absent => None,
        Field::Null => Some(Vec::new()),
        Field::Value(Value::Array(items)) => Some(items.clone()),
        Field::Value(_) => None,
    }
}

fn optional_text(map: &Map<String, Value>, aliases: &[&str], existing: Option<&String>) -> Option<String> {
    match lookup_field(map, aliases) {
        Field::Absent => existing.cloned(),
        Field::Null => None,
        Field::Value(value) => value_to_string(value).or_else(|| existing.cloned()),
    }
}

/// Merges a status delta over the existing record, carrying forward every omitted field.
pub fn merge_status(
    payload: &Map<String, Value>,
    existing: Option<&StrategyRecord>,
    received_at: DateTime<Utc>,
) -> StrategyStatusUpdate {
    let active = bool_field(payload, &["active"]);
    let enabled = bool_field(payload, &["enabled"]);

    let status = text_field(payload, &STATE_KEYS)
        .and_then(|token| infer_status(&token))
        .or_else(|| active.map(status_from_flag))
        .or_else(|| existing.map(|record| record.status))
        .or_else(|| enabled.filter(|flag| !flag).map(status_from_flag))
        .unwrap_or_default();

    let mode = text_field(payload, &MODE_KEYS)
        .and_then(|token| infer_mode(&token))
        .or_else(|| existing.map(|record| record.mode))
        .unwrap_or_default();

    let kind = text_field(payload, &KIND_KEYS)
        .map(|token| infer_kind(&token))
        .or_else(|| existing.map(|record| record.kind))
        .unwrap_or_default();

    let metrics = payload
        .get("metrics")
        .and_then(Value::as_object)
        .map(coerce_metrics);
    let metrics_updated_at = metrics.as_ref().map(|_| {
        lookup_value(payload, &["metrics_updated_at"])
            .and_then(parse_timestamp)
            .unwrap_or(received_at)
    });

    StrategyStatusUpdate {
        legacy_id: optional_text(
            payload,
            &LEGACY_ID_KEYS,
            existing.and_then(|record| record.legacy_id.as_ref()),
        ),
        name: optional_text(
            payload,
            &NAME_KEYS,
            existing.and_then(|record| record.name.as_ref()),
        ),
        description: optional_text(
            payload,
            &["description"],
            existing.and_then(|record| record.description.as_ref()),
        ),
        symbol: optional_text(
            payload,
            &["symbol"],
            existing.and_then(|record| record.symbol.as_ref()),
        ),
        status,
        mode,
        kind,
        enabled: enabled
            .or_else(|| existing.map(|record| record.enabled))
            .unwrap_or(true),
        active: active
            .or_else(|| existing.map(|record| record.active))
            .unwrap_or(status == StrategyStatus::Running),
        windows: collection_field(payload, &WINDOW_KEYS)
            .or_else(|| existing.map(|record| record.windows.clone()))
            .unwrap_or_default(),
        parameters: collection_field(payload, &PARAMETER_KEYS)
            .or_else(|| existing.map(|record| record.parameters.clone()))
            .unwrap_or_default(),
        metrics,
        metrics_updated_at,
    }
}

fn status_from_flag(flag: bool) -> StrategyStatus {
    if flag {
        StrategyStatus::Running
    } else {
        StrategyStatus::Stopped
    }
}

/// Applies one `strategy.status` delta and reports the refreshes it warrants.
pub fn apply_status_event(
    payload: &Value,
    resolver: &mut IdentifierResolver,
    sink: &dyn StateSink,
    received_at: DateTime<Utc>,
) -> Result<Vec<RefreshRequest>, AppError> {
    let map = payload.as_object().ok_or_else(|| {
        AppError::MalformedPayload("status payload is not an object".to_string())
    })?;
    let id = resolver.resolve_payload(map, sink).ok_or_else(|| {
        AppError::UnresolvedIdentity("status event carries no id or name".to_string())
    })?;

    let existing = sink.strategy(&id);
    let update = merge_status(map, existing.as_ref(), received_at);

    let mut refresh = Vec::new();
    match existing.as_ref() {
        None => refresh.push(RefreshRequest::PerformanceSummary(id.clone())),
        Some(record) if record.status != update.status => {
            refresh.push(RefreshRequest::MetricsSnapshot(id.clone()));
            refresh.push(RefreshRequest::CandlesSnapshot(id.clone()));
        }
        Some(_) => {}
    }

    sink.update_strategy_status(&id, update);

    if let Some(performance) = map.get("performance").and_then(Value::as_object) {
        let snapshot = normalize_performance(performance, None, Some(received_at));
        sink.set_strategy_performance(&id, snapshot);
    }

    Ok(refresh)
}

/// Normalizes a full record as returned by the strategy listing, keyed by an id the
/// caller already resolved.
pub fn normalize_strategy_record(
    map: &Map<String, Value>,
    id: String,
    received_at: DateTime<Utc>,
) -> StrategyRecord {
    let update = merge_status(map, None, received_at);
    let performance = map
        .get("performance")
        .and_then(Value::as_object)
        .map(|performance| normalize_performance(performance, None, Some(received_at)))
        .map(|snapshot| (snapshot.period.clone(), snapshot))
        .into_iter()
        .collect();

    StrategyRecord {
        id,
        legacy_id: update.legacy_id,
        name: update.name,
        description: update.description,
        symbol: update.symbol,
        status: update.status,
        mode: update.mode,
        kind: update.kind,
        enabled: update.enabled,
        active: update.active,
        windows: update.windows,
        parameters: update.parameters,
        metrics: update.metrics,
        metrics_updated_at: update.metrics_updated_at,
        performance,
        runtime: Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::sink::{MemoryStore, StrategyLookup};
    use crate::sync::types::MetricValue;
    use serde_json::json;

    fn apply(store: &MemoryStore, resolver: &mut IdentifierResolver, payload: Value) -> Vec<RefreshRequest> {
        apply_status_event(&payload, resolver, store, Utc::now()).expect("status event should apply")
    }

    #[test]
    fn matches_mode_and_status_vocabularies() {
        assert_eq!(infer_mode("LIVE"), Some(StrategyMode::Live));
        assert_eq!(infer_mode("sim"), Some(StrategyMode::Paper));
        assert_eq!(infer_mode("BT"), Some(StrategyMode::Backtest));
        assert_eq!(infer_mode("unknown"), None);
        assert_eq!(infer_status("Running"), Some(StrategyStatus::Running));
        assert_eq!(infer_status("stopped"), Some(StrategyStatus::Stopped));
    }

    #[test]
    fn defaults_apply_when_no_record_exists() {
        let update = merge_status(
            json!({ "id": "a1" }).as_object().expect("object"),
            None,
            Utc::now(),
        );

        assert!(update.enabled);
        assert_eq!(update.mode, StrategyMode::Paper);
        assert_eq!(update.status, StrategyStatus::Stopped);
        assert!(update.metrics.is_none());
    }

    #[test]
    fn falls_back_to_active_flag_for_status() {
        let update = merge_status(
            json!({ "id": "a1", "active": true }).as_object().expect("object"),
            None,
            Utc::now(),
        );

        assert_eq!(update.status, StrategyStatus::Running);
    }

    #[test]
    fn follow_up_by_legacy_id_updates_same_record() {
        let store = MemoryStore::default();
        let mut resolver = IdentifierResolver::new();

        apply(&store, &mut resolver, json!({ "id": "a1", "strategy_id": "alpha", "state": "running" }));
        apply(&store, &mut resolver, json!({ "strategy_id": "alpha", "mode": "live" }));

        let records = store.strategies();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "a1");
        assert_eq!(records[0].status, StrategyStatus::Running);
        assert_eq!(records[0].mode, StrategyMode::Live);
    }

    #[test]
    fn omitted_metrics_are_preserved() {
        let store = MemoryStore::default();
        let mut resolver = IdentifierResolver::new();

        apply(&store, &mut resolver, json!({ "id": "a1", "metrics": { "pnl": "4.5" } }));
        apply(&store, &mut resolver, json!({ "id": "a1", "state": "running" }));

        let record = store.strategy("a1").expect("record");
        assert_eq!(
            record.metrics.as_ref().and_then(|metrics| metrics.get("pnl")),
            Some(&MetricValue::Number(4.5))
        );
    }

    #[test]
    fn explicit_empty_parameters_replace_the_list() {
        let store = MemoryStore::default();
        let mut resolver = IdentifierResolver::new();

        apply(
            &store,
            &mut resolver,
            json!({ "id": "a1", "parameters": [{ "name": "length", "value": 20 }], "windows": [{ "start": "09:30" }] }),
        );
        apply(&store, &mut resolver, json!({ "id": "a1", "parameters": [] }));

        let record = store.strategy("a1").expect("record");
        assert!(record.parameters.is_empty());
        assert_eq!(record.windows.len(), 1);
    }

    #[test]
    fn performance_in_status_payload_defaults_to_day() {
        let store = MemoryStore::default();
        let mut resolver = IdentifierResolver::new();

        apply(&store, &mut resolver, json!({ "id": "a1", "performance": { "pnl": 2 } }));

        let record = store.strategy("a1").expect("record");
        assert!(record.performance.contains_key("day"));
    }

    #[test]
    fn requests_refreshes_on_creation_and_status_change() {
        let store = MemoryStore::default();
        let mut resolver = IdentifierResolver::new();

        let created = apply(&store, &mut resolver, json!({ "id": "a1", "state": "stopped" }));
        let unchanged = apply(&store, &mut resolver, json!({ "id": "a1", "mode": "paper" }));
        let changed = apply(&store, &mut resolver, json!({ "id": "a1", "state": "running" }));

        assert_eq!(created, vec![RefreshRequest::PerformanceSummary("a1".to_string())]);
        assert!(unchanged.is_empty());
        assert_eq!(
            changed,
            vec![
                RefreshRequest::MetricsSnapshot("a1".to_string()),
                RefreshRequest::CandlesSnapshot("a1".to_string())
            ]
        );
    }

    #[test]
    fn marks_screeners_from_kind_token() {
        let payload = json!({ "id": 9, "name": "Gap Screener", "type": "SCREENER", "enabled": false });
        let record = normalize_strategy_record(
            payload.as_object().expect("object"),
            "9".to_string(),
            Utc::now(),
        );

        assert_eq!(record.id, "9");
        assert_eq!(record.kind, StrategyKind::Screener);
        assert!(!record.enabled);
        assert_eq!(record.status, StrategyStatus::Stopped);
    }

    #[test]
    fn rejects_payload_without_identity() {
        let store = MemoryStore::default();
        let mut resolver = IdentifierResolver::new();

        let result = apply_status_event(&json!({ "state": "running" }), &mut resolver, &store, Utc::now());

        assert!(matches!(result, Err(AppError::UnresolvedIdentity(_))));
        assert!(store.strategies().is_empty());
    }
}
