use crate::error::AppError;
use crate::sync::identity::IdentifierResolver;
use crate::sync::metrics::{apply_metrics_snapshot, normalize_performance, resolve_performance_summary};
use crate::sync::sink::StateSink;
use crate::sync::status::normalize_strategy_record;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde_json::{Map, Value};
use tracing::debug;

const CANDLES_RUNTIME_KEY: &str = "candles";

/// Richer data a reconciler wants fetched because the delta alone was not enough.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefreshRequest {
    PerformanceSummary(String),
    MetricsSnapshot(String),
    CandlesSnapshot(String),
    AllStrategies,
}

#[derive(Debug)]
pub struct RefreshResult {
    pub request: RefreshRequest,
    pub payload: Result<Value, AppError>,
}

#[async_trait]
pub trait RefreshSource: Send + Sync {
    async fn fetch_performance_summary(&self, strategy_id: &str) -> Result<Value, AppError>;
    async fn fetch_metrics_snapshot(&self, strategy_id: &str) -> Result<Value, AppError>;
    async fn fetch_candles_snapshot(&self, strategy_id: &str) -> Result<Value, AppError>;
    async fn list_strategies(&self) -> Result<Value, AppError>;
}

pub async fn execute_refresh(source: &dyn RefreshSource, request: RefreshRequest) -> RefreshResult {
    let payload = match &request {
        RefreshRequest::PerformanceSummary(id) => source.fetch_performance_summary(id).await,
        RefreshRequest::MetricsSnapshot(id) => source.fetch_metrics_snapshot(id).await,
        RefreshRequest::CandlesSnapshot(id) => source.fetch_candles_snapshot(id).await,
        RefreshRequest::AllStrategies => source.list_strategies().await,
    };
    RefreshResult { request, payload }
}

/// Writes a fetched payload into the sink using the reconcilers' normalization. Listed
/// records go through `resolver` so they land on the canonical id of a known strategy.
pub fn apply_refresh_payload(
    request: &RefreshRequest,
    payload: &Value,
    resolver: &mut IdentifierResolver,
    sink: &dyn StateSink,
    received_at: DateTime<Utc>,
) -> Result<(), AppError> {
    match request {
        RefreshRequest::PerformanceSummary(id) => {
            let map = payload.as_object().ok_or_else(|| {
                AppError::MalformedPayload("performance summary is not an object".to_string())
            })?;
            let snapshot = resolve_performance_summary(map, Some(received_at))
                .unwrap_or_else(|| normalize_performance(map, None, Some(received_at)));
            sink.set_strategy_performance(id, snapshot);
        }
        RefreshRequest::MetricsSnapshot(id) => {
            apply_metrics_snapshot(id, payload, sink, received_at)?;
        }
        RefreshRequest::CandlesSnapshot(id) => {
            let mut fragment = Map::new();
            fragment.insert(CANDLES_RUNTIME_KEY.to_string(), payload.clone());
            sink.set_strategy_runtime_snapshot(id, fragment);
        }
        RefreshRequest::AllStrategies => {
            let entries = payload
                .as_array()
                .or_else(|| payload.get("strategies").and_then(Value::as_array))
                .ok_or_else(|| {
                    AppError::MalformedPayload("strategy listing is not an array".to_string())
                })?;
            let mut records = Vec::with_capacity(entries.len());
            for map in entries.iter().filter_map(Value::as_object) {
                let Some(id) = resolver.resolve_payload(map, sink) else {
                    debug!("skipping listed strategy without identity");
                    continue;
                };
                records.push(normalize_strategy_record(map, id, received_at));
            }
            sink.upsert_strategies(records);
        }
    }
    Ok(())
}

/// Appends percent-encoded path segments; ids may be human names containing `/` or `?`.
fn endpoint(base_url: &str, segments: &[&str]) -> Result<Url, AppError> {
    let mut url = Url::parse(base_url)
        .map_err(|error| AppError::InvalidArgument(format!("invalid api base url: {error}")))?;
    url.path_segments_mut()
        .map_err(|_| AppError::InvalidArgument("api base url cannot carry a path".to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn strategies_endpoint(base_url: &str) -> Result<Url, AppError> {
    endpoint(base_url, &["strategies"])
}

fn performance_endpoint(base_url: &str, strategy_id: &str) -> Result<Url, AppError> {
    let mut url = endpoint(base_url, &["strategies", strategy_id, "performance"])?;
    url.query_pairs_mut().append_pair("period", "day");
    Ok(url)
}

fn metrics_endpoint(base_url: &str, strategy_id: &str) -> Result<Url, AppError> {
    endpoint(base_url, &["strategies", strategy_id, "metrics"])
}

fn candles_endpoint(base_url: &str, strategy_id: &str) -> Result<Url, AppError> {
    endpoint(base_url, &["strategies", strategy_id, "candles"])
}

pub struct HttpRefreshSource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRefreshSource {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            token,
        }
    }

    async fn get_json(&self, endpoint: Url) -> Result<Value, AppError> {
        let mut request = self.client.get(endpoint);
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?.error_for_status()?;
        let payload = response.json::<Value>().await?;
        Ok(payload)
    }
}

#[async_trait]
impl RefreshSource for HttpRefreshSource {
    async fn fetch_performance_summary(&self, strategy_id: &str) -> Result<Value, AppError> {
        self.get_json(performance_endpoint(&self.base_url, strategy_id)?)
            .await
    }

    async fn fetch_metrics_snapshot(&self, strategy_id: &str) -> Result<Value, AppError> {
        self.get_json(metrics_endpoint(&self.base_url, strategy_id)?)
            .await
    }

    async fn fetch_candles_snapshot(&self, strategy_id: &str) -> Result<Value, AppError> {
        self.get_json(candles_endpoint(&self.base_url, strategy_id)?)
            .await
    }

    async fn list_strategies(&self) -> Result<Value, AppError> {
        self.get_json(strategies_endpoint(&self.base_url)?).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CannedRefreshSource;
    use super::*;
    use crate::sync::sink::{MemoryStore, StrategyLookup};
    use crate::sync::types::{MetricValue, StrategyStatus};
    use serde_json::json;

    fn url(endpoint: Result<Url, AppError>) -> String {
        endpoint.expect("endpoint should build").to_string()
    }

    #[test]
    fn strategy_endpoints_use_base_url() {
        let base = "http://127.0.0.1:8000/api";

        assert_eq!(url(strategies_endpoint(base)), "http://127.0.0.1:8000/api/strategies");
        assert_eq!(
            url(performance_endpoint(base, "a1")),
            "http://127.0.0.1:8000/api/strategies/a1/performance?period=day"
        );
        assert_eq!(
            url(metrics_endpoint("http://127.0.0.1:8000/api/", "a1")),
            "http://127.0.0.1:8000/api/strategies/a1/metrics"
        );
        assert!(url(candles_endpoint(base, "a1")).ends_with("/strategies/a1/candles"));
    }

    #[test]
    fn strategy_ids_are_encoded_as_one_path_segment() {
        let base = "http://127.0.0.1:8000/api";

        assert_eq!(
            url(metrics_endpoint(base, "Gap / Alpha?")),
            "http://127.0.0.1:8000/api/strategies/Gap%20%2F%20Alpha%3F/metrics"
        );
        assert!(matches!(
            strategies_endpoint("not a url"),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn executes_request_against_matching_fetch() {
        let source = CannedRefreshSource::default();

        let result = execute_refresh(&source, RefreshRequest::MetricsSnapshot("a1".to_string())).await;

        assert_eq!(result.request, RefreshRequest::MetricsSnapshot("a1".to_string()));
        assert!(result.payload.is_ok());
        assert_eq!(
            *source.requests.lock(),
            vec![RefreshRequest::MetricsSnapshot("a1".to_string())]
        );
    }

    #[test]
    fn listing_upserts_normalized_records() {
        let store = MemoryStore::default();
        let payload = json!({
            "strategies": [
                { "id": "a1", "strategy_id": "alpha", "name": "Alpha", "state": "running" },
                { "name": "" },
                { "id": "b2", "mode": "backtest" }
            ]
        });

        apply_refresh_payload(
            &RefreshRequest::AllStrategies,
            &payload,
            &mut IdentifierResolver::new(),
            &store,
            Utc::now(),
        )
        .expect("listing should apply");

        let records = store.strategies();
        assert_eq!(records.len(), 2);
        assert_eq!(
            store.strategy("a1").map(|record| record.status),
            Some(StrategyStatus::Running)
        );
        assert_eq!(store.find_strategy_id("alpha").as_deref(), Some("a1"));
    }

    #[test]
    fn listing_lands_on_strategy_known_by_legacy_id() {
        let store = MemoryStore::default();
        let mut resolver = IdentifierResolver::new();
        crate::sync::status::apply_status_event(
            &json!({ "strategy_id": "alpha", "state": "running" }),
            &mut resolver,
            &store,
            Utc::now(),
        )
        .expect("status should apply");

        apply_refresh_payload(
            &RefreshRequest::AllStrategies,
            &json!([{ "id": "a1", "strategy_id": "alpha", "name": "Alpha", "state": "running" }]),
            &mut resolver,
            &store,
            Utc::now(),
        )
        .expect("listing should apply");

        let records = store.strategies();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "alpha");
        assert_eq!(records[0].name.as_deref(), Some("Alpha"));
    }

    #[test]
    fn performance_and_candles_land_in_the_record() {
        let store = MemoryStore::default();
        let now = Utc::now();

        apply_refresh_payload(
            &RefreshRequest::PerformanceSummary("a1".to_string()),
            &json!({ "period": "day", "summary": { "pnl": "7.5" } }),
            &mut IdentifierResolver::new(),
            &store,
            now,
        )
        .expect("performance should apply");
        apply_refresh_payload(
            &RefreshRequest::CandlesSnapshot("a1".to_string()),
            &json!([{ "t": 1, "c": 2.0 }]),
            &mut IdentifierResolver::new(),
            &store,
            now,
        )
        .expect("candles should apply");

        let record = store.strategy("a1").expect("record");
        assert_eq!(
            record
                .performance
                .get("day")
                .and_then(|snapshot| snapshot.summary.get("pnl")),
            Some(&MetricValue::Number(7.5))
        );
        assert_eq!(record.runtime.get(CANDLES_RUNTIME_KEY), Some(&json!([{ "t": 1, "c": 2.0 }])));
    }

    #[test]
    fn malformed_listing_is_rejected() {
        let store = MemoryStore::default();

        let result = apply_refresh_payload(
            &RefreshRequest::AllStrategies,
            &json!({ "unexpected": true }),
            &mut IdentifierResolver::new(),
            &store,
            Utc::now(),
        );

        assert!(matches!(result, Err(AppError::MalformedPayload(_))));
    }
}
