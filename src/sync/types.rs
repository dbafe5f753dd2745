use crate::error::AppError;
use chrono::{DateTime, TimeZone, Utc};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{
    STRATEGY_MARKET_DATA_EVENT, STRATEGY_METRIC_EVENT, STRATEGY_STATUS_EVENT, SUBSCRIBE_ACTION,
};

pub const DEFAULT_URL: &str = "ws://127.0.0.1:8000/ws/events";
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000/api";
pub const DEFAULT_FORCE_PULL: bool = false;
pub const DEFAULT_FALLBACK_POLL: bool = false;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_COALESCE_WINDOW_MS: u64 = 180;
pub const DEFAULT_EMPTY_CLEAR_DELAY_MS: u64 = 1_200;
pub const DEFAULT_AUTH_FAILURE_CODES: [u16; 3] = [4001, 4003, 4401];
pub const DEFAULT_PERFORMANCE_PERIOD: &str = "day";
pub const MIN_POLL_INTERVAL_MS: u64 = 1_000;
pub const MAX_POLL_INTERVAL_MS: u64 = 300_000;
pub const MIN_COALESCE_WINDOW_MS: u64 = 10;
pub const MAX_COALESCE_WINDOW_MS: u64 = 5_000;
pub const MIN_EMPTY_CLEAR_DELAY_MS: u64 = 100;
pub const MAX_EMPTY_CLEAR_DELAY_MS: u64 = 30_000;

/// Epoch values at or above this magnitude are milliseconds, below it seconds.
pub const EPOCH_MILLIS_THRESHOLD: f64 = 1e12;

pub fn default_topics() -> Vec<String> {
    vec![
        STRATEGY_STATUS_EVENT.to_string(),
        STRATEGY_METRIC_EVENT.to_string(),
        STRATEGY_MARKET_DATA_EVENT.to_string(),
    ]
}

/// A delta field that may be absent (no change), explicitly null (clear) or set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Field<T> {
    #[default]
    Absent,
    Null,
    Value(T),
}

impl<T> Field<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn is_present(&self) -> bool {
        !self.is_absent()
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Field<U> {
        match self {
            Self::Absent => Field::Absent,
            Self::Null => Field::Null,
            Self::Value(value) => Field::Value(f(value)),
        }
    }

    /// Delta-wins merge: anything present in `next` replaces `self`.
    pub fn merged_with(self, next: Field<T>) -> Field<T> {
        if next.is_present() {
            next
        } else {
            self
        }
    }

    pub fn apply_to(self, target: &mut Option<T>) {
        match self {
            Self::Absent => {}
            Self::Null => *target = None,
            Self::Value(value) => *target = Some(value),
        }
    }
}

impl<T: Serialize> Serialize for Field<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Value(value) => value.serialize(serializer),
            _ => serializer.serialize_none(),
        }
    }
}

fn compact_key(key: &str) -> String {
    key.chars()
        .filter(|ch| *ch != '_' && *ch != '-')
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

/// Looks up the first present key among `aliases`, tolerating camel/snake case differences.
pub fn lookup_field<'a>(map: &'a Map<String, Value>, aliases: &[&str]) -> Field<&'a Value> {
    for alias in aliases {
        if let Some(value) = map.get(*alias) {
            return field_from_value(value);
        }
    }

    let wanted: Vec<String> = aliases.iter().map(|alias| compact_key(alias)).collect();
    for (key, value) in map {
        if wanted.contains(&compact_key(key)) {
            return field_from_value(value);
        }
    }

    Field::Absent
}

fn field_from_value(value: &Value) -> Field<&Value> {
    if value.is_null() {
        Field::Null
    } else {
        Field::Value(value)
    }
}

pub fn lookup_value<'a>(map: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    lookup_field(map, aliases).into_option()
}

/// Stringifies a scalar id-like value and trims it; empty results are `None`.
pub fn scalar_to_key(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

pub fn value_to_string(value: &Value) -> Option<String> {
    scalar_to_key(value)
}

pub fn value_to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_f64().map(|raw| raw != 0.0),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn value_to_u32(value: &Value) -> Option<u32> {
    let raw = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    Some(raw.min(u32::MAX as f64) as u32)
}

/// Parses numeric epoch (seconds or milliseconds) or ISO-8601 timestamps.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number.as_f64().and_then(epoch_to_datetime),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                return Some(parsed.with_timezone(&Utc));
            }
            trimmed.parse::<f64>().ok().and_then(epoch_to_datetime)
        }
        _ => None,
    }
}

fn epoch_to_datetime(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    let millis = if raw.abs() >= EPOCH_MILLIS_THRESHOLD {
        raw
    } else {
        raw * 1_000.0
    };
    Utc.timestamp_millis_opt(millis as i64).single()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Live,
    Degraded,
}

impl ConnectionState {
    pub fn mode(self) -> Option<ConnectionMode> {
        match self {
            Self::Live => Some(ConnectionMode::Push),
            Self::Degraded => Some(ConnectionMode::Pull),
            Self::Disconnected | Self::Connecting => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncClientArgs {
    pub url: Option<String>,
    pub api_base_url: Option<String>,
    pub force_pull: Option<bool>,
    pub fallback_poll: Option<bool>,
    pub poll_interval_ms: Option<u64>,
    pub coalesce_window_ms: Option<u64>,
    pub empty_clear_delay_ms: Option<u64>,
    pub topics: Option<Vec<String>>,
    pub auth_failure_codes: Option<Vec<u16>>,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub url: String,
    pub api_base_url: String,
    pub force_pull: bool,
    pub fallback_poll: bool,
    pub poll_interval: Duration,
    pub coalesce_window: Duration,
    pub empty_clear_delay: Duration,
    pub topics: Vec<String>,
    pub auth_failure_codes: Vec<u16>,
    pub token: Option<String>,
}

impl SyncConfig {
    pub fn is_auth_failure(&self, close: &CloseEvent) -> bool {
        close
            .code
            .map(|code| self.auth_failure_codes.contains(&code))
            .unwrap_or(false)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            force_pull: DEFAULT_FORCE_PULL,
            fallback_poll: DEFAULT_FALLBACK_POLL,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            coalesce_window: Duration::from_millis(DEFAULT_COALESCE_WINDOW_MS),
            empty_clear_delay: Duration::from_millis(DEFAULT_EMPTY_CLEAR_DELAY_MS),
            topics: default_topics(),
            auth_failure_codes: DEFAULT_AUTH_FAILURE_CODES.to_vec(),
            token: None,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>, AppError> {
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::InvalidArgument(format!("{key} has an invalid value '{raw}'"))),
        None => Ok(None),
    }
}

impl SyncClientArgs {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            url: env_string("SYNC_URL"),
            api_base_url: env_string("SYNC_API_BASE_URL"),
            force_pull: env_parsed("SYNC_FORCE_PULL")?,
            fallback_poll: env_parsed("SYNC_FALLBACK_POLL")?,
            poll_interval_ms: env_parsed("SYNC_POLL_INTERVAL_MS")?,
            coalesce_window_ms: None,
            empty_clear_delay_ms: None,
            topics: None,
            auth_failure_codes: None,
            token: env_string("SYNC_TOKEN"),
        })
    }

    pub fn normalize(self) -> Result<SyncConfig, AppError> {
        let url = self
            .url
            .unwrap_or_else(|| DEFAULT_URL.to_string())
            .trim()
            .to_string();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(AppError::InvalidArgument(
                "url must start with ws:// or wss://".to_string(),
            ));
        }

        let api_base_url = self
            .api_base_url
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !(api_base_url.starts_with("http://") || api_base_url.starts_with("https://")) {
            return Err(AppError::InvalidArgument(
                "apiBaseUrl must start with http:// or https://".to_string(),
            ));
        }

        let poll_interval_ms = self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&poll_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "pollIntervalMs must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS}"
            )));
        }

        let coalesce_window_ms = self
            .coalesce_window_ms
            .unwrap_or(DEFAULT_COALESCE_WINDOW_MS);
        if !(MIN_COALESCE_WINDOW_MS..=MAX_COALESCE_WINDOW_MS).contains(&coalesce_window_ms) {
            return Err(AppError::InvalidArgument(format!(
                "coalesceWindowMs must be between {MIN_COALESCE_WINDOW_MS} and {MAX_COALESCE_WINDOW_MS}"
            )));
        }

        let empty_clear_delay_ms = self
            .empty_clear_delay_ms
            .unwrap_or(DEFAULT_EMPTY_CLEAR_DELAY_MS);
        if !(MIN_EMPTY_CLEAR_DELAY_MS..=MAX_EMPTY_CLEAR_DELAY_MS).contains(&empty_clear_delay_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "emptyClearDelayMs must be between {MIN_EMPTY_CLEAR_DELAY_MS} and {MAX_EMPTY_CLEAR_DELAY_MS}"
            )));
        }

        let topics: Vec<String> = self
            .topics
            .unwrap_or_else(default_topics)
            .into_iter()
            .map(|topic| topic.trim().to_string())
            .filter(|topic| !topic.is_empty())
            .collect();
        if topics.is_empty() {
            return Err(AppError::InvalidArgument(
                "topics must contain at least one event topic".to_string(),
            ));
        }

        let auth_failure_codes = self
            .auth_failure_codes
            .unwrap_or_else(|| DEFAULT_AUTH_FAILURE_CODES.to_vec());
        let token = self
            .token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());

        Ok(SyncConfig {
            url,
            api_base_url,
            force_pull: self.force_pull.unwrap_or(DEFAULT_FORCE_PULL),
            fallback_poll: self.fallback_poll.unwrap_or(DEFAULT_FALLBACK_POLL),
            poll_interval: Duration::from_millis(poll_interval_ms),
            coalesce_window: Duration::from_millis(coalesce_window_ms),
            empty_clear_delay: Duration::from_millis(empty_clear_delay_ms),
            topics,
            auth_failure_codes,
            token,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: Option<u16>,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct EnvelopeWire {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlMessage {
    pub action: String,
    pub topics: Vec<String>,
}

impl ControlMessage {
    pub fn subscribe(topics: &[String]) -> Self {
        Self {
            action: SUBSCRIBE_ACTION.to_string(),
            topics: topics.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyStatus {
    Running,
    #[default]
    Stopped,
    Error,
}

impl StrategyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    Live,
    #[default]
    Paper,
    Backtest,
}

impl StrategyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Paper => "paper",
            Self::Backtest => "backtest",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Trading,
    Screener,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Flag(bool),
    Text(String),
}

pub type MetricMap = BTreeMap<String, MetricValue>;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub period: String,
    pub summary: MetricMap,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StrategyRecord {
    pub id: String,
    pub legacy_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub symbol: Option<String>,
    pub status: StrategyStatus,
    pub mode: StrategyMode,
    pub kind: StrategyKind,
    pub enabled: bool,
    pub active: bool,
    pub windows: Vec<Value>,
    pub parameters: Vec<Value>,
    pub metrics: Option<MetricMap>,
    pub metrics_updated_at: Option<DateTime<Utc>>,
    pub performance: BTreeMap<String, PerformanceSnapshot>,
    pub runtime: Map<String, Value>,
}

impl StrategyRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            ..Self::default()
        }
    }
}

/// Partial update produced by the status reconciler. `metrics: None` means "leave untouched".
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStatusUpdate {
    pub legacy_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub symbol: Option<String>,
    pub status: StrategyStatus,
    pub mode: StrategyMode,
    pub kind: StrategyKind,
    pub enabled: bool,
    pub active: bool,
    pub windows: Vec<Value>,
    pub parameters: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdate {
    pub metrics: MetricMap,
    pub period: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Dom,
    Ticker,
    Bars,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Dom, StreamKind::Ticker, StreamKind::Bars];

    /// Infers a stream kind from loose tokens such as `"DOM"`, `"depth"`, `"bar_5"` or `"bars_1M"`.
    pub fn parse_token(token: &str) -> Option<Self> {
        let lowered = token.trim().to_ascii_lowercase();
        if lowered.is_empty() {
            return None;
        }
        if lowered == "dom" || lowered.starts_with("dom_") || lowered.contains("depth") {
            return Some(Self::Dom);
        }
        if lowered == "ticker"
            || lowered.starts_with("ticker_")
            || lowered == "tick"
            || lowered == "quote"
        {
            return Some(Self::Ticker);
        }
        if lowered == "bars" || lowered == "bar" || lowered.starts_with("bar_") || lowered.starts_with("bars_") {
            return Some(Self::Bars);
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub owner_id: String,
    pub stream: StreamKind,
    pub source: Option<String>,
    pub reference_count: Option<u32>,
    pub metadata: Option<Value>,
    pub subscribed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Subscriber {
    pub fn dedup_key(&self) -> (StreamKind, &str, &str) {
        (
            self.stream,
            self.owner_id.as_str(),
            self.source.as_deref().unwrap_or(""),
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub kind: StreamKind,
    pub request_id: Option<String>,
    pub enabled: Option<bool>,
    pub owner_count: u32,
    pub total_references: Option<u32>,
    pub subscribers: Vec<Subscriber>,
}

impl Stream {
    pub fn group_key(&self) -> (StreamKind, String) {
        (self.kind, self.request_id.clone().unwrap_or_default())
    }
}

/// Which summary-level fields arrived explicitly rather than being derived from streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExplicitSummaryFields {
    pub owners: bool,
    pub owner_count: bool,
    pub enable_dom: bool,
    pub enable_ticker: bool,
    pub enable_bars: bool,
}

impl ExplicitSummaryFields {
    pub fn union(self, other: Self) -> Self {
        Self {
            owners: self.owners || other.owners,
            owner_count: self.owner_count || other.owner_count,
            enable_dom: self.enable_dom || other.enable_dom,
            enable_ticker: self.enable_ticker || other.enable_ticker,
            enable_bars: self.enable_bars || other.enable_bars,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    pub subscription_id: String,
    #[serde(skip_serializing_if = "Field::is_absent")]
    pub symbol: Field<String>,
    #[serde(skip_serializing_if = "Field::is_absent")]
    pub sec_type: Field<String>,
    #[serde(skip_serializing_if = "Field::is_absent")]
    pub exchange: Field<String>,
    #[serde(skip_serializing_if = "Field::is_absent")]
    pub currency: Field<String>,
    #[serde(skip_serializing_if = "Field::is_absent")]
    pub local_symbol: Field<String>,
    #[serde(skip_serializing_if = "Field::is_absent")]
    pub timeframe: Field<String>,
    #[serde(skip_serializing_if = "Field::is_absent")]
    pub started_at: Field<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Field::is_absent")]
    pub metadata: Field<Value>,
    pub owners: Vec<String>,
    pub owner_count: u32,
    pub enable_dom: bool,
    pub enable_ticker: bool,
    pub enable_bars: bool,
    pub streams: Vec<Stream>,
    #[serde(skip)]
    pub explicit: ExplicitSummaryFields,
}

impl SubscriptionSummary {
    pub fn is_draining(&self) -> bool {
        self.streams.is_empty() && self.owner_count == 0
    }

    pub fn sort_key(&self) -> (String, String) {
        (
            self.symbol.as_option().cloned().unwrap_or_default(),
            self.subscription_id.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    #[default]
    Idle,
    Updating,
}

/// Normalized `strategy.market_data` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketDataEvent {
    /// `None` means the key was absent and the visible list must not be touched.
    pub items: Option<Vec<SubscriptionSummary>>,
    pub telemetry: Option<Map<String, Value>>,
    pub status: FeedStatus,
    pub error: Field<String>,
}

/// Partial update for the market-data slice of the store. `None` fields are left untouched.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<SubscriptionSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<FeedStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Field::is_absent")]
    pub error: Field<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataStatusUpdate {
    pub status: FeedStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Field::is_absent")]
    pub error: Field<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_args_defaults() {
        let config = SyncClientArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.force_pull, DEFAULT_FORCE_PULL);
        assert_eq!(config.fallback_poll, DEFAULT_FALLBACK_POLL);
        assert_eq!(
            config.coalesce_window,
            Duration::from_millis(DEFAULT_COALESCE_WINDOW_MS)
        );
        assert_eq!(
            config.empty_clear_delay,
            Duration::from_millis(DEFAULT_EMPTY_CLEAR_DELAY_MS)
        );
        assert_eq!(config.topics, default_topics());
        assert!(config.token.is_none());
    }

    #[test]
    fn rejects_non_websocket_url() {
        let result = SyncClientArgs {
            url: Some("http://example.com/ws".to_string()),
            ..SyncClientArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_coalesce_window_range() {
        let result = SyncClientArgs {
            coalesce_window_ms: Some(1),
            ..SyncClientArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_empty_topic_list() {
        let result = SyncClientArgs {
            topics: Some(vec!["  ".to_string()]),
            ..SyncClientArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn classifies_auth_failure_close_codes() {
        let config = SyncConfig::default();
        let auth = CloseEvent {
            code: Some(4001),
            reason: "token expired".to_string(),
        };
        let normal = CloseEvent {
            code: Some(1006),
            reason: String::new(),
        };

        assert!(config.is_auth_failure(&auth));
        assert!(!config.is_auth_failure(&normal));
    }

    #[test]
    fn lookup_distinguishes_absent_null_and_value() {
        let payload = json!({ "error": null, "message": "boom" });
        let map = payload.as_object().expect("object");

        assert_eq!(lookup_field(map, &["error"]), Field::Null);
        assert_eq!(
            lookup_field(map, &["message"]),
            Field::Value(&json!("boom"))
        );
        assert_eq!(lookup_field(map, &["status"]), Field::Absent);
    }

    #[test]
    fn lookup_tolerates_key_casing() {
        let payload = json!({ "SubscriptionID": "s1" });
        let map = payload.as_object().expect("object");

        assert_eq!(
            lookup_value(map, &["subscriptionId", "subscription_id"]),
            Some(&json!("s1"))
        );
    }

    #[test]
    fn parses_seconds_millis_and_iso_timestamps() {
        let from_seconds = parse_timestamp(&json!(1_700_000_000)).expect("seconds");
        let from_millis = parse_timestamp(&json!(1_700_000_000_000_i64)).expect("millis");
        let from_iso = parse_timestamp(&json!("2023-11-14T22:13:20Z")).expect("iso");

        assert_eq!(from_seconds, from_millis);
        assert_eq!(from_seconds, from_iso);
        assert!(parse_timestamp(&json!("not a time")).is_none());
    }

    #[test]
    fn field_merge_prefers_present_delta() {
        let previous = Field::Value("ES".to_string());

        assert_eq!(
            previous.clone().merged_with(Field::Absent),
            Field::Value("ES".to_string())
        );
        assert_eq!(previous.merged_with(Field::Null), Field::Null);
    }

    #[test]
    fn infers_stream_kind_tokens() {
        assert_eq!(StreamKind::parse_token("DOM"), Some(StreamKind::Dom));
        assert_eq!(StreamKind::parse_token("bars_5"), Some(StreamKind::Bars));
        assert_eq!(StreamKind::parse_token("bar_1mo"), Some(StreamKind::Bars));
        assert_eq!(StreamKind::parse_token("ticker"), Some(StreamKind::Ticker));
        assert_eq!(StreamKind::parse_token("news"), None);
    }
}
