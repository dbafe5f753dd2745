pub mod coalesce;
pub mod connection;
pub mod engine;
pub mod envelope;
pub mod identity;
pub mod metrics;
pub mod refresh;
pub mod sink;
pub mod status;
pub mod subscriptions;
pub mod telemetry;
pub mod transport;
pub mod types;

pub const EVENT_ENVELOPE_TYPE: &str = "event";
pub const STRATEGY_STATUS_EVENT: &str = "strategy.status";
pub const STRATEGY_METRIC_EVENT: &str = "strategy.metric";
pub const STRATEGY_MARKET_DATA_EVENT: &str = "strategy.market_data";
pub const SUBSCRIBE_ACTION: &str = "subscribe";
