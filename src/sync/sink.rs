use crate::sync::types::{
    ConnectionState, FeedStatus, MarketDataStatusUpdate, MarketDataUpdate, MetricsUpdate,
    PerformanceSnapshot, StrategyRecord, StrategyStatusUpdate, SubscriptionSummary,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::info;

/// Read access the reconcilers need to resolve identities and preserve omitted fields.
pub trait StrategyLookup {
    fn strategy(&self, id: &str) -> Option<StrategyRecord>;

    /// Finds the canonical id of a record known under `key` as its id, legacy id or name.
    fn find_strategy_id(&self, key: &str) -> Option<String>;
}

/// Dispatch-style store the engine writes into. Implementations own their merge semantics.
pub trait StateSink: StrategyLookup + Send + Sync {
    fn update_strategy_status(&self, id: &str, update: StrategyStatusUpdate);
    fn set_strategy_metrics(&self, id: &str, update: MetricsUpdate);
    fn set_strategy_performance(&self, id: &str, snapshot: PerformanceSnapshot);
    fn set_strategy_runtime_snapshot(&self, id: &str, fragment: Map<String, Value>);
    fn upsert_strategies(&self, records: Vec<StrategyRecord>);
    fn set_market_data_subscriptions(&self, update: MarketDataUpdate);
    fn set_market_data_subscriptions_status(&self, update: MarketDataStatusUpdate);
    fn set_connection_state(&self, state: ConnectionState);
    fn logout_session(&self);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketDataState {
    pub items: Vec<SubscriptionSummary>,
    pub status: FeedStatus,
    pub telemetry: Map<String, Value>,
    pub updated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug)]
struct StoreState {
    strategies: BTreeMap<String, StrategyRecord>,
    market_data: MarketDataState,
    connection_state: ConnectionState,
    session_expired: bool,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            strategies: BTreeMap::new(),
            market_data: MarketDataState::default(),
            connection_state: ConnectionState::Disconnected,
            session_expired: false,
        }
    }
}

/// In-memory store with last-writer-wins merge semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn strategies(&self) -> Vec<StrategyRecord> {
        self.state.read().strategies.values().cloned().collect()
    }

    pub fn market_data(&self) -> MarketDataState {
        self.state.read().market_data.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state
    }

    pub fn session_expired(&self) -> bool {
        self.state.read().session_expired
    }
}

fn merge_metrics(record: &mut StrategyRecord, update: MetricsUpdate) {
    let metrics = record.metrics.get_or_insert_with(BTreeMap::new);
    metrics.extend(update.metrics);
    if update.updated_at.is_some() {
        record.metrics_updated_at = update.updated_at;
    }
}

impl StrategyLookup for MemoryStore {
    fn strategy(&self, id: &str) -> Option<StrategyRecord> {
        self.state.read().strategies.get(id).cloned()
    }

    fn find_strategy_id(&self, key: &str) -> Option<String> {
        let readable = self.state.read();
        if readable.strategies.contains_key(key) {
            return Some(key.to_string());
        }
        readable
            .strategies
            .values()
            .find(|record| record.legacy_id.as_deref() == Some(key))
            .or_else(|| {
                readable
                    .strategies
                    .values()
                    .find(|record| record.name.as_deref() == Some(key))
            })
            .map(|record| record.id.clone())
    }
}

impl StateSink for MemoryStore {
    fn update_strategy_status(&self, id: &str, update: StrategyStatusUpdate) {
        let mut writable = self.state.write();
        let record = writable
            .strategies
            .entry(id.to_string())
            .or_insert_with(|| StrategyRecord::new(id));

        record.legacy_id = update.legacy_id;
        record.name = update.name;
        record.description = update.description;
        record.symbol = update.symbol;
        record.status = update.status;
        record.mode = update.mode;
        record.kind = update.kind;
        record.enabled = update.enabled;
        record.active = update.active;
        record.windows = update.windows;
        record.parameters = update.parameters;
        if let Some(metrics) = update.metrics {
            merge_metrics(
                record,
                MetricsUpdate {
                    metrics,
                    period: None,
                    updated_at: update.metrics_updated_at,
                },
            );
        }
    }

    fn set_strategy_metrics(&self, id: &str, update: MetricsUpdate) {
        let mut writable = self.state.write();
        let record = writable
            .strategies
            .entry(id.to_string())
            .or_insert_with(|| StrategyRecord::new(id));
        merge_metrics(record, update);
    }

    fn set_strategy_performance(&self, id: &str, snapshot: PerformanceSnapshot) {
        let mut writable = self.state.write();
        let record = writable
            .strategies
            .entry(id.to_string())
            .or_insert_with(|| StrategyRecord::new(id));
        record.performance.insert(snapshot.period.clone(), snapshot);
    }

    fn set_strategy_runtime_snapshot(&self, id: &str, fragment: Map<String, Value>) {
        let mut writable = self.state.write();
        let record = writable
            .strategies
            .entry(id.to_string())
            .or_insert_with(|| StrategyRecord::new(id));
        record.runtime.extend(fragment);
    }

    fn upsert_strategies(&self, records: Vec<StrategyRecord>) {
        let mut writable = self.state.write();
        for mut incoming in records {
            if let Some(existing) = writable.strategies.remove(&incoming.id) {
                if incoming.metrics.is_none() {
                    incoming.metrics = existing.metrics;
                    incoming.metrics_updated_at = existing.metrics_updated_at;
                }
                let mut performance = existing.performance;
                performance.append(&mut incoming.performance);
                incoming.performance = performance;
                let mut runtime = existing.runtime;
                runtime.extend(incoming.runtime);
                incoming.runtime = runtime;
            }
            writable.strategies.insert(incoming.id.clone(), incoming);
        }
    }

    fn set_market_data_subscriptions(&self, update: MarketDataUpdate) {
        let mut writable = self.state.write();
        let market_data = &mut writable.market_data;
        if let Some(items) = update.items {
            market_data.items = items;
        }
        if let Some(status) = update.status {
            market_data.status = status;
        }
        if let Some(telemetry) = update.telemetry {
            market_data.telemetry = telemetry;
        }
        if update.updated_at.is_some() {
            market_data.updated_at = update.updated_at;
        }
        update.error.apply_to(&mut market_data.error);
    }

    fn set_market_data_subscriptions_status(&self, update: MarketDataStatusUpdate) {
        let mut writable = self.state.write();
        writable.market_data.status = update.status;
        writable.market_data.updated_at = Some(update.updated_at);
        update.error.apply_to(&mut writable.market_data.error);
    }

    fn set_connection_state(&self, state: ConnectionState) {
        self.state.write().connection_state = state;
    }

    fn logout_session(&self) {
        self.state.write().session_expired = true;
    }
}

/// Logs every store mutation before delegating to the wrapped sink.
#[derive(Debug, Default)]
pub struct TracingSink<S> {
    inner: S,
}

impl<S> TracingSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: StrategyLookup> StrategyLookup for TracingSink<S> {
    fn strategy(&self, id: &str) -> Option<StrategyRecord> {
        self.inner.strategy(id)
    }

    fn find_strategy_id(&self, key: &str) -> Option<String> {
        self.inner.find_strategy_id(key)
    }
}

impl<S: StateSink> StateSink for TracingSink<S> {
    fn update_strategy_status(&self, id: &str, update: StrategyStatusUpdate) {
        info!(
            strategy = id,
            status = update.status.as_str(),
            mode = update.mode.as_str(),
            metrics = update.metrics.is_some(),
            "strategy status updated"
        );
        self.inner.update_strategy_status(id, update);
    }

    fn set_strategy_metrics(&self, id: &str, update: MetricsUpdate) {
        info!(strategy = id, keys = update.metrics.len(), "strategy metrics set");
        self.inner.set_strategy_metrics(id, update);
    }

    fn set_strategy_performance(&self, id: &str, snapshot: PerformanceSnapshot) {
        info!(strategy = id, period = %snapshot.period, "strategy performance set");
        self.inner.set_strategy_performance(id, snapshot);
    }

    fn set_strategy_runtime_snapshot(&self, id: &str, fragment: Map<String, Value>) {
        info!(strategy = id, keys = fragment.len(), "runtime snapshot merged");
        self.inner.set_strategy_runtime_snapshot(id, fragment);
    }

    fn upsert_strategies(&self, records: Vec<StrategyRecord>) {
        info!(count = records.len(), "strategies upserted");
        self.inner.upsert_strategies(records);
    }

    fn set_market_data_subscriptions(&self, update: MarketDataUpdate) {
        info!(
            items = ?update.items.as_ref().map(Vec::len),
            status = ?update.status,
            error = ?update.error,
            "market data subscriptions published"
        );
        self.inner.set_market_data_subscriptions(update);
    }

    fn set_market_data_subscriptions_status(&self, update: MarketDataStatusUpdate) {
        info!(status = ?update.status, error = ?update.error, "market data status published");
        self.inner.set_market_data_subscriptions_status(update);
    }

    fn set_connection_state(&self, state: ConnectionState) {
        info!(state = ?state, mode = ?state.mode(), "connection state changed");
        self.inner.set_connection_state(state);
    }

    fn logout_session(&self) {
        info!("session expired");
        self.inner.logout_session();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Memory store that also keeps every market-data publish, for ordering assertions.
    #[derive(Debug, Default)]
    pub struct RecordingStore {
        pub store: MemoryStore,
        pub publishes: Mutex<Vec<MarketDataUpdate>>,
        pub connection_states: Mutex<Vec<ConnectionState>>,
    }

    impl RecordingStore {
        pub fn published_item_lists(&self) -> Vec<Vec<String>> {
            self.publishes
                .lock()
                .iter()
                .filter_map(|update| update.items.as_ref())
                .map(|items| {
                    items
                        .iter()
                        .map(|item| item.subscription_id.clone())
                        .collect()
                })
                .collect()
        }
    }

    impl StrategyLookup for RecordingStore {
        fn strategy(&self, id: &str) -> Option<StrategyRecord> {
            self.store.strategy(id)
        }

        fn find_strategy_id(&self, key: &str) -> Option<String> {
            self.store.find_strategy_id(key)
        }
    }

    impl StateSink for RecordingStore {
        fn update_strategy_status(&self, id: &str, update: StrategyStatusUpdate) {
            self.store.update_strategy_status(id, update);
        }

        fn set_strategy_metrics(&self, id: &str, update: MetricsUpdate) {
            self.store.set_strategy_metrics(id, update);
        }

        fn set_strategy_performance(&self, id: &str, snapshot: PerformanceSnapshot) {
            self.store.set_strategy_performance(id, snapshot);
        }

        fn set_strategy_runtime_snapshot(&self, id: &str, fragment: Map<String, Value>) {
            self.store.set_strategy_runtime_snapshot(id, fragment);
        }

        fn upsert_strategies(&self, records: Vec<StrategyRecord>) {
            self.store.upsert_strategies(records);
        }

        fn set_market_data_subscriptions(&self, update: MarketDataUpdate) {
            self.publishes.lock().push(update.clone());
            self.store.set_market_data_subscriptions(update);
        }

        fn set_market_data_subscriptions_status(&self, update: MarketDataStatusUpdate) {
            self.store.set_market_data_subscriptions_status(update);
        }

        fn set_connection_state(&self, state: ConnectionState) {
            self.connection_states.lock().push(state);
            self.store.set_connection_state(state);
        }

        fn logout_session(&self) {
            self.store.logout_session();
        }
    }
}
