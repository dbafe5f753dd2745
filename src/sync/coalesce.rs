use crate::sync::subscriptions::derive_summary_fields;
use crate::sync::types::{
    MarketDataEvent, MarketDataUpdate, Stream, StreamKind, Subscriber, SubscriptionSummary,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// One reconciler timer: either idle or pending until a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerState {
    #[default]
    Idle,
    Pending { until: Instant },
}

impl TimerState {
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Self::Idle => None,
            Self::Pending { until } => Some(*until),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    /// Arms the timer unless it is already pending; a pending deadline is reused, not pushed out.
    fn arm_if_idle(&mut self, now: Instant, window: Duration) {
        if !self.is_pending() {
            *self = Self::Pending { until: now + window };
        }
    }

    fn cancel(&mut self) {
        *self = Self::Idle;
    }

    fn take_due(&mut self, now: Instant) -> bool {
        match self {
            Self::Pending { until } if *until <= now => {
                *self = Self::Idle;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimerFire {
    /// Coalescing window closed; the settled, sorted list to publish.
    Settled(Vec<SubscriptionSummary>),
    /// Draining subscriptions outlived the debounce; the visible list without them.
    Pruned(Vec<SubscriptionSummary>),
    /// Empty-clear debounce survived uninterrupted; publish an empty list.
    Cleared,
}

/// Owns the subscription accumulator and its timers. Only the event loop touches it.
///
/// `settled` is the last settled list; a new accumulation starts from it so a delta only
/// changes the subscriptions it names.
#[derive(Debug)]
pub struct SubscriptionReconciler {
    accumulator: HashMap<String, SubscriptionSummary>,
    settled: HashMap<String, SubscriptionSummary>,
    draining: HashMap<String, TimerState>,
    coalesce: TimerState,
    empty_clear: TimerState,
    coalesce_window: Duration,
    empty_clear_delay: Duration,
}

impl SubscriptionReconciler {
    pub fn new(coalesce_window: Duration, empty_clear_delay: Duration) -> Self {
        Self {
            accumulator: HashMap::new(),
            settled: HashMap::new(),
            draining: HashMap::new(),
            coalesce: TimerState::Idle,
            empty_clear: TimerState::Idle,
            coalesce_window,
            empty_clear_delay,
        }
    }

    /// Applies one normalized event and returns the update to publish right away.
    pub fn apply(
        &mut self,
        event: MarketDataEvent,
        updated_at: DateTime<Utc>,
        now: Instant,
    ) -> MarketDataUpdate {
        let mut update = MarketDataUpdate {
            items: None,
            status: Some(event.status),
            telemetry: event.telemetry,
            updated_at: Some(updated_at),
            error: event.error,
        };

        let Some(items) = event.items else {
            return update;
        };

        if items.is_empty() {
            if !self.empty_clear.is_pending() {
                debug!(delay_ms = self.empty_clear_delay.as_millis() as u64, "empty-clear armed");
            }
            self.empty_clear.arm_if_idle(now, self.empty_clear_delay);
            return update;
        }

        if self.empty_clear.is_pending() {
            debug!("empty-clear cancelled by non-empty delta");
            self.empty_clear.cancel();
            self.coalesce.cancel();
        }

        if self.accumulator.is_empty() {
            self.accumulator = self.settled.clone();
        }

        for item in items {
            let merged = match self.accumulator.remove(&item.subscription_id) {
                Some(previous) => merge_summaries(previous, item),
                None => item,
            };
            let id = merged.subscription_id.clone();
            if merged.is_draining() {
                self.draining
                    .entry(id.clone())
                    .or_default()
                    .arm_if_idle(now, self.empty_clear_delay);
            } else {
                self.draining.remove(&id);
            }
            self.accumulator.insert(id, merged);
        }

        update.items = Some(sorted_items(&self.accumulator));
        self.coalesce.arm_if_idle(now, self.coalesce_window);
        update
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [self.coalesce.deadline(), self.empty_clear.deadline()]
            .into_iter()
            .flatten()
            .chain(self.draining.values().filter_map(TimerState::deadline))
            .min()
    }

    /// Fires every timer due at `now`: coalescing, then draining removals, then empty-clear.
    pub fn fire_due(&mut self, now: Instant) -> Vec<TimerFire> {
        let mut fires = Vec::new();

        if self.coalesce.take_due(now) {
            self.settled = std::mem::take(&mut self.accumulator);
            let settled = sorted_items(&self.settled);
            debug!(items = settled.len(), "coalescing window settled");
            fires.push(TimerFire::Settled(settled));
        }

        let pruned: Vec<String> = self
            .draining
            .iter_mut()
            .filter_map(|(id, timer)| timer.take_due(now).then(|| id.clone()))
            .collect();
        if !pruned.is_empty() {
            for id in &pruned {
                self.draining.remove(id);
                self.accumulator.remove(id);
                self.settled.remove(id);
            }
            debug!(removed = ?pruned, "draining subscriptions removed");
            fires.push(TimerFire::Pruned(self.visible_items()));
        }

        if self.empty_clear.take_due(now) {
            self.accumulator.clear();
            self.settled.clear();
            self.draining.clear();
            self.coalesce.cancel();
            debug!("empty-clear fired");
            fires.push(TimerFire::Cleared);
        }

        fires
    }

    /// Drops pending work without publishing it.
    pub fn discard(&mut self) {
        self.accumulator.clear();
        self.settled.clear();
        self.draining.clear();
        self.coalesce.cancel();
        self.empty_clear.cancel();
    }

    fn visible_items(&self) -> Vec<SubscriptionSummary> {
        if self.accumulator.is_empty() {
            sorted_items(&self.settled)
        } else {
            sorted_items(&self.accumulator)
        }
    }
}

fn sorted_items(map: &HashMap<String, SubscriptionSummary>) -> Vec<SubscriptionSummary> {
    let mut items: Vec<SubscriptionSummary> = map.values().cloned().collect();
    items.sort_by_key(SubscriptionSummary::sort_key);
    items
}

/// Delta-wins merge of two views of the same subscription.
pub fn merge_summaries(
    previous: SubscriptionSummary,
    next: SubscriptionSummary,
) -> SubscriptionSummary {
    let explicit = previous.explicit.union(next.explicit);
    let mut merged = SubscriptionSummary {
        subscription_id: next.subscription_id,
        symbol: previous.symbol.merged_with(next.symbol),
        sec_type: previous.sec_type.merged_with(next.sec_type),
        exchange: previous.exchange.merged_with(next.exchange),
        currency: previous.currency.merged_with(next.currency),
        local_symbol: previous.local_symbol.merged_with(next.local_symbol),
        timeframe: previous.timeframe.merged_with(next.timeframe),
        started_at: previous.started_at.merged_with(next.started_at),
        metadata: previous.metadata.merged_with(next.metadata),
        owners: if next.explicit.owners {
            next.owners
        } else {
            previous.owners
        },
        owner_count: if next.explicit.owner_count {
            next.owner_count
        } else {
            previous.owner_count
        },
        enable_dom: if next.explicit.enable_dom {
            next.enable_dom
        } else {
            previous.enable_dom
        },
        enable_ticker: if next.explicit.enable_ticker {
            next.enable_ticker
        } else {
            previous.enable_ticker
        },
        enable_bars: if next.explicit.enable_bars {
            next.enable_bars
        } else {
            previous.enable_bars
        },
        streams: merge_streams(previous.streams.into_iter().chain(next.streams)),
        explicit,
    };
    derive_summary_fields(&mut merged);
    merged
}

/// Groups streams by `(kind, request_id)` in first-seen order and merges each group.
pub fn merge_streams(streams: impl IntoIterator<Item = Stream>) -> Vec<Stream> {
    let mut order: Vec<(StreamKind, String)> = Vec::new();
    let mut groups: HashMap<(StreamKind, String), Stream> = HashMap::new();

    for stream in streams {
        let key = stream.group_key();
        match groups.remove(&key) {
            Some(existing) => {
                groups.insert(key, merge_stream(existing, stream));
            }
            None => {
                order.push(key.clone());
                groups.insert(key, stream);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect()
}

pub fn merge_stream(previous: Stream, next: Stream) -> Stream {
    let enabled = match (previous.enabled, next.enabled) {
        (None, None) => None,
        (lhs, rhs) => Some(lhs.unwrap_or(false) || rhs.unwrap_or(false)),
    };
    let total_references = match (previous.total_references, next.total_references) {
        (Some(lhs), Some(rhs)) => Some(lhs.max(rhs)),
        (lhs, rhs) => lhs.or(rhs),
    };
    let subscribers = union_subscribers(previous.subscribers, next.subscribers);
    let unique_owners = subscribers
        .iter()
        .map(|subscriber| subscriber.owner_id.as_str())
        .collect::<HashSet<_>>()
        .len() as u32;

    Stream {
        kind: next.kind,
        request_id: next.request_id.or(previous.request_id),
        enabled,
        owner_count: previous.owner_count.max(next.owner_count).max(unique_owners),
        total_references,
        subscribers,
    }
}

/// Unions two subscriber lists on `(stream, owner_id, source)`. A later duplicate replaces
/// the earlier entry in place.
pub fn union_subscribers(previous: Vec<Subscriber>, next: Vec<Subscriber>) -> Vec<Subscriber> {
    let mut merged: Vec<Subscriber> = Vec::with_capacity(previous.len() + next.len());
    for subscriber in previous.into_iter().chain(next) {
        match merged
            .iter()
            .position(|existing| existing.dedup_key() == subscriber.dedup_key())
        {
            Some(index) => merged[index] = subscriber,
            None => merged.push(subscriber),
        }
    }
    merged
}
