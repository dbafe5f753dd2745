use crate::error::AppError;
use crate::sync::coalesce::{merge_streams, union_subscribers};
use crate::sync::types::{
    lookup_field, lookup_value, parse_timestamp, scalar_to_key, value_to_bool, value_to_string,
    value_to_u32, ExplicitSummaryFields, FeedStatus, Field, MarketDataEvent, Stream, StreamKind,
    Subscriber, SubscriptionSummary,
};
use serde_json::{Map, Value};
use std::collections::HashSet;

const ITEM_KEYS: [&str; 2] = ["items", "subscriptions"];
const SUBSCRIPTION_ID_KEYS: [&str; 3] = ["subscriptionId", "subscription_id", "id"];
const STREAM_TYPE_KEYS: [&str; 5] = ["stream", "type", "kind", "name", "key"];
const SUBSCRIBER_LIST_KEYS: [&str; 2] = ["subscribers", "owners"];
const OWNER_ID_KEYS: [&str; 4] = ["owner_id", "ownerId", "owner", "id"];
const SUBSCRIBER_STREAM_KEYS: [&str; 2] = ["stream", "stream_type"];
const REFERENCE_COUNT_KEYS: [&str; 2] = ["reference_count", "ref_count"];

/// Normalizes a `strategy.market_data` payload. Non-object payloads are rejected so the
/// caller can surface a status error without touching the visible list.
pub fn normalize_market_data_event(payload: &Value) -> Result<MarketDataEvent, AppError> {
    let map = payload.as_object().ok_or_else(|| {
        AppError::MalformedPayload("market data payload is not an object".to_string())
    })?;

    let items = match lookup_field(map, &ITEM_KEYS) {
        Field::Absent => None,
        Field::Null => Some(Vec::new()),
        Field::Value(Value::Array(entries)) => {
            Some(entries.iter().filter_map(normalize_subscription).collect())
        }
        Field::Value(_) => None,
    };

    let status = match map.get("status").and_then(Value::as_str) {
        Some(raw) if raw.trim().eq_ignore_ascii_case("updating") => FeedStatus::Updating,
        _ => FeedStatus::Idle,
    };

    let error = match map.get("error") {
        Some(value) => text_field(value),
        None => map.get("message").map(text_field).unwrap_or_default(),
    };

    Ok(MarketDataEvent {
        items,
        telemetry: map.get("telemetry").and_then(Value::as_object).cloned(),
        status,
        error,
    })
}

fn text_field(value: &Value) -> Field<String> {
    match value_to_string(value) {
        Some(text) => Field::Value(text),
        None => Field::Null,
    }
}

fn string_field(map: &Map<String, Value>, aliases: &[&str]) -> Field<String> {
    match lookup_field(map, aliases) {
        Field::Absent => Field::Absent,
        Field::Null => Field::Null,
        Field::Value(value) => text_field(value),
    }
}

pub fn normalize_subscription(value: &Value) -> Option<SubscriptionSummary> {
    let map = value.as_object()?;
    let subscription_id = lookup_value(map, &SUBSCRIPTION_ID_KEYS).and_then(scalar_to_key)?;

    let timeframe = string_field(map, &["timeframe"]);
    let started_at = match lookup_field(map, &["startedAt", "started_at"]) {
        Field::Absent => Field::Absent,
        Field::Null => Field::Null,
        Field::Value(raw) => parse_timestamp(raw).map(Field::Value).unwrap_or_default(),
    };

    let mut explicit = ExplicitSummaryFields::default();
    let owners = match lookup_value(map, &["owners"]).and_then(Value::as_array) {
        Some(entries) => {
            explicit.owners = true;
            unique_owner_ids(entries.iter().filter_map(|entry| {
                scalar_to_key(entry).or_else(|| {
                    entry
                        .as_object()
                        .and_then(|owner| lookup_value(owner, &OWNER_ID_KEYS))
                        .and_then(scalar_to_key)
                })
            }))
        }
        None => Vec::new(),
    };
    let owner_count = match lookup_value(map, &["ownerCount", "owner_count"]).and_then(value_to_u32) {
        Some(count) => {
            explicit.owner_count = true;
            count
        }
        None => 0,
    };
    let enable_dom = explicit_flag(map, &["enableDom", "enable_dom"], &mut explicit.enable_dom);
    let enable_ticker =
        explicit_flag(map, &["enableTicker", "enable_ticker"], &mut explicit.enable_ticker);
    let enable_bars = explicit_flag(map, &["enableBars", "enable_bars"], &mut explicit.enable_bars);

    let streams = normalize_subscription_streams(
        map,
        timeframe.as_option().map(String::as_str),
        [enable_dom, enable_ticker, enable_bars],
    );

    let mut summary = SubscriptionSummary {
        subscription_id,
        symbol: string_field(map, &["symbol"]),
        sec_type: string_field(map, &["secType", "sec_type"]),
        exchange: string_field(map, &["exchange"]),
        currency: string_field(map, &["currency"]),
        local_symbol: string_field(map, &["localSymbol", "local_symbol"]),
        timeframe,
        started_at,
        metadata: lookup_field(map, &["metadata"]).map(Value::clone),
        owners,
        owner_count,
        enable_dom: enable_dom.unwrap_or(false),
        enable_ticker: enable_ticker.unwrap_or(false),
        enable_bars: enable_bars.unwrap_or(false),
        streams,
        explicit,
    };
    derive_summary_fields(&mut summary);
    Some(summary)
}

fn explicit_flag(map: &Map<String, Value>, aliases: &[&str], explicit: &mut bool) -> Option<bool> {
    let flag = lookup_value(map, aliases).and_then(value_to_bool);
    *explicit = flag.is_some();
    flag
}

fn unique_owner_ids(ids: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Fills owners, owner count and enable flags that the payload did not supply explicitly.
pub fn derive_summary_fields(summary: &mut SubscriptionSummary) {
    let stream_owners = unique_owner_ids(
        summary
            .streams
            .iter()
            .flat_map(|stream| stream.subscribers.iter())
            .map(|subscriber| subscriber.owner_id.clone()),
    );

    if !summary.explicit.owners {
        summary.owners = stream_owners.clone();
    }
    if !summary.explicit.owner_count {
        summary.owner_count = summary.owners.len().max(stream_owners.len()) as u32;
    }

    let stream_enabled = |kind: StreamKind| {
        summary
            .streams
            .iter()
            .filter(|stream| stream.kind == kind)
            .any(|stream| stream.enabled == Some(true) || stream.owner_count > 0)
    };
    let enable_dom = stream_enabled(StreamKind::Dom);
    let enable_ticker = stream_enabled(StreamKind::Ticker);
    let enable_bars = stream_enabled(StreamKind::Bars);

    if !summary.explicit.enable_dom {
        summary.enable_dom = enable_dom;
    }
    if !summary.explicit.enable_ticker {
        summary.enable_ticker = enable_ticker;
    }
    if !summary.explicit.enable_bars {
        summary.enable_bars = enable_bars;
    }
}

/// Builds the stream list of one subscription, from an explicit `streams` array when
/// present and otherwise from the legacy flat subscriber fields. `enable_flags` is
/// ordered dom, ticker, bars.
pub fn normalize_subscription_streams(
    map: &Map<String, Value>,
    timeframe: Option<&str>,
    enable_flags: [Option<bool>; 3],
) -> Vec<Stream> {
    let streams = match lookup_value(map, &["streams"]).and_then(Value::as_array) {
        Some(entries) => entries.iter().filter_map(normalize_stream).collect(),
        None => legacy_streams(map, timeframe, enable_flags),
    };

    merge_streams(streams)
}

fn normalize_stream(value: &Value) -> Option<Stream> {
    let map = value.as_object()?;
    let token = lookup_value(map, &STREAM_TYPE_KEYS).and_then(value_to_string)?;
    let kind = StreamKind::parse_token(&token)?;

    let request_id = if kind == StreamKind::Bars {
        lookup_value(map, &["requestId", "request_id"])
            .and_then(value_to_string)
            .and_then(|raw| normalize_request_id(&raw))
            .or_else(|| has_bar_prefix(&token).then(|| normalize_request_id(&token)).flatten())
            .or_else(|| {
                lookup_value(map, &["timeframe"])
                    .and_then(value_to_string)
                    .and_then(|raw| normalize_request_id(&raw))
            })
    } else {
        None
    };

    let subscribers = lookup_value(map, &SUBSCRIBER_LIST_KEYS)
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| normalize_subscriber(entry, Some(kind)))
                .map(|subscriber| Subscriber {
                    stream: kind,
                    ..subscriber
                })
                .collect()
        })
        .unwrap_or_default();

    Some(build_stream(
        kind,
        request_id,
        lookup_value(map, &["enabled", "active"]).and_then(value_to_bool),
        lookup_value(map, &["ownerCount", "owner_count"]).and_then(value_to_u32),
        lookup_value(map, &["totalReferences", "total_references"]).and_then(value_to_u32),
        subscribers,
    ))
}

fn legacy_streams(
    map: &Map<String, Value>,
    timeframe: Option<&str>,
    enable_flags: [Option<bool>; 3],
) -> Vec<Stream> {
    let per_kind: Vec<(StreamKind, Option<&Vec<Value>>)> = StreamKind::ALL
        .iter()
        .map(|kind| (*kind, legacy_subscriber_list(map, *kind)))
        .collect();
    let has_per_kind_lists = per_kind.iter().any(|(_, list)| list.is_some());

    let flat: Vec<Subscriber> = if has_per_kind_lists {
        Vec::new()
    } else {
        lookup_value(map, &["subscribers"])
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| normalize_subscriber(entry, None))
                    .collect()
            })
            .unwrap_or_default()
    };

    // A kind with no list, no tagged subscribers and no enable flag was never reported.
    per_kind
        .into_iter()
        .zip(enable_flags)
        .filter_map(|((kind, list), enabled)| {
            let subscribers: Vec<Subscriber> = match list {
                Some(entries) => entries
                    .iter()
                    .filter_map(|entry| normalize_subscriber(entry, Some(kind)))
                    .map(|subscriber| Subscriber {
                        stream: kind,
                        ..subscriber
                    })
                    .collect(),
                None => flat
                    .iter()
                    .filter(|subscriber| subscriber.stream == kind)
                    .cloned()
                    .collect(),
            };
            if list.is_none() && subscribers.is_empty() && enabled.is_none() {
                return None;
            }
            let request_id = (kind == StreamKind::Bars)
                .then(|| timeframe.and_then(normalize_request_id))
                .flatten();
            Some(build_stream(kind, request_id, enabled, None, None, subscribers))
        })
        .collect()
}

fn legacy_subscriber_list(map: &Map<String, Value>, kind: StreamKind) -> Option<&Vec<Value>> {
    let aliases: &[&str] = match kind {
        StreamKind::Dom => &["dom_subscribers"],
        StreamKind::Ticker => &["ticker_subscribers"],
        StreamKind::Bars => &["bar_subscribers", "bars_subscribers"],
    };
    lookup_value(map, aliases).and_then(Value::as_array)
}

fn build_stream(
    kind: StreamKind,
    request_id: Option<String>,
    enabled: Option<bool>,
    explicit_owner_count: Option<u32>,
    explicit_total_references: Option<u32>,
    subscribers: Vec<Subscriber>,
) -> Stream {
    let subscribers = union_subscribers(Vec::new(), subscribers);
    let unique_owners = subscribers
        .iter()
        .map(|subscriber| subscriber.owner_id.as_str())
        .collect::<HashSet<_>>()
        .len() as u32;
    let total_references = match kind {
        StreamKind::Dom => None,
        _ => explicit_total_references.or_else(|| {
            (!subscribers.is_empty()).then(|| {
                subscribers
                    .iter()
                    .map(|subscriber| subscriber.reference_count.unwrap_or(1))
                    .sum()
            })
        }),
    };

    Stream {
        kind,
        request_id,
        enabled,
        owner_count: explicit_owner_count.unwrap_or(0).max(unique_owners),
        total_references,
        subscribers,
    }
}

fn has_bar_prefix(token: &str) -> bool {
    let lowered = token.trim().to_ascii_lowercase();
    lowered.starts_with("bar_") || lowered.starts_with("bars_")
}

/// Maps timeframe-ish tokens onto bar request ids: `bar_5m` -> `5`, `1mo` -> `1M`, `1M` -> `1M`.
pub fn normalize_request_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let lowered = trimmed.to_ascii_lowercase();
    let token = ["bars_", "bar_"]
        .iter()
        .find(|prefix| lowered.starts_with(*prefix))
        .map(|prefix| &trimmed[prefix.len()..])
        .unwrap_or(trimmed);
    if token.is_empty() {
        return None;
    }

    if let Some(count) = token.strip_suffix('M') {
        if is_count(count) {
            return Some(format!("{count}M"));
        }
    }

    let lowered = token.to_ascii_lowercase();
    for suffix in ["months", "month", "mon", "mo"] {
        if let Some(count) = lowered.strip_suffix(suffix) {
            if is_count(count) {
                return Some(format!("{count}M"));
            }
        }
    }
    for suffix in ["mins", "min", "m"] {
        if let Some(count) = lowered.strip_suffix(suffix) {
            if is_count(count) {
                return Some(count.to_string());
            }
        }
    }

    Some(token.to_string())
}

fn is_count(raw: &str) -> bool {
    !raw.is_empty() && raw.chars().all(|ch| ch.is_ascii_digit())
}

/// Normalizes one subscriber entry, either a bare owner id or an object. The stream tag
/// comes from the entry, then `metadata.stream`, then `hint`; entries with none are dropped.
pub fn normalize_subscriber(value: &Value, hint: Option<StreamKind>) -> Option<Subscriber> {
    if let Some(owner_id) = scalar_to_key(value) {
        return Some(Subscriber {
            owner_id,
            stream: hint?,
            source: None,
            reference_count: None,
            metadata: None,
            subscribed_at: None,
            updated_at: None,
        });
    }

    let map = value.as_object()?;
    let owner_id = lookup_value(map, &OWNER_ID_KEYS).and_then(scalar_to_key)?;
    let metadata = map.get("metadata").filter(|value| value.is_object()).cloned();
    let stream = lookup_value(map, &SUBSCRIBER_STREAM_KEYS)
        .and_then(value_to_string)
        .and_then(|token| StreamKind::parse_token(&token))
        .or_else(|| {
            metadata
                .as_ref()
                .and_then(|metadata| metadata.get("stream"))
                .and_then(value_to_string)
                .and_then(|token| StreamKind::parse_token(&token))
        })
        .or(hint)?;

    Some(Subscriber {
        owner_id,
        stream,
        source: lookup_value(map, &["source"]).and_then(value_to_string),
        reference_count: lookup_value(map, &REFERENCE_COUNT_KEYS).and_then(value_to_u32),
        metadata,
        subscribed_at: lookup_value(map, &["subscribed_at"]).and_then(parse_timestamp),
        updated_at: lookup_value(map, &["updated_at"]).and_then(parse_timestamp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn items_tri_state_is_preserved() {
        let absent = normalize_market_data_event(&json!({ "status": "updating" })).expect("absent");
        let null = normalize_market_data_event(&json!({ "items": null })).expect("null");
        let empty = normalize_market_data_event(&json!({ "subscriptions": [] })).expect("empty");

        assert!(absent.items.is_none());
        assert_eq!(absent.status, FeedStatus::Updating);
        assert_eq!(null.items, Some(Vec::new()));
        assert_eq!(empty.items, Some(Vec::new()));
        assert_eq!(empty.status, FeedStatus::Idle);
    }

    #[test]
    fn error_key_tri_state_falls_back_to_message() {
        let absent = normalize_market_data_event(&json!({})).expect("absent");
        let cleared = normalize_market_data_event(&json!({ "error": null })).expect("cleared");
        let set = normalize_market_data_event(&json!({ "message": "feed lagging" })).expect("set");

        assert_eq!(absent.error, Field::Absent);
        assert_eq!(cleared.error, Field::Null);
        assert_eq!(set.error, Field::Value("feed lagging".to_string()));
    }

    #[test]
    fn rejects_non_object_payload() {
        let result = normalize_market_data_event(&json!(["s1"]));
        assert!(matches!(result, Err(AppError::MalformedPayload(_))));
    }

    #[test]
    fn discards_entries_without_subscription_id() {
        let event = normalize_market_data_event(&json!({
            "items": [{ "symbol": "ES" }, { "SubscriptionId": "s2", "symbol": "NQ" }]
        }))
        .expect("event");

        let items = event.items.expect("items");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].subscription_id, "s2");
    }

    #[test]
    fn descriptors_are_copied_only_when_present() {
        let summary = normalize_subscription(&json!({
            "subscription_id": "s1",
            "symbol": "ES",
            "exchange": null
        }))
        .expect("summary");

        assert_eq!(summary.symbol, Field::Value("ES".to_string()));
        assert_eq!(summary.exchange, Field::Null);
        assert_eq!(summary.currency, Field::Absent);
    }

    #[test]
    fn explicit_streams_dedupe_and_derive_owner_fields() {
        let summary = normalize_subscription(&json!({
            "subscription_id": "s1",
            "streams": [
                { "stream": "dom", "subscribers": [{ "owner_id": "x" }, { "owner_id": "x" }] },
                { "type": "bars_5m", "subscribers": ["y", "z"] },
                { "stream": "ticker", "enabled": false }
            ]
        }))
        .expect("summary");

        assert_eq!(summary.streams.len(), 3);
        let dom = &summary.streams[0];
        assert_eq!(dom.kind, StreamKind::Dom);
        assert_eq!(dom.owner_count, 1);
        assert!(dom.total_references.is_none());

        let bars = &summary.streams[1];
        assert_eq!(bars.request_id.as_deref(), Some("5"));
        assert_eq!(bars.owner_count, 2);
        assert_eq!(bars.total_references, Some(2));

        let ticker = &summary.streams[2];
        assert_eq!(ticker.kind, StreamKind::Ticker);
        assert_eq!(ticker.enabled, Some(false));
        assert_eq!(ticker.owner_count, 0);

        assert_eq!(summary.owners, vec!["x", "y", "z"]);
        assert_eq!(summary.owner_count, 3);
        assert!(summary.enable_dom);
        assert!(summary.enable_bars);
        assert!(!summary.enable_ticker);
    }

    #[test]
    fn disabled_streams_without_owners_are_kept() {
        let summary = normalize_subscription(&json!({
            "subscription_id": "s1",
            "symbol": "ES",
            "streams": [{ "stream": "ticker", "enabled": false, "owner_count": 0 }]
        }))
        .expect("summary");

        assert_eq!(summary.streams.len(), 1);
        assert_eq!(summary.streams[0].enabled, Some(false));
        assert!(!summary.enable_ticker);
        assert!(!summary.is_draining());
    }

    #[test]
    fn explicit_owner_fields_are_not_overwritten() {
        let summary = normalize_subscription(&json!({
            "subscription_id": "s1",
            "ownerCount": 5,
            "enableTicker": true,
            "streams": [{ "stream": "dom", "subscribers": ["x"] }]
        }))
        .expect("summary");

        assert_eq!(summary.owner_count, 5);
        assert!(summary.enable_ticker);
        assert_eq!(summary.owners, vec!["x"]);
    }

    #[test]
    fn legacy_flat_fields_synthesize_streams() {
        let summary = normalize_subscription(&json!({
            "id": "s1",
            "timeframe": "bar_1mo",
            "dom_subscribers": ["a"],
            "bar_subscribers": [{ "owner_id": "b", "reference_count": 3 }]
        }))
        .expect("summary");

        assert_eq!(summary.streams.len(), 2);
        assert_eq!(summary.streams[0].kind, StreamKind::Dom);
        let bars = &summary.streams[1];
        assert_eq!(bars.kind, StreamKind::Bars);
        assert_eq!(bars.request_id.as_deref(), Some("1M"));
        assert_eq!(bars.total_references, Some(3));
    }

    #[test]
    fn flat_subscriber_list_is_split_by_stream_tag() {
        let summary = normalize_subscription(&json!({
            "id": "s1",
            "subscribers": [
                { "owner_id": "a", "stream": "ticker" },
                { "owner_id": "b", "metadata": { "stream": "dom" } },
                { "owner_id": "c" }
            ]
        }))
        .expect("summary");

        let kinds: Vec<StreamKind> = summary.streams.iter().map(|stream| stream.kind).collect();
        assert_eq!(kinds, vec![StreamKind::Dom, StreamKind::Ticker]);
        assert_eq!(summary.owner_count, 2);
    }

    #[test]
    fn request_ids_map_timeframe_tokens() {
        assert_eq!(normalize_request_id("bar_5").as_deref(), Some("5"));
        assert_eq!(normalize_request_id("5min").as_deref(), Some("5"));
        assert_eq!(normalize_request_id("1mo").as_deref(), Some("1M"));
        assert_eq!(normalize_request_id("3months").as_deref(), Some("3M"));
        assert_eq!(normalize_request_id("1M").as_deref(), Some("1M"));
        assert_eq!(normalize_request_id("1h").as_deref(), Some("1h"));
        assert!(normalize_request_id("bars_").is_none());
    }

    #[test]
    fn subscriber_timestamps_accept_seconds_and_iso() {
        let subscriber = normalize_subscriber(
            &json!({
                "ownerId": "x",
                "source": "chart",
                "subscribed_at": 1_700_000_000,
                "updated_at": "2023-11-14T22:13:20Z"
            }),
            Some(StreamKind::Ticker),
        )
        .expect("subscriber");

        assert_eq!(subscriber.stream, StreamKind::Ticker);
        assert_eq!(subscriber.source.as_deref(), Some("chart"));
        assert_eq!(subscriber.subscribed_at, subscriber.updated_at);
    }

    #[test]
    fn subscriber_without_stream_tag_is_dropped() {
        assert!(normalize_subscriber(&json!({ "owner_id": "x" }), None).is_none());
        assert!(normalize_subscriber(&json!("x"), None).is_none());
    }
}
