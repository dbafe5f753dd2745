use crate::error::AppError;
use crate::sync::types::EnvelopeWire;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{
    EVENT_ENVELOPE_TYPE, STRATEGY_MARKET_DATA_EVENT, STRATEGY_METRIC_EVENT, STRATEGY_STATUS_EVENT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRoute {
    Status,
    Metric,
    MarketData,
}

impl EventRoute {
    pub fn from_event_name(event: &str) -> Option<Self> {
        match event {
            STRATEGY_STATUS_EVENT => Some(Self::Status),
            STRATEGY_METRIC_EVENT => Some(Self::Metric),
            STRATEGY_MARKET_DATA_EVENT => Some(Self::MarketData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub route: EventRoute,
    pub payload: Value,
    /// Server-side stamp when present and parseable; callers fall back to receive time.
    pub timestamp: Option<DateTime<Utc>>,
}

pub fn parse_envelope_payload(payload: &mut [u8]) -> Result<EnvelopeWire, AppError> {
    let wire: EnvelopeWire = simd_json::serde::from_slice(payload)?;
    Ok(wire)
}

/// Decodes one inbound text frame. `Ok(None)` is a well-formed frame this client ignores.
pub fn decode_frame(text: &str) -> Result<Option<Envelope>, AppError> {
    let mut owned_payload = text.as_bytes().to_vec();
    let wire = parse_envelope_payload(owned_payload.as_mut_slice())?;
    Ok(route_envelope(wire))
}

pub fn route_envelope(wire: EnvelopeWire) -> Option<Envelope> {
    if wire.kind.as_deref() != Some(EVENT_ENVELOPE_TYPE) {
        return None;
    }
    let route = EventRoute::from_event_name(wire.event.as_deref()?)?;
    let timestamp = wire
        .timestamp
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        .map(|parsed| parsed.with_timezone(&Utc));

    Some(Envelope {
        route,
        payload: wire.payload,
        timestamp,
    })
}
