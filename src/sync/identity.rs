use crate::sync::sink::StrategyLookup;
use crate::sync::types::{lookup_value, scalar_to_key};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub const PRIMARY_ID_KEYS: [&str; 1] = ["id"];
pub const LEGACY_ID_KEYS: [&str; 2] = ["strategy_id", "strategyId"];
pub const NAME_KEYS: [&str; 2] = ["name", "strategy_name"];

/// Maps every identifier spelling seen for a strategy onto one canonical key.
///
/// Candidates are tried in priority order (primary id, legacy id, name). The first
/// non-empty candidate becomes the key for a new entity, but any candidate that already
/// names a known entity wins so alternating id schemes never fork a record. Once an alias
/// is bound it is never rebound to a different canonical key.
#[derive(Debug, Default)]
pub struct IdentifierResolver {
    aliases: HashMap<String, String>,
}

impl IdentifierResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve<L>(&mut self, candidates: &[Option<&Value>], lookup: &L) -> Option<String>
    where
        L: StrategyLookup + ?Sized,
    {
        let keys: Vec<String> = candidates
            .iter()
            .filter_map(|candidate| candidate.and_then(scalar_to_key))
            .collect();
        let primary = keys.first()?.clone();

        let known = keys.iter().find_map(|key| {
            self.aliases
                .get(key)
                .cloned()
                .or_else(|| lookup.find_strategy_id(key))
        });
        let canonical = known.unwrap_or(primary);

        for key in keys {
            self.aliases.entry(key).or_insert_with(|| canonical.clone());
        }
        self.aliases
            .entry(canonical.clone())
            .or_insert_with(|| canonical.clone());

        Some(canonical)
    }

    /// Resolves the standard `id` / `strategy_id` / `name` family of a payload.
    pub fn resolve_payload<L>(&mut self, payload: &Map<String, Value>, lookup: &L) -> Option<String>
    where
        L: StrategyLookup + ?Sized,
    {
        let candidates = [
            lookup_value(payload, &PRIMARY_ID_KEYS),
            lookup_value(payload, &LEGACY_ID_KEYS),
            lookup_value(payload, &NAME_KEYS),
        ];
        self.resolve(&candidates, lookup)
    }

    pub fn resolve_key<L>(&mut self, key: &str, lookup: &L) -> Option<String>
    where
        L: StrategyLookup + ?Sized,
    {
        let value = Value::String(key.to_string());
        self.resolve(&[Some(&value)], lookup)
    }
}
