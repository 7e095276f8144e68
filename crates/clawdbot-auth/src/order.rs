//! Candidate ordering for credential profiles.
//!
//! `resolve_order` produces the full list of profile ids worth trying for a
//! provider, best first. The runner walks the list on transient auth
//! failures; nothing here performs I/O.

use std::collections::HashMap;

use clawdbot_core::config::AuthOrderConfig;

use crate::profile::{normalize_provider, split_profile_id};
use crate::store::StoreData;

/// Compute the try-order of profile ids for `provider`.
///
/// Precedence of the base ordering: store-level `order[provider]`, then
/// config `auth.order[provider]` ids not already placed, then the recency
/// heuristic for whatever remains. `preferred` (when present) moves to the
/// front. Profiles in cooldown or disabled sink to the tail regardless of
/// any explicit order — disabled entries first, then cooldowns, each by
/// expiry ascending. `last_good` never reorders.
pub fn resolve_order(
    cfg: Option<&AuthOrderConfig>,
    data: &StoreData,
    provider: &str,
    preferred: Option<&str>,
    now_ms: i64,
) -> Vec<String> {
    let provider = normalize_provider(provider);

    // Live candidates for this provider.
    let mut candidates: Vec<&str> = data
        .profiles
        .iter()
        .filter(|(_, p)| p.provider == provider)
        .filter(|(_, p)| !p.credential.is_dead(now_ms))
        .map(|(id, _)| id.as_str())
        .collect();

    let mut ordered: Vec<String> = Vec::with_capacity(candidates.len());
    let push_known = |ids: &[String], ordered: &mut Vec<String>| {
        for raw in ids {
            let Some((id_provider, name)) = split_profile_id(raw) else {
                continue;
            };
            if id_provider != provider {
                continue;
            }
            let id = format!("{id_provider}:{name}");
            if candidates.contains(&id.as_str()) && !ordered.contains(&id) {
                ordered.push(id);
            }
        }
    };

    if let Some(ids) = lookup_normalized(&data.order, &provider) {
        push_known(ids, &mut ordered);
    }
    if let Some(cfg) = cfg {
        if let Some(ids) = lookup_normalized(&cfg.order, &provider) {
            push_known(ids, &mut ordered);
        }
    }

    // Heuristic for everything not explicitly placed: ascending last_used
    // (round-robin freshness — never-used profiles first), OAuth before
    // plain keys on ties, id as the final tie-break.
    candidates.retain(|id| !ordered.iter().any(|o| o == id));
    candidates.sort_by_key(|id| {
        let last_used = data
            .usage_stats
            .get(*id)
            .and_then(|s| s.last_used)
            .unwrap_or(i64::MIN);
        let oauth_rank = if data
            .profiles
            .get(*id)
            .map(|p| p.credential.is_oauth())
            .unwrap_or(false)
        {
            0u8
        } else {
            1u8
        };
        (last_used, oauth_rank, id.to_string())
    });
    ordered.extend(candidates.iter().map(|s| s.to_string()));

    if let Some(preferred) = preferred {
        if let Some(pos) = ordered.iter().position(|id| id == preferred) {
            let id = ordered.remove(pos);
            ordered.insert(0, id);
        }
    }

    // Quarantined profiles sink to the tail. Disabled entries outrank
    // cooldowns there, then expiry ascending within each group.
    let (available, mut tail): (Vec<String>, Vec<String>) = ordered
        .into_iter()
        .partition(|id| {
            data.usage_stats
                .get(id)
                .map(|s| !s.is_disabled(now_ms) && !s.in_cooldown(now_ms))
                .unwrap_or(true)
        });
    tail.sort_by_key(|id| {
        let stats = data.usage_stats.get(id);
        let disabled = stats.map(|s| s.is_disabled(now_ms)).unwrap_or(false);
        let expiry = stats
            .and_then(|s| {
                if disabled {
                    s.disabled_until
                } else {
                    s.cooldown_until
                }
            })
            .unwrap_or(i64::MAX);
        (if disabled { 0u8 } else { 1u8 }, expiry)
    });

    let mut result = available;
    result.extend(tail);
    result
}

/// Case/alias-insensitive provider lookup into an order map.
fn lookup_normalized<'a, V>(map: &'a impl MapLike<V>, provider: &str) -> Option<&'a V> {
    map.iter_pairs()
        .find(|(k, _)| normalize_provider(k) == provider)
        .map(|(_, v)| v)
}

/// The store keeps a BTreeMap and the config a HashMap; one tiny trait
/// avoids copying either into the other's shape.
trait MapLike<V> {
    fn iter_pairs(&self) -> Box<dyn Iterator<Item = (&String, &V)> + '_>;
}

impl<V> MapLike<V> for std::collections::BTreeMap<String, V> {
    fn iter_pairs(&self) -> Box<dyn Iterator<Item = (&String, &V)> + '_> {
        Box::new(self.iter())
    }
}

impl<V> MapLike<V> for HashMap<String, V> {
    fn iter_pairs(&self) -> Box<dyn Iterator<Item = (&String, &V)> + '_> {
        Box::new(self.iter())
    }
}
