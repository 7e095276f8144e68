use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Why a credential attempt failed. Drives the backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Account out of credit or payment rejected. Long disable.
    Billing,
    /// 401/403 or expired credential. Short cooldown, try the next profile.
    Unauthorized,
    RateLimit,
    Timeout,
    Transport,
    Other,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Billing => "billing",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::RateLimit => "rate_limit",
            FailureReason::Timeout => "timeout",
            FailureReason::Transport => "transport",
            FailureReason::Other => "other",
        }
    }
}

/// Per-profile usage bookkeeping, persisted next to the profile map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageStats {
    /// Epoch millis of the last successful use. Drives round-robin ordering.
    pub last_used: Option<i64>,
    pub error_count: u32,
    pub failure_counts: BTreeMap<String, u32>,
    pub last_failure_at: Option<i64>,
    /// Transient quarantine after recoverable failures (epoch millis).
    pub cooldown_until: Option<i64>,
    /// Long quarantine after billing failures (epoch millis).
    pub disabled_until: Option<i64>,
    pub disabled_reason: Option<String>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl UsageStats {
    pub fn in_cooldown(&self, now_ms: i64) -> bool {
        self.cooldown_until.is_some_and(|t| t > now_ms)
    }

    pub fn is_disabled(&self, now_ms: i64) -> bool {
        self.disabled_until.is_some_and(|t| t > now_ms)
    }
}

/// Recoverable-failure cooldown: 1 min, 5 min, 25 min, then capped at 60 min.
///
/// `n` is the error count after incrementing (so the first failure gets
/// `cooldown_ms(1)`).
pub fn cooldown_ms(n: u32) -> i64 {
    const BASE_MS: i64 = 60_000;
    const CAP_MS: i64 = 3_600_000;
    let n = n.max(1);
    let mut ms = BASE_MS;
    for _ in 1..n {
        ms = ms.saturating_mul(5);
        if ms >= CAP_MS {
            return CAP_MS;
        }
    }
    ms.min(CAP_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_table() {
        assert_eq!(cooldown_ms(1), 60_000);
        assert_eq!(cooldown_ms(2), 300_000);
        assert_eq!(cooldown_ms(3), 1_500_000);
        assert_eq!(cooldown_ms(4), 3_600_000);
        assert_eq!(cooldown_ms(5), 3_600_000);
        assert_eq!(cooldown_ms(50), 3_600_000);
    }

    #[test]
    fn cooldown_and_disable_windows() {
        let stats = UsageStats {
            cooldown_until: Some(5_000),
            disabled_until: Some(10_000),
            ..Default::default()
        };
        assert!(stats.in_cooldown(4_999));
        assert!(!stats.in_cooldown(5_000));
        assert!(stats.is_disabled(9_999));
        assert!(!stats.is_disabled(10_000));
    }
}
