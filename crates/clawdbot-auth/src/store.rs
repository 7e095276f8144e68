//! The on-disk credential profile store.
//!
//! One JSON file per agent directory: `<agent_dir>/auth-profiles.json`,
//! file mode 0600, directory 0700. Loading migrates the legacy `auth.json`
//! layout, synchronizes external CLI credentials, and synthesizes in-memory
//! profiles from provider env vars. All writes go through the atomic
//! tempfile+rename path.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use clawdbot_core::config::{AuthOrderConfig, CooldownConfig};
use clawdbot_core::fsio;

use crate::cli_sync;
use crate::error::{AuthError, Result};
use crate::order;
use crate::profile::{normalize_provider, Credential, CredentialProfile};
use crate::usage::{cooldown_ms, FailureReason, UsageStats};

const STORE_FILE: &str = "auth-profiles.json";
const LEGACY_FILE: &str = "auth.json";

/// Serialized store schema (`version: 1`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreData {
    pub version: u32,
    pub profiles: BTreeMap<String, CredentialProfile>,
    pub usage_stats: BTreeMap<String, UsageStats>,
    /// Operator-pinned per-provider orderings; wins over config order.
    pub order: BTreeMap<String, Vec<String>>,
    pub last_good: BTreeMap<String, String>,
}

/// Token usage recorded by `mark_success`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageDelta {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub struct AuthProfileStore {
    path: PathBuf,
    data: StoreData,
    /// Profiles synthesized from env vars; never written to disk.
    ephemeral: HashSet<String>,
}

impl AuthProfileStore {
    /// Load or create the store at `<agent_dir>/auth-profiles.json`.
    ///
    /// Performs, in order: legacy `auth.json` migration (idempotent — the
    /// legacy file is deleted after import), external CLI credential sync,
    /// env-var profile synthesis. Persists when migration or sync changed
    /// anything.
    pub fn ensure(agent_dir: &Path) -> Result<Self> {
        let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_default();
        Self::ensure_with_home(agent_dir, &home)
    }

    /// `ensure` with an explicit home directory (CLI credential roots).
    #[instrument(skip_all, fields(dir = %agent_dir.display()))]
    pub fn ensure_with_home(agent_dir: &Path, home: &Path) -> Result<Self> {
        fsio::ensure_private_dir(agent_dir)?;
        let path = agent_dir.join(STORE_FILE);

        let mut data = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            StoreData {
                version: 1,
                ..Default::default()
            }
        };

        let mut dirty = !path.exists();
        dirty |= migrate_legacy(agent_dir, &mut data)?;
        dirty |= cli_sync::sync_cli_credentials(&mut data, home);

        let mut store = Self {
            path,
            data,
            ephemeral: HashSet::new(),
        };
        store.synthesize_env_profiles();

        if dirty {
            store.persist()?;
        }
        Ok(store)
    }

    pub fn data(&self) -> &StoreData {
        &self.data
    }

    pub fn profile(&self, id: &str) -> Option<&CredentialProfile> {
        self.data.profiles.get(id)
    }

    pub fn usage(&self, id: &str) -> Option<&UsageStats> {
        self.data.usage_stats.get(id)
    }

    /// Insert or replace a profile, enforcing the id/provider invariant.
    pub fn upsert(&mut self, id: &str, profile: CredentialProfile) -> Result<()> {
        let Some((provider, _)) = crate::profile::split_profile_id(id) else {
            return Err(AuthError::InvalidProfile {
                id: id.to_string(),
                reason: "id must be <provider>:<name>".into(),
            });
        };
        if normalize_provider(&profile.provider) != provider {
            return Err(AuthError::InvalidProfile {
                id: id.to_string(),
                reason: format!(
                    "provider field '{}' does not match id prefix '{provider}'",
                    profile.provider
                ),
            });
        }
        self.data.profiles.insert(id.to_string(), profile);
        self.persist()
    }

    /// Full candidate ordering for `provider`. See [`order::resolve_order`].
    pub fn resolve(
        &self,
        cfg: Option<&AuthOrderConfig>,
        provider: &str,
        preferred: Option<&str>,
    ) -> Vec<String> {
        let now = chrono::Utc::now().timestamp_millis();
        order::resolve_order(cfg, &self.data, provider, preferred, now)
    }

    /// Record a failed attempt and apply the backoff policy.
    #[instrument(skip(self, cooldowns), fields(profile = %profile_id, reason = reason.as_str()))]
    pub fn mark_failure(
        &mut self,
        profile_id: &str,
        reason: FailureReason,
        cooldowns: Option<&CooldownConfig>,
    ) -> Result<()> {
        if !self.data.profiles.contains_key(profile_id) {
            return Err(AuthError::ProfileNotFound {
                id: profile_id.to_string(),
            });
        }
        let now = chrono::Utc::now().timestamp_millis();
        let defaults = CooldownConfig::default();
        let cooldowns = cooldowns.unwrap_or(&defaults);

        let stats = self.data.usage_stats.entry(profile_id.to_string()).or_default();

        // Stale failure history resets before counting this one.
        let window_ms = (cooldowns.failure_window_hours * 3_600_000.0) as i64;
        if stats
            .last_failure_at
            .is_some_and(|at| now - at > window_ms)
        {
            stats.error_count = 0;
            stats.failure_counts.clear();
        }
        stats.error_count += 1;
        *stats
            .failure_counts
            .entry(reason.as_str().to_string())
            .or_insert(0) += 1;
        stats.last_failure_at = Some(now);

        match reason {
            FailureReason::Billing => {
                let provider = profile_id.split(':').next().unwrap_or_default();
                let hours = cooldowns
                    .billing_backoff_hours_by_provider
                    .get(provider)
                    .copied()
                    .unwrap_or(cooldowns.billing_backoff_hours)
                    .min(cooldowns.billing_max_hours);
                stats.disabled_until = Some(now + (hours * 3_600_000.0) as i64);
                stats.disabled_reason = Some("billing".to_string());
                warn!(hours, "profile disabled for billing failure");
            }
            _ => {
                let ms = cooldown_ms(stats.error_count);
                stats.cooldown_until = Some(now + ms);
                info!(cooldown_ms = ms, errors = stats.error_count, "profile cooling down");
            }
        }

        self.persist()
    }

    /// Record a successful attempt: freshness, last-good, counter reset.
    #[instrument(skip(self, delta), fields(profile = %profile_id))]
    pub fn mark_success(&mut self, profile_id: &str, delta: UsageDelta) -> Result<()> {
        let Some(profile) = self.data.profiles.get(profile_id) else {
            return Err(AuthError::ProfileNotFound {
                id: profile_id.to_string(),
            });
        };
        let provider = profile.provider.clone();
        let now = chrono::Utc::now().timestamp_millis();

        let stats = self.data.usage_stats.entry(profile_id.to_string()).or_default();
        stats.last_used = Some(now);
        stats.cooldown_until = None;
        stats.error_count = 0;
        stats.failure_counts.clear();
        stats.total_input_tokens += delta.input_tokens;
        stats.total_output_tokens += delta.output_tokens;

        self.data
            .last_good
            .insert(provider, profile_id.to_string());
        self.persist()
    }

    /// Write the store atomically, excluding env-synthesized profiles.
    pub fn persist(&self) -> Result<()> {
        let mut on_disk = self.data.clone();
        for id in &self.ephemeral {
            on_disk.profiles.remove(id);
            on_disk.usage_stats.remove(id);
        }
        fsio::write_json_atomic(&self.path, &on_disk, 0o600)?;
        Ok(())
    }

    /// Synthesize `<provider>:env` profiles from process env vars for
    /// providers the store has no profile for. Never persisted.
    fn synthesize_env_profiles(&mut self) {
        const ENV_KEYS: &[(&str, &str)] = &[
            ("anthropic", "ANTHROPIC_API_KEY"),
            ("openai", "OPENAI_API_KEY"),
            ("gemini", "GEMINI_API_KEY"),
            ("zai", "ZAI_API_KEY"),
            ("openrouter", "OPENROUTER_API_KEY"),
            ("minimax", "MINIMAX_API_KEY"),
        ];

        for (provider, var) in ENV_KEYS {
            if self
                .data
                .profiles
                .values()
                .any(|p| p.provider == *provider)
            {
                continue;
            }
            let Ok(key) = std::env::var(var) else { continue };
            if key.trim().is_empty() {
                continue;
            }
            let id = format!("{provider}:env");
            self.data.profiles.insert(
                id.clone(),
                CredentialProfile {
                    provider: provider.to_string(),
                    credential: Credential::ApiKey { key },
                },
            );
            self.ephemeral.insert(id);
        }

        // ANTHROPIC_OAUTH_TOKEN outranks a plain env key for anthropic.
        if let Ok(token) = std::env::var("ANTHROPIC_OAUTH_TOKEN") {
            if !token.trim().is_empty()
                && !self
                    .data
                    .profiles
                    .values()
                    .any(|p| p.provider == "anthropic" && p.credential.is_oauth())
            {
                let id = "anthropic:env-oauth".to_string();
                self.data.profiles.insert(
                    id.clone(),
                    CredentialProfile {
                        provider: "anthropic".to_string(),
                        credential: Credential::OAuth {
                            access: token,
                            refresh: None,
                            expires: None,
                        },
                    },
                );
                self.ephemeral.insert(id);
            }
        }
    }
}

/// Import the legacy single-profile-per-provider `auth.json` layout.
///
/// Each entry becomes `<provider>:default`; existing profiles are never
/// overwritten. The legacy file is deleted afterwards, which also makes the
/// migration idempotent.
fn migrate_legacy(agent_dir: &Path, data: &mut StoreData) -> Result<bool> {
    let legacy_path = agent_dir.join(LEGACY_FILE);
    if !legacy_path.exists() {
        return Ok(false);
    }

    let text = std::fs::read_to_string(&legacy_path)?;
    let entries: BTreeMap<String, serde_json::Value> = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "legacy auth.json unparseable; leaving in place");
            return Ok(false);
        }
    };

    let mut imported = 0usize;
    for (provider, value) in entries {
        let provider = normalize_provider(&provider);
        let id = format!("{provider}:default");
        if data.profiles.contains_key(&id) {
            continue;
        }
        match serde_json::from_value::<CredentialProfile>(value) {
            Ok(mut profile) => {
                profile.provider = provider;
                data.profiles.insert(id, profile);
                imported += 1;
            }
            Err(e) => warn!(%provider, error = %e, "skipping malformed legacy credential"),
        }
    }

    std::fs::remove_file(&legacy_path)?;
    info!(imported, "migrated legacy auth.json");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn empty_home() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn ensure_creates_store_file() {
        let dir = tempfile::tempdir().unwrap();
        let home = empty_home();
        let store = AuthProfileStore::ensure_with_home(dir.path(), home.path()).unwrap();
        assert!(dir.path().join(STORE_FILE).exists());
        assert_eq!(store.data().version, 1);
    }

    #[test]
    fn legacy_migration_imports_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let home = empty_home();
        fs::write(
            dir.path().join(LEGACY_FILE),
            r#"{"anthropic":{"type":"oauth","provider":"anthropic","access":"A","refresh":"R","expires":9999999999999}}"#,
        )
        .unwrap();

        let store = AuthProfileStore::ensure_with_home(dir.path(), home.path()).unwrap();
        let profile = store.profile("anthropic:default").expect("migrated profile");
        assert_eq!(
            profile.credential,
            Credential::OAuth {
                access: "A".into(),
                refresh: Some("R".into()),
                expires: Some(9_999_999_999_999),
            }
        );
        assert!(!dir.path().join(LEGACY_FILE).exists());

        // idempotent: a second ensure changes nothing
        let again = AuthProfileStore::ensure_with_home(dir.path(), home.path()).unwrap();
        assert!(again.profile("anthropic:default").is_some());
        assert_eq!(again.data().profiles.len(), store.data().profiles.len());
    }

    #[test]
    fn mark_failure_billing_disables_for_about_five_hours() {
        let dir = tempfile::tempdir().unwrap();
        let home = empty_home();
        let mut store = AuthProfileStore::ensure_with_home(dir.path(), home.path()).unwrap();
        store
            .upsert(
                "anthropic:work",
                CredentialProfile {
                    provider: "anthropic".into(),
                    credential: Credential::ApiKey { key: "sk".into() },
                },
            )
            .unwrap();

        let started = chrono::Utc::now().timestamp_millis();
        store
            .mark_failure("anthropic:work", FailureReason::Billing, None)
            .unwrap();

        let until = store.usage("anthropic:work").unwrap().disabled_until.unwrap();
        let lo = started + (4.5 * 3_600_000.0) as i64;
        let hi = started + (5.5 * 3_600_000.0) as i64;
        assert!(until > lo && until < hi, "disabled_until {until} not ~5h out");
        assert_eq!(
            store.usage("anthropic:work").unwrap().disabled_reason.as_deref(),
            Some("billing")
        );
    }

    #[test]
    fn billing_backoff_respects_provider_override_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let home = empty_home();
        let mut store = AuthProfileStore::ensure_with_home(dir.path(), home.path()).unwrap();
        store
            .upsert(
                "openai:a",
                CredentialProfile {
                    provider: "openai".into(),
                    credential: Credential::ApiKey { key: "sk".into() },
                },
            )
            .unwrap();

        let mut cfg = CooldownConfig::default();
        cfg.billing_backoff_hours_by_provider
            .insert("openai".into(), 100.0);
        cfg.billing_max_hours = 10.0;

        let started = chrono::Utc::now().timestamp_millis();
        store
            .mark_failure("openai:a", FailureReason::Billing, Some(&cfg))
            .unwrap();
        let until = store.usage("openai:a").unwrap().disabled_until.unwrap();
        // capped at 10h despite the 100h override
        assert!(until < started + 11 * 3_600_000);
        assert!(until > started + 9 * 3_600_000);
    }

    #[test]
    fn repeated_failures_escalate_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let home = empty_home();
        let mut store = AuthProfileStore::ensure_with_home(dir.path(), home.path()).unwrap();
        store
            .upsert(
                "anthropic:a",
                CredentialProfile {
                    provider: "anthropic".into(),
                    credential: Credential::ApiKey { key: "sk".into() },
                },
            )
            .unwrap();

        store
            .mark_failure("anthropic:a", FailureReason::Unauthorized, None)
            .unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        let first = store.usage("anthropic:a").unwrap().cooldown_until.unwrap();
        assert!(first - now <= 60_000 + 1_000);

        store
            .mark_failure("anthropic:a", FailureReason::Unauthorized, None)
            .unwrap();
        let second = store.usage("anthropic:a").unwrap().cooldown_until.unwrap();
        assert!(second - now >= 300_000 - 1_000);
        assert_eq!(store.usage("anthropic:a").unwrap().error_count, 2);
    }

    #[test]
    fn mark_success_clears_failure_state_and_sets_last_good() {
        let dir = tempfile::tempdir().unwrap();
        let home = empty_home();
        let mut store = AuthProfileStore::ensure_with_home(dir.path(), home.path()).unwrap();
        store
            .upsert(
                "anthropic:a",
                CredentialProfile {
                    provider: "anthropic".into(),
                    credential: Credential::ApiKey { key: "sk".into() },
                },
            )
            .unwrap();
        store
            .mark_failure("anthropic:a", FailureReason::Unauthorized, None)
            .unwrap();

        store
            .mark_success(
                "anthropic:a",
                UsageDelta {
                    input_tokens: 100,
                    output_tokens: 50,
                },
            )
            .unwrap();

        let stats = store.usage("anthropic:a").unwrap();
        assert_eq!(stats.error_count, 0);
        assert!(stats.cooldown_until.is_none());
        assert!(stats.failure_counts.is_empty());
        assert_eq!(stats.total_input_tokens, 100);
        assert_eq!(
            store.data().last_good.get("anthropic").map(String::as_str),
            Some("anthropic:a")
        );
    }

    #[test]
    fn upsert_rejects_mismatched_provider() {
        let dir = tempfile::tempdir().unwrap();
        let home = empty_home();
        let mut store = AuthProfileStore::ensure_with_home(dir.path(), home.path()).unwrap();
        let err = store
            .upsert(
                "anthropic:a",
                CredentialProfile {
                    provider: "openai".into(),
                    credential: Credential::ApiKey { key: "sk".into() },
                },
            )
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidProfile { .. }));
    }

    #[test]
    fn persisted_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let home = empty_home();
        {
            let mut store = AuthProfileStore::ensure_with_home(dir.path(), home.path()).unwrap();
            store
                .upsert(
                    "zai:default",
                    CredentialProfile {
                        provider: "zai".into(),
                        credential: Credential::ApiKey { key: "zk".into() },
                    },
                )
                .unwrap();
        }
        let store = AuthProfileStore::ensure_with_home(dir.path(), home.path()).unwrap();
        assert!(store.profile("zai:default").is_some());
    }
}
