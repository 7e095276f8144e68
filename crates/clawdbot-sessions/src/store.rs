//! The session registry — single source of truth for conversation state.
//!
//! Entries live in `sessions/sessions.json` and persist atomically after
//! every mutation. Mutations to the same key are serialized by the per-run
//! lane queue upstream; the store itself guards its map with an `RwLock`
//! so concurrent handlers for distinct keys stay independent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use clawdbot_core::config::ModelsConfig;
use clawdbot_core::fsio;

use crate::error::{Result, SessionError};
use crate::transcript;
use crate::types::{SessionEntry, SessionKey, ThinkingLevel};

const STORE_FILE: &str = "sessions.json";

/// How long `delete` waits for an aborted run to unwind.
const DELETE_ABORT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Created,
    Reset,
    Deleted,
    Compacted,
}

impl SessionEventKind {
    pub fn event_name(&self) -> &'static str {
        match self {
            SessionEventKind::Created => "session.created",
            SessionEventKind::Reset => "session.reset",
            SessionEventKind::Deleted => "session.deleted",
            SessionEventKind::Compacted => "session.compacted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub key: String,
    pub session_id: String,
}

/// Partial update; `Some(None)` on the double-option fields clears.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPatch {
    #[serde(deserialize_with = "double_option")]
    pub label: Option<Option<String>>,
    pub thinking_level: Option<String>,
    pub verbose_level: Option<String>,
    pub reasoning_level: Option<String>,
    pub elevated_level: Option<String>,
    pub send_policy: Option<String>,
    pub group_activation: Option<String>,
    #[serde(deserialize_with = "double_option")]
    pub model: Option<Option<String>>,
    pub spawned_by: Option<String>,
}

/// `"field": null` must arrive as `Some(None)`, not `None`.
fn double_option<'de, T, D>(de: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

struct ActiveRun {
    cancel: CancellationToken,
    done_rx: watch::Receiver<bool>,
}

/// Removes the active-run registration (and signals waiters) on drop, so
/// every exit path of a run — success, error, abort — unregisters.
pub struct RunGuard {
    active: Arc<DashMap<String, ActiveRun>>,
    key: String,
    done_tx: watch::Sender<bool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.active.remove(&self.key);
        let _ = self.done_tx.send(true);
    }
}

pub struct SessionStore {
    sessions_dir: PathBuf,
    path: PathBuf,
    default_agent: String,
    entries: RwLock<BTreeMap<String, SessionEntry>>,
    active: Arc<DashMap<String, ActiveRun>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionStore {
    /// Open (or create) the store under `<state_dir>/sessions/`.
    pub fn open(state_dir: &Path, default_agent: &str) -> Result<Self> {
        let sessions_dir = state_dir.join("sessions");
        fsio::ensure_private_dir(&sessions_dir)?;
        let path = sessions_dir.join(STORE_FILE);

        let entries: BTreeMap<String, SessionEntry> = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            BTreeMap::new()
        };

        let (events, _) = broadcast::channel(64);
        Ok(Self {
            sessions_dir,
            path,
            default_agent: default_agent.to_string(),
            entries: RwLock::new(entries),
            active: Arc::new(DashMap::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// All entries, key-sorted.
    pub fn list(&self) -> Vec<(String, SessionEntry)> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionEntry> {
        self.entries.read().unwrap().get(&key.format()).cloned()
    }

    /// Resolve a raw key, the `"main"` shorthand, or a label to its
    /// canonical key.
    pub fn resolve(&self, key_or_label: &str) -> Result<SessionKey> {
        let trimmed = key_or_label.trim();
        if trimmed == "main" {
            return Ok(SessionKey::main(&self.default_agent));
        }
        if let Ok(key) = SessionKey::parse(trimmed) {
            return Ok(key);
        }
        let entries = self.entries.read().unwrap();
        for (key, entry) in entries.iter() {
            if entry.label.as_deref() == Some(trimmed) {
                return SessionKey::parse(key);
            }
        }
        Err(SessionError::NotFound {
            key: key_or_label.to_string(),
        })
    }

    /// Fetch or lazily create the entry for `key`.
    #[instrument(skip(self), fields(key = %key))]
    pub fn get_or_create(&self, key: &SessionKey) -> Result<SessionEntry> {
        {
            let entries = self.entries.read().unwrap();
            if let Some(entry) = entries.get(&key.format()) {
                return Ok(entry.clone());
            }
        }
        let entry = SessionEntry::new();
        {
            let mut entries = self.entries.write().unwrap();
            // lost race: another handler created it first
            if let Some(existing) = entries.get(&key.format()) {
                return Ok(existing.clone());
            }
            entries.insert(key.format(), entry.clone());
            self.persist_locked(&entries)?;
        }
        debug!("session created");
        self.emit(SessionEventKind::Created, key, &entry.session_id);
        Ok(entry)
    }

    /// Apply a partial update under the registry's validation rules.
    #[instrument(skip(self, patch, models, default_model), fields(key = %key))]
    pub fn patch(
        &self,
        key: &SessionKey,
        patch: &SessionPatch,
        models: &ModelsConfig,
        default_model: &str,
    ) -> Result<SessionEntry> {
        let key_str = key.format();
        let mut entries = self.entries.write().unwrap();

        // Label uniqueness is checked against every other entry before we
        // take the mutable borrow.
        if let Some(Some(label)) = &patch.label {
            let label = label.trim();
            if label.is_empty() {
                return Err(SessionError::InvalidPatch("label must not be blank".into()));
            }
            let clash = entries
                .iter()
                .any(|(k, e)| k != &key_str && e.label.as_deref() == Some(label));
            if clash {
                return Err(SessionError::DuplicateLabel {
                    label: label.to_string(),
                });
            }
        }

        let entry = entries
            .get_mut(&key_str)
            .ok_or_else(|| SessionError::NotFound { key: key_str.clone() })?;

        if let Some(spawned_by) = &patch.spawned_by {
            if !key.is_subagent() {
                return Err(SessionError::InvalidPatch(
                    "spawnedBy only applies to subagent sessions".into(),
                ));
            }
            if spawned_by.trim().is_empty() {
                return Err(SessionError::InvalidPatch("spawnedBy must not be blank".into()));
            }
            if entry.spawned_by.is_some() {
                return Err(SessionError::InvalidPatch("spawnedBy is immutable".into()));
            }
            entry.spawned_by = Some(spawned_by.clone());
        }

        if let Some(model) = &patch.model {
            match model {
                None => {
                    entry.provider_override = None;
                    entry.model_override = None;
                }
                Some(spec) => {
                    if !models.is_allowed(spec) {
                        return Err(SessionError::InvalidPatch(format!(
                            "model not in catalog/allowlist: {spec}"
                        )));
                    }
                    if spec == default_model {
                        // selecting the default clears the override
                        entry.provider_override = None;
                        entry.model_override = None;
                    } else {
                        let (provider, model) = spec
                            .split_once('/')
                            .ok_or_else(|| {
                                SessionError::InvalidPatch(format!(
                                    "model must be <provider>/<model>: {spec}"
                                ))
                            })?;
                        entry.provider_override = Some(provider.to_string());
                        entry.model_override = Some(model.to_string());
                    }
                }
            }
        }

        if let Some(level) = &patch.thinking_level {
            let parsed = ThinkingLevel::parse(level).ok_or_else(|| {
                SessionError::InvalidPatch(format!("unknown thinking level: {level}"))
            })?;
            if parsed == ThinkingLevel::Xhigh {
                let spec = entry
                    .model_spec()
                    .unwrap_or_else(|| default_model.to_string());
                let supported = models.find(&spec).map(|m| m.supports_xhigh).unwrap_or(false);
                if !supported {
                    return Err(SessionError::InvalidPatch(format!(
                        "xhigh is not supported by {spec}"
                    )));
                }
            }
            entry.thinking_level = Some(parsed);
        }
        if let Some(level) = &patch.verbose_level {
            entry.verbose_level = Some(parse_level(level)?);
        }
        if let Some(level) = &patch.reasoning_level {
            entry.reasoning_level = Some(parse_level(level)?);
        }
        if let Some(level) = &patch.elevated_level {
            entry.elevated_level = Some(parse_level(level)?);
        }
        if let Some(policy) = &patch.send_policy {
            match policy.as_str() {
                "allow" | "deny" => entry.send_policy = Some(policy.clone()),
                other => {
                    return Err(SessionError::InvalidPatch(format!(
                        "unknown send policy: {other}"
                    )))
                }
            }
        }
        if let Some(activation) = &patch.group_activation {
            match activation.as_str() {
                "mention" | "always" => entry.group_activation = Some(activation.clone()),
                other => {
                    return Err(SessionError::InvalidPatch(format!(
                        "unknown group activation: {other}"
                    )))
                }
            }
        }
        if let Some(label) = &patch.label {
            entry.label = label.as_ref().map(|l| l.trim().to_string());
        }

        entry.touch();
        let snapshot = entry.clone();
        self.persist_locked(&entries)?;
        Ok(snapshot)
    }

    /// Effective thinking level for a model spec — stored `xhigh` demotes
    /// to `high` lazily when the model cannot take it.
    pub fn effective_thinking_level(
        entry: &SessionEntry,
        models: &ModelsConfig,
        default_model: &str,
    ) -> Option<ThinkingLevel> {
        let level = entry.thinking_level?;
        if level != ThinkingLevel::Xhigh {
            return Some(level);
        }
        let spec = entry
            .model_spec()
            .unwrap_or_else(|| default_model.to_string());
        let supported = models.find(&spec).map(|m| m.supports_xhigh).unwrap_or(false);
        Some(if supported {
            ThinkingLevel::Xhigh
        } else {
            ThinkingLevel::High
        })
    }

    /// Regenerate the session id, keeping overrides and label. The old
    /// transcript is removed.
    #[instrument(skip(self), fields(key = %key))]
    pub fn reset(&self, key: &SessionKey) -> Result<SessionEntry> {
        let key_str = key.format();
        let (old_id, snapshot) = {
            let mut entries = self.entries.write().unwrap();
            let entry = entries
                .get_mut(&key_str)
                .ok_or_else(|| SessionError::NotFound { key: key_str.clone() })?;
            let old_id = std::mem::replace(
                &mut entry.session_id,
                uuid::Uuid::now_v7().to_string(),
            );
            entry.input_tokens = None;
            entry.output_tokens = None;
            entry.total_tokens = None;
            entry.compaction_count = 0;
            entry.touch();
            let snapshot = entry.clone();
            self.persist_locked(&entries)?;
            (old_id, snapshot)
        };

        transcript::remove(&self.sessions_dir, &old_id)?;
        info!(old_session = %old_id, new_session = %snapshot.session_id, "session reset");
        self.emit(SessionEventKind::Reset, key, &snapshot.session_id);
        Ok(snapshot)
    }

    /// Delete a session. Refuses the main slot; aborts an active run and
    /// waits (bounded) for it to unwind; soft-deletes the transcript.
    pub async fn delete(&self, key: &SessionKey) -> Result<()> {
        self.delete_with_wait(key, DELETE_ABORT_WAIT).await
    }

    #[instrument(skip(self, wait), fields(key = %key))]
    pub async fn delete_with_wait(&self, key: &SessionKey, wait: Duration) -> Result<()> {
        if key.is_main() {
            return Err(SessionError::DeleteMain);
        }
        let key_str = key.format();

        if let Some(run) = self.active.get(&key_str).map(|r| ActiveRun {
            cancel: r.cancel.clone(),
            done_rx: r.done_rx.clone(),
        }) {
            info!("aborting active run before delete");
            run.cancel.cancel();
            let mut done_rx = run.done_rx;
            if !*done_rx.borrow() {
                let _ = tokio::time::timeout(wait, done_rx.changed()).await;
            }
            if self.active.contains_key(&key_str) {
                warn!("run did not unwind before timeout; deleting anyway");
            }
        }

        let session_id = {
            let mut entries = self.entries.write().unwrap();
            let entry = entries
                .remove(&key_str)
                .ok_or_else(|| SessionError::NotFound { key: key_str.clone() })?;
            self.persist_locked(&entries)?;
            entry.session_id
        };

        transcript::soft_delete(&self.sessions_dir, &session_id)?;
        info!(session = %session_id, "session deleted");
        self.emit(SessionEventKind::Deleted, key, &session_id);
        Ok(())
    }

    /// Truncate the transcript to its last `max_lines` lines.
    #[instrument(skip(self), fields(key = %key, max_lines))]
    pub fn compact(&self, key: &SessionKey, max_lines: usize) -> Result<SessionEntry> {
        let key_str = key.format();
        let session_id = {
            let entries = self.entries.read().unwrap();
            entries
                .get(&key_str)
                .map(|e| e.session_id.clone())
                .ok_or_else(|| SessionError::NotFound { key: key_str.clone() })?
        };

        let trimmed = transcript::compact(&self.sessions_dir, &session_id, max_lines)?;

        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .get_mut(&key_str)
            .ok_or_else(|| SessionError::NotFound { key: key_str.clone() })?;
        if trimmed {
            entry.compaction_count += 1;
            entry.touch();
        }
        let snapshot = entry.clone();
        self.persist_locked(&entries)?;
        drop(entries);

        if trimmed {
            self.emit(SessionEventKind::Compacted, key, &snapshot.session_id);
        }
        Ok(snapshot)
    }

    /// Post-run bookkeeping: token usage and last delivery route.
    pub fn record_run(
        &self,
        key: &SessionKey,
        input_tokens: u64,
        output_tokens: u64,
        last_channel: Option<&str>,
        last_to: Option<&str>,
        last_account_id: Option<&str>,
    ) -> Result<SessionEntry> {
        let key_str = key.format();
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .get_mut(&key_str)
            .ok_or_else(|| SessionError::NotFound { key: key_str.clone() })?;
        entry.input_tokens = Some(entry.input_tokens.unwrap_or(0) + input_tokens);
        entry.output_tokens = Some(entry.output_tokens.unwrap_or(0) + output_tokens);
        entry.total_tokens =
            Some(entry.input_tokens.unwrap_or(0) + entry.output_tokens.unwrap_or(0));
        if let Some(channel) = last_channel {
            entry.last_channel = Some(channel.to_string());
        }
        if let Some(to) = last_to {
            entry.last_to = Some(to.to_string());
        }
        if let Some(account) = last_account_id {
            entry.last_account_id = Some(account.to_string());
        }
        entry.touch();
        let snapshot = entry.clone();
        self.persist_locked(&entries)?;
        Ok(snapshot)
    }

    /// Register an in-flight run so `delete` can abort and await it. The
    /// caller's cancellation token is the one `delete` will cancel.
    pub fn register_run(&self, key: &SessionKey, cancel: CancellationToken) -> RunGuard {
        let (done_tx, done_rx) = watch::channel(false);
        self.active.insert(key.format(), ActiveRun { cancel, done_rx });
        RunGuard {
            active: Arc::clone(&self.active),
            key: key.format(),
            done_tx,
        }
    }

    pub fn has_active_run(&self, key: &SessionKey) -> bool {
        self.active.contains_key(&key.format())
    }

    fn persist_locked(&self, entries: &BTreeMap<String, SessionEntry>) -> Result<()> {
        fsio::write_json_atomic(&self.path, entries, 0o600)?;
        Ok(())
    }

    fn emit(&self, kind: SessionEventKind, key: &SessionKey, session_id: &str) {
        // fire-and-forget: no subscriber is fine
        let _ = self.events.send(SessionEvent {
            kind,
            key: key.format(),
            session_id: session_id.to_string(),
        });
    }
}

fn parse_level(s: &str) -> Result<ThinkingLevel> {
    ThinkingLevel::parse(s)
        .ok_or_else(|| SessionError::InvalidPatch(format!("unknown level: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), "main").unwrap();
        (dir, store)
    }

    fn models() -> ModelsConfig {
        ModelsConfig::default()
    }

    const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

    #[test]
    fn get_or_create_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = SessionKey::parse("agent:main:whatsapp:direct:+1555").unwrap();
        let id = {
            let store = SessionStore::open(dir.path(), "main").unwrap();
            store.get_or_create(&key).unwrap().session_id
        };
        let store = SessionStore::open(dir.path(), "main").unwrap();
        assert_eq!(store.get(&key).unwrap().session_id, id);
    }

    #[test]
    fn duplicate_label_conflicts() {
        let (_dir, store) = store();
        let a = SessionKey::parse("agent:main:whatsapp:direct:+1").unwrap();
        let b = SessionKey::parse("agent:main:whatsapp:direct:+2").unwrap();
        store.get_or_create(&a).unwrap();
        store.get_or_create(&b).unwrap();

        let patch = SessionPatch {
            label: Some(Some("travel".into())),
            ..Default::default()
        };
        store.patch(&a, &patch, &models(), DEFAULT_MODEL).unwrap();

        let err = store
            .patch(&b, &patch, &models(), DEFAULT_MODEL)
            .unwrap_err();
        assert!(matches!(err, SessionError::DuplicateLabel { .. }));
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn label_clears_with_null() {
        let (_dir, store) = store();
        let a = SessionKey::parse("agent:main:whatsapp:direct:+1").unwrap();
        store.get_or_create(&a).unwrap();
        store
            .patch(
                &a,
                &SessionPatch {
                    label: Some(Some("x".into())),
                    ..Default::default()
                },
                &models(),
                DEFAULT_MODEL,
            )
            .unwrap();
        let entry = store
            .patch(
                &a,
                &SessionPatch {
                    label: Some(None),
                    ..Default::default()
                },
                &models(),
                DEFAULT_MODEL,
            )
            .unwrap();
        assert!(entry.label.is_none());
    }

    #[test]
    fn resolve_accepts_key_alias_and_label() {
        let (_dir, store) = store();
        let main = SessionKey::main("main");
        store.get_or_create(&main).unwrap();
        assert_eq!(store.resolve("main").unwrap(), main);
        assert_eq!(store.resolve("agent:main:main").unwrap(), main);

        let chat = SessionKey::parse("agent:main:telegram:direct:42").unwrap();
        store.get_or_create(&chat).unwrap();
        store
            .patch(
                &chat,
                &SessionPatch {
                    label: Some(Some("tg".into())),
                    ..Default::default()
                },
                &models(),
                DEFAULT_MODEL,
            )
            .unwrap();
        assert_eq!(store.resolve("tg").unwrap(), chat);
        assert!(store.resolve("nope").is_err());
    }

    #[test]
    fn spawned_by_is_write_once_and_subagent_only() {
        let (_dir, store) = store();
        let chat = SessionKey::parse("agent:main:telegram:direct:42").unwrap();
        store.get_or_create(&chat).unwrap();
        let patch = SessionPatch {
            spawned_by: Some("agent:main:main".into()),
            ..Default::default()
        };
        assert!(store.patch(&chat, &patch, &models(), DEFAULT_MODEL).is_err());

        let sub = SessionKey::subagent("main", "x1");
        store.get_or_create(&sub).unwrap();
        store.patch(&sub, &patch, &models(), DEFAULT_MODEL).unwrap();
        // second write rejected
        assert!(store.patch(&sub, &patch, &models(), DEFAULT_MODEL).is_err());
    }

    #[test]
    fn model_patch_validates_and_default_clears() {
        let (_dir, store) = store();
        let key = SessionKey::subagent("main", "m");
        store.get_or_create(&key).unwrap();

        let err = store
            .patch(
                &key,
                &SessionPatch {
                    model: Some(Some("bogus/model".into())),
                    ..Default::default()
                },
                &models(),
                DEFAULT_MODEL,
            )
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");

        let entry = store
            .patch(
                &key,
                &SessionPatch {
                    model: Some(Some("openai/gpt-5".into())),
                    ..Default::default()
                },
                &models(),
                DEFAULT_MODEL,
            )
            .unwrap();
        assert_eq!(entry.provider_override.as_deref(), Some("openai"));
        assert_eq!(entry.model_override.as_deref(), Some("gpt-5"));

        // patching back to the default model clears the override
        let entry = store
            .patch(
                &key,
                &SessionPatch {
                    model: Some(Some(DEFAULT_MODEL.into())),
                    ..Default::default()
                },
                &models(),
                DEFAULT_MODEL,
            )
            .unwrap();
        assert!(entry.model_override.is_none());
    }

    #[test]
    fn xhigh_rejected_on_unsupporting_model() {
        let (_dir, store) = store();
        let key = SessionKey::subagent("main", "t");
        store.get_or_create(&key).unwrap();

        // default model does not support xhigh
        let err = store
            .patch(
                &key,
                &SessionPatch {
                    thinking_level: Some("xhigh".into()),
                    ..Default::default()
                },
                &models(),
                DEFAULT_MODEL,
            )
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");

        // switching to an xhigh-capable model first makes it valid
        store
            .patch(
                &key,
                &SessionPatch {
                    model: Some(Some("anthropic/claude-opus-4".into())),
                    ..Default::default()
                },
                &models(),
                DEFAULT_MODEL,
            )
            .unwrap();
        let entry = store
            .patch(
                &key,
                &SessionPatch {
                    thinking_level: Some("xhigh".into()),
                    ..Default::default()
                },
                &models(),
                DEFAULT_MODEL,
            )
            .unwrap();
        assert_eq!(entry.thinking_level, Some(ThinkingLevel::Xhigh));
    }

    #[test]
    fn stored_xhigh_demotes_lazily() {
        let mut entry = SessionEntry::new();
        entry.thinking_level = Some(ThinkingLevel::Xhigh);
        let level =
            SessionStore::effective_thinking_level(&entry, &models(), DEFAULT_MODEL).unwrap();
        assert_eq!(level, ThinkingLevel::High);

        entry.provider_override = Some("openai".into());
        entry.model_override = Some("gpt-5".into());
        let level =
            SessionStore::effective_thinking_level(&entry, &models(), DEFAULT_MODEL).unwrap();
        assert_eq!(level, ThinkingLevel::Xhigh);
    }

    #[test]
    fn reset_keeps_overrides_and_removes_transcript() {
        let (dir, store) = store();
        let key = SessionKey::subagent("main", "r");
        let before = store.get_or_create(&key).unwrap();
        store
            .patch(
                &key,
                &SessionPatch {
                    model: Some(Some("openai/gpt-5".into())),
                    label: Some(Some("keepme".into())),
                    ..Default::default()
                },
                &models(),
                DEFAULT_MODEL,
            )
            .unwrap();
        transcript::append(
            &dir.path().join("sessions"),
            &before.session_id,
            &transcript::TranscriptLine {
                role: "user".into(),
                content: "hi".into(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
        )
        .unwrap();

        let after = store.reset(&key).unwrap();
        assert_ne!(after.session_id, before.session_id);
        assert_eq!(after.label.as_deref(), Some("keepme"));
        assert_eq!(after.model_override.as_deref(), Some("gpt-5"));
        assert!(after.input_tokens.is_none());
        assert!(!transcript::transcript_path(
            &dir.path().join("sessions"),
            &before.session_id
        )
        .exists());
    }

    #[tokio::test]
    async fn delete_refuses_main() {
        let (_dir, store) = store();
        let main = SessionKey::main("main");
        store.get_or_create(&main).unwrap();
        let err = store.delete(&main).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn delete_aborts_active_run_and_soft_deletes() {
        let (dir, store) = store();
        let key = SessionKey::subagent("main", "d");
        let entry = store.get_or_create(&key).unwrap();
        transcript::append(
            &dir.path().join("sessions"),
            &entry.session_id,
            &transcript::TranscriptLine {
                role: "assistant".into(),
                content: "working".into(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let guard = store.register_run(&key, cancel.clone());
        // simulated run: exits when cancelled, dropping the guard
        let handle = tokio::spawn(async move {
            cancel.cancelled().await;
            drop(guard);
        });

        store.delete(&key).await.unwrap();
        handle.await.unwrap();

        assert!(store.get(&key).is_none());
        let deleted: Vec<_> = std::fs::read_dir(dir.path().join("sessions"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".deleted."))
            .collect();
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0]
            .file_name()
            .to_string_lossy()
            .starts_with(&format!("sess-{}", entry.session_id)));
    }

    #[test]
    fn compact_increments_count() {
        let (dir, store) = store();
        let key = SessionKey::subagent("main", "c");
        let entry = store.get_or_create(&key).unwrap();
        for i in 0..6 {
            transcript::append(
                &dir.path().join("sessions"),
                &entry.session_id,
                &transcript::TranscriptLine {
                    role: "user".into(),
                    content: format!("m{i}"),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                },
            )
            .unwrap();
        }
        let after = store.compact(&key, 2).unwrap();
        assert_eq!(after.compaction_count, 1);
        let lines = transcript::tail(&dir.path().join("sessions"), &entry.session_id, 0).unwrap();
        assert_eq!(lines.len(), 2);
    }
}
