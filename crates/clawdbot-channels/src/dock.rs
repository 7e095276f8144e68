//! The channel dock table.
//!
//! A dock is the compact, side-effect-free contract the orchestrator and
//! the outbound pipeline consume for one channel: capabilities, chunk
//! limits, allow-list resolution, mention stripping, thread inheritance.
//! Heavy per-channel plugins (login wizards, status probes) are loaded on
//! demand by the RPCs that need them and never appear here.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;

use clawdbot_core::config::{ChannelEntryConfig, ChannelsConfig};

/// Thread inheritance for agent-sent replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyToMode {
    /// Never thread replies.
    Off,
    /// Thread only the first reply of a turn.
    First,
    /// Thread every reply.
    All,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChannelCapabilities {
    pub chat_types: &'static [&'static str],
    pub polls: bool,
    pub reactions: bool,
    pub threads: bool,
    pub native_commands: bool,
    pub media: bool,
    pub block_streaming: bool,
}

/// Per-dock defaults for the block-streaming `char_budget` break.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CoalesceDefaults {
    pub min_chars: usize,
    pub idle_ms: u64,
}

/// Per-turn threading context handed to channel tools.
#[derive(Debug, Clone)]
pub struct ThreadToolContext {
    pub current_channel_id: String,
    pub current_thread_ts: Option<String>,
    pub reply_to_mode: ReplyToMode,
    /// Set by the first threaded reply of the turn when the mode is
    /// `first`; owned by the turn, visible only to the channel tools.
    pub has_replied: Arc<AtomicBool>,
}

pub struct ChannelDock {
    pub id: &'static str,
    pub capabilities: ChannelCapabilities,
    pub text_chunk_limit: usize,
    pub coalesce: CoalesceDefaults,
    /// Regexes removed from the user-visible text after a mention match.
    pub mention_patterns: &'static [&'static str],
    pub reply_to_mode: ReplyToMode,
    /// Group messages need a bot mention unless config says otherwise.
    pub require_mention_default: bool,
    /// Elevated commands fall back to the channel allow-list when no
    /// elevated list is configured.
    pub elevated_allow_from_fallback: bool,
    /// Commands require the configured owner identity.
    pub enforce_owner_for_commands: bool,
}

impl ChannelDock {
    /// Allow-list for `(cfg, account_id)` — account-scoped list first,
    /// channel-wide list otherwise, normalized.
    pub fn resolve_allow_from(
        &self,
        cfg: &ChannelsConfig,
        account_id: Option<&str>,
    ) -> Vec<String> {
        let Some(entry) = cfg.entry(self.id) else {
            return Vec::new();
        };
        let raw = account_id
            .and_then(|id| entry.accounts.get(id))
            .map(|a| &a.allow_from)
            .filter(|l| !l.is_empty())
            .unwrap_or(&entry.allow_from);
        self.format_allow_from(raw)
    }

    /// Trim, lowercase, and drop empty allow-list entries.
    pub fn format_allow_from(&self, entries: &[String]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }

    /// Whether a group message must mention the bot to activate.
    pub fn resolve_require_mention(&self, entry: Option<&ChannelEntryConfig>) -> bool {
        entry
            .and_then(|e| e.require_mention)
            .unwrap_or(self.require_mention_default)
    }

    /// Strip bot mentions from the user's visible text.
    pub fn strip_mentions(&self, text: &str) -> String {
        let mut out = text.to_string();
        for re in compiled_patterns(self.id) {
            out = re.replace_all(&out, "").into_owned();
        }
        out.trim().to_string()
    }

    /// Threading context for this turn's channel tools.
    pub fn build_tool_context(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
    ) -> ThreadToolContext {
        ThreadToolContext {
            current_channel_id: channel_id.to_string(),
            current_thread_ts: thread_ts.map(String::from),
            reply_to_mode: self.reply_to_mode,
            has_replied: Arc::new(AtomicBool::new(false)),
        }
    }
}

static WHATSAPP: ChannelDock = ChannelDock {
    id: "whatsapp",
    capabilities: ChannelCapabilities {
        chat_types: &["direct", "group"],
        polls: true,
        reactions: true,
        threads: false,
        native_commands: false,
        media: true,
        block_streaming: true,
    },
    text_chunk_limit: 4000,
    coalesce: CoalesceDefaults {
        min_chars: 1500,
        idle_ms: 1000,
    },
    mention_patterns: &[r"@\d{6,}"],
    reply_to_mode: ReplyToMode::Off,
    require_mention_default: true,
    elevated_allow_from_fallback: true,
    enforce_owner_for_commands: true,
};

static TELEGRAM: ChannelDock = ChannelDock {
    id: "telegram",
    capabilities: ChannelCapabilities {
        chat_types: &["direct", "group"],
        polls: true,
        reactions: true,
        threads: true,
        native_commands: true,
        media: true,
        block_streaming: true,
    },
    // Telegram's hard limit is 4096; a small margin absorbs escaping.
    text_chunk_limit: 4090,
    coalesce: CoalesceDefaults {
        min_chars: 1500,
        idle_ms: 1000,
    },
    mention_patterns: &[r"@[A-Za-z0-9_]{3,}bot\b"],
    reply_to_mode: ReplyToMode::First,
    require_mention_default: true,
    elevated_allow_from_fallback: true,
    enforce_owner_for_commands: false,
};

static DISCORD: ChannelDock = ChannelDock {
    id: "discord",
    capabilities: ChannelCapabilities {
        chat_types: &["direct", "group", "thread"],
        polls: true,
        reactions: true,
        threads: true,
        native_commands: true,
        media: true,
        block_streaming: true,
    },
    text_chunk_limit: 2000,
    coalesce: CoalesceDefaults {
        min_chars: 1200,
        idle_ms: 1000,
    },
    mention_patterns: &[r"<@!?\d+>"],
    reply_to_mode: ReplyToMode::All,
    require_mention_default: true,
    elevated_allow_from_fallback: false,
    enforce_owner_for_commands: false,
};

static SLACK: ChannelDock = ChannelDock {
    id: "slack",
    capabilities: ChannelCapabilities {
        chat_types: &["direct", "group", "thread"],
        polls: false,
        reactions: true,
        threads: true,
        native_commands: true,
        media: true,
        block_streaming: true,
    },
    text_chunk_limit: 4000,
    coalesce: CoalesceDefaults {
        min_chars: 1500,
        idle_ms: 1000,
    },
    mention_patterns: &[r"<@[A-Z0-9]+>"],
    reply_to_mode: ReplyToMode::First,
    require_mention_default: true,
    elevated_allow_from_fallback: false,
    enforce_owner_for_commands: false,
};

static SIGNAL: ChannelDock = ChannelDock {
    id: "signal",
    capabilities: ChannelCapabilities {
        chat_types: &["direct", "group"],
        polls: false,
        reactions: true,
        threads: false,
        native_commands: false,
        media: true,
        block_streaming: false,
    },
    text_chunk_limit: 2000,
    coalesce: CoalesceDefaults {
        min_chars: 1500,
        idle_ms: 1000,
    },
    mention_patterns: &[],
    reply_to_mode: ReplyToMode::Off,
    require_mention_default: true,
    elevated_allow_from_fallback: true,
    enforce_owner_for_commands: true,
};

static IMESSAGE: ChannelDock = ChannelDock {
    id: "imessage",
    capabilities: ChannelCapabilities {
        chat_types: &["direct", "group"],
        polls: false,
        reactions: true,
        threads: false,
        native_commands: false,
        media: true,
        block_streaming: false,
    },
    text_chunk_limit: 4000,
    coalesce: CoalesceDefaults {
        min_chars: 1500,
        idle_ms: 1000,
    },
    mention_patterns: &[],
    reply_to_mode: ReplyToMode::Off,
    require_mention_default: true,
    elevated_allow_from_fallback: true,
    enforce_owner_for_commands: true,
};

static MSTEAMS: ChannelDock = ChannelDock {
    id: "msteams",
    capabilities: ChannelCapabilities {
        chat_types: &["direct", "group", "thread"],
        polls: false,
        reactions: true,
        threads: true,
        native_commands: false,
        media: true,
        block_streaming: false,
    },
    text_chunk_limit: 4000,
    coalesce: CoalesceDefaults {
        min_chars: 1500,
        idle_ms: 1000,
    },
    mention_patterns: &[r"<at>[^<]*</at>"],
    reply_to_mode: ReplyToMode::First,
    require_mention_default: true,
    elevated_allow_from_fallback: false,
    enforce_owner_for_commands: false,
};

static WEBCHAT: ChannelDock = ChannelDock {
    id: "webchat",
    capabilities: ChannelCapabilities {
        chat_types: &["direct"],
        polls: false,
        reactions: false,
        threads: false,
        native_commands: false,
        media: false,
        block_streaming: true,
    },
    text_chunk_limit: 16_000,
    coalesce: CoalesceDefaults {
        min_chars: 1500,
        idle_ms: 1000,
    },
    mention_patterns: &[],
    reply_to_mode: ReplyToMode::Off,
    require_mention_default: false,
    elevated_allow_from_fallback: false,
    enforce_owner_for_commands: false,
};

/// Every dock, in a stable order.
pub fn docks() -> &'static [&'static ChannelDock] {
    static DOCKS: &[&ChannelDock] = &[
        &WHATSAPP, &TELEGRAM, &DISCORD, &SLACK, &SIGNAL, &IMESSAGE, &MSTEAMS, &WEBCHAT,
    ];
    DOCKS
}

/// Dock lookup by channel id.
pub fn dock(channel: &str) -> Option<&'static ChannelDock> {
    docks().iter().find(|d| d.id == channel).copied()
}

/// Compiled mention regexes, keyed by dock id. Compiled once per process.
fn compiled_patterns(id: &str) -> &'static [Regex] {
    static CACHE: OnceLock<HashMap<&'static str, Vec<Regex>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| {
        docks()
            .iter()
            .map(|d| {
                let compiled = d
                    .mention_patterns
                    .iter()
                    .filter_map(|p| Regex::new(p).ok())
                    .collect();
                (d.id, compiled)
            })
            .collect()
    });
    cache.get(id).map(Vec::as_slice).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawdbot_core::config::AccountConfig;

    #[test]
    fn dock_lookup_covers_all_channels() {
        for id in [
            "whatsapp", "telegram", "discord", "slack", "signal", "imessage", "msteams", "webchat",
        ] {
            assert!(dock(id).is_some(), "missing dock for {id}");
        }
        assert!(dock("matrix").is_none());
    }

    #[test]
    fn allow_from_normalizes() {
        let d = dock("whatsapp").unwrap();
        let formatted =
            d.format_allow_from(&[" +1555 ".to_string(), "".to_string(), "ALICE@X".to_string()]);
        assert_eq!(formatted, vec!["+1555", "alice@x"]);
    }

    #[test]
    fn account_allow_list_overrides_channel_list() {
        let mut cfg = ChannelsConfig::default();
        cfg.whatsapp.allow_from = vec!["+1111".into()];
        cfg.whatsapp.accounts.insert(
            "work".into(),
            AccountConfig {
                allow_from: vec!["+2222".into()],
            },
        );
        let d = dock("whatsapp").unwrap();
        assert_eq!(d.resolve_allow_from(&cfg, None), vec!["+1111"]);
        assert_eq!(d.resolve_allow_from(&cfg, Some("work")), vec!["+2222"]);
        // unknown account falls back to the channel-wide list
        assert_eq!(d.resolve_allow_from(&cfg, Some("other")), vec!["+1111"]);
    }

    #[test]
    fn discord_mentions_are_stripped() {
        let d = dock("discord").unwrap();
        assert_eq!(d.strip_mentions("<@123456> hello <@!98765>"), "hello");
    }

    #[test]
    fn require_mention_defaults_and_overrides() {
        let d = dock("telegram").unwrap();
        assert!(d.resolve_require_mention(None));
        let mut entry = ChannelEntryConfig::default();
        entry.require_mention = Some(false);
        assert!(!d.resolve_require_mention(Some(&entry)));
    }

    #[test]
    fn tool_context_starts_unreplied() {
        let d = dock("slack").unwrap();
        let ctx = d.build_tool_context("C123", Some("169.42"));
        assert_eq!(ctx.reply_to_mode, ReplyToMode::First);
        assert!(!ctx.has_replied.load(std::sync::atomic::Ordering::Relaxed));
        assert_eq!(ctx.current_thread_ts.as_deref(), Some("169.42"));
    }
}
