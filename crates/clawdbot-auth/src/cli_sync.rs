//! Synchronize credentials from external CLI installs.
//!
//! The Claude CLI keeps an OAuth pair in `~/.claude/.credentials.json`, the
//! Codex CLI in `~/.codex/auth.json`. On every store load we synthesize the
//! special profiles `anthropic:claude-cli` and `openai-codex:codex-cli`
//! from those files. I/O or parse failures skip the sync for that cycle.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::profile::{Credential, CredentialProfile};
use crate::store::StoreData;

pub const CLAUDE_CLI_PROFILE: &str = "anthropic:claude-cli";
pub const CODEX_CLI_PROFILE: &str = "openai-codex:codex-cli";

#[derive(Debug, Deserialize)]
struct ClaudeCredentialsFile {
    #[serde(rename = "claudeAiOauth")]
    claude_ai_oauth: Option<ClaudeOauth>,
}

#[derive(Debug, Deserialize)]
struct ClaudeOauth {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(rename = "expiresAt")]
    expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CodexAuthFile {
    tokens: Option<CodexTokens>,
}

#[derive(Debug, Deserialize)]
struct CodexTokens {
    access_token: String,
    refresh_token: Option<String>,
}

/// Sync both CLI credential files into `data`. Returns true when the store
/// changed and needs persisting.
pub fn sync_cli_credentials(data: &mut StoreData, home: &Path) -> bool {
    let mut changed = false;

    match read_claude_cli(home) {
        Ok(Some(candidate)) => {
            changed |= merge_cli_profile(data, CLAUDE_CLI_PROFILE, candidate);
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "claude CLI credential sync skipped"),
    }

    match read_codex_cli(home) {
        Ok(Some(candidate)) => {
            changed |= merge_cli_profile(data, CODEX_CLI_PROFILE, candidate);
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "codex CLI credential sync skipped"),
    }

    changed
}

fn read_claude_cli(home: &Path) -> std::io::Result<Option<CredentialProfile>> {
    let path = home.join(".claude").join(".credentials.json");
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    let file: ClaudeCredentialsFile = match serde_json::from_str(&text) {
        Ok(f) => f,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "unparseable claude credentials");
            return Ok(None);
        }
    };
    Ok(file.claude_ai_oauth.map(|oauth| CredentialProfile {
        provider: "anthropic".to_string(),
        credential: Credential::OAuth {
            access: oauth.access_token,
            refresh: oauth.refresh_token,
            expires: oauth.expires_at,
        },
    }))
}

fn read_codex_cli(home: &Path) -> std::io::Result<Option<CredentialProfile>> {
    let path = home.join(".codex").join("auth.json");
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    let file: CodexAuthFile = match serde_json::from_str(&text) {
        Ok(f) => f,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "unparseable codex credentials");
            return Ok(None);
        }
    };
    Ok(file.tokens.map(|tokens| CredentialProfile {
        provider: "openai-codex".to_string(),
        credential: Credential::OAuth {
            access: tokens.access_token,
            refresh: tokens.refresh_token,
            expires: None,
        },
    }))
}

/// Apply the sync preference rules for a single CLI profile slot.
///
/// OAuth beats token regardless of absolute expiry (OAuth refreshes); a
/// store-held OAuth is never replaced by an older CLI OAuth; profiles
/// outside the CLI ids are never touched (the caller only passes CLI ids).
fn merge_cli_profile(data: &mut StoreData, id: &str, candidate: CredentialProfile) -> bool {
    let Some(existing) = data.profiles.get(id) else {
        data.profiles.insert(id.to_string(), candidate);
        return true;
    };

    let replace = match (&existing.credential, &candidate.credential) {
        (Credential::OAuth { expires: have, .. }, Credential::OAuth { expires: new, .. }) => {
            // Refuse to regress to an older CLI OAuth pair.
            match (have, new) {
                (Some(have), Some(new)) => new >= have,
                (Some(_), None) => false,
                _ => true,
            }
        }
        // Never downgrade an OAuth pair to a bare token.
        (Credential::OAuth { .. }, _) => false,
        // Anything else upgrades to OAuth.
        (_, Credential::OAuth { .. }) => true,
        (Credential::Token { expires: have, .. }, Credential::Token { expires: new, .. }) => {
            match (have, new) {
                (Some(have), Some(new)) => new > have,
                (Some(_), None) => false,
                _ => true,
            }
        }
        _ => true,
    };

    if replace && *existing != candidate {
        data.profiles.insert(id.to_string(), candidate);
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn oauth(expires: Option<i64>) -> CredentialProfile {
        CredentialProfile {
            provider: "anthropic".into(),
            credential: Credential::OAuth {
                access: "cli-access".into(),
                refresh: Some("cli-refresh".into()),
                expires,
            },
        }
    }

    #[test]
    fn cli_oauth_replaces_stored_token_even_with_later_expiry() {
        let mut data = StoreData::default();
        data.profiles.insert(
            CLAUDE_CLI_PROFILE.into(),
            CredentialProfile {
                provider: "anthropic".into(),
                credential: Credential::Token {
                    token: "t".into(),
                    // token outlives the OAuth pair, but OAuth still wins
                    expires: Some(60 * 60_000),
                },
            },
        );
        assert!(merge_cli_profile(
            &mut data,
            CLAUDE_CLI_PROFILE,
            oauth(Some(30 * 60_000))
        ));
        assert!(data.profiles[CLAUDE_CLI_PROFILE].credential.is_oauth());
    }

    #[test]
    fn never_downgrade_oauth_to_token() {
        let mut data = StoreData::default();
        data.profiles
            .insert(CLAUDE_CLI_PROFILE.into(), oauth(Some(1_000)));
        let token = CredentialProfile {
            provider: "anthropic".into(),
            credential: Credential::Token {
                token: "t".into(),
                expires: Some(999_999),
            },
        };
        assert!(!merge_cli_profile(&mut data, CLAUDE_CLI_PROFILE, token));
        assert!(data.profiles[CLAUDE_CLI_PROFILE].credential.is_oauth());
    }

    #[test]
    fn older_cli_oauth_does_not_overwrite() {
        let mut data = StoreData::default();
        data.profiles
            .insert(CLAUDE_CLI_PROFILE.into(), oauth(Some(2_000)));
        assert!(!merge_cli_profile(
            &mut data,
            CLAUDE_CLI_PROFILE,
            oauth(Some(1_000))
        ));
        assert_eq!(
            data.profiles[CLAUDE_CLI_PROFILE].credential.expires(),
            Some(2_000)
        );

        // a newer pair does land
        assert!(merge_cli_profile(
            &mut data,
            CLAUDE_CLI_PROFILE,
            oauth(Some(3_000))
        ));
    }

    #[test]
    fn sync_reads_cli_files_from_home() {
        let home = tempfile::tempdir().unwrap();
        fs::create_dir_all(home.path().join(".claude")).unwrap();
        fs::write(
            home.path().join(".claude/.credentials.json"),
            r#"{"claudeAiOauth":{"accessToken":"A","refreshToken":"R","expiresAt":123}}"#,
        )
        .unwrap();
        fs::create_dir_all(home.path().join(".codex")).unwrap();
        fs::write(
            home.path().join(".codex/auth.json"),
            r#"{"tokens":{"access_token":"CA","refresh_token":"CR"}}"#,
        )
        .unwrap();

        let mut data = StoreData::default();
        assert!(sync_cli_credentials(&mut data, home.path()));
        assert!(data.profiles.contains_key(CLAUDE_CLI_PROFILE));
        assert!(data.profiles.contains_key(CODEX_CLI_PROFILE));
        assert_eq!(
            data.profiles[CLAUDE_CLI_PROFILE].credential.expires(),
            Some(123)
        );
    }

    #[test]
    fn malformed_cli_file_is_skipped() {
        let home = tempfile::tempdir().unwrap();
        fs::create_dir_all(home.path().join(".claude")).unwrap();
        fs::write(home.path().join(".claude/.credentials.json"), "not json").unwrap();

        let mut data = StoreData::default();
        assert!(!sync_cli_credentials(&mut data, home.path()));
        assert!(data.profiles.is_empty());
    }
}
