use serde::{Deserialize, Serialize};

/// One authentication artifact for a provider.
///
/// The `type` tag is stored on disk; pattern matching replaces the ad-hoc
/// string checks the profiles would otherwise need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    ApiKey {
        key: String,
    },
    Token {
        token: String,
        /// Epoch millis. Expired tokens are dead — there is no refresh path.
        #[serde(skip_serializing_if = "Option::is_none")]
        expires: Option<i64>,
    },
    #[serde(rename = "oauth")]
    OAuth {
        access: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        refresh: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires: Option<i64>,
    },
}

impl Credential {
    /// A credential is dead when it can never authenticate again:
    /// blank secrets, or an expired token/OAuth with no refresh token.
    pub fn is_dead(&self, now_ms: i64) -> bool {
        match self {
            Credential::ApiKey { key } => key.trim().is_empty(),
            Credential::Token { token, expires } => {
                token.trim().is_empty() || expires.is_some_and(|e| e <= now_ms)
            }
            Credential::OAuth {
                access,
                refresh,
                expires,
            } => {
                if access.trim().is_empty() && refresh.as_deref().map_or(true, |r| r.trim().is_empty()) {
                    return true;
                }
                match (expires, refresh) {
                    // An expired OAuth pair with a refresh token survives —
                    // the runtime refreshes it on first use.
                    (Some(e), None) => *e <= now_ms,
                    _ => false,
                }
            }
        }
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self, Credential::OAuth { .. })
    }

    /// Expiry in epoch millis, when the variant carries one.
    pub fn expires(&self) -> Option<i64> {
        match self {
            Credential::ApiKey { .. } => None,
            Credential::Token { expires, .. } | Credential::OAuth { expires, .. } => *expires,
        }
    }
}

/// A stored credential profile, addressed as `<provider>:<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialProfile {
    /// Lowercase-normalized provider id; always equals the id prefix.
    pub provider: String,
    #[serde(flatten)]
    pub credential: Credential,
}

/// Lowercase a provider id and fold known aliases onto their canonical name.
pub fn normalize_provider(provider: &str) -> String {
    let lower = provider.trim().to_ascii_lowercase();
    match lower.as_str() {
        "z.ai" | "z-ai" => "zai".to_string(),
        "codex" => "openai-codex".to_string(),
        _ => lower,
    }
}

/// Split a profile id `<provider>:<name>` into normalized parts.
pub fn split_profile_id(id: &str) -> Option<(String, String)> {
    let (provider, name) = id.split_once(':')?;
    if provider.is_empty() || name.is_empty() {
        return None;
    }
    Some((normalize_provider(provider), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_normalize() {
        assert_eq!(normalize_provider("OpenAI"), "openai");
        assert_eq!(normalize_provider("z.ai"), "zai");
        assert_eq!(normalize_provider("Anthropic"), "anthropic");
    }

    #[test]
    fn expired_token_is_dead() {
        let cred = Credential::Token {
            token: "t".into(),
            expires: Some(1_000),
        };
        assert!(cred.is_dead(2_000));
        assert!(!cred.is_dead(500));
    }

    #[test]
    fn expired_oauth_with_refresh_survives() {
        let cred = Credential::OAuth {
            access: "a".into(),
            refresh: Some("r".into()),
            expires: Some(1_000),
        };
        assert!(!cred.is_dead(2_000));

        let without_refresh = Credential::OAuth {
            access: "a".into(),
            refresh: None,
            expires: Some(1_000),
        };
        assert!(without_refresh.is_dead(2_000));
    }

    #[test]
    fn blank_key_is_dead() {
        assert!(Credential::ApiKey { key: "  ".into() }.is_dead(0));
        assert!(!Credential::ApiKey { key: "sk-1".into() }.is_dead(0));
    }
}
