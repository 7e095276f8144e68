//! Connection authentication, resolved before the WebSocket upgrade.
//!
//! Token or password arrive as `Authorization: Bearer <t>`, a `?token=`
//! query parameter, or a `Sec-WebSocket-Protocol` entry of the form
//! `token.<t>`. Comparison is constant-time (SHA-256 digests of both
//! sides; equal-length array compare leaks nothing about the secret).

use std::net::IpAddr;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use tracing::warn;

use clawdbot_core::config::{GatewayAuthConfig, GatewayAuthMode};

/// Validate the listener configuration at startup. Loopback binds may run
/// without auth; anything else must carry a secret.
pub fn validate_bind_policy(bind: &str, auth: &GatewayAuthConfig) -> Result<(), String> {
    let loopback = bind
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false);
    match auth.mode {
        GatewayAuthMode::Off if !loopback => Err(format!(
            "gateway.auth.mode=off requires a loopback bind, got {bind}"
        )),
        GatewayAuthMode::Token if auth.token.as_deref().unwrap_or("").trim().is_empty() => {
            Err("gateway.auth.mode=token requires gateway.auth.token".to_string())
        }
        GatewayAuthMode::Password
            if auth.password.as_deref().unwrap_or("").trim().is_empty() =>
        {
            Err("gateway.auth.mode=password requires gateway.auth.password".to_string())
        }
        _ => Ok(()),
    }
}

/// Extract the presented secret from headers, query string, or WS
/// subprotocol list, in that order.
pub fn presented_secret(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                return Some(token.to_string());
            }
        }
    }
    if let Some(protocols) = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
    {
        for proto in protocols.split(',') {
            if let Some(token) = proto.trim().strip_prefix("token.") {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Authorize a connection attempt against the configured mode.
pub fn authorize(auth: &GatewayAuthConfig, presented: Option<&str>) -> Result<(), String> {
    let expected = match auth.mode {
        GatewayAuthMode::Off => return Ok(()),
        GatewayAuthMode::Token => auth.token.as_deref(),
        GatewayAuthMode::Password => auth.password.as_deref(),
    };
    let Some(expected) = expected else {
        warn!("auth mode requires a secret but none is configured");
        return Err("gateway secret not configured".to_string());
    };
    let Some(presented) = presented else {
        return Err("missing credentials".to_string());
    };
    if constant_time_eq(expected, presented) {
        Ok(())
    } else {
        Err("invalid credentials".to_string())
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn token_config(token: &str) -> GatewayAuthConfig {
        GatewayAuthConfig {
            mode: GatewayAuthMode::Token,
            token: Some(token.to_string()),
            password: None,
        }
    }

    #[test]
    fn off_mode_requires_loopback() {
        let auth = GatewayAuthConfig {
            mode: GatewayAuthMode::Off,
            token: None,
            password: None,
        };
        assert!(validate_bind_policy("127.0.0.1", &auth).is_ok());
        assert!(validate_bind_policy("::1", &auth).is_ok());
        assert!(validate_bind_policy("0.0.0.0", &auth).is_err());
    }

    #[test]
    fn token_mode_requires_token_configured() {
        let auth = GatewayAuthConfig {
            mode: GatewayAuthMode::Token,
            token: None,
            password: None,
        };
        assert!(validate_bind_policy("127.0.0.1", &auth).is_err());
        assert!(validate_bind_policy("0.0.0.0", &token_config("s3cret")).is_ok());
    }

    #[test]
    fn bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        let secret = presented_secret(&headers, Some("token=def"));
        assert_eq!(secret.as_deref(), Some("abc"));
    }

    #[test]
    fn query_and_subprotocol_fallbacks() {
        let headers = HeaderMap::new();
        assert_eq!(
            presented_secret(&headers, Some("x=1&token=fromquery")).as_deref(),
            Some("fromquery")
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            "sec-websocket-protocol",
            HeaderValue::from_static("clawdbot, token.fromproto"),
        );
        assert_eq!(
            presented_secret(&headers, None).as_deref(),
            Some("fromproto")
        );
    }

    #[test]
    fn authorize_accepts_exact_token_only() {
        let auth = token_config("s3cret");
        assert!(authorize(&auth, Some("s3cret")).is_ok());
        assert!(authorize(&auth, Some("s3cret ")).is_err());
        assert!(authorize(&auth, Some("wrong")).is_err());
        assert!(authorize(&auth, None).is_err());
    }

    #[test]
    fn off_mode_accepts_anything() {
        let auth = GatewayAuthConfig {
            mode: GatewayAuthMode::Off,
            token: None,
            password: None,
        };
        assert!(authorize(&auth, None).is_ok());
    }
}
