//! Streaming access token decoding.
//!
//! The token is a JWT. Only the payload segment is decoded: the signature
//! is verified by the streaming service, not by the client.

use crate::error::{ProtocolError, ProtocolResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Capability marking a channel whose publisher presence must be tracked.
pub const PUBLISHERS_CHANNEL_METADATA: &str = "channel-metadata:publishers";

/// Prefix that subscribes a channel to occupancy events instead of content.
pub const OCCUPANCY_CHANNEL_PREFIX: &str = "[?occupancy=metrics.publishers]";

/// Returns the channel name with the occupancy prefix removed.
pub fn strip_occupancy_prefix(channel: &str) -> &str {
    channel
        .strip_prefix(OCCUPANCY_CHANNEL_PREFIX)
        .unwrap_or(channel)
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(rename = "x-ably-capability")]
    capability: Option<String>,
    iat: Option<u64>,
    exp: Option<u64>,
}

/// A decoded streaming access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    issued_at: u64,
    expiration: u64,
    channels: Vec<String>,
    raw: String,
}

impl AccessToken {
    /// Decodes a raw JWT.
    ///
    /// Fails when the token has no payload segment, the payload is not
    /// base64url JSON, the capability map is missing or empty, or the
    /// expiration is not after the issue time.
    pub fn parse(raw: &str) -> ProtocolResult<Self> {
        let encoded = raw
            .split('.')
            .nth(1)
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| ProtocolError::invalid_token("missing payload segment"))?;

        let payload = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| ProtocolError::invalid_token(format!("payload is not base64url: {e}")))?;

        let claims: TokenClaims = serde_json::from_slice(&payload)
            .map_err(|e| ProtocolError::malformed_json("token payload", e))?;

        let capability = claims
            .capability
            .ok_or_else(|| ProtocolError::invalid_token("missing channel capability"))?;
        let capabilities: BTreeMap<String, Vec<String>> = serde_json::from_str(&capability)
            .map_err(|e| ProtocolError::malformed_json("token capability", e))?;

        if capabilities.is_empty() {
            return Err(ProtocolError::invalid_token("token grants no channels"));
        }

        let issued_at = claims
            .iat
            .ok_or_else(|| ProtocolError::invalid_token("missing iat"))?;
        let expiration = claims
            .exp
            .ok_or_else(|| ProtocolError::invalid_token("missing exp"))?;
        if expiration <= issued_at {
            return Err(ProtocolError::invalid_token(format!(
                "expiration {expiration} is not after issue time {issued_at}"
            )));
        }

        let channels = capabilities
            .into_iter()
            .map(|(channel, caps)| {
                if caps.iter().any(|c| c == PUBLISHERS_CHANNEL_METADATA) {
                    format!("{OCCUPANCY_CHANNEL_PREFIX}{channel}")
                } else {
                    channel
                }
            })
            .collect();

        Ok(Self {
            issued_at,
            expiration,
            channels,
            raw: raw.to_string(),
        })
    }

    /// Issue time, in seconds since the Unix epoch.
    pub fn issued_at(&self) -> u64 {
        self.issued_at
    }

    /// Expiration time, in seconds since the Unix epoch.
    pub fn expiration(&self) -> u64 {
        self.expiration
    }

    /// Channels to subscribe, occupancy channels already prefixed.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// The raw token string, as sent to the streaming service.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Lifetime of the token.
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.expiration - self.issued_at)
    }

    /// Delay after which the token should be refreshed, `margin` before expiry.
    pub fn refresh_delay(&self, margin: Duration) -> Duration {
        self.lifetime().saturating_sub(margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(payload: &str) -> String {
        format!(
            "eyJhbGciOiJIUzI1NiJ9.{}.c2lnbmF0dXJl",
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    fn claims(capability: &str, iat: u64, exp: u64) -> String {
        serde_json::json!({
            "x-ably-capability": capability,
            "x-ably-clientId": "clientId",
            "iat": iat,
            "exp": exp,
        })
        .to_string()
    }

    #[test]
    fn parses_channels_and_times() {
        let capability = r#"{"abc_splits":["subscribe"],"abc_key_mySegments":["subscribe"],"control_pri":["subscribe","channel-metadata:publishers"]}"#;
        let raw = encode(&claims(capability, 1000, 4600));

        let token = AccessToken::parse(&raw).unwrap();
        assert_eq!(token.issued_at(), 1000);
        assert_eq!(token.expiration(), 4600);
        assert_eq!(token.raw(), raw);
        assert_eq!(
            token.channels(),
            &[
                "abc_key_mySegments".to_string(),
                "abc_splits".to_string(),
                "[?occupancy=metrics.publishers]control_pri".to_string(),
            ]
        );
    }

    #[test]
    fn refresh_delay_subtracts_margin() {
        let raw = encode(&claims(r#"{"c":["subscribe"]}"#, 0, 3600));
        let token = AccessToken::parse(&raw).unwrap();
        assert_eq!(token.lifetime(), Duration::from_secs(3600));
        assert_eq!(
            token.refresh_delay(Duration::from_secs(600)),
            Duration::from_secs(3000)
        );
        assert_eq!(token.refresh_delay(Duration::from_secs(7200)), Duration::ZERO);
    }

    #[test]
    fn accepts_padded_payload() {
        let payload = claims(r#"{"c":["subscribe"]}"#, 1, 2);
        let padded = base64::engine::general_purpose::URL_SAFE.encode(&payload);
        let raw = format!("h.{padded}.s");
        assert!(AccessToken::parse(&raw).is_ok());
    }

    #[test]
    fn rejects_token_without_payload_segment() {
        assert!(matches!(
            AccessToken::parse("onlyheader"),
            Err(ProtocolError::InvalidToken { .. })
        ));
        assert!(AccessToken::parse("header..sig").is_err());
    }

    #[test]
    fn rejects_bad_base64() {
        assert!(matches!(
            AccessToken::parse("h.%%%.s"),
            Err(ProtocolError::InvalidToken { .. })
        ));
    }

    #[test]
    fn rejects_non_json_payload() {
        let raw = format!("h.{}.s", URL_SAFE_NO_PAD.encode("not json"));
        assert!(matches!(
            AccessToken::parse(&raw),
            Err(ProtocolError::MalformedJson { .. })
        ));
    }

    #[test]
    fn rejects_missing_or_empty_channels() {
        let raw = encode(r#"{"iat":1,"exp":2}"#);
        assert!(AccessToken::parse(&raw).is_err());

        let raw = encode(&claims("{}", 1, 2));
        assert!(AccessToken::parse(&raw).is_err());

        let raw = encode(&claims("[1,2]", 1, 2));
        assert!(AccessToken::parse(&raw).is_err());
    }

    #[test]
    fn rejects_expiration_not_after_issue() {
        let raw = encode(&claims(r#"{"c":["subscribe"]}"#, 10, 10));
        assert!(AccessToken::parse(&raw).is_err());
    }

    #[test]
    fn strips_occupancy_prefix() {
        assert_eq!(
            strip_occupancy_prefix("[?occupancy=metrics.publishers]control_pri"),
            "control_pri"
        );
        assert_eq!(strip_occupancy_prefix("abc_splits"), "abc_splits");
    }
}
