//! Wire fixtures.
//!
//! Endpoint paths, access tokens, response bodies and event-stream blocks
//! as the flagsync backend produces them.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use flagsync_engine::protocol::{OCCUPANCY_CHANNEL_PREFIX, PUBLISHERS_CHANNEL_METADATA};
use flagsync_engine::{OutboundFlusher, SyncConfig, SyncResult};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// SDK endpoint used by test configurations.
pub const TEST_SDK_URL: &str = "https://sdk.flagsync.test/api";
/// Auth endpoint used by test configurations.
pub const TEST_AUTH_URL: &str = "https://auth.flagsync.test/api";
/// Streaming endpoint used by test configurations.
pub const TEST_STREAMING_URL: &str = "https://streaming.flagsync.test/sse";

/// Path of the auth endpoint.
pub const AUTH_PATH: &str = "/api/auth";
/// Path of the flags endpoint.
pub const FLAGS_PATH: &str = "/api/splitChanges";
/// Path of the streaming endpoint.
pub const STREAMING_PATH: &str = "/sse";

/// Flags channel granted by [`standard_token`].
pub const FLAGS_CHANNEL: &str = "NzM2MDI5Mzc0_MTgyNTg1MTgwNg==_splits";
/// Segments channel granted by [`standard_token`].
pub const SEGMENTS_CHANNEL: &str = "NzM2MDI5Mzc0_MTgyNTg1MTgwNg==_MTExMzgwNjgx_mySegments";
/// Primary control channel.
pub const CONTROL_PRI: &str = "control_pri";
/// Secondary control channel.
pub const CONTROL_SEC: &str = "control_sec";

/// Issue time of tokens built without an explicit one.
pub const TOKEN_ISSUED_AT: u64 = 1_700_000_000;
/// Lifetime of tokens built without an explicit one.
pub const TOKEN_LIFETIME_SECS: u64 = 3600;

/// Path of the segments endpoint for `key`.
pub fn segments_path(key: &str) -> String {
    format!("/api/mySegments/{key}")
}

/// A configuration pointing at the test endpoints.
pub fn test_config(user_key: &str) -> SyncConfig {
    SyncConfig::new(user_key).with_endpoints(TEST_SDK_URL, TEST_AUTH_URL, TEST_STREAMING_URL)
}

/// Builds signed-looking access tokens.
#[derive(Debug, Clone)]
pub struct TokenBuilder {
    capabilities: BTreeMap<String, Vec<String>>,
    issued_at: u64,
    expiration: u64,
}

impl Default for TokenBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenBuilder {
    /// A token with no channels and the default lifetime.
    pub fn new() -> Self {
        Self {
            capabilities: BTreeMap::new(),
            issued_at: TOKEN_ISSUED_AT,
            expiration: TOKEN_ISSUED_AT + TOKEN_LIFETIME_SECS,
        }
    }

    /// Grants a subscribe-only channel.
    pub fn channel(mut self, name: &str) -> Self {
        self.capabilities
            .insert(name.to_string(), vec!["subscribe".to_string()]);
        self
    }

    /// Grants a channel that also reports publisher occupancy.
    pub fn occupancy_channel(mut self, name: &str) -> Self {
        self.capabilities.insert(
            name.to_string(),
            vec![
                "subscribe".to_string(),
                PUBLISHERS_CHANNEL_METADATA.to_string(),
            ],
        );
        self
    }

    /// Sets the lifetime in seconds.
    pub fn lifetime(mut self, seconds: u64) -> Self {
        self.expiration = self.issued_at + seconds;
        self
    }

    /// Encodes the token.
    pub fn build(&self) -> String {
        let capability = serde_json::to_string(&self.capabilities).unwrap_or_default();
        let header = json!({"alg": "HS256", "typ": "JWT"});
        let claims = json!({
            "iat": self.issued_at,
            "exp": self.expiration,
            "x-ably-capability": capability,
        });
        format!(
            "{}.{}.c2lnbmF0dXJl",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        )
    }
}

/// A token for the flags, segments and both control channels.
pub fn standard_token() -> String {
    TokenBuilder::new()
        .channel(FLAGS_CHANNEL)
        .channel(SEGMENTS_CHANNEL)
        .occupancy_channel(CONTROL_PRI)
        .occupancy_channel(CONTROL_SEC)
        .build()
}

/// Auth response granting `token`.
pub fn auth_body(token: &str) -> String {
    json!({"pushEnabled": true, "token": token}).to_string()
}

/// Auth response with streaming disabled.
pub fn auth_disabled_body() -> String {
    json!({"pushEnabled": false}).to_string()
}

/// Flags response moving from `since` to `till` with active flags `names`.
pub fn flag_changes_body(since: i64, till: i64, names: &[&str]) -> String {
    let splits: Vec<Value> = names
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "changeNumber": till,
                "status": "ACTIVE",
                "killed": false,
                "defaultTreatment": "off",
                "trafficTypeName": "user",
                "conditions": [],
            })
        })
        .collect();
    json!({"since": since, "till": till, "splits": splits}).to_string()
}

/// Segments response listing `names`.
pub fn segments_body(names: &[&str]) -> String {
    let segments: Vec<Value> = names.iter().map(|name| json!({"name": name})).collect();
    json!({"mySegments": segments}).to_string()
}

static MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Lines of a message block publishing `data` on `channel`.
pub fn message_block(channel: &str, name: Option<&str>, data: &Value) -> Vec<String> {
    let id = MESSAGE_ID.fetch_add(1, Ordering::Relaxed);
    let mut envelope = json!({
        "id": format!("msg-{id}"),
        "clientId": "flagsync-test",
        "timestamp": 1_700_000_000_000u64 + id,
        "encoding": "json",
        "channel": channel,
        "data": data.to_string(),
    });
    if let (Some(name), Some(object)) = (name, envelope.as_object_mut()) {
        object.insert("name".to_string(), Value::from(name));
    }
    vec![
        format!("id:msg-{id}"),
        "event:message".to_string(),
        format!("data:{envelope}"),
    ]
}

/// A flags change notification.
pub fn flags_update(change_number: i64) -> Vec<String> {
    message_block(
        FLAGS_CHANNEL,
        None,
        &json!({"type": "SPLIT_UPDATE", "changeNumber": change_number}),
    )
}

/// A flag kill notification.
pub fn flag_kill(change_number: i64, flag: &str, default_treatment: &str) -> Vec<String> {
    message_block(
        FLAGS_CHANNEL,
        None,
        &json!({
            "type": "SPLIT_KILL",
            "changeNumber": change_number,
            "splitName": flag,
            "defaultTreatment": default_treatment,
        }),
    )
}

/// A segments notification, with the new membership inline when given.
pub fn segments_update(change_number: i64, segments: Option<&[&str]>) -> Vec<String> {
    let mut data = json!({"type": "MY_SEGMENTS_UPDATE", "changeNumber": change_number});
    if let (Some(segments), Some(object)) = (segments, data.as_object_mut()) {
        object.insert("includesPayload".to_string(), Value::from(true));
        object.insert("segmentList".to_string(), json!(segments));
    }
    message_block(SEGMENTS_CHANNEL, None, &data)
}

/// A control message such as `STREAMING_PAUSED`.
pub fn control(control_type: &str) -> Vec<String> {
    message_block(
        &format!("{OCCUPANCY_CHANNEL_PREFIX}{CONTROL_PRI}"),
        None,
        &json!({"type": "CONTROL", "controlType": control_type}),
    )
}

/// An occupancy update for a control channel.
pub fn occupancy(channel: &str, publishers: u32) -> Vec<String> {
    message_block(
        &format!("{OCCUPANCY_CHANNEL_PREFIX}{channel}"),
        Some("[meta]occupancy"),
        &json!({"metrics": {"publishers": publishers}}),
    )
}

/// A streaming error event.
pub fn error_event(code: u32, status_code: u16, message: &str) -> Vec<String> {
    let data = json!({"code": code, "statusCode": status_code, "message": message});
    vec!["event:error".to_string(), format!("data:{data}")]
}

/// Counts flushes.
#[derive(Debug, Default)]
pub struct RecordingFlusher {
    flushes: AtomicUsize,
}

impl RecordingFlusher {
    /// Creates a flusher with no recorded flushes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flushes so far.
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl OutboundFlusher for RecordingFlusher {
    async fn flush(&self) -> SyncResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
