//! # flagsync testkit
//!
//! Test utilities for the flagsync engine.
//!
//! This crate provides:
//! - A scripted in-memory HTTP client with feedable event streams
//! - Access token, response body and event-stream fixtures
//! - A recording outbound flusher
//! - Tracing setup and polling helpers for async tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use flagsync_testkit::prelude::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn streams_flag_updates() {
//!     let http = Arc::new(FakeHttpClient::new());
//!     http.respond_ok(AUTH_PATH, auth_body(&standard_token()));
//!     let stream = http.open_stream();
//!     // ... start a manager, then
//!     stream.send_block(flags_update(1000));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod http;

use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::http::*;
    pub use crate::{eventually, init_tracing};
}

pub use fixtures::*;
pub use http::*;

static TRACING: Once = Once::new();

/// Installs a test-writer subscriber once per process, honoring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Polls `condition` every 10ms of (tokio) time until it holds or
/// `within` elapses. Returns whether it held.
pub async fn eventually<F>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    loop {
        if condition() {
            return true;
        }
        if waited >= within {
            return false;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
}
