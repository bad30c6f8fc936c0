//! CLI command implementations.

pub mod decode_token;
pub mod replay;
