//! Decode-token command implementation.

use flagsync_protocol::{strip_occupancy_prefix, AccessToken, ChannelKind, OCCUPANCY_CHANNEL_PREFIX};
use serde::Serialize;

/// Decoded token.
#[derive(Debug, Serialize)]
pub struct TokenReport {
    /// Issue time, seconds since the Unix epoch.
    pub issued_at: u64,
    /// Expiration time, seconds since the Unix epoch.
    pub expiration: u64,
    /// Lifetime in seconds.
    pub lifetime_secs: u64,
    /// Granted channels.
    pub channels: Vec<ChannelReport>,
}

/// One granted channel.
#[derive(Debug, Serialize)]
pub struct ChannelReport {
    /// Channel name without the occupancy prefix.
    pub name: String,
    /// Whether publisher occupancy is reported on it.
    pub occupancy: bool,
    /// Consumer the channel feeds, if recognized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<&'static str>,
}

fn route_name(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Flags => "flags",
        ChannelKind::Segments => "segments",
        ChannelKind::Control => "control",
    }
}

/// Decodes `raw` into a report.
pub fn decode(raw: &str) -> Result<TokenReport, Box<dyn std::error::Error>> {
    let token = AccessToken::parse(raw.trim())?;
    let channels = token
        .channels()
        .iter()
        .map(|channel| ChannelReport {
            name: strip_occupancy_prefix(channel).to_string(),
            occupancy: channel.starts_with(OCCUPANCY_CHANNEL_PREFIX),
            route: ChannelKind::of(channel).map(route_name),
        })
        .collect();

    Ok(TokenReport {
        issued_at: token.issued_at(),
        expiration: token.expiration(),
        lifetime_secs: token.lifetime().as_secs(),
        channels,
    })
}

/// Runs the decode-token command.
pub fn run(raw: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = decode(raw)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!("Issued at:   {}", report.issued_at);
            println!("Expires at:  {}", report.expiration);
            println!("Lifetime:    {}s", report.lifetime_secs);
            println!("Channels:    {}", report.channels.len());
            for channel in &report.channels {
                println!(
                    "  {:<60} {:<9} {}",
                    channel.name,
                    channel.route.unwrap_or("-"),
                    if channel.occupancy { "occupancy" } else { "" }
                );
            }
        }
    }

    Ok(())
}
