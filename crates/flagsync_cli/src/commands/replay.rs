//! Replay command implementation.

use flagsync_protocol::{
    parse_message, EventStreamParser, NotificationKind, StreamBlock, StreamingMessage,
};
use serde::Serialize;
use std::path::Path;

/// What one block of the capture decoded to.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "block", rename_all = "snake_case")]
pub enum ReplayEntry {
    /// A comment-only block.
    KeepAlive {
        /// Line the block ended on.
        line: usize,
    },
    /// A routable notification.
    Notification {
        /// Line the block ended on.
        line: usize,
        /// Notification type.
        kind: &'static str,
        /// Channel it arrived on.
        channel: String,
        /// Change number, when it carries one.
        #[serde(skip_serializing_if = "Option::is_none")]
        change_number: Option<i64>,
    },
    /// A streaming error event.
    Error {
        /// Line the block ended on.
        line: usize,
        /// Service error code.
        code: u32,
        /// Whether reconnecting can recover.
        retryable: bool,
        /// Message.
        message: String,
    },
    /// A block that did not decode.
    Dropped {
        /// Line the block ended on.
        line: usize,
        /// Decode failure.
        reason: String,
    },
}

/// Counts per entry type.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Lines read.
    pub lines: usize,
    /// Keep-alive blocks.
    pub keep_alives: usize,
    /// Notifications.
    pub notifications: usize,
    /// Error events.
    pub errors: usize,
    /// Undecodable blocks.
    pub dropped: usize,
}

/// Replay result.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    /// Decoded blocks, in order.
    pub entries: Vec<ReplayEntry>,
    /// Counts.
    pub summary: ReplaySummary,
}

fn change_number(kind: &NotificationKind) -> Option<i64> {
    match kind {
        NotificationKind::FlagsChanged { change_number }
        | NotificationKind::FlagKilled { change_number, .. } => Some(*change_number),
        NotificationKind::SegmentsChanged { change_number, .. } => *change_number,
        NotificationKind::Control(_) | NotificationKind::Occupancy { .. } => None,
    }
}

/// Feeds `capture` through the parser and decoder.
pub fn replay(capture: &str) -> ReplayReport {
    let mut parser = EventStreamParser::new();
    let mut entries = Vec::new();
    let mut summary = ReplaySummary::default();

    for (index, line) in capture.lines().enumerate() {
        summary.lines += 1;
        let line_number = index + 1;
        let Some(block) = parser.feed_line(line) else {
            continue;
        };

        let entry = match block {
            StreamBlock::KeepAlive => {
                summary.keep_alives += 1;
                ReplayEntry::KeepAlive { line: line_number }
            }
            StreamBlock::Message(fields) => match parse_message(&fields) {
                Ok(StreamingMessage::Notification(notification)) => {
                    summary.notifications += 1;
                    ReplayEntry::Notification {
                        line: line_number,
                        kind: notification.kind.name(),
                        change_number: change_number(&notification.kind),
                        channel: notification.channel,
                    }
                }
                Ok(StreamingMessage::Error(error)) => {
                    summary.errors += 1;
                    ReplayEntry::Error {
                        line: line_number,
                        code: error.code,
                        retryable: error.is_retryable(),
                        message: error.message,
                    }
                }
                Err(e) => {
                    summary.dropped += 1;
                    ReplayEntry::Dropped {
                        line: line_number,
                        reason: e.to_string(),
                    }
                }
            },
        };
        tracing::debug!(?entry, "decoded block");
        entries.push(entry);
    }

    ReplayReport { entries, summary }
}

/// Runs the replay command.
pub fn run(path: &Path, summary_only: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let capture = std::fs::read_to_string(path)
        .map_err(|e| format!("Cannot read capture {}: {e}", path.display()))?;
    let report = replay(&capture);

    match format {
        "json" => {
            if summary_only {
                println!("{}", serde_json::to_string_pretty(&report.summary)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        _ => {
            if !summary_only {
                for entry in &report.entries {
                    print_entry(entry);
                }
                println!();
            }
            let summary = &report.summary;
            println!("Lines:         {}", summary.lines);
            println!("Keep-alives:   {}", summary.keep_alives);
            println!("Notifications: {}", summary.notifications);
            println!("Errors:        {}", summary.errors);
            println!("Dropped:       {}", summary.dropped);
        }
    }

    Ok(())
}

fn print_entry(entry: &ReplayEntry) {
    match entry {
        ReplayEntry::KeepAlive { line } => println!("{line:>6}  keep-alive"),
        ReplayEntry::Notification {
            line,
            kind,
            channel,
            change_number,
        } => match change_number {
            Some(cn) => println!("{line:>6}  {kind:<20} {channel} cn={cn}"),
            None => println!("{line:>6}  {kind:<20} {channel}"),
        },
        ReplayEntry::Error {
            line,
            code,
            retryable,
            message,
        } => println!("{line:>6}  error {code} retryable={retryable} {message}"),
        ReplayEntry::Dropped { line, reason } => println!("{line:>6}  dropped: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CAPTURE: &str = r#":keepalive

id:1
event:message
data:{"id":"a","channel":"abc_splits","timestamp":1,"data":"{\"type\":\"SPLIT_UPDATE\",\"changeNumber\":1000}"}

data:{broken

event:error
data:{"code":40142,"statusCode":401,"message":"Token expired"}

"#;

    #[test]
    fn replays_each_block() {
        let report = replay(CAPTURE);
        assert_eq!(
            report.summary,
            ReplaySummary {
                lines: 11,
                keep_alives: 1,
                notifications: 1,
                errors: 1,
                dropped: 1,
            }
        );
        assert_eq!(report.entries[0], ReplayEntry::KeepAlive { line: 2 });
        assert_eq!(
            report.entries[1],
            ReplayEntry::Notification {
                line: 6,
                kind: "FLAGS_CHANGED",
                channel: "abc_splits".to_string(),
                change_number: Some(1000),
            }
        );
        assert!(matches!(
            &report.entries[3],
            ReplayEntry::Error { code: 40142, retryable: true, .. }
        ));
    }

    #[test]
    fn run_reads_capture_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CAPTURE.as_bytes()).unwrap();
        run(file.path(), false, "text").unwrap();
        run(file.path(), true, "json").unwrap();
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&dir.path().join("missing.txt"), false, "text").is_err());
    }

    #[test]
    fn entries_serialize_with_tag() {
        let json = serde_json::to_value(ReplayEntry::KeepAlive { line: 3 }).unwrap();
        assert_eq!(json["block"], "keep_alive");
        assert_eq!(json["line"], 3);
    }
}
