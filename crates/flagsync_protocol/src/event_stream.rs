//! Event-stream (server-sent events) block parser.
//!
//! The stream is a sequence of lines. Consecutive field lines form a block
//! and an empty line terminates it. A field line is `name:value` (a single
//! leading space in the value is dropped); a line starting with `:` is a
//! comment. The server sends comment-only blocks as keep-alives.

use std::collections::BTreeMap;

/// Name of the field that carries the message payload.
pub const DATA_FIELD: &str = "data";
/// Name of the field that carries the event type.
pub const EVENT_FIELD: &str = "event";
/// Name of the field that carries the event id.
pub const ID_FIELD: &str = "id";
/// Event type used by the server for error events.
pub const ERROR_EVENT: &str = "error";

/// The fields of one event-stream block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFields {
    fields: BTreeMap<String, String>,
}

impl EventFields {
    /// Creates an empty field map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of a field.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Returns the `data` field.
    pub fn data(&self) -> Option<&str> {
        self.get(DATA_FIELD)
    }

    /// Returns the `event` field.
    pub fn event(&self) -> Option<&str> {
        self.get(EVENT_FIELD)
    }

    /// Returns true if the block is an `event: error` block.
    pub fn is_error_event(&self) -> bool {
        self.event() == Some(ERROR_EVENT)
    }

    /// Sets a field, appending to an existing `data` field with a newline.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.fields.get_mut(&name) {
            Some(existing) if name == DATA_FIELD => {
                existing.push('\n');
                existing.push_str(&value);
            }
            _ => {
                self.fields.insert(name, value);
            }
        }
    }

    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EventFields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = EventFields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

/// A complete block produced by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamBlock {
    /// A comment-only block.
    KeepAlive,
    /// A block carrying at least a `data` field.
    Message(EventFields),
}

/// Incremental line-oriented event-stream parser.
///
/// Feed lines one at a time; a complete block is returned when the
/// terminating empty line arrives.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    fields: EventFields,
    saw_comment: bool,
}

impl EventStreamParser {
    /// Creates a parser with no pending block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (without its terminator) into the parser.
    pub fn feed_line(&mut self, line: &str) -> Option<StreamBlock> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.finish_block();
        }

        if line.starts_with(':') {
            self.saw_comment = true;
            return None;
        }

        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        self.fields.insert(name, value);
        None
    }

    /// Discards any partially accumulated block.
    pub fn reset(&mut self) {
        self.fields = EventFields::new();
        self.saw_comment = false;
    }

    /// Returns true if a block is partially accumulated.
    pub fn has_pending(&self) -> bool {
        !self.fields.is_empty() || self.saw_comment
    }

    fn finish_block(&mut self) -> Option<StreamBlock> {
        let fields = std::mem::take(&mut self.fields);
        let saw_comment = std::mem::replace(&mut self.saw_comment, false);

        if fields.is_empty() {
            return saw_comment.then_some(StreamBlock::KeepAlive);
        }

        if fields.data().is_some() {
            Some(StreamBlock::Message(fields))
        } else {
            tracing::debug!(fields = fields.len(), "dropping event-stream block without data");
            None
        }
    }
}

/// Parses a complete event-stream text into its blocks.
///
/// A trailing block without its terminating empty line is not returned.
pub fn parse_blocks(text: &str) -> Vec<StreamBlock> {
    let mut parser = EventStreamParser::new();
    text.lines().filter_map(|line| parser.feed_line(line)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_message_block() {
        let mut parser = EventStreamParser::new();
        assert_eq!(parser.feed_line("id: 123"), None);
        assert_eq!(parser.feed_line("event: message"), None);
        assert_eq!(parser.feed_line("data: {\"a\":1}"), None);

        let block = parser.feed_line("").unwrap();
        match block {
            StreamBlock::Message(fields) => {
                assert_eq!(fields.get(ID_FIELD), Some("123"));
                assert_eq!(fields.event(), Some("message"));
                assert_eq!(fields.data(), Some("{\"a\":1}"));
            }
            other => panic!("unexpected block {other:?}"),
        }
        assert!(!parser.has_pending());
    }

    #[test]
    fn comment_only_block_is_keep_alive() {
        let mut parser = EventStreamParser::new();
        assert_eq!(parser.feed_line(":keepalive"), None);
        assert_eq!(parser.feed_line(""), Some(StreamBlock::KeepAlive));
    }

    #[test]
    fn block_without_data_is_dropped() {
        let mut parser = EventStreamParser::new();
        parser.feed_line("id: 1");
        parser.feed_line("event: message");
        assert_eq!(parser.feed_line(""), None);
        assert!(!parser.has_pending());
    }

    #[test]
    fn extra_blank_lines_produce_nothing() {
        let mut parser = EventStreamParser::new();
        assert_eq!(parser.feed_line(""), None);
        assert_eq!(parser.feed_line(""), None);
    }

    #[test]
    fn multi_line_data_is_joined() {
        let blocks = parse_blocks("data: first\ndata: second\n\n");
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            StreamBlock::Message(fields) => assert_eq!(fields.data(), Some("first\nsecond")),
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn value_keeps_inner_colons_and_strips_one_space() {
        let blocks = parse_blocks("data:  {\"k\":\"a:b\"}\r\n\r\n");
        match &blocks[0] {
            StreamBlock::Message(fields) => assert_eq!(fields.data(), Some(" {\"k\":\"a:b\"}")),
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn field_without_colon_has_empty_value() {
        let blocks = parse_blocks("data\n\n");
        match &blocks[0] {
            StreamBlock::Message(fields) => assert_eq!(fields.data(), Some("")),
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn unterminated_block_is_not_returned() {
        let blocks = parse_blocks(":keepalive\n\ndata: x\n");
        assert_eq!(blocks, vec![StreamBlock::KeepAlive]);
    }

    #[test]
    fn error_event_detection() {
        let fields: EventFields = [("event", "error"), ("data", "{}")].into_iter().collect();
        assert!(fields.is_error_event());
    }

    proptest! {
        #[test]
        fn arbitrary_lines_never_panic(lines in proptest::collection::vec(".*", 0..40)) {
            let mut parser = EventStreamParser::new();
            for line in &lines {
                let _ = parser.feed_line(line);
            }
        }

        #[test]
        fn data_blocks_survive_interleaved_keep_alives(
            payloads in proptest::collection::vec("[a-zA-Z0-9{}\",]{1,24}", 1..10)
        ) {
            let mut text = String::new();
            for payload in &payloads {
                text.push_str(":keepalive\n\n");
                text.push_str("data: ");
                text.push_str(payload);
                text.push_str("\n\n");
            }

            let messages: Vec<String> = parse_blocks(&text)
                .into_iter()
                .filter_map(|block| match block {
                    StreamBlock::Message(fields) => fields.data().map(str::to_string),
                    StreamBlock::KeepAlive => None,
                })
                .collect();
            prop_assert_eq!(messages, payloads);
        }
    }
}
