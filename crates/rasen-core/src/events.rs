//! Event grammar extraction from assistant output (spec Section 4.2, 6).
//!
//! Tokens of the form `<event topic="TOPIC">PAYLOAD</event>` are the sole
//! structured communication channel from the assistant subprocess to the
//! supervisor. Extraction is a tolerant manual scan rather than a regex
//! dependency, in the donor's own manual-parsing style (its `config.rs` key
//!=value parser): topic and payload are both stripped, multi-line payloads
//! are accepted, and malformed tags are silently ignored.

use serde::{Deserialize, Serialize};

/// Recognized event topics (Section 3, 6). `Other` retains unrecognized
/// topics so forward compatibility never requires a parser change (Section
/// 9: "Dynamic typing / duck typing").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    InitDone,
    BuildDone,
    BuildBlocked,
    ReviewApproved,
    ReviewChangesRequested,
    QaApproved,
    QaRejected,
    Other(String),
}

impl Topic {
    fn parse(raw: &str) -> Self {
        match raw {
            "init.done" => Self::InitDone,
            "build.done" => Self::BuildDone,
            "build.blocked" => Self::BuildBlocked,
            "review.approved" => Self::ReviewApproved,
            "review.changes_requested" => Self::ReviewChangesRequested,
            "qa.approved" => Self::QaApproved,
            "qa.rejected" => Self::QaRejected,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A single extracted `<event topic="...">...</event>` occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    pub payload: String,
}

/// Scan `output` for `<event topic="TOPIC">PAYLOAD</event>` tokens.
///
/// Equivalent to the regex `<event\s+topic="([^"]+)">(.*?)</event>` with
/// dot-matches-newline, non-greedy payload capture; malformed tags (missing
/// closing tag, unterminated quote) are skipped rather than erroring.
pub fn extract_events(output: &str) -> Vec<Event> {
    const OPEN_PREFIX: &str = "<event";
    const CLOSE_TAG: &str = "</event>";

    let mut events = Vec::new();
    let bytes = output.as_bytes();
    let mut cursor = 0usize;

    while let Some(rel_start) = output[cursor..].find(OPEN_PREFIX) {
        let tag_start = cursor + rel_start;
        // Find the attribute section end `>`.
        let Some(rel_gt) = output[tag_start..].find('>') else {
            break;
        };
        let header = &output[tag_start..tag_start + rel_gt];
        let payload_start = tag_start + rel_gt + 1;

        let Some(topic_raw) = extract_topic_attr(header) else {
            // Not a well-formed opening tag; resume scanning just past it.
            cursor = tag_start + OPEN_PREFIX.len();
            continue;
        };

        let Some(rel_close) = output[payload_start..].find(CLOSE_TAG) else {
            // No closing tag anywhere after this point; nothing more to find.
            break;
        };
        let payload_end = payload_start + rel_close;
        let payload = output[payload_start..payload_end].trim().to_string();

        events.push(Event {
            topic: Topic::parse(topic_raw.trim()),
            payload,
        });

        cursor = payload_end + CLOSE_TAG.len();
        if cursor > bytes.len() {
            break;
        }
    }

    events
}

/// Pull the `topic="..."` attribute value out of an opening tag header
/// (everything between `<event` and the closing `>`, exclusive).
fn extract_topic_attr(header: &str) -> Option<&str> {
    let idx = header.find("topic=")?;
    let rest = &header[idx + "topic=".len()..];
    let rest = rest.trim_start();
    let mut chars = rest.char_indices();
    let (_, quote) = chars.next()?;
    if quote != '"' {
        return None;
    }
    let close = rest[1..].find('"')?;
    Some(&rest[1..1 + close])
}

/// A single `<!-- memory: KIND: CONTENT -->` marker extracted from output
/// (Section 4.3 step 9, Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMarker {
    pub kind: String,
    pub content: String,
}

/// Scan `output` for memory markers of the form
/// `<!-- memory: KIND: CONTENT -->`. Unrecognized `KIND` values are still
/// returned; the caller (Post-Session Processor) filters by
/// `MemoryKind::parse`.
pub fn extract_memory_markers(output: &str) -> Vec<MemoryMarker> {
    const PREFIX: &str = "<!-- memory:";
    const SUFFIX: &str = "-->";

    let mut markers = Vec::new();
    let mut cursor = 0usize;

    while let Some(rel_start) = output[cursor..].find(PREFIX) {
        let start = cursor + rel_start + PREFIX.len();
        let Some(rel_end) = output[start..].find(SUFFIX) else {
            break;
        };
        let body = output[start..start + rel_end].trim();
        if let Some((kind, content)) = body.split_once(':') {
            markers.push(MemoryMarker {
                kind: kind.trim().to_string(),
                content: content.trim().to_string(),
            });
        }
        cursor = start + rel_end + SUFFIX.len();
    }

    markers
}

/// Does the assistant output claim a completion for this topic set? Section
/// 4.3 step 2.
pub fn claims_completion(events: &[Event]) -> bool {
    events
        .iter()
        .any(|e| matches!(e.topic, Topic::InitDone | Topic::BuildDone))
}

pub fn has_topic(events: &[Event], topic: &Topic) -> bool {
    events.iter().any(|e| &e.topic == topic)
}

/// Payload of the first `build.done`/`init.done` event, if any (used by the
/// Validator).
pub fn completion_payload(events: &[Event]) -> Option<&str> {
    events
        .iter()
        .find(|e| matches!(e.topic, Topic::InitDone | Topic::BuildDone))
        .map(|e| e.payload.as_str())
}
