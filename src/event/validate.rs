use std::fmt;

use serde::de::{self, DeserializeSeed, IgnoredAny, SeqAccess, Visitor};
use serde_json::{Map, Value};
use thiserror::Error;

use super::{Event, EventType};

/// Length of a session identifier in hex characters.
pub const SESSION_ID_LEN: usize = 64;
/// Default ceiling on entries per submitted batch.
pub const DEFAULT_MAX_BATCH_EVENTS: usize = 500;
/// Maximum track stem length in bytes.
pub const MAX_TRACK_STEM_BYTES: usize = 255;
/// Upper bound for `position_seconds` (one day).
pub const MAX_POSITION_SECONDS: f64 = 86_400.0;
/// Maximum nesting depth of event metadata; the top-level object is depth 1.
pub const MAX_METADATA_DEPTH: usize = 4;
/// Maximum keys per object, or elements per array, inside metadata.
pub const MAX_METADATA_KEYS: usize = 32;
/// Maximum length of any metadata string in bytes.
pub const MAX_METADATA_STRING_BYTES: usize = 512;
/// Maximum canonical encoded size of metadata in bytes.
pub const MAX_METADATA_BYTES: usize = 4096;
/// Raw body allowance per permitted event. Bounds the bytes parsed per batch.
pub const MAX_EVENT_BODY_BYTES: usize = 8 * 1024;

/// Batch-level failures. These abort the whole submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("batch has {size} events, limit is {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("batch body is {bytes} bytes, limit is {limit}")]
    BodyTooLarge { bytes: usize, limit: usize },

    #[error("session id must be {SESSION_ID_LEN} lowercase hex characters")]
    InvalidSessionId,

    #[error("malformed batch: {reason}")]
    MalformedBatch { reason: String },
}

impl ValidationError {
    /// Stable label for metrics and logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BatchTooLarge { .. } => "batch_too_large",
            Self::BodyTooLarge { .. } => "body_too_large",
            Self::InvalidSessionId => "invalid_session_id",
            Self::MalformedBatch { .. } => "malformed_batch",
        }
    }
}

/// Why a single event was removed from an otherwise valid batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotAnObject,
    UnknownEventType,
    InvalidTrackStem,
    InvalidPosition,
    InvalidMetadata,
    MissingTrackStem,
    UnexpectedTrackStem,
    MissingSeekPositions,
    NonPositivePosition,
}

impl RejectReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotAnObject => "not_an_object",
            Self::UnknownEventType => "unknown_event_type",
            Self::InvalidTrackStem => "invalid_track_stem",
            Self::InvalidPosition => "invalid_position",
            Self::InvalidMetadata => "invalid_metadata",
            Self::MissingTrackStem => "missing_track_stem",
            Self::UnexpectedTrackStem => "unexpected_track_stem",
            Self::MissingSeekPositions => "missing_seek_positions",
            Self::NonPositivePosition => "non_positive_position",
        }
    }
}

/// Result of validating one batch.
#[derive(Debug, Default)]
pub struct ValidatedBatch {
    pub events: Vec<Event>,
    pub rejected: usize,
}

/// Pure validator turning loosely-typed client payloads into normalized events.
#[derive(Debug, Clone)]
pub struct Validator {
    max_batch_events: usize,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_EVENTS)
    }
}

impl Validator {
    pub fn new(max_batch_events: usize) -> Self {
        Self { max_batch_events }
    }

    /// Validates a raw JSON batch for the given session.
    ///
    /// Returns an error only for batch-level problems; individual bad events
    /// are dropped and counted in [`ValidatedBatch::rejected`].
    pub fn validate_batch(
        &self,
        session_id: &str,
        raw: &[u8],
    ) -> Result<ValidatedBatch, ValidationError> {
        if !is_valid_session_id(session_id) {
            return Err(ValidationError::InvalidSessionId);
        }

        let body_limit = self.max_batch_events.saturating_mul(MAX_EVENT_BODY_BYTES);
        if raw.len() > body_limit {
            return Err(ValidationError::BodyTooLarge {
                bytes: raw.len(),
                limit: body_limit,
            });
        }

        let entries = match parse_entries(raw, self.max_batch_events) {
            Ok(Entries::Within(entries)) => entries,
            Ok(Entries::Over(size)) => {
                return Err(ValidationError::BatchTooLarge {
                    size,
                    limit: self.max_batch_events,
                });
            }
            Err(e) => {
                return Err(ValidationError::MalformedBatch {
                    reason: e.to_string(),
                });
            }
        };

        let mut out = ValidatedBatch {
            events: Vec::with_capacity(entries.len()),
            rejected: 0,
        };

        for entry in &entries {
            match validate_event(session_id, entry) {
                Ok(event) => out.events.push(event),
                Err(reason) => {
                    tracing::debug!(reason = reason.as_str(), "event rejected");
                    out.rejected += 1;
                }
            }
        }

        Ok(out)
    }
}

/// Checks for exactly 64 lowercase hex characters.
pub fn is_valid_session_id(session_id: &str) -> bool {
    session_id.len() == SESSION_ID_LEN
        && session_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Checks a track stem for length, path traversal and control characters.
pub fn is_valid_track_stem(stem: &str) -> bool {
    if stem.is_empty() || stem.len() > MAX_TRACK_STEM_BYTES {
        return false;
    }
    if stem.contains('/') || stem.contains('\\') || stem.contains("..") {
        return false;
    }
    !stem.chars().any(char::is_control)
}

fn validate_event(session_id: &str, entry: &Value) -> Result<Event, RejectReason> {
    let obj = entry.as_object().ok_or(RejectReason::NotAnObject)?;

    let event_type = obj
        .get("event_type")
        .and_then(Value::as_str)
        .and_then(EventType::from_name)
        .ok_or(RejectReason::UnknownEventType)?;

    let track_stem = match obj.get("track_stem") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if is_valid_track_stem(s) => Some(s.as_str()),
        Some(_) => return Err(RejectReason::InvalidTrackStem),
    };

    let position_seconds = match obj.get("position_seconds") {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(n)) => n.as_f64().ok_or(RejectReason::InvalidPosition)?,
        Some(_) => return Err(RejectReason::InvalidPosition),
    };
    if !position_seconds.is_finite() || !(0.0..=MAX_POSITION_SECONDS).contains(&position_seconds)
    {
        return Err(RejectReason::InvalidPosition);
    }

    let metadata = match obj.get("metadata") {
        None | Some(Value::Null) => Map::new(),
        Some(value) => normalize_metadata(value)?,
    };

    let encoded = serde_json::to_string(&metadata).map_err(|_| RejectReason::InvalidMetadata)?;
    if encoded.len() > MAX_METADATA_BYTES {
        return Err(RejectReason::InvalidMetadata);
    }

    // Type-specific rules run after every generic shape check.
    if event_type.requires_track() && track_stem.is_none() {
        return Err(RejectReason::MissingTrackStem);
    }
    if event_type.is_session_boundary() && track_stem.is_some() {
        return Err(RejectReason::UnexpectedTrackStem);
    }
    if event_type == EventType::Seek {
        let numeric = |key: &str| metadata.get(key).is_some_and(Value::is_number);
        if !numeric("from_position") || !numeric("to_position") {
            return Err(RejectReason::MissingSeekPositions);
        }
    }
    if matches!(event_type, EventType::Pause | EventType::Dropout) && position_seconds <= 0.0 {
        return Err(RejectReason::NonPositivePosition);
    }

    let (track_stem, position_seconds) = if event_type.is_session_boundary() {
        (String::new(), 0.0)
    } else {
        (track_stem.unwrap_or_default().to_string(), position_seconds)
    };

    Ok(Event {
        session_id: session_id.to_string(),
        event_type,
        track_stem,
        position_seconds,
        metadata: encoded,
    })
}

/// Accepts metadata either inline as an object or as a string holding one
/// JSON document.
fn normalize_metadata(value: &Value) -> Result<Map<String, Value>, RejectReason> {
    let parsed;
    let value = match value {
        Value::String(text) => {
            if text.len() > MAX_METADATA_BYTES {
                return Err(RejectReason::InvalidMetadata);
            }
            parsed = parse_strict::<Value>(text.as_bytes())
                .map_err(|_| RejectReason::InvalidMetadata)?;
            &parsed
        }
        other => other,
    };

    let Value::Object(map) = value else {
        return Err(RejectReason::InvalidMetadata);
    };
    check_shape(value, 1)?;
    Ok(map.clone())
}

fn check_shape(value: &Value, depth: usize) -> Result<(), RejectReason> {
    match value {
        Value::Object(map) => {
            if depth > MAX_METADATA_DEPTH || map.len() > MAX_METADATA_KEYS {
                return Err(RejectReason::InvalidMetadata);
            }
            for (key, child) in map {
                if key.len() > MAX_METADATA_STRING_BYTES {
                    return Err(RejectReason::InvalidMetadata);
                }
                check_shape(child, depth + 1)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            if depth > MAX_METADATA_DEPTH || items.len() > MAX_METADATA_KEYS {
                return Err(RejectReason::InvalidMetadata);
            }
            items.iter().try_for_each(|child| check_shape(child, depth + 1))
        }
        Value::String(s) if s.len() > MAX_METADATA_STRING_BYTES => {
            Err(RejectReason::InvalidMetadata)
        }
        _ => Ok(()),
    }
}

/// Outer batch array, or the entry count once it passed the limit.
enum Entries {
    Within(Vec<Value>),
    Over(usize),
}

/// Array visitor that stops materializing entries past `limit`. The rest
/// of the array is only scanned and counted.
struct BoundedEntries {
    limit: usize,
}

impl<'de> DeserializeSeed<'de> for BoundedEntries {
    type Value = Entries;

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<Entries, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for BoundedEntries {
    type Value = Entries;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON array of events")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Entries, A::Error> {
        let mut entries = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(self.limit));
        while entries.len() < self.limit {
            match seq.next_element::<Value>()? {
                Some(entry) => entries.push(entry),
                None => return Ok(Entries::Within(entries)),
            }
        }

        let mut size = entries.len();
        while seq.next_element::<IgnoredAny>()?.is_some() {
            size += 1;
        }
        if size > self.limit {
            Ok(Entries::Over(size))
        } else {
            Ok(Entries::Within(entries))
        }
    }
}

/// Parses the outer batch array, rejecting trailing data.
fn parse_entries(raw: &[u8], limit: usize) -> serde_json::Result<Entries> {
    let mut de = serde_json::Deserializer::from_slice(raw);
    let entries = BoundedEntries { limit }.deserialize(&mut de)?;
    de.end()?;
    Ok(entries)
}

/// Parses exactly one JSON value, rejecting trailing data.
fn parse_strict<T: serde::de::DeserializeOwned>(raw: &[u8]) -> serde_json::Result<T> {
    let mut de = serde_json::Deserializer::from_slice(raw);
    let value = T::deserialize(&mut de)?;
    de.end()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SESSION: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn validate(batch: Value) -> ValidatedBatch {
        let raw = serde_json::to_vec(&batch).expect("encode batch");
        Validator::default()
            .validate_batch(SESSION, &raw)
            .expect("batch accepted")
    }

    fn validate_one(event: Value) -> Option<Event> {
        let mut out = validate(json!([event]));
        out.events.pop()
    }

    #[test]
    fn test_session_id_shape() {
        assert!(is_valid_session_id(SESSION));
        assert!(!is_valid_session_id(&SESSION.to_uppercase()));
        assert!(!is_valid_session_id(&SESSION[..63]));
        assert!(!is_valid_session_id(&format!("{}g", &SESSION[..63])));

        let err = Validator::default()
            .validate_batch("abc", b"[]")
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidSessionId);
    }

    #[test]
    fn test_batch_too_large() {
        let entries: Vec<Value> = (0..501)
            .map(|_| json!({"event_type": "heartbeat"}))
            .collect();
        let raw = serde_json::to_vec(&entries).expect("encode");
        let err = Validator::default()
            .validate_batch(SESSION, &raw)
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::BatchTooLarge {
                size: 501,
                limit: 500
            }
        );
    }

    #[test]
    fn test_entries_past_limit_are_counted_not_kept() {
        let v = Validator::new(2);
        let raw = br#"[{"event_type":"play","track_stem":"a"},{"event_type":"play","track_stem":"b"},
                       {"event_type":"play","track_stem":"c"},[1,2,{"nested":true}]]"#;
        assert_eq!(
            v.validate_batch(SESSION, raw).unwrap_err(),
            ValidationError::BatchTooLarge { size: 4, limit: 2 }
        );

        let raw = br#"[{"event_type":"play","track_stem":"a"},{"event_type":"play","track_stem":"b"}]"#;
        assert_eq!(v.validate_batch(SESSION, raw).expect("at limit").events.len(), 2);
    }

    #[test]
    fn test_body_size_ceiling() {
        let v = Validator::new(1);
        let padding = "x".repeat(MAX_EVENT_BODY_BYTES);
        let raw = format!(r#"[{{"event_type":"play","track_stem":"a","metadata":{{"p":"{padding}"}}}}]"#);

        let err = v.validate_batch(SESSION, raw.as_bytes()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::BodyTooLarge {
                bytes: raw.len(),
                limit: MAX_EVENT_BODY_BYTES
            }
        );
        assert_eq!(err.kind(), "body_too_large");
    }

    #[test]
    fn test_malformed_outer_json() {
        let v = Validator::default();
        assert!(matches!(
            v.validate_batch(SESSION, b"{\"event_type\":\"play\"}"),
            Err(ValidationError::MalformedBatch { .. })
        ));
        assert!(matches!(
            v.validate_batch(SESSION, b"[] []"),
            Err(ValidationError::MalformedBatch { .. })
        ));
        assert!(matches!(
            v.validate_batch(SESSION, b"[{"),
            Err(ValidationError::MalformedBatch { .. })
        ));
    }

    #[test]
    fn test_valid_play_event() {
        let event = validate_one(json!({
            "event_type": "play",
            "track_stem": "01 - Intro",
            "position_seconds": 12.5,
            "metadata": {"source": "album"}
        }))
        .expect("valid");
        assert_eq!(event.event_type, EventType::Play);
        assert_eq!(event.track_stem, "01 - Intro");
        assert_eq!(event.position_seconds, 12.5);
        assert_eq!(event.metadata, r#"{"source":"album"}"#);
        assert_eq!(event.session_id, SESSION);
    }

    #[test]
    fn test_unknown_type_and_traversal_rejected() {
        let out = validate(json!([
            {"event_type": "play", "track_stem": "song"},
            {"event_type": "rewind", "track_stem": "song"},
            {"event_type": "pause", "track_stem": "../../etc/passwd", "position_seconds": 3},
        ]));
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.rejected, 2);
    }

    #[test]
    fn test_track_stem_rules() {
        assert!(is_valid_track_stem("Track 01"));
        assert!(!is_valid_track_stem(""));
        assert!(!is_valid_track_stem("a/b"));
        assert!(!is_valid_track_stem("a\\b"));
        assert!(!is_valid_track_stem(".."));
        assert!(!is_valid_track_stem("bad\u{0007}bell"));
        assert!(!is_valid_track_stem(&"x".repeat(256)));
        assert!(is_valid_track_stem(&"x".repeat(255)));
    }

    #[test]
    fn test_position_bounds() {
        assert!(validate_one(json!({"event_type": "play", "track_stem": "s", "position_seconds": -1})).is_none());
        assert!(validate_one(json!({"event_type": "play", "track_stem": "s", "position_seconds": 86400.5})).is_none());
        assert!(validate_one(json!({"event_type": "play", "track_stem": "s", "position_seconds": "5"})).is_none());
        assert!(validate_one(json!({"event_type": "play", "track_stem": "s", "position_seconds": 86400})).is_some());
    }

    #[test]
    fn test_track_required_and_forbidden() {
        assert!(validate_one(json!({"event_type": "complete"})).is_none());
        assert!(validate_one(json!({"event_type": "session_start", "track_stem": "s"})).is_none());
        assert!(validate_one(json!({"event_type": "heartbeat"})).is_some());
        assert!(validate_one(json!({"event_type": "heartbeat", "track_stem": "s"})).is_some());
    }

    #[test]
    fn test_session_boundary_forces_zero_position() {
        let event = validate_one(json!({"event_type": "session_end", "position_seconds": 42}))
            .expect("valid");
        assert_eq!(event.track_stem, "");
        assert_eq!(event.position_seconds, 0.0);
    }

    #[test]
    fn test_seek_requires_numeric_positions() {
        assert!(validate_one(json!({
            "event_type": "seek", "track_stem": "s",
            "metadata": {"from_position": 10, "to_position": 60.5}
        }))
        .is_some());
        assert!(validate_one(json!({
            "event_type": "seek", "track_stem": "s",
            "metadata": {"from_position": "10", "to_position": 60}
        }))
        .is_none());
        assert!(validate_one(json!({"event_type": "seek", "track_stem": "s"})).is_none());
    }

    #[test]
    fn test_pause_and_dropout_need_positive_position() {
        assert!(validate_one(json!({"event_type": "pause", "track_stem": "s"})).is_none());
        assert!(validate_one(json!({"event_type": "dropout", "track_stem": "s", "position_seconds": 0})).is_none());
        assert!(validate_one(json!({"event_type": "dropout", "track_stem": "s", "position_seconds": 0.1})).is_some());
    }

    #[test]
    fn test_metadata_must_be_object() {
        assert!(validate_one(json!({"event_type": "heartbeat", "metadata": [1, 2]})).is_none());
        assert!(validate_one(json!({"event_type": "heartbeat", "metadata": 5})).is_none());
        assert!(validate_one(json!({"event_type": "heartbeat", "metadata": "[1]"})).is_none());
    }

    #[test]
    fn test_metadata_string_is_parsed_strictly() {
        let event = validate_one(json!({"event_type": "heartbeat", "metadata": "{\"a\": 1}"}))
            .expect("valid");
        assert_eq!(event.metadata, r#"{"a":1}"#);
        assert!(validate_one(json!({"event_type": "heartbeat", "metadata": "{\"a\":1} x"})).is_none());
    }

    #[test]
    fn test_metadata_depth_limit() {
        let ok = json!({"a": {"b": {"c": {"d": 1}}}});
        let too_deep = json!({"a": {"b": {"c": {"d": {"e": 1}}}}});
        assert!(validate_one(json!({"event_type": "heartbeat", "metadata": ok})).is_some());
        assert!(validate_one(json!({"event_type": "heartbeat", "metadata": too_deep})).is_none());
    }

    #[test]
    fn test_metadata_key_and_string_limits() {
        let many: Map<String, Value> = (0..33).map(|i| (format!("k{i}"), json!(i))).collect();
        assert!(validate_one(json!({"event_type": "heartbeat", "metadata": many})).is_none());

        let long = "x".repeat(513);
        assert!(validate_one(json!({"event_type": "heartbeat", "metadata": {"note": long}})).is_none());

        let items: Vec<Value> = (0..33).map(|i| json!(i)).collect();
        assert!(validate_one(json!({"event_type": "heartbeat", "metadata": {"list": items}})).is_none());
    }

    #[test]
    fn test_metadata_total_size_limit() {
        let fields: Map<String, Value> = (0..10)
            .map(|i| (format!("k{i}"), json!("y".repeat(500))))
            .collect();
        assert!(validate_one(json!({"event_type": "heartbeat", "metadata": fields})).is_none());
    }

    #[test]
    fn test_metadata_numbers_kept_verbatim() {
        let raw = r#"[{"event_type":"heartbeat","metadata":{"big":12345678901234567890123,"f":0.1000000000000000055511}}]"#;
        let out = Validator::default()
            .validate_batch(SESSION, raw.as_bytes())
            .expect("accepted");
        assert_eq!(
            out.events[0].metadata,
            r#"{"big":12345678901234567890123,"f":0.1000000000000000055511}"#
        );
    }
}
