pub mod validate;

use std::fmt;

use serde::{Deserialize, Serialize};

/// EventType identifies the kind of playback telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Play,
    Pause,
    Seek,
    Complete,
    Dropout,
    Heartbeat,
    SessionStart,
    SessionEnd,
}

/// All event kinds in declaration order.
pub const ALL_EVENT_TYPES: [EventType; 8] = [
    EventType::Play,
    EventType::Pause,
    EventType::Seek,
    EventType::Complete,
    EventType::Dropout,
    EventType::Heartbeat,
    EventType::SessionStart,
    EventType::SessionEnd,
];

impl EventType {
    /// Returns the canonical wire/storage name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Seek => "seek",
            Self::Complete => "complete",
            Self::Dropout => "dropout",
            Self::Heartbeat => "heartbeat",
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
        }
    }

    /// Convert from the canonical name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "play" => Some(Self::Play),
            "pause" => Some(Self::Pause),
            "seek" => Some(Self::Seek),
            "complete" => Some(Self::Complete),
            "dropout" => Some(Self::Dropout),
            "heartbeat" => Some(Self::Heartbeat),
            "session_start" => Some(Self::SessionStart),
            "session_end" => Some(Self::SessionEnd),
            _ => None,
        }
    }

    /// Backpressure class for this kind.
    pub const fn value_class(self) -> ValueClass {
        match self {
            Self::Play | Self::Complete | Self::SessionStart | Self::SessionEnd => {
                ValueClass::High
            }
            Self::Pause | Self::Seek | Self::Dropout | Self::Heartbeat => ValueClass::Low,
        }
    }

    /// Whether a track stem must be present.
    pub const fn requires_track(self) -> bool {
        matches!(
            self,
            Self::Play | Self::Pause | Self::Seek | Self::Complete | Self::Dropout
        )
    }

    /// Whether this kind marks a session boundary (no track, no position).
    pub const fn is_session_boundary(self) -> bool {
        matches!(self, Self::SessionStart | Self::SessionEnd)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a full ingestion queue treats an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueClass {
    /// Waits a bounded interval for queue space before dropping.
    High,
    /// Dropped immediately when the queue is full.
    Low,
}

/// A validated, normalized playback event awaiting persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub session_id: String,
    pub event_type: EventType,
    /// Empty for session boundary events.
    pub track_stem: String,
    pub position_seconds: f64,
    /// Canonically re-encoded JSON object.
    pub metadata: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip_for_every_kind() {
        for t in ALL_EVENT_TYPES {
            assert_eq!(EventType::from_name(t.as_str()), Some(t));
        }
        assert_eq!(EventType::from_name("scrub"), None);
        assert_eq!(EventType::from_name("PLAY"), None);
    }

    #[test]
    fn test_value_classes() {
        let high: Vec<_> = ALL_EVENT_TYPES
            .into_iter()
            .filter(|t| t.value_class() == ValueClass::High)
            .collect();
        assert_eq!(
            high,
            vec![
                EventType::Play,
                EventType::Complete,
                EventType::SessionStart,
                EventType::SessionEnd
            ]
        );
        assert_eq!(EventType::Heartbeat.value_class(), ValueClass::Low);
    }

    #[test]
    fn test_track_requirements() {
        assert!(EventType::Seek.requires_track());
        assert!(!EventType::Heartbeat.requires_track());
        assert!(!EventType::SessionStart.requires_track());
        assert!(EventType::SessionEnd.is_session_boundary());
        assert!(!EventType::Heartbeat.is_session_boundary());
    }
}
