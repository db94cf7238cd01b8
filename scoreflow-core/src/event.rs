use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A single game action with explicit event-time (event-time semantics).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEvent {
    pub user: String,
    pub team: String,
    pub score: i64,
    pub event_time: DateTime<Utc>,
}

impl GameEvent {
    pub fn new(user: impl Into<String>, team: impl Into<String>, score: i64, event_time: DateTime<Utc>) -> Self {
        Self {
            user: user.into(),
            team: team.into(),
            score,
            event_time,
        }
    }
}

/// Which field of a [`GameEvent`] an aggregation is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyField {
    Team,
    User,
}

impl KeyField {
    pub fn extract<'a>(&self, event: &'a GameEvent) -> &'a str {
        match self {
            KeyField::Team => &event.team,
            KeyField::User => &event.user,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyField::Team => "team",
            KeyField::User => "user",
        }
    }
}

impl fmt::Display for KeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark(pub DateTime<Utc>);

/// Half-open event-time interval `[start, end)`.
///
/// Ordered by `start` first, so a table holding windows of one size iterates them in time order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Instant at which state for this window may be discarded.
    pub fn expiry(&self, allowed_lateness: Duration) -> DateTime<Utc> {
        self.end
            .checked_add_signed(allowed_lateness)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// When, relative to the watermark, a pane was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaneTiming {
    Early,
    OnTime,
    Late,
}

impl PaneTiming {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaneTiming::Early => "early",
            PaneTiming::OnTime => "on_time",
            PaneTiming::Late => "late",
        }
    }
}

/// One emitted aggregate. Sinks upsert by `(path, key, window)` and keep the highest `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emission {
    pub path: KeyField,
    pub key: String,
    pub window: Window,
    pub sum: i64,
    pub version: u64,
    pub timing: PaneTiming,
    pub is_final: bool,
}

impl Emission {
    pub fn supersedes(&self, other: &Emission) -> bool {
        self.version > other.version
    }
}
