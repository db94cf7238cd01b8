use chrono::{DateTime, Utc};
use scoreflow_core::{metrics, GameEvent, KeyField, Window};
use scoreflow_state::WindowTable;
use tracing::debug;

use crate::window::FixedWindows;

/// Trigger state of one `(key, window)` pair: Open -> EmittedEarly* -> Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPhase {
    Open,
    EmittedEarly,
    Closed,
}

/// Running sum for one `(key, window)` plus its emission bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowState {
    pub key: String,
    pub sum: i64,
    pub last_emitted_sum: Option<i64>,
    pub phase: TriggerPhase,
    /// Version of the last emission; 0 before the first one.
    pub version: u64,
}

impl WindowState {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            sum: 0,
            last_emitted_sum: None,
            phase: TriggerPhase::Open,
            version: 0,
        }
    }

    pub fn closed(&self) -> bool {
        self.phase == TriggerPhase::Closed
    }

    /// True when the current sum has not been emitted yet.
    pub fn is_dirty(&self) -> bool {
        self.last_emitted_sum != Some(self.sum)
    }
}

/// Per-key windowed sums for one key field (team or user).
pub struct KeyedAggregator {
    key_field: KeyField,
    windows: FixedWindows,
    table: WindowTable<WindowState>,
    dropped_late: u64,
}

impl KeyedAggregator {
    pub fn new(key_field: KeyField, windows: FixedWindows) -> Self {
        Self {
            key_field,
            windows,
            table: WindowTable::new(),
            dropped_late: 0,
        }
    }

    pub fn key_field(&self) -> KeyField {
        self.key_field
    }

    pub fn windows(&self) -> FixedWindows {
        self.windows
    }

    /// Add `event.score` to the state of its `(key, window)`, creating it on first use.
    ///
    /// Events before `horizon` are dropped and counted; nothing else observes them.
    pub fn ingest(&mut self, event: &GameEvent, horizon: Option<DateTime<Utc>>) -> Option<(Window, &mut WindowState)> {
        if let Some(h) = horizon {
            if event.event_time < h {
                self.dropped_late += 1;
                metrics::DROPPED_RECORDS.with_label_values(&["late"]).inc();
                debug!(
                    path = %self.key_field,
                    user = %event.user,
                    event_time = %event.event_time,
                    horizon = %h,
                    "dropping late event"
                );
                return None;
            }
        }
        let window = self.windows.window_of(event.event_time);
        let key = self.key_field.extract(event);
        let state = self.table.get_or_insert_with(key, window, || WindowState::new(key));
        state.sum = state.sum.saturating_add(event.score);
        metrics::EVENTS_PROCESSED
            .with_label_values(&[self.key_field.as_str()])
            .inc();
        Some((window, state))
    }

    pub fn sum(&self, key: &str, window: &Window) -> Option<i64> {
        self.table.get(key, window).map(|s| s.sum)
    }

    pub fn state(&self, key: &str, window: &Window) -> Option<&WindowState> {
        self.table.get(key, window)
    }

    pub fn table(&self) -> &WindowTable<WindowState> {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut WindowTable<WindowState> {
        &mut self.table
    }

    pub fn dropped_late(&self) -> u64 {
        self.dropped_late
    }
}
