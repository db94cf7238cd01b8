use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use scoreflow_core::{metrics, Emission, GameEvent, KeyField, Window};
use scoreflow_state::WindowTable;
use tracing::info;

use crate::side_input::{MeanValue, SideInputView, SnapshotRead};
use crate::team::Contribution;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Normal,
    Spammy,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("side input for window {window} is not available yet")]
pub struct SideInputUnavailable {
    pub window: Window,
}

/// What happened to an event offered to the filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    Keep(GameEvent),
    /// Its user is spammy in the event's window. The event is handed back so a later mean
    /// can count it again.
    Excluded(GameEvent),
    /// Buffered until the window's side input (and the user's sum) is known.
    Deferred,
}

#[derive(Debug, Clone, Copy)]
struct UserSum {
    sum: i64,
    version: u64,
}

/// Excludes events of users whose windowed sum exceeds `score_weight` times the window mean.
pub struct SpamFilter {
    score_weight: f64,
    allowed_lateness: Duration,
    view: SideInputView,
    user_sums: WindowTable<UserSum>,
    flagged: WindowTable<()>,
    deferred: BTreeMap<Window, Vec<GameEvent>>,
    excluded: u64,
}

impl SpamFilter {
    pub fn new(score_weight: f64, view: SideInputView, allowed_lateness: Duration) -> Self {
        Self {
            score_weight,
            allowed_lateness,
            view,
            user_sums: WindowTable::new(),
            flagged: WindowTable::new(),
            deferred: BTreeMap::new(),
            excluded: 0,
        }
    }

    pub fn score_weight(&self) -> f64 {
        self.score_weight
    }

    /// Track the latest per-user sums emitted by the user path.
    pub fn observe_user_sums(&mut self, emissions: &[Emission]) {
        for e in emissions.iter().filter(|e| e.path == KeyField::User) {
            let entry = self
                .user_sums
                .get_or_insert_with(&e.key, e.window, || UserSum { sum: 0, version: 0 });
            if e.version > entry.version {
                *entry = UserSum {
                    sum: e.sum,
                    version: e.version,
                };
            }
        }
    }

    pub fn user_sum(&self, user: &str, window: &Window) -> Option<i64> {
        self.user_sums.get(user, window).map(|u| u.sum)
    }

    /// Spammy iff `user_sum > score_weight * mean` of the same window.
    pub fn classify(&self, user_sum: i64, window: &Window) -> Result<Classification, SideInputUnavailable> {
        match self.view.snapshot_for(window) {
            SnapshotRead::Pending => Err(SideInputUnavailable { window: *window }),
            SnapshotRead::Ready(snap) => Ok(match snap.value {
                MeanValue::NoData => Classification::Normal,
                MeanValue::Mean(mean) if user_sum as f64 > self.score_weight * mean => Classification::Spammy,
                MeanValue::Mean(_) => Classification::Normal,
            }),
        }
    }

    pub fn filter(&mut self, event: GameEvent, window: Window) -> FilterDecision {
        match self.decide(&event, &window) {
            Some((Classification::Normal, _)) => FilterDecision::Keep(event),
            Some((Classification::Spammy, sum)) => {
                self.exclude(&event.user, &window, sum, 1);
                FilterDecision::Excluded(event)
            }
            None => {
                self.deferred.entry(window).or_default().push(event);
                metrics::DEFERRED_EVENTS.inc();
                FilterDecision::Deferred
            }
        }
    }

    /// Re-evaluate the events deferred for `window`. Returns the ones that could be
    /// classified, in arrival order; the rest stay deferred.
    pub fn release(&mut self, window: &Window) -> Vec<(GameEvent, Classification)> {
        let Some(waiting) = self.deferred.remove(window) else {
            return Vec::new();
        };
        metrics::DEFERRED_EVENTS.sub(waiting.len() as i64);
        let mut decided = Vec::new();
        for event in waiting {
            match self.filter(event, *window) {
                FilterDecision::Keep(ev) => decided.push((ev, Classification::Normal)),
                FilterDecision::Excluded(ev) => decided.push((ev, Classification::Spammy)),
                FilterDecision::Deferred => {}
            }
        }
        decided
    }

    /// Classify `user` again for a team contribution it already made in `window`. When the
    /// user turns spammy, the contribution's events count as excluded.
    pub fn reclassify(&mut self, user: &str, window: &Window, contribution: &Contribution) -> Option<Classification> {
        let sum = self.user_sum(user, window)?;
        let class = self.classify(sum, window).ok()?;
        if class == Classification::Spammy && !contribution.spammy {
            self.exclude(user, window, sum, contribution.events);
        }
        Some(class)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.values().map(Vec::len).sum()
    }

    /// Events excluded so far.
    pub fn excluded(&self) -> u64 {
        self.excluded
    }

    pub fn expire(&mut self, wm: DateTime<Utc>) {
        let lateness = self.allowed_lateness;
        self.user_sums.expire(|w| w.expiry(lateness) <= wm);
        self.flagged.expire(|w| w.expiry(lateness) <= wm);
        let gone: Vec<Window> = self
            .deferred
            .keys()
            .filter(|w| w.expiry(lateness) <= wm)
            .copied()
            .collect();
        for w in gone {
            if let Some(events) = self.deferred.remove(&w) {
                metrics::DEFERRED_EVENTS.sub(events.len() as i64);
                metrics::DROPPED_RECORDS
                    .with_label_values(&["side_input_expired"])
                    .inc_by(events.len() as u64);
            }
        }
    }

    fn decide(&self, event: &GameEvent, window: &Window) -> Option<(Classification, i64)> {
        let sum = self.user_sum(&event.user, window)?;
        self.classify(sum, window).ok().map(|c| (c, sum))
    }

    fn exclude(&mut self, user: &str, window: &Window, sum: i64, events: u64) {
        self.excluded += events;
        metrics::SPAMMER_EVENTS.inc_by(events);
        if self.flagged.get(user, window).is_none() {
            self.flagged.get_or_insert_with(user, *window, || ());
            info!(user = %user, score = sum, window = %window, "spammy user detected");
        }
    }
}
