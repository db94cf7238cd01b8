use chrono::{DateTime, Utc};
use scoreflow_core::{metrics, Emission, EngineConfig, GameEvent, KeyField, Window};
use tracing::debug;

use crate::aggregator::{KeyedAggregator, WindowState};
use crate::trigger::{TriggerController, TriggerPolicy};
use crate::window::FixedWindows;

/// Outcome of feeding one event into a [`WindowedSum`].
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    /// Added to its window; carries a pane when the window had already been closed.
    Accepted(Option<Emission>),
    /// Older than the lateness horizon; ignored.
    DroppedLate,
}

/// One aggregation path: a keyed aggregator and the trigger controller governing its emissions.
///
/// The watermark is pushed in from outside so several paths can share one clock.
pub struct WindowedSum {
    aggregator: KeyedAggregator,
    trigger: TriggerController,
}

impl WindowedSum {
    pub fn new(key_field: KeyField, windows: FixedWindows, policy: TriggerPolicy) -> Self {
        Self {
            aggregator: KeyedAggregator::new(key_field, windows),
            trigger: TriggerController::new(policy),
        }
    }

    pub fn from_config(key_field: KeyField, cfg: &EngineConfig) -> Self {
        let mut policy = TriggerPolicy::new(cfg.allowed_lateness);
        policy.early_firing = cfg.early_firing;
        Self::new(key_field, FixedWindows::of(cfg.window_size), policy)
    }

    pub fn path(&self) -> KeyField {
        self.aggregator.key_field()
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.trigger.watermark()
    }

    pub fn windows(&self) -> FixedWindows {
        self.aggregator.windows()
    }

    pub fn ingest(&mut self, event: &GameEvent) -> Ingest {
        let path = self.aggregator.key_field();
        let horizon = self.trigger.lateness_horizon();
        let Some((window, state)) = self.aggregator.ingest(event, horizon) else {
            return Ingest::DroppedLate;
        };
        let pane = self.trigger.on_element(path, &window, state);
        if let Some(p) = &pane {
            count(std::slice::from_ref(p));
        }
        self.report_size();
        Ingest::Accepted(pane)
    }

    /// Overwrite the sum of `(key, window)`, creating the state if needed. No lateness check:
    /// the caller derives the sum from data another path already admitted. Fires a late pane
    /// when the window is already closed.
    pub fn correct(&mut self, key: &str, window: Window, sum: i64) -> Option<Emission> {
        let path = self.aggregator.key_field();
        let state = self
            .aggregator
            .table_mut()
            .get_or_insert_with(key, window, || WindowState::new(key));
        state.sum = sum;
        let pane = self.trigger.on_element(path, &window, state);
        if let Some(p) = &pane {
            count(std::slice::from_ref(p));
        }
        self.report_size();
        pane
    }

    pub fn advance_watermark(&mut self, wm: DateTime<Utc>) -> Vec<Emission> {
        let path = self.aggregator.key_field();
        let adv = self.trigger.on_watermark(path, wm, self.aggregator.table_mut());
        if !adv.expired.is_empty() {
            metrics::EXPIRED_WINDOWS
                .with_label_values(&[path.as_str()])
                .inc_by(adv.expired.len() as u64);
            debug!(path = %path, windows = adv.expired.len(), watermark = %wm, "expired window state");
        }
        count(&adv.emissions);
        self.report_size();
        adv.emissions
    }

    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Vec<Emission> {
        let path = self.aggregator.key_field();
        let panes = self.trigger.on_tick(path, now, self.aggregator.table_mut());
        count(&panes);
        panes
    }

    pub fn sum(&self, key: &str, window: &Window) -> Option<i64> {
        self.aggregator.sum(key, window)
    }

    pub fn state(&self, key: &str, window: &Window) -> Option<&WindowState> {
        self.aggregator.state(key, window)
    }

    /// Live `(key, window)` states.
    pub fn state_len(&self) -> usize {
        self.aggregator.table().len()
    }

    pub fn dropped_late(&self) -> u64 {
        self.aggregator.dropped_late()
    }

    fn report_size(&self) {
        metrics::STATE_SIZE
            .with_label_values(&[self.aggregator.key_field().as_str()])
            .set(self.aggregator.table().len() as i64);
    }
}

fn count(panes: &[Emission]) {
    for p in panes {
        metrics::EMISSIONS
            .with_label_values(&[p.path.as_str(), p.timing.as_str()])
            .inc();
    }
}
