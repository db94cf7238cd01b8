use chrono::{DateTime, Duration, Utc};
use scoreflow_core::{Emission, KeyField, PaneTiming, Window};
use scoreflow_state::WindowTable;

use crate::aggregator::{TriggerPhase, WindowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPolicy {
    /// How long after a window's end late events are still accepted and re-emitted.
    pub allowed_lateness: Duration,
    /// Processing-time cadence for speculative results of open windows.
    pub early_firing: Option<Duration>,
}

impl TriggerPolicy {
    pub fn new(allowed_lateness: Duration) -> Self {
        Self {
            allowed_lateness,
            early_firing: None,
        }
    }

    pub fn with_early_firing(mut self, every: Duration) -> Self {
        self.early_firing = Some(every);
        self
    }
}

/// Result of moving the watermark forward.
#[derive(Debug, Default)]
pub struct WatermarkAdvance {
    pub emissions: Vec<Emission>,
    pub expired: Vec<Window>,
}

/// Decides when `(key, window)` sums are emitted: on-time at the watermark, early on ticks,
/// late on every accepted event for a window the watermark already passed.
#[derive(Debug, Clone)]
pub struct TriggerController {
    policy: TriggerPolicy,
    watermark: Option<DateTime<Utc>>,
    last_early_fire: Option<DateTime<Utc>>,
}

impl TriggerController {
    pub fn new(policy: TriggerPolicy) -> Self {
        Self {
            policy,
            watermark: None,
            last_early_fire: None,
        }
    }

    pub fn policy(&self) -> TriggerPolicy {
        self.policy
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// Earliest event time still accepted: `WM - allowed_lateness`.
    pub fn lateness_horizon(&self) -> Option<DateTime<Utc>> {
        self.watermark
            .map(|wm| wm.checked_sub_signed(self.policy.allowed_lateness).unwrap_or(DateTime::<Utc>::MIN_UTC))
    }

    /// Called after an accepted event updated `state`. Fires a late pane if the watermark
    /// already passed the window's end.
    pub fn on_element(&self, path: KeyField, window: &Window, state: &mut WindowState) -> Option<Emission> {
        match self.watermark {
            Some(wm) if window.end <= wm => Some(fire(path, window, state, PaneTiming::Late)),
            _ => None,
        }
    }

    /// Close every window ending at or before `wm`, then expire windows past their lateness.
    pub fn on_watermark(
        &mut self,
        path: KeyField,
        wm: DateTime<Utc>,
        table: &mut WindowTable<WindowState>,
    ) -> WatermarkAdvance {
        if matches!(self.watermark, Some(cur) if wm <= cur) {
            return WatermarkAdvance::default();
        }
        self.watermark = Some(wm);

        let mut emissions = Vec::new();
        for (window, states) in table.ending_by_mut(wm) {
            for state in states.values_mut().filter(|s| !s.closed()) {
                emissions.push(fire(path, window, state, PaneTiming::OnTime));
            }
        }
        sort_panes(&mut emissions);

        let lateness = self.policy.allowed_lateness;
        let expired = table.expire(|w| w.expiry(lateness) <= wm);
        WatermarkAdvance { emissions, expired }
    }

    /// Speculative panes for open windows whose sum changed since their last emission.
    pub fn on_tick(&mut self, path: KeyField, now: DateTime<Utc>, table: &mut WindowTable<WindowState>) -> Vec<Emission> {
        let Some(every) = self.policy.early_firing else {
            return Vec::new();
        };
        if matches!(self.last_early_fire, Some(last) if now - last < every) {
            return Vec::new();
        }
        self.last_early_fire = Some(now);

        let mut emissions = Vec::new();
        for (window, states) in table.open_at_mut(self.watermark) {
            for state in states.values_mut().filter(|s| !s.closed() && s.is_dirty()) {
                emissions.push(fire(path, window, state, PaneTiming::Early));
            }
        }
        sort_panes(&mut emissions);
        emissions
    }
}

fn fire(path: KeyField, window: &Window, state: &mut WindowState, timing: PaneTiming) -> Emission {
    state.version += 1;
    state.last_emitted_sum = Some(state.sum);
    state.phase = match timing {
        PaneTiming::Early => TriggerPhase::EmittedEarly,
        PaneTiming::OnTime | PaneTiming::Late => TriggerPhase::Closed,
    };
    Emission {
        path,
        key: state.key.clone(),
        window: *window,
        sum: state.sum,
        version: state.version,
        timing,
        is_final: timing != PaneTiming::Early,
    }
}

fn sort_panes(panes: &mut [Emission]) {
    panes.sort_by(|a, b| a.window.cmp(&b.window).then_with(|| a.key.cmp(&b.key)));
}
