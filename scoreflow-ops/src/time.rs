use chrono::{DateTime, Duration, Utc};

/// How far behind the newest event time the watermark trails:
/// `max_observed_event_time - allowed_out_of_orderness`.
#[derive(Debug, Clone, Copy)]
pub struct WatermarkPolicy {
    pub allowed_out_of_orderness: Duration,
}

impl WatermarkPolicy {
    pub fn new(allowed_out_of_orderness: Duration) -> Self {
        Self {
            allowed_out_of_orderness,
        }
    }
}

/// Monotonic watermark derived from observed event times and explicit source watermarks.
#[derive(Debug, Clone)]
pub struct WatermarkClock {
    policy: WatermarkPolicy,
    max_observed: Option<DateTime<Utc>>,
    current: Option<DateTime<Utc>>,
}

impl WatermarkClock {
    pub fn new(policy: WatermarkPolicy) -> Self {
        Self {
            policy,
            max_observed: None,
            current: None,
        }
    }

    /// Record an event time. Returns the new watermark if it advanced.
    pub fn observe(&mut self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let max = self.max_observed.map_or(ts, |m| m.max(ts));
        self.max_observed = Some(max);
        let candidate = max.checked_sub_signed(self.policy.allowed_out_of_orderness)?;
        self.advance_to(candidate)
    }

    /// Move the watermark forward to `wm`. Returns it if it advanced; never regresses.
    pub fn advance_to(&mut self, wm: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.current {
            Some(cur) if wm <= cur => None,
            _ => {
                self.current = Some(wm);
                Some(wm)
            }
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.current
    }
}
