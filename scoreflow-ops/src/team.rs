use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use scoreflow_core::{metrics, Emission, EngineConfig, GameEvent, KeyField, Window};
use scoreflow_state::WindowTable;
use tracing::debug;

use crate::spam::Classification;
use crate::windowed_sum::WindowedSum;

/// What one user added to one team in one window, and how the user is currently classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Contribution {
    pub sum: i64,
    pub events: u64,
    pub spammy: bool,
}

type Users = BTreeMap<String, Contribution>;

/// Team path: per-window team sums over the users currently classified normal.
///
/// Every filtered event is kept as a per-user contribution until its window expires, so a
/// new mean can move users in or out of a team sum. Any change re-fires the team's pane.
pub struct TeamScores {
    sums: WindowedSum,
    contributions: WindowTable<Users>,
    allowed_lateness: Duration,
}

impl TeamScores {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            sums: WindowedSum::from_config(KeyField::Team, cfg),
            contributions: WindowTable::new(),
            allowed_lateness: cfg.allowed_lateness,
        }
    }

    /// Record an event the spam filter classified. Returns a pane when the team sum of a
    /// closed window changed.
    pub fn add(&mut self, event: &GameEvent, class: Classification) -> Option<Emission> {
        let window = self.sums.windows().window_of(event.event_time);
        let users = self
            .contributions
            .get_or_insert_with(&event.team, window, BTreeMap::new);
        let c = users.entry(event.user.clone()).or_default();
        c.sum = c.sum.saturating_add(event.score);
        c.events += 1;
        c.spammy = class == Classification::Spammy;
        metrics::EVENTS_PROCESSED
            .with_label_values(&[KeyField::Team.as_str()])
            .inc();
        self.refresh(&event.team, window)
    }

    /// Re-classify every contribution in `window` and re-fire the teams whose sum changed.
    ///
    /// `classify` returns `None` for users it cannot decide yet; they keep their current class.
    pub fn reclassify(
        &mut self,
        window: &Window,
        mut classify: impl FnMut(&str, &Contribution) -> Option<Classification>,
    ) -> Vec<Emission> {
        let mut teams: Vec<String> = match self.contributions.window(window) {
            Some(m) => m.keys().cloned().collect(),
            None => return Vec::new(),
        };
        teams.sort();

        let mut panes = Vec::new();
        for team in teams {
            if let Some(users) = self.contributions.get_mut(&team, window) {
                for (user, c) in users.iter_mut() {
                    if let Some(class) = classify(user.as_str(), &*c) {
                        let spammy = class == Classification::Spammy;
                        if spammy != c.spammy {
                            debug!(team = %team, user = %user, window = %window, spammy, "user reclassified");
                            c.spammy = spammy;
                        }
                    }
                }
            }
            panes.extend(self.refresh(&team, *window));
        }
        panes
    }

    pub fn advance_watermark(&mut self, wm: DateTime<Utc>) -> Vec<Emission> {
        let panes = self.sums.advance_watermark(wm);
        let lateness = self.allowed_lateness;
        self.contributions.expire(|w| w.expiry(lateness) <= wm);
        panes
    }

    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Vec<Emission> {
        self.sums.on_tick(now)
    }

    /// Current team sum, spammy users left out.
    pub fn sum(&self, team: &str, window: &Window) -> Option<i64> {
        self.sums.sum(team, window)
    }

    pub fn contribution(&self, team: &str, user: &str, window: &Window) -> Option<Contribution> {
        self.contributions
            .get(team, window)
            .and_then(|users| users.get(user))
            .copied()
    }

    pub fn state_len(&self) -> usize {
        self.sums.state_len()
    }

    fn refresh(&mut self, team: &str, window: Window) -> Option<Emission> {
        let users = self.contributions.get(team, &window)?;
        let mut any_normal = false;
        let mut sum = 0i64;
        for c in users.values().filter(|c| !c.spammy) {
            any_normal = true;
            sum = sum.saturating_add(c.sum);
        }
        match self.sums.sum(team, &window) {
            Some(cur) if cur == sum => None,
            // a team made only of spammy users never shows up
            None if !any_normal => None,
            _ => self.sums.correct(team, window, sum),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoreflow_core::PaneTiming;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    fn w0() -> Window {
        Window::new(at(0), at(300))
    }

    fn scores(lateness: Duration) -> TeamScores {
        TeamScores::from_config(&EngineConfig::new(Duration::minutes(5)).with_allowed_lateness(lateness))
    }

    #[test]
    fn spammy_contributions_are_kept_but_not_counted() {
        let mut t = scores(Duration::zero());
        assert_eq!(t.add(&GameEvent::new("a", "red", 10, at(1)), Classification::Normal), None);
        t.add(&GameEvent::new("r", "red", 500, at(2)), Classification::Spammy);
        assert_eq!(t.sum("red", &w0()), Some(10));
        assert_eq!(
            t.contribution("red", "r", &w0()),
            Some(Contribution { sum: 500, events: 1, spammy: true })
        );

        // only spammy players: no team state at all
        t.add(&GameEvent::new("s", "blue", 500, at(2)), Classification::Spammy);
        assert_eq!(t.sum("blue", &w0()), None);
        assert_eq!(t.state_len(), 1);
    }

    #[test]
    fn reclassifying_a_closed_window_refires_the_team() {
        let mut t = scores(Duration::minutes(10));
        t.add(&GameEvent::new("a", "red", 10, at(1)), Classification::Normal);
        t.add(&GameEvent::new("r", "red", 300, at(2)), Classification::Normal);
        t.add(&GameEvent::new("s", "blue", 900, at(3)), Classification::Spammy);
        let closed = t.advance_watermark(at(300));
        assert_eq!(closed.len(), 1);
        assert_eq!((closed[0].sum, closed[0].version), (310, 1));

        // r turns spammy, s turns normal
        let panes = t.reclassify(&w0(), |user, _| match user {
            "r" => Some(Classification::Spammy),
            "s" => Some(Classification::Normal),
            _ => None,
        });
        let got: Vec<_> = panes.iter().map(|e| (e.key.as_str(), e.sum, e.version, e.timing)).collect();
        assert_eq!(got, vec![("blue", 900, 1, PaneTiming::Late), ("red", 10, 2, PaneTiming::Late)]);

        // nothing changed: nothing fires
        assert!(t
            .reclassify(&w0(), |user, _| (user == "r").then_some(Classification::Spammy))
            .is_empty());
    }

    #[test]
    fn open_windows_take_the_new_sum_at_close() {
        let mut t = scores(Duration::zero());
        t.add(&GameEvent::new("a", "red", 10, at(1)), Classification::Normal);
        t.add(&GameEvent::new("r", "red", 300, at(2)), Classification::Normal);
        assert!(t.reclassify(&w0(), |u, _| (u == "r").then_some(Classification::Spammy)).is_empty());
        let closed = t.advance_watermark(at(300));
        assert_eq!((closed[0].sum, closed[0].version, closed[0].timing), (10, 1, PaneTiming::OnTime));
        assert_eq!(t.contribution("red", "a", &w0()), None, "expired with zero lateness");
    }
}
