use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scoreflow_core::{
    metrics, ConfigError, Emission, EngineConfig, GameEvent, KeyField, Operator, Output, Result, Watermark,
};
use tracing::{debug, instrument};

use crate::side_input::{SideInputView, SideInputViewBuilder};
use crate::spam::{Classification, FilterDecision, SpamFilter};
use crate::team::TeamScores;
use crate::time::{WatermarkClock, WatermarkPolicy};
use crate::windowed_sum::{Ingest, WindowedSum};

/// Team scores per window with spammy users' events left out.
///
/// Every event feeds the user path. Its per-user sums build the side-input mean; the event
/// then counts for its team only while its user is not spammy in that window. Team events
/// wait in the spam filter until the window's user sums and mean are known, and every new
/// mean reclassifies the window's team contributions.
pub struct NonSpammerTeamScore {
    cfg: EngineConfig,
    clock: WatermarkClock,
    users: WindowedSum,
    teams: TeamScores,
    side_input: SideInputViewBuilder,
    spam: SpamFilter,
}

impl NonSpammerTeamScore {
    pub fn new(cfg: EngineConfig) -> std::result::Result<Self, ConfigError> {
        cfg.validate()?;
        let view = SideInputView::new();
        Ok(Self {
            clock: WatermarkClock::new(WatermarkPolicy::new(cfg.allowed_out_of_orderness)),
            users: WindowedSum::from_config(KeyField::User, &cfg),
            teams: TeamScores::from_config(&cfg),
            side_input: SideInputViewBuilder::new(view.clone(), cfg.allowed_lateness),
            spam: SpamFilter::new(cfg.score_weight, view, cfg.allowed_lateness),
            cfg,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Feed one event; returns the panes it caused, including any watermark it advanced.
    pub fn process(&mut self, event: GameEvent) -> Vec<Emission> {
        let mut out = Vec::new();
        let ts = event.event_time;
        match self.users.ingest(&event) {
            Ingest::DroppedLate => return out,
            Ingest::Accepted(Some(pane)) => self.on_user_panes(vec![pane], &mut out),
            Ingest::Accepted(None) => {}
        }

        let window = self.users.windows().window_of(ts);
        match self.spam.filter(event, window) {
            FilterDecision::Keep(ev) => self.to_team(&ev, Classification::Normal, &mut out),
            FilterDecision::Excluded(ev) => self.to_team(&ev, Classification::Spammy, &mut out),
            FilterDecision::Deferred => {}
        }

        if let Some(wm) = self.clock.observe(ts) {
            self.advance(wm, &mut out);
        }
        out
    }

    /// Explicit watermark, e.g. end of a bounded input. Ignored unless it moves forward.
    pub fn advance_watermark(&mut self, wm: DateTime<Utc>) -> Vec<Emission> {
        let mut out = Vec::new();
        if let Some(wm) = self.clock.advance_to(wm) {
            self.advance(wm, &mut out);
        }
        out
    }

    /// Processing-time tick: early panes for open windows.
    ///
    /// Speculative user sums publish an interim mean first, which lets deferred team events
    /// of open windows through before the team panes fire.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Emission> {
        let mut out = Vec::new();
        let early = self.users.on_tick(now);
        self.on_user_panes(early, &mut out);
        out.extend(self.teams.on_tick(now));
        out
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.clock.watermark()
    }

    pub fn side_input(&self) -> SideInputView {
        self.side_input.view()
    }

    pub fn spam_filter(&self) -> &SpamFilter {
        &self.spam
    }

    pub fn users(&self) -> &WindowedSum {
        &self.users
    }

    pub fn teams(&self) -> &TeamScores {
        &self.teams
    }

    fn advance(&mut self, wm: DateTime<Utc>, out: &mut Vec<Emission>) {
        metrics::record_watermark(wm);
        let closed = self.users.advance_watermark(wm);
        self.on_user_panes(closed, out);
        out.extend(self.teams.advance_watermark(wm));
        self.side_input.expire(wm);
        self.spam.expire(wm);
    }

    fn on_user_panes(&mut self, panes: Vec<Emission>, out: &mut Vec<Emission>) {
        if panes.is_empty() {
            return;
        }
        self.spam.observe_user_sums(&panes);
        for snap in self.side_input.on_user_emissions(&panes) {
            let window = snap.valid_window;
            let spam = &mut self.spam;
            out.extend(
                self.teams
                    .reclassify(&window, |user, contribution| spam.reclassify(user, &window, contribution)),
            );
            let released = self.spam.release(&window);
            if !released.is_empty() {
                debug!(window = %window, events = released.len(), version = snap.version, "releasing deferred events");
            }
            for (ev, class) in released {
                self.to_team(&ev, class, out);
            }
        }
        if self.cfg.emit_user_sums {
            out.extend(panes);
        }
    }

    fn to_team(&mut self, event: &GameEvent, class: Classification, out: &mut Vec<Emission>) {
        if let Some(pane) = self.teams.add(event, class) {
            out.push(pane);
        }
    }
}

#[async_trait]
impl Operator for NonSpammerTeamScore {
    #[instrument(name = "team_score_on_element", skip_all)]
    async fn on_element(&mut self, out: &mut dyn Output, event: GameEvent) -> Result<()> {
        for e in self.process(event) {
            out.emit(e);
        }
        Ok(())
    }

    #[instrument(name = "team_score_on_watermark", skip_all)]
    async fn on_watermark(&mut self, out: &mut dyn Output, wm: Watermark) -> Result<()> {
        for e in self.advance_watermark(wm.0) {
            out.emit(e);
        }
        Ok(())
    }

    async fn on_tick(&mut self, out: &mut dyn Output, now: DateTime<Utc>) -> Result<()> {
        for e in self.tick(now) {
            out.emit(e);
        }
        Ok(())
    }
}
