use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scoreflow_core::config::parse_duration_ms;
use scoreflow_core::{ConfigError, Context, GameEvent, Result, Source};
use tracing::{debug, info};

use crate::end_of_input;

/// Deterministic synthetic game events.
///
/// Players are visited round robin, one event per `step` of event time. Robots score about
/// ten times what regular players do. With `late_every = n`, every n-th event is stamped
/// `late_by` in the past. A bounded run ends with an end-of-input watermark; an unbounded one
/// runs until nothing downstream reads anymore.
#[derive(Debug, Clone)]
pub struct GeneratorSource {
    pub teams: usize,
    pub users_per_team: usize,
    pub robots: usize,
    pub events: Option<u64>,
    pub step: Duration,
    pub pace: std::time::Duration,
    pub late_every: Option<u64>,
    pub late_by: Duration,
    pub start: DateTime<Utc>,
}

impl GeneratorSource {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            teams: 3,
            users_per_team: 4,
            robots: 0,
            events: Some(1_000),
            step: Duration::seconds(1),
            pace: std::time::Duration::ZERO,
            late_every: None,
            late_by: Duration::minutes(2),
            start,
        }
    }

    pub fn from_config(cfg: &scoreflow_core::config::GeneratorConfig, start: DateTime<Utc>) -> std::result::Result<Self, ConfigError> {
        let pace_ms = parse_duration_ms(&cfg.pace)?;
        if pace_ms < 0 {
            return Err(ConfigError::InvalidDuration(cfg.pace.clone()));
        }
        Ok(Self {
            teams: cfg.teams.max(1),
            users_per_team: cfg.users_per_team.max(1),
            robots: cfg.robots,
            events: cfg.events,
            step: Duration::milliseconds(parse_duration_ms(&cfg.step)?),
            pace: std::time::Duration::from_millis(pace_ms as u64),
            late_every: cfg.late_every.filter(|n| *n > 0),
            late_by: Duration::milliseconds(parse_duration_ms(&cfg.late_by)?),
            start,
        })
    }

    /// The `i`-th event of the sequence.
    pub fn event(&self, i: u64) -> GameEvent {
        let teams = self.teams.max(1) as u64;
        let regular = (self.teams * self.users_per_team) as u64;
        let slots = regular + self.robots as u64;
        let slot = i % slots.max(1);
        let noise = mix(i);
        let (user, team, score) = if slot < regular {
            let team = slot % teams;
            let user = slot / teams;
            (format!("user{user}_team{team}"), team, 1 + (noise % 20) as i64)
        } else {
            let r = slot - regular;
            let team = r % teams;
            (format!("robot{r}_team{team}"), team, 150 + (noise % 100) as i64)
        };
        let offset = self
            .step
            .checked_mul(i.min(i32::MAX as u64) as i32)
            .unwrap_or(Duration::MAX);
        let mut event_time = self
            .start
            .checked_add_signed(offset)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if matches!(self.late_every, Some(n) if (i + 1) % n == 0) {
            event_time = event_time.checked_sub_signed(self.late_by).unwrap_or(event_time);
        }
        GameEvent::new(user, format!("team{team}"), score, event_time)
    }
}

// splitmix64
fn mix(i: u64) -> u64 {
    let mut z = i.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[async_trait]
impl Source for GeneratorSource {
    async fn run(&mut self, ctx: &mut dyn Context) -> Result<()> {
        let mut max_ts: Option<DateTime<Utc>> = None;
        let mut i = 0u64;
        while self.events.map_or(true, |n| i < n) {
            if ctx.is_closed() {
                debug!(emitted = i, "downstream closed, stopping generator");
                break;
            }
            let ev = self.event(i);
            max_ts = Some(max_ts.map_or(ev.event_time, |m| m.max(ev.event_time)));
            ctx.collect(ev);
            i += 1;
            if !self.pace.is_zero() {
                tokio::time::sleep(self.pace).await;
            } else if i % 1024 == 0 {
                tokio::task::yield_now().await;
            }
        }
        if self.events.is_some() {
            if let Some(m) = max_ts {
                ctx.watermark(end_of_input(m));
            }
        }
        info!(events = i, "generator finished");
        Ok(())
    }
}
