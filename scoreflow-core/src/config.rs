use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_SCORE_WEIGHT: f64 = 2.5;

/// Startup validation failures. Any of these rejects the pipeline before an event is read.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("window_size must be positive, got {0}ms")]
    NonPositiveWindow(i64),
    #[error("allowed_lateness must not be negative, got {0}ms")]
    NegativeLateness(i64),
    #[error("allowed_out_of_orderness must not be negative, got {0}ms")]
    NegativeOutOfOrderness(i64),
    #[error("early_firing must be positive, got {0}ms")]
    NonPositiveEarlyFiring(i64),
    #[error("score_weight must be a finite non-negative number, got {0}")]
    InvalidScoreWeight(f64),
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    #[error("unsupported {what} kind: {kind}")]
    Unsupported { what: &'static str, kind: String },
    #[error("{0}")]
    Missing(&'static str),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    pub kind: String, // "file" | "generator"
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_format")]
    pub format: String, // "jsonl" | "csv"
}

fn default_format() -> String {
    "jsonl".into()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GeneratorConfig {
    #[serde(default = "default_teams")]
    pub teams: usize,
    #[serde(default = "default_users_per_team")]
    pub users_per_team: usize,
    /// Users that score far above everyone else.
    #[serde(default)]
    pub robots: usize,
    /// Number of events; unbounded when absent.
    #[serde(default)]
    pub events: Option<u64>,
    /// Event-time distance between consecutive events, e.g. "1s".
    #[serde(default = "default_step")]
    pub step: String,
    /// Wall-clock pause between events; "0ms" replays as fast as possible.
    #[serde(default = "default_pace")]
    pub pace: String,
    /// Every n-th event is emitted late.
    #[serde(default)]
    pub late_every: Option<u64>,
    #[serde(default = "default_late_by")]
    pub late_by: String,
}

fn default_teams() -> usize {
    3
}
fn default_users_per_team() -> usize {
    4
}
fn default_step() -> String {
    "1s".into()
}
fn default_pace() -> String {
    "0ms".into()
}
fn default_late_by() -> String {
    "2m".into()
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            teams: default_teams(),
            users_per_team: default_users_per_team(),
            robots: 0,
            events: None,
            step: default_step(),
            pace: default_pace(),
            late_every: None,
            late_by: default_late_by(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimeConfig {
    pub window_size: String,      // e.g., "5m"
    pub allowed_lateness: String, // e.g., "10m"
    #[serde(default = "default_out_of_orderness")]
    pub allowed_out_of_orderness: String,
    #[serde(default)]
    pub early_firing: Option<String>,
}

fn default_out_of_orderness() -> String {
    "0s".into()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SpamConfig {
    #[serde(default = "default_score_weight")]
    pub score_weight: f64,
}

fn default_score_weight() -> f64 {
    DEFAULT_SCORE_WEIGHT
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            score_weight: DEFAULT_SCORE_WEIGHT,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SinkConfig {
    pub kind: String, // "stdout" | "file" | "table"
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub emit_user_sums: bool,
    pub source: SourceConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    pub time: TimeConfig,
    #[serde(default)]
    pub spam: SpamConfig,
    pub sink: SinkConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.source.kind.as_str() {
            "file" => {
                if self.source.path.is_none() {
                    return Err(ConfigError::Missing("source.path must be set for a file source"));
                }
                if self.source.format != "jsonl" && self.source.format != "csv" {
                    return Err(ConfigError::Unsupported {
                        what: "source format",
                        kind: self.source.format.clone(),
                    });
                }
            }
            "generator" => {
                parse_duration_ms(&self.generator.step)?;
                parse_duration_ms(&self.generator.pace)?;
                parse_duration_ms(&self.generator.late_by)?;
            }
            other => {
                return Err(ConfigError::Unsupported {
                    what: "source",
                    kind: other.to_string(),
                })
            }
        }
        match self.sink.kind.as_str() {
            "stdout" | "table" => {}
            "file" => {
                if self.sink.path.is_none() {
                    return Err(ConfigError::Missing("sink.path must be set for a file sink"));
                }
            }
            other => {
                return Err(ConfigError::Unsupported {
                    what: "sink",
                    kind: other.to_string(),
                })
            }
        }
        self.engine()?;
        Ok(())
    }

    pub fn engine(&self) -> Result<EngineConfig, ConfigError> {
        let early_firing = match &self.time.early_firing {
            Some(s) => Some(Duration::milliseconds(parse_duration_ms(s)?)),
            None => None,
        };
        let cfg = EngineConfig {
            window_size: Duration::milliseconds(parse_duration_ms(&self.time.window_size)?),
            allowed_lateness: Duration::milliseconds(parse_duration_ms(&self.time.allowed_lateness)?),
            allowed_out_of_orderness: Duration::milliseconds(parse_duration_ms(
                &self.time.allowed_out_of_orderness,
            )?),
            early_firing,
            score_weight: self.spam.score_weight,
            streaming: self.streaming,
            emit_user_sums: self.emit_user_sums,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Typed engine settings derived from [`PipelineConfig`] or built directly.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub window_size: Duration,
    pub allowed_lateness: Duration,
    pub allowed_out_of_orderness: Duration,
    /// Processing-time cadence of speculative results while a window is open.
    pub early_firing: Option<Duration>,
    pub score_weight: f64,
    pub streaming: bool,
    pub emit_user_sums: bool,
}

impl EngineConfig {
    pub fn new(window_size: Duration) -> Self {
        Self {
            window_size,
            allowed_lateness: Duration::zero(),
            allowed_out_of_orderness: Duration::zero(),
            early_firing: None,
            score_weight: DEFAULT_SCORE_WEIGHT,
            streaming: false,
            emit_user_sums: false,
        }
    }

    pub fn with_allowed_lateness(mut self, d: Duration) -> Self {
        self.allowed_lateness = d;
        self
    }

    pub fn with_out_of_orderness(mut self, d: Duration) -> Self {
        self.allowed_out_of_orderness = d;
        self
    }

    pub fn with_early_firing(mut self, d: Duration) -> Self {
        self.early_firing = Some(d);
        self
    }

    pub fn with_score_weight(mut self, w: f64) -> Self {
        self.score_weight = w;
        self
    }

    pub fn with_user_sums(mut self) -> Self {
        self.emit_user_sums = true;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size <= Duration::zero() {
            return Err(ConfigError::NonPositiveWindow(self.window_size.num_milliseconds()));
        }
        if self.allowed_lateness < Duration::zero() {
            return Err(ConfigError::NegativeLateness(self.allowed_lateness.num_milliseconds()));
        }
        if self.allowed_out_of_orderness < Duration::zero() {
            return Err(ConfigError::NegativeOutOfOrderness(
                self.allowed_out_of_orderness.num_milliseconds(),
            ));
        }
        if let Some(every) = self.early_firing {
            if every <= Duration::zero() {
                return Err(ConfigError::NonPositiveEarlyFiring(every.num_milliseconds()));
            }
        }
        if !self.score_weight.is_finite() || self.score_weight < 0.0 {
            return Err(ConfigError::InvalidScoreWeight(self.score_weight));
        }
        Ok(())
    }
}

pub fn parse_duration_ms(s: &str) -> Result<i64, ConfigError> {
    // very small parser for values like "10s", "500ms", "2m"
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());
    let (num, factor) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1_000)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, 3_600_000)
    } else {
        // default assume seconds
        (s, 1_000)
    };
    let n = num.trim().parse::<i64>().map_err(|_| invalid())?;
    n.checked_mul(factor).ok_or_else(invalid)
}
