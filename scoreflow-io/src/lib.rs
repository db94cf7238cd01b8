//! scoreflow-io: sources and sinks.
//! - `FileSource`: reads game events from JSONL or headerless CSV
//! - `GeneratorSource`: deterministic synthetic events, optionally with robots and late data
//! - `FileSink`: writes emissions as JSON lines to stdout or a file
//! - `UpsertSink`: keeps the highest version per `(path, key, window)`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scoreflow_core::{metrics, ConfigError, Context, Emission, GameEvent, Result, Sink, Source, Watermark};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{info, warn};

pub mod generator;
pub mod upsert;

pub use generator::GeneratorSource;
pub use upsert::UpsertSink;

/// Supported file formats for `FileSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// One JSON object per line: `user`, `team`, `score`, `event_time` (epoch ms or RFC3339).
    Jsonl,
    /// Headerless `user,team,score,timestamp_ms[,readable_time]`.
    Csv,
}

impl FileFormat {
    pub fn parse(s: &str) -> std::result::Result<Self, ConfigError> {
        match s {
            "jsonl" => Ok(FileFormat::Jsonl),
            "csv" => Ok(FileFormat::Csv),
            other => Err(ConfigError::Unsupported {
                what: "source format",
                kind: other.to_string(),
            }),
        }
    }
}

/// Why an input line could not become a [`GameEvent`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid utf-8 in csv row: {0}")]
    CsvUtf8(#[from] csv::FromUtf8Error),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid score `{0}`")]
    BadScore(String),
    #[error("invalid timestamp `{0}`")]
    BadTimestamp(String),
}

/// Far-future watermark that flushes every window once a bounded input ended.
pub fn end_of_input(max_ts: DateTime<Utc>) -> Watermark {
    Watermark(
        max_ts
            .checked_add_signed(Duration::days(365 * 100))
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    )
}

fn extract_event_time(v: &serde_json::Value) -> std::result::Result<DateTime<Utc>, ParseError> {
    match v.get("event_time") {
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| ParseError::BadTimestamp(n.to_string())),
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| ParseError::BadTimestamp(s.clone())),
        Some(other) => Err(ParseError::BadTimestamp(other.to_string())),
        None => Err(ParseError::MissingField("event_time")),
    }
}

fn str_field<'a>(v: &'a serde_json::Value, name: &'static str) -> std::result::Result<&'a str, ParseError> {
    v.get(name).and_then(|x| x.as_str()).ok_or(ParseError::MissingField(name))
}

pub fn parse_json_event(line: &str) -> std::result::Result<GameEvent, ParseError> {
    let v: serde_json::Value = serde_json::from_str(line)?;
    let score = match v.get("score") {
        Some(s) => s.as_i64().ok_or_else(|| ParseError::BadScore(s.to_string()))?,
        None => return Err(ParseError::MissingField("score")),
    };
    Ok(GameEvent::new(
        str_field(&v, "user")?,
        str_field(&v, "team")?,
        score,
        extract_event_time(&v)?,
    ))
}

pub fn parse_csv_record(row: &csv::StringRecord) -> std::result::Result<GameEvent, ParseError> {
    let field = |i: usize, name: &'static str| row.get(i).map(str::trim).ok_or(ParseError::MissingField(name));
    let user = field(0, "user")?;
    let team = field(1, "team")?;
    let score = field(2, "score")?;
    let score: i64 = score.parse().map_err(|_| ParseError::BadScore(score.to_string()))?;
    let ts = field(3, "timestamp_ms")?;
    let event_time = ts
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| ParseError::BadTimestamp(ts.to_string()))?;
    Ok(GameEvent::new(user, team, score, event_time))
}

fn skip(path: &Path, line: u64, err: &ParseError) {
    metrics::DROPPED_RECORDS.with_label_values(&["parse"]).inc();
    warn!(file = %path.display(), line, error = %err, "skipping unparsable input");
}

/// Reads a game event file and emits its events, then an end-of-input watermark.
pub struct FileSource {
    pub path: PathBuf,
    pub format: FileFormat,
    skipped: u64,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, format: FileFormat) -> Self {
        Self {
            path: path.into(),
            format,
            skipped: 0,
        }
    }

    pub fn jsonl(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FileFormat::Jsonl)
    }

    pub fn csv(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FileFormat::Csv)
    }

    /// Lines skipped as unparsable in the last run.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn accept(ctx: &mut dyn Context, max_ts: &mut Option<DateTime<Utc>>, ev: GameEvent) {
        *max_ts = Some(max_ts.map_or(ev.event_time, |m| m.max(ev.event_time)));
        ctx.collect(ev);
    }
}

#[async_trait]
impl Source for FileSource {
    async fn run(&mut self, ctx: &mut dyn Context) -> Result<()> {
        self.skipped = 0;
        let mut max_ts: Option<DateTime<Utc>> = None;
        match self.format {
            FileFormat::Jsonl => {
                let mut reader = tokio::io::BufReader::new(tokio::fs::File::open(&self.path).await?);
                let mut buf = Vec::new();
                let mut n = 0u64;
                loop {
                    if reader.read_until(b'\n', &mut buf).await? == 0 {
                        break;
                    }
                    n += 1;
                    let parsed = String::from_utf8(std::mem::take(&mut buf))
                        .map_err(ParseError::from)
                        .and_then(|line| match line.trim() {
                            "" => Ok(None),
                            l => parse_json_event(l).map(Some),
                        });
                    match parsed {
                        Ok(None) => {}
                        Ok(Some(ev)) => Self::accept(ctx, &mut max_ts, ev),
                        Err(e) => {
                            self.skipped += 1;
                            skip(&self.path, n, &e);
                        }
                    }
                }
            }
            FileFormat::Csv => {
                let bytes = tokio::fs::read(&self.path).await?;
                let mut rdr = csv::ReaderBuilder::new()
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(bytes.as_slice());
                for (i, row) in rdr.byte_records().enumerate() {
                    let parsed = row
                        .map_err(ParseError::from)
                        .and_then(|r| csv::StringRecord::from_byte_record(r).map_err(ParseError::from))
                        .and_then(|r| parse_csv_record(&r));
                    match parsed {
                        Ok(ev) => Self::accept(ctx, &mut max_ts, ev),
                        Err(e) => {
                            self.skipped += 1;
                            skip(&self.path, i as u64 + 1, &e);
                        }
                    }
                }
            }
        }
        if let Some(m) = max_ts {
            ctx.watermark(end_of_input(m));
        }
        info!(file = %self.path.display(), skipped = self.skipped, "finished reading input");
        Ok(())
    }
}

/// Writes each emission as a single JSON line to stdout or a file.
pub struct FileSink {
    pub path: Option<PathBuf>,
    file: Option<tokio::io::BufWriter<tokio::fs::File>>,
}

impl FileSink {
    pub fn stdout() -> Self {
        Self { path: None, file: None }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            file: None,
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn on_emission(&mut self, emission: Emission) -> Result<()> {
        let line = serde_json::to_string(&emission)?;
        let Some(p) = &self.path else {
            println!("{}", line);
            return Ok(());
        };
        if self.file.is_none() {
            let f = tokio::fs::OpenOptions::new().create(true).append(true).open(p).await?;
            self.file = Some(tokio::io::BufWriter::new(f));
        }
        if let Some(f) = self.file.as_mut() {
            f.write_all(line.as_bytes()).await?;
            f.write_all(b"\n").await?;
            metrics::BYTES_WRITTEN
                .with_label_values(&["file_sink"])
                .inc_by((line.len() + 1) as u64);
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(f) = self.file.as_mut() {
            f.flush().await?;
        }
        Ok(())
    }
}
