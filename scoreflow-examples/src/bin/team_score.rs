//! Team scores per 5-minute window with spammy players left out.
//! Run:
//!   cargo run -p scoreflow-examples --bin team_score -- scoreflow-examples/data/game_events.csv
//! Input: headerless CSV `user,team,score,timestamp_ms[,readable_time]`.
//! Without an argument, synthetic events with one robot per run are used instead.

use anyhow::Result;
use chrono::Duration;
use scoreflow_core::{EngineConfig, Executor};
use scoreflow_io::{FileSource, GeneratorSource, UpsertSink};
use scoreflow_ops::NonSpammerTeamScore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cfg = EngineConfig::new(Duration::minutes(5)).with_allowed_lateness(Duration::minutes(10));
    let table = UpsertSink::new();

    let mut exec = Executor::new();
    match std::env::args().nth(1) {
        Some(input) => {
            exec.source(FileSource::csv(input));
        }
        None => {
            let mut generator = GeneratorSource::new(chrono::Utc::now());
            generator.robots = 1;
            generator.events = Some(1_800);
            exec.source(generator);
        }
    }
    exec.operator(NonSpammerTeamScore::new(cfg)?).sink(table.clone());
    exec.run().await?;

    for row in table.rows() {
        println!(
            "{:<16} {}  sum={:<6} version={} ({})",
            row.key,
            row.window,
            row.sum,
            row.version,
            row.timing.as_str()
        );
    }
    Ok(())
}
