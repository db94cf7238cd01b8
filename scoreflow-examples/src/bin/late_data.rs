//! Walks through on-time, late and too-late data for one 5-minute window.
//! Run:
//!   cargo run -p scoreflow-examples --bin late_data

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use scoreflow_core::{Emission, EngineConfig, GameEvent};
use scoreflow_ops::{NonSpammerTeamScore, SnapshotRead};

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_447_718_400 + secs, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn show(step: &str, panes: &[Emission]) {
    println!("{step}");
    if panes.is_empty() {
        println!("    (nothing emitted)");
    }
    for p in panes {
        println!(
            "    {} {:<6} {} sum={} v{} {}{}",
            p.path,
            p.key,
            p.window,
            p.sum,
            p.version,
            p.timing.as_str(),
            if p.is_final { "" } else { " (speculative)" }
        );
    }
}

fn main() -> Result<()> {
    let cfg = EngineConfig::new(Duration::minutes(5))
        .with_allowed_lateness(Duration::minutes(10))
        .with_user_sums();
    let mut p = NonSpammerTeamScore::new(cfg)?;

    show("a scores 10 at 0:00:30", &p.process(GameEvent::new("a", "red", 10, at(30))));
    show("b scores 100 at 0:01:00", &p.process(GameEvent::new("b", "red", 100, at(60))));
    show("watermark reaches 0:05", &p.advance_watermark(at(300)));

    let window = scoreflow_ops::FixedWindows::of(Duration::minutes(5)).window_of(at(0));
    if let SnapshotRead::Ready(snap) = p.side_input().snapshot_for(&window) {
        println!("    mean for {} is {:?} (snapshot v{})", window, snap.value, snap.version);
    }

    show("c scores 300 late, at 0:01:30", &p.process(GameEvent::new("c", "blue", 300, at(90))));
    show("a scores 50 more, late, at 0:00:45", &p.process(GameEvent::new("a", "red", 50, at(45))));
    show("watermark reaches 0:15", &p.advance_watermark(at(900)));
    show("a scores again at 0:00:50, beyond the allowed lateness", &p.process(GameEvent::new("a", "red", 1, at(50))));
    println!("dropped as too late: {}", p.users().dropped_late());
    Ok(())
}
