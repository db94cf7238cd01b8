use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use scoreflow_core::{Context, Emission, EngineConfig, Executor, GameEvent, KeyField, PaneTiming, Sink, Source, Watermark};
use scoreflow_ops::{MeanValue, NonSpammerTeamScore, SnapshotRead};

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
}

fn engine(lateness: Duration) -> NonSpammerTeamScore {
    NonSpammerTeamScore::new(EngineConfig::new(Duration::minutes(5)).with_allowed_lateness(lateness)).unwrap()
}

fn teams(out: &[Emission]) -> Vec<(String, i64, u64, PaneTiming)> {
    let mut v: Vec<_> = out
        .iter()
        .filter(|e| e.path == KeyField::Team)
        .map(|e| (e.key.clone(), e.sum, e.version, e.timing))
        .collect();
    v.sort();
    v
}

fn mean(p: &NonSpammerTeamScore, window_start: i64) -> f64 {
    let w = scoreflow_ops::FixedWindows::of(Duration::minutes(5)).window_of(at(window_start));
    match p.side_input().snapshot_for(&w) {
        SnapshotRead::Ready(s) => s.value.as_f64().unwrap(),
        SnapshotRead::Pending => panic!("no snapshot for {w}"),
    }
}

#[test]
fn normal_players_close_on_time_and_late_data_refires() {
    let mut p = engine(Duration::minutes(10));
    p.process(GameEvent::new("a", "red", 10, at(30)));
    p.process(GameEvent::new("b", "red", 100, at(60)));

    let out = p.advance_watermark(at(300));
    assert_eq!(teams(&out), vec![("red".into(), 110, 1, PaneTiming::OnTime)]);
    assert!((mean(&p, 0) - 55.0).abs() < 1e-9);

    // the window closes exactly once
    assert!(p.advance_watermark(at(300)).is_empty());

    // c arrives late with 300: the mean moves to 136.67 before c is classified, so c stays normal
    let out = p.process(GameEvent::new("c", "blue", 300, at(90)));
    assert_eq!(teams(&out), vec![("blue".into(), 300, 1, PaneTiming::Late)]);
    assert!((mean(&p, 0) - 410.0 / 3.0).abs() < 1e-9);

    // a scores 50 more late: red re-emits with the new sum and a higher version
    let out = p.process(GameEvent::new("a", "red", 50, at(45)));
    assert_eq!(teams(&out), vec![("red".into(), 160, 2, PaneTiming::Late)]);
    let w = scoreflow_ops::FixedWindows::of(Duration::minutes(5)).window_of(at(0));
    assert_eq!(p.users().sum("a", &w), Some(60));
    assert_eq!(p.spam_filter().excluded(), 0);
}

#[test]
fn late_players_lowering_the_mean_exclude_a_counted_user() {
    let mut p = engine(Duration::minutes(10));
    for (user, score, t) in [("a", 10, 10), ("b", 100, 20), ("r", 300, 30)] {
        p.process(GameEvent::new(user, "red", score, at(t)));
    }
    // mean 136.67, threshold 341.7: r still counts
    let out = p.advance_watermark(at(300));
    assert_eq!(teams(&out), vec![("red".into(), 410, 1, PaneTiming::OnTime)]);

    let mut late = Vec::new();
    for user in ["d", "e", "f"] {
        late.extend(p.process(GameEvent::new(user, "red", 1, at(40))));
    }
    // mean 68.83, threshold 172.1: r is spammy now
    assert!((mean(&p, 0) - 413.0 / 6.0).abs() < 1e-9);
    let last = late.iter().filter(|e| e.path == KeyField::Team).last().unwrap();
    assert_eq!((last.sum, last.timing, last.is_final), (113, PaneTiming::Late, true));
    assert_eq!(teams(&late).first(), Some(&(String::from("red"), 110, 2, PaneTiming::Late)));
    let versions: Vec<u64> = late.iter().filter(|e| e.path == KeyField::Team).map(|e| e.version).collect();
    assert!(versions.windows(2).all(|v| v[0] < v[1]));
    let w = scoreflow_ops::FixedWindows::of(Duration::minutes(5)).window_of(at(0));
    assert_eq!(p.teams().sum("red", &w), Some(113));
    assert_eq!(p.spam_filter().excluded(), 1);
}

#[test]
fn late_high_scorer_raising_the_mean_restores_an_excluded_user() {
    let mut p = engine(Duration::minutes(10));
    for (user, score, t) in [("a", 10, 10), ("b", 10, 20), ("r", 200, 30)] {
        p.process(GameEvent::new(user, "red", score, at(t)));
    }
    // mean 73.33, threshold 183.3: r is left out
    let out = p.advance_watermark(at(300));
    assert_eq!(teams(&out), vec![("red".into(), 20, 1, PaneTiming::OnTime)]);
    assert_eq!(p.spam_filter().excluded(), 1);

    // mean 130, threshold 325: r and h are both normal
    let out = p.process(GameEvent::new("h", "blue", 300, at(40)));
    assert_eq!(
        teams(&out),
        vec![("blue".into(), 300, 1, PaneTiming::Late), ("red".into(), 220, 2, PaneTiming::Late)]
    );
    let w = scoreflow_ops::FixedWindows::of(Duration::minutes(5)).window_of(at(0));
    assert_eq!(p.teams().contribution("red", "r", &w).map(|c| c.spammy), Some(false));
}

#[test]
fn final_pane_uses_the_final_mean_not_an_early_one() {
    let cfg = EngineConfig::new(Duration::minutes(5)).with_early_firing(Duration::seconds(1));
    let mut p = NonSpammerTeamScore::new(cfg).unwrap();
    p.process(GameEvent::new("a", "red", 10, at(10)));
    p.process(GameEvent::new("r", "red", 100, at(20)));
    // early mean 55, threshold 137.5: r counts in the speculative pane
    let early = p.tick(at(1_000));
    assert_eq!(teams(&early), vec![("red".into(), 110, 1, PaneTiming::Early)]);

    // b and c join before the close: mean 28, threshold 70
    p.process(GameEvent::new("b", "red", 1, at(30)));
    p.process(GameEvent::new("c", "red", 1, at(40)));
    let out = p.advance_watermark(at(300));
    let fin = out.iter().find(|e| e.path == KeyField::Team && e.is_final).unwrap();
    assert_eq!((fin.sum, fin.timing), (12, PaneTiming::OnTime));
}

#[test]
fn robot_is_left_out_of_its_team() {
    let mut p = engine(Duration::zero());
    for (user, team, score) in [("a", "red", 10), ("b", "red", 20), ("c", "blue", 30), ("r", "red", 1_000)] {
        p.process(GameEvent::new(user, team, score, at(10)));
    }
    let out = p.advance_watermark(at(300));
    // mean 265, threshold 662.5
    assert_eq!(
        teams(&out),
        vec![("blue".into(), 30, 1, PaneTiming::OnTime), ("red".into(), 30, 1, PaneTiming::OnTime)]
    );
    assert_eq!(p.spam_filter().excluded(), 1);
}

#[test]
fn spam_classification_is_per_window() {
    let mut p = engine(Duration::zero());
    let mut out = Vec::new();
    // r is spammy in the first window only
    for (user, score, t) in [
        ("a", 10, 10),
        ("b", 10, 10),
        ("c", 10, 10),
        ("r", 1_000, 20),
        ("a", 10, 310),
        ("r", 10, 320),
    ] {
        out.extend(p.process(GameEvent::new(user, "red", score, at(t))));
    }
    out.extend(p.advance_watermark(at(600)));
    let red: Vec<_> = out
        .iter()
        .filter(|e| e.path == KeyField::Team)
        .map(|e| (e.window.start, e.sum))
        .collect();
    assert_eq!(red, vec![(at(0), 30), (at(300), 20)]);
    assert_eq!(p.spam_filter().excluded(), 1);
}

#[test]
fn events_behind_the_lateness_horizon_are_dropped() {
    let mut p = engine(Duration::minutes(1));
    p.process(GameEvent::new("a", "red", 10, at(30)));
    p.advance_watermark(at(300));
    assert!(p.process(GameEvent::new("a", "red", 99, at(200))).is_empty());
    assert_eq!(p.users().dropped_late(), 1);
    // still accepted just inside the horizon
    let out = p.process(GameEvent::new("a", "red", 1, at(240)));
    assert_eq!(teams(&out), vec![("red".into(), 11, 2, PaneTiming::Late)]);
}

#[test]
fn state_is_gone_after_lateness() {
    let mut p = engine(Duration::minutes(1));
    p.process(GameEvent::new("a", "red", 10, at(30)));
    p.advance_watermark(at(360));
    assert_eq!(p.users().state_len(), 0);
    assert_eq!(p.teams().state_len(), 0);
    assert!(p.side_input().is_empty());
}

#[test]
fn zero_activity_window_is_no_data() {
    let mut p = engine(Duration::minutes(10));
    p.process(GameEvent::new("a", "red", 0, at(30)));
    let out = p.advance_watermark(at(300));
    assert_eq!(teams(&out), vec![("red".into(), 0, 1, PaneTiming::OnTime)]);
    let w = scoreflow_ops::FixedWindows::of(Duration::minutes(5)).window_of(at(0));
    let SnapshotRead::Ready(snap) = p.side_input().snapshot_for(&w) else {
        panic!("expected a snapshot");
    };
    assert_eq!(snap.value, MeanValue::NoData);
}

struct Events(Vec<GameEvent>);

#[async_trait::async_trait]
impl Source for Events {
    async fn run(&mut self, ctx: &mut dyn Context) -> scoreflow_core::Result<()> {
        for ev in self.0.drain(..) {
            ctx.collect(ev);
        }
        ctx.watermark(Watermark(at(86_400)));
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Collect(Arc<Mutex<Vec<Emission>>>);

#[async_trait::async_trait]
impl Sink for Collect {
    async fn on_emission(&mut self, emission: Emission) -> scoreflow_core::Result<()> {
        self.0.lock().push(emission);
        Ok(())
    }
}

#[tokio::test]
async fn runs_under_the_executor() {
    let sink = Collect::default();
    let events = vec![
        GameEvent::new("a", "red", 3, at(10)),
        GameEvent::new("b", "blue", 4, at(20)),
        GameEvent::new("a", "red", 5, at(400)),
    ];
    let mut exec = Executor::new();
    exec.source(Events(events))
        .operator(engine(Duration::minutes(10)))
        .sink(sink.clone());
    exec.run().await.unwrap();

    let out = sink.0.lock();
    let finals: Vec<_> = out
        .iter()
        .filter(|e| e.is_final)
        .map(|e| (e.key.as_str(), e.window.start, e.sum))
        .collect();
    assert_eq!(finals, vec![("blue", at(0), 4), ("red", at(0), 3), ("red", at(300), 5)]);
}
