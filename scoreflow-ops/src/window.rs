use chrono::{DateTime, Duration, Utc};
use scoreflow_core::Window;

/// Fixed, non-overlapping event-time windows of one size, aligned to the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindows {
    size: Duration,
}

impl FixedWindows {
    /// `size` must be at least one millisecond; `EngineConfig::validate` enforces this upstream.
    pub fn of(size: Duration) -> Self {
        let size = if size < Duration::milliseconds(1) {
            Duration::milliseconds(1)
        } else {
            size
        };
        Self { size }
    }

    pub fn size(&self) -> Duration {
        self.size
    }

    /// The window containing `ts`. Depends only on `ts` and the size, never on arrival order.
    pub fn window_of(&self, ts: DateTime<Utc>) -> Window {
        let size_ms = self.size.num_milliseconds();
        let ms = ts.timestamp_millis();
        let start_ms = ms - ms.rem_euclid(size_ms);
        let start = DateTime::<Utc>::from_timestamp_millis(start_ms).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = start.checked_add_signed(self.size).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Window { start, end }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn five_minute_windows_floor_to_boundary() {
        let fw = FixedWindows::of(Duration::minutes(5));
        let w = fw.window_of(at(62_000));
        assert_eq!(w.start, at(0));
        assert_eq!(w.end, at(300_000));
        let w2 = fw.window_of(at(300_000));
        assert_eq!(w2.start, at(300_000));
    }

    #[test]
    fn window_contains_its_timestamp_including_before_epoch() {
        let fw = FixedWindows::of(Duration::seconds(7));
        for ms in [-20_001, -7_000, -1, 0, 1, 6_999, 7_000, 1_700_000_000_123] {
            let t = at(ms);
            let w = fw.window_of(t);
            assert!(w.start <= t && t < w.end, "{ms} not in {w}");
            assert_eq!(w.end - w.start, Duration::seconds(7));
        }
        assert_eq!(fw.window_of(at(-1)).start, at(-7_000));
    }

    #[test]
    fn windows_tile_without_gaps_or_overlaps() {
        let fw = FixedWindows::of(Duration::seconds(10));
        let mut prev = fw.window_of(at(-50_000));
        for step in 1..20 {
            let next = fw.window_of(prev.end);
            assert_eq!(next.start, prev.end);
            assert_eq!(fw.window_of(prev.end - Duration::milliseconds(1)), prev, "step {step}");
            prev = next;
        }
    }

    #[test]
    fn assignment_is_idempotent() {
        let fw = FixedWindows::of(Duration::minutes(1));
        let t = at(1_700_000_012_345);
        let w = fw.window_of(t);
        assert_eq!(fw.window_of(w.start), w);
        assert_eq!(fw.window_of(t), w);
    }

    #[test]
    fn sub_millisecond_timestamps_stay_inside() {
        let fw = FixedWindows::of(Duration::milliseconds(1));
        let t = DateTime::<Utc>::from_timestamp(10, 500_000).unwrap();
        let w = fw.window_of(t);
        assert!(w.contains(t));
    }
}
