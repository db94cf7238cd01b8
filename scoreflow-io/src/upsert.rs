use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use scoreflow_core::{Emission, KeyField, Result, Sink, Window};
use tracing::debug;

type Row = (KeyField, String, Window);

/// Table sink: one row per `(path, key, window)`, replaced only by a higher version.
///
/// Clones share the same table, so a handle kept outside the executor can read the result.
#[derive(Clone, Default)]
pub struct UpsertSink {
    rows: Arc<Mutex<BTreeMap<Row, Emission>>>,
    print_on_flush: bool,
}

impl UpsertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Print the final table as JSON lines to stdout when the input ends.
    pub fn printing(mut self) -> Self {
        self.print_on_flush = true;
        self
    }

    /// Apply `e`; returns false when a row with the same or a higher version is present.
    pub fn upsert(&self, e: Emission) -> bool {
        let mut rows = self.rows.lock();
        let key = (e.path, e.key.clone(), e.window);
        if let Some(cur) = rows.get(&key) {
            if !e.supersedes(cur) {
                debug!(key = %e.key, window = %e.window, version = e.version, current = cur.version, "ignoring stale emission");
                return false;
            }
        }
        rows.insert(key, e);
        true
    }

    pub fn get(&self, path: KeyField, key: &str, window: &Window) -> Option<Emission> {
        self.rows.lock().get(&(path, key.to_string(), *window)).cloned()
    }

    /// All rows ordered by path, key and window.
    pub fn rows(&self) -> Vec<Emission> {
        self.rows.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Sink for UpsertSink {
    async fn on_emission(&mut self, emission: Emission) -> Result<()> {
        self.upsert(emission);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.print_on_flush {
            for row in self.rows() {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use scoreflow_core::PaneTiming;

    fn w() -> Window {
        Window::new(
            DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            DateTime::<Utc>::from_timestamp(300, 0).unwrap(),
        )
    }

    fn pane(key: &str, sum: i64, version: u64) -> Emission {
        Emission {
            path: KeyField::Team,
            key: key.into(),
            window: w(),
            sum,
            version,
            timing: if version == 1 { PaneTiming::OnTime } else { PaneTiming::Late },
            is_final: true,
        }
    }

    #[test]
    fn keeps_highest_version_regardless_of_arrival_order() {
        let sink = UpsertSink::new();
        assert!(sink.upsert(pane("red", 160, 2)));
        assert!(!sink.upsert(pane("red", 110, 1)));
        assert!(!sink.upsert(pane("red", 999, 2)));
        assert_eq!(sink.get(KeyField::Team, "red", &w()).map(|e| e.sum), Some(160));
        assert!(sink.upsert(pane("red", 170, 3)));
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn clones_share_rows() {
        let reader = UpsertSink::new();
        let mut writer = reader.clone();
        writer.on_emission(pane("blue", 4, 1)).await.unwrap();
        writer.on_emission(pane("red", 3, 1)).await.unwrap();
        let keys: Vec<_> = reader.rows().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, ["blue", "red"]);
    }
}
