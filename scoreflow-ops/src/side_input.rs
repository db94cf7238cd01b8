//! Side input: the mean of per-user sums for each window, published as immutable
//! versioned snapshots that downstream stages read without locking.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use scoreflow_core::{metrics, Emission, KeyField, Window};
use scoreflow_state::WindowTable;

/// Mean of the active users' sums, or `NoData` when no user had a nonzero sum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeanValue {
    Mean(f64),
    NoData,
}

impl MeanValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MeanValue::Mean(m) => Some(*m),
            MeanValue::NoData => None,
        }
    }
}

/// Sum and count of active users; combinable across partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartialMean {
    pub sum: i64,
    pub count: u64,
}

impl PartialMean {
    pub fn merge(self, other: PartialMean) -> PartialMean {
        PartialMean {
            sum: self.sum.saturating_add(other.sum),
            count: self.count + other.count,
        }
    }

    pub fn mean(&self) -> MeanValue {
        if self.count == 0 {
            MeanValue::NoData
        } else {
            MeanValue::Mean(self.sum as f64 / self.count as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SideInputSnapshot {
    pub version: u64,
    pub value: MeanValue,
    pub valid_window: Window,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotRead {
    Ready(Arc<SideInputSnapshot>),
    /// Nothing published for the window yet; re-check later.
    Pending,
}

type Cells = BTreeMap<Window, Arc<SideInputSnapshot>>;

/// Shared read handle over the latest snapshot per window. Cloning shares the same cells.
///
/// Writers replace the whole map atomically, so a reader sees either the previous or the
/// next snapshot of a window, never a mix.
#[derive(Clone, Default)]
pub struct SideInputView {
    cells: Arc<ArcSwap<Cells>>,
}

impl SideInputView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_for(&self, window: &Window) -> SnapshotRead {
        match self.cells.load().get(window) {
            Some(snap) => SnapshotRead::Ready(snap.clone()),
            None => SnapshotRead::Pending,
        }
    }

    /// Replace the snapshot of `window` with `value` at the next version. Returns the
    /// snapshot now stored in the view.
    pub fn publish(&self, window: Window, value: MeanValue) -> Arc<SideInputSnapshot> {
        let mut stored = Arc::new(SideInputSnapshot {
            version: 0,
            value,
            valid_window: window,
        });
        // rcu may retry; the snapshot built by the last attempt is the one swapped in
        self.cells.rcu(|current| {
            let mut next = Cells::clone(current);
            let version = current.get(&window).map_or(1, |s| s.version + 1);
            stored = Arc::new(SideInputSnapshot {
                version,
                value,
                valid_window: window,
            });
            next.insert(window, stored.clone());
            next
        });
        metrics::SIDE_INPUT_VERSIONS.inc();
        stored
    }

    /// Drop snapshots of windows whose lateness horizon `wm` has passed. Returns how many went.
    pub fn retire(&self, wm: DateTime<Utc>, allowed_lateness: Duration) -> usize {
        let previous = self.cells.rcu(|current| {
            let mut next = Cells::clone(current);
            next.retain(|w, _| w.expiry(allowed_lateness) > wm);
            next
        });
        previous
            .keys()
            .filter(|w| w.expiry(allowed_lateness) <= wm)
            .count()
    }

    pub fn len(&self) -> usize {
        self.cells.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct UserSum {
    sum: i64,
    version: u64,
}

/// Folds user-path panes into per-window means and publishes them to a [`SideInputView`].
pub struct SideInputViewBuilder {
    user_sums: WindowTable<UserSum>,
    view: SideInputView,
    allowed_lateness: Duration,
}

impl SideInputViewBuilder {
    pub fn new(view: SideInputView, allowed_lateness: Duration) -> Self {
        Self {
            user_sums: WindowTable::new(),
            view,
            allowed_lateness,
        }
    }

    pub fn view(&self) -> SideInputView {
        self.view.clone()
    }

    /// Record the latest sum per user (by pane version). Returns the windows that changed.
    pub fn fold_user_emissions(&mut self, emissions: &[Emission]) -> BTreeSet<Window> {
        let mut touched = BTreeSet::new();
        for e in emissions.iter().filter(|e| e.path == KeyField::User) {
            let entry = self
                .user_sums
                .get_or_insert_with(&e.key, e.window, || UserSum { sum: 0, version: 0 });
            if e.version > entry.version {
                *entry = UserSum {
                    sum: e.sum,
                    version: e.version,
                };
                touched.insert(e.window);
            }
        }
        touched
    }

    /// Fold a batch of user panes and publish one new snapshot per affected window.
    pub fn on_user_emissions(&mut self, emissions: &[Emission]) -> Vec<Arc<SideInputSnapshot>> {
        let touched = self.fold_user_emissions(emissions);
        touched
            .into_iter()
            .map(|w| self.view.publish(w, self.partial(&w).mean()))
            .collect()
    }

    /// Sum and count of users with nonzero activity in `window`.
    pub fn partial(&self, window: &Window) -> PartialMean {
        self.user_sums
            .window(window)
            .map(|users| {
                users
                    .values()
                    .filter(|u| u.sum != 0)
                    .fold(PartialMean::default(), |acc, u| {
                        acc.merge(PartialMean { sum: u.sum, count: 1 })
                    })
            })
            .unwrap_or_default()
    }

    pub fn snapshot_for(&self, window: &Window) -> SnapshotRead {
        self.view.snapshot_for(window)
    }

    /// Forget windows whose lateness horizon `wm` has passed, in the builder and in the view.
    pub fn expire(&mut self, wm: DateTime<Utc>) {
        let lateness = self.allowed_lateness;
        self.user_sums.expire(|w| w.expiry(lateness) <= wm);
        self.view.retire(wm, lateness);
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

    fn pane(user: &str, window: Window, sum: i64, version: u64) -> Emission {
        Emission {
            path: KeyField::User,
            key: user.into(),
            window,
            sum,
            version,
            timing: PaneTiming::OnTime,
            is_final: true,
        }
    }

    fn mean_of(read: SnapshotRead) -> MeanValue {
        match read {
            SnapshotRead::Ready(s) => s.value,
            SnapshotRead::Pending => panic!("snapshot pending"),
        }
    }

    #[test]
    fn pending_until_first_user_pane() {
        let b = SideInputViewBuilder::new(SideInputView::new(), Duration::zero());
        assert_eq!(b.snapshot_for(&w0()), SnapshotRead::Pending);
    }

    #[test]
    fn mean_over_active_users_and_recompute_on_late_pane() {
        let mut b = SideInputViewBuilder::new(SideInputView::new(), Duration::minutes(10));
        let snaps = b.on_user_emissions(&[pane("a", w0(), 10, 1), pane("b", w0(), 100, 1)]);
        assert_eq!(snaps.len(), 1, "one snapshot per window per batch");
        assert_eq!(snaps[0].version, 1);
        assert_eq!(mean_of(b.snapshot_for(&w0())), MeanValue::Mean(55.0));

        let snaps = b.on_user_emissions(&[pane("c", w0(), 300, 1)]);
        assert_eq!(snaps[0].version, 2);
        let m = mean_of(b.snapshot_for(&w0())).as_f64().unwrap();
        assert!((m - 136.666_666).abs() < 1e-3);

        // late re-emission for "a" replaces its sum
        b.on_user_emissions(&[pane("a", w0(), 60, 2)]);
        assert_eq!(mean_of(b.snapshot_for(&w0())), MeanValue::Mean((60.0 + 100.0 + 300.0) / 3.0));
    }

    #[test]
    fn stale_versions_are_ignored() {
        let mut b = SideInputViewBuilder::new(SideInputView::new(), Duration::zero());
        b.on_user_emissions(&[pane("a", w0(), 60, 2)]);
        let snaps = b.on_user_emissions(&[pane("a", w0(), 10, 1)]);
        assert!(snaps.is_empty());
        assert_eq!(b.partial(&w0()), PartialMean { sum: 60, count: 1 });
    }

    #[test]
    fn zero_activity_yields_no_data() {
        let mut b = SideInputViewBuilder::new(SideInputView::new(), Duration::zero());
        b.on_user_emissions(&[pane("a", w0(), 0, 1)]);
        assert_eq!(mean_of(b.snapshot_for(&w0())), MeanValue::NoData);
        assert_eq!(PartialMean::default().mean(), MeanValue::NoData);
    }

    #[test]
    fn windows_are_independent() {
        let w1 = Window::new(at(300), at(600));
        let mut b = SideInputViewBuilder::new(SideInputView::new(), Duration::zero());
        b.on_user_emissions(&[pane("a", w0(), 10, 1), pane("a", w1, 1_000, 1)]);
        assert_eq!(mean_of(b.snapshot_for(&w0())), MeanValue::Mean(10.0));
        assert_eq!(mean_of(b.snapshot_for(&w1)), MeanValue::Mean(1_000.0));
    }

    #[test]
    fn readers_keep_their_snapshot_across_publishes() {
        let view = SideInputView::new();
        view.publish(w0(), MeanValue::Mean(1.0));
        let SnapshotRead::Ready(held) = view.snapshot_for(&w0()) else {
            panic!("expected snapshot");
        };
        let next = view.publish(w0(), MeanValue::Mean(2.0));
        assert_eq!(held.version, 1);
        assert_eq!(held.value, MeanValue::Mean(1.0));
        assert_eq!(next.version, 2);
    }

    #[test]
    fn publish_returns_the_stored_snapshot() {
        let view = SideInputView::new();
        let first = view.publish(w0(), MeanValue::Mean(1.0));
        let SnapshotRead::Ready(read) = view.snapshot_for(&w0()) else {
            panic!("expected snapshot");
        };
        assert!(Arc::ptr_eq(&first, &read));
        let second = view.publish(w0(), MeanValue::Mean(2.0));
        let SnapshotRead::Ready(read) = view.snapshot_for(&w0()) else {
            panic!("expected snapshot");
        };
        assert!(Arc::ptr_eq(&second, &read));
        assert_eq!(second.version, 2);
    }

    #[test]
    fn expire_retires_builder_and_view() {
        let mut b = SideInputViewBuilder::new(SideInputView::new(), Duration::seconds(60));
        b.on_user_emissions(&[pane("a", w0(), 10, 1)]);
        b.expire(at(359));
        assert!(matches!(b.snapshot_for(&w0()), SnapshotRead::Ready(_)));
        b.expire(at(360));
        assert_eq!(b.snapshot_for(&w0()), SnapshotRead::Pending);
        assert!(b.view().is_empty());
    }

    #[test]
    fn view_is_shared_between_clones() {
        let view = SideInputView::new();
        let reader = view.clone();
        view.publish(w0(), MeanValue::Mean(3.0));
        assert!(matches!(reader.snapshot_for(&w0()), SnapshotRead::Ready(_)));
    }

    #[test]
    fn publishing_from_threads_keeps_versions_unique() {
        let view = SideInputView::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let v = view.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        v.publish(w0(), MeanValue::Mean((i * 100 + j) as f64));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let SnapshotRead::Ready(last) = view.snapshot_for(&w0()) else {
            panic!("expected snapshot");
        };
        assert_eq!(last.version, 100);
    }
}
