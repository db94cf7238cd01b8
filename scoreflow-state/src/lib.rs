//! scoreflow-state: state layer.
//! Provides `WindowTable`, the per-window keyed state owned by one partition.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use scoreflow_core::Window;

/// Keyed state grouped by window. At most one `S` per `(key, window)`.
///
/// Windows are created lazily on first insert and removed as a whole by [`WindowTable::expire`].
#[derive(Debug, Clone)]
pub struct WindowTable<S> {
    windows: BTreeMap<Window, HashMap<String, S>>,
    len: usize,
}

impl<S> Default for WindowTable<S> {
    fn default() -> Self {
        Self {
            windows: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<S> WindowTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str, window: &Window) -> Option<&S> {
        self.windows.get(window).and_then(|m| m.get(key))
    }

    pub fn get_mut(&mut self, key: &str, window: &Window) -> Option<&mut S> {
        self.windows.get_mut(window).and_then(|m| m.get_mut(key))
    }

    pub fn get_or_insert_with(&mut self, key: &str, window: Window, init: impl FnOnce() -> S) -> &mut S {
        let keyed = self.windows.entry(window).or_default();
        match keyed.entry(key.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                self.len += 1;
                v.insert(init())
            }
        }
    }

    pub fn window(&self, window: &Window) -> Option<&HashMap<String, S>> {
        self.windows.get(window)
    }

    pub fn contains_window(&self, window: &Window) -> bool {
        self.windows.contains_key(window)
    }

    pub fn windows(&self) -> impl Iterator<Item = &Window> {
        self.windows.keys()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Window, &mut HashMap<String, S>)> {
        self.windows.iter_mut()
    }

    /// Windows whose end is at or before `t`, in time order.
    pub fn ending_by_mut(&mut self, t: DateTime<Utc>) -> impl Iterator<Item = (&Window, &mut HashMap<String, S>)> {
        self.windows.iter_mut().filter(move |(w, _)| w.end <= t)
    }

    /// Windows still open at `t` (end after `t`).
    pub fn open_at_mut(&mut self, t: Option<DateTime<Utc>>) -> impl Iterator<Item = (&Window, &mut HashMap<String, S>)> {
        self.windows
            .iter_mut()
            .filter(move |(w, _)| t.map_or(true, |t| w.end > t))
    }

    /// Remove every window for which `is_expired` holds. Returns the removed windows.
    pub fn expire(&mut self, mut is_expired: impl FnMut(&Window) -> bool) -> Vec<Window> {
        let gone: Vec<Window> = self.windows.keys().filter(|w| is_expired(w)).copied().collect();
        for w in &gone {
            if let Some(keyed) = self.windows.remove(w) {
                self.len -= keyed.len();
            }
        }
        gone
    }

    /// Number of live `(key, window)` states.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(start: i64, end: i64) -> Window {
        Window::new(
            DateTime::<Utc>::from_timestamp(start, 0).unwrap(),
            DateTime::<Utc>::from_timestamp(end, 0).unwrap(),
        )
    }

    #[test]
    fn one_state_per_key_and_window() {
        let mut t: WindowTable<i64> = WindowTable::new();
        *t.get_or_insert_with("a", w(0, 60), || 0) += 5;
        *t.get_or_insert_with("a", w(0, 60), || 0) += 2;
        *t.get_or_insert_with("a", w(60, 120), || 0) += 1;
        *t.get_or_insert_with("b", w(0, 60), || 0) += 1;
        assert_eq!(t.len(), 3);
        assert_eq!(t.window_count(), 2);
        assert_eq!(t.get("a", &w(0, 60)), Some(&7));
        assert_eq!(t.get("b", &w(60, 120)), None);
    }

    #[test]
    fn ending_by_selects_closed_windows_only() {
        let mut t: WindowTable<i64> = WindowTable::new();
        t.get_or_insert_with("a", w(0, 60), || 1);
        t.get_or_insert_with("a", w(60, 120), || 2);
        let cutoff = DateTime::<Utc>::from_timestamp(60, 0).unwrap();
        let closed: Vec<Window> = t.ending_by_mut(cutoff).map(|(w, _)| *w).collect();
        assert_eq!(closed, vec![w(0, 60)]);
        let open: Vec<Window> = t.open_at_mut(Some(cutoff)).map(|(w, _)| *w).collect();
        assert_eq!(open, vec![w(60, 120)]);
    }

    #[test]
    fn expire_drops_whole_windows_and_tracks_len() {
        let mut t: WindowTable<i64> = WindowTable::new();
        t.get_or_insert_with("a", w(0, 60), || 1);
        t.get_or_insert_with("b", w(0, 60), || 1);
        t.get_or_insert_with("a", w(60, 120), || 1);
        let gone = t.expire(|win| win.end <= DateTime::<Utc>::from_timestamp(60, 0).unwrap());
        assert_eq!(gone, vec![w(0, 60)]);
        assert_eq!(t.len(), 1);
        assert!(!t.contains_window(&w(0, 60)));
    }
}
