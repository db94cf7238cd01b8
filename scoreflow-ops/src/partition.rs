//! Cross-partition combination of per-window means.
//!
//! Each partition runs its own user path and reports a [`PartialMean`] per window. The
//! combiner publishes the merged mean once every partition's watermark passed the window's
//! end, or earlier on an explicit combine tick.
//!
//! `NonSpammerTeamScore` is a single partition and publishes its own means; the combiner is
//! for callers that shard the user path themselves and feed it `SideInputViewBuilder::partial`.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use scoreflow_core::{Error, Result, Window};
use tracing::debug;

use crate::side_input::{PartialMean, SideInputSnapshot, SideInputView};

/// Stable partition index for `key` among `partitions` (at least one).
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % partitions.max(1) as u64) as usize
}

pub struct MeanCombiner {
    watermarks: Vec<Option<DateTime<Utc>>>,
    partials: BTreeMap<Window, Vec<PartialMean>>,
    dirty: BTreeSet<Window>,
    view: SideInputView,
    allowed_lateness: Duration,
}

impl MeanCombiner {
    pub fn new(partitions: usize, view: SideInputView, allowed_lateness: Duration) -> Self {
        Self {
            watermarks: vec![None; partitions.max(1)],
            partials: BTreeMap::new(),
            dirty: BTreeSet::new(),
            view,
            allowed_lateness,
        }
    }

    pub fn partitions(&self) -> usize {
        self.watermarks.len()
    }

    /// Minimum of all partition watermarks; `None` until every partition reported one.
    pub fn barrier(&self) -> Option<DateTime<Utc>> {
        self.watermarks.iter().copied().collect::<Option<Vec<_>>>()?.into_iter().min()
    }

    /// Replace `partition`'s partial for `window`. Publishes right away when the barrier has
    /// already passed the window (a late update); otherwise waits for it.
    pub fn update(
        &mut self,
        partition: usize,
        window: Window,
        partial: PartialMean,
    ) -> Result<Option<Arc<SideInputSnapshot>>> {
        self.check(partition)?;
        let n = self.partitions();
        let slots = self.partials.entry(window).or_insert_with(|| vec![PartialMean::default(); n]);
        slots[partition] = partial;
        if matches!(self.barrier(), Some(b) if window.end <= b) {
            self.dirty.remove(&window);
            return Ok(Some(self.publish(&window)));
        }
        self.dirty.insert(window);
        Ok(None)
    }

    /// Record `partition`'s watermark; publish windows the barrier now covers and expire
    /// those past their lateness.
    pub fn advance(&mut self, partition: usize, wm: DateTime<Utc>) -> Result<Vec<Arc<SideInputSnapshot>>> {
        self.check(partition)?;
        let slot = &mut self.watermarks[partition];
        if matches!(*slot, Some(cur) if wm <= cur) {
            return Ok(Vec::new());
        }
        *slot = Some(wm);

        let Some(barrier) = self.barrier() else {
            return Ok(Vec::new());
        };
        let ready: Vec<Window> = self.dirty.iter().filter(|w| w.end <= barrier).copied().collect();
        for w in &ready {
            self.dirty.remove(w);
        }
        let published = ready.iter().map(|w| self.publish(w)).collect();

        let lateness = self.allowed_lateness;
        self.partials.retain(|w, _| w.expiry(lateness) > barrier);
        self.dirty.retain(|w| w.expiry(lateness) > barrier);
        self.view.retire(barrier, lateness);
        Ok(published)
    }

    /// Publish every pending window now, barrier or not.
    pub fn combine_tick(&mut self) -> Vec<Arc<SideInputSnapshot>> {
        let pending = std::mem::take(&mut self.dirty);
        pending.iter().map(|w| self.publish(w)).collect()
    }

    pub fn merged(&self, window: &Window) -> PartialMean {
        self.partials
            .get(window)
            .map(|slots| slots.iter().fold(PartialMean::default(), |acc, p| acc.merge(*p)))
            .unwrap_or_default()
    }

    fn publish(&self, window: &Window) -> Arc<SideInputSnapshot> {
        let merged = self.merged(window);
        debug!(window = %window, users = merged.count, "publishing combined mean");
        self.view.publish(*window, merged.mean())
    }

    fn check(&self, partition: usize) -> Result<()> {
        if partition < self.partitions() {
            Ok(())
        } else {
            Err(Error::UnknownPartition {
                index: partition,
                partitions: self.partitions(),
            })
        }
    }
}
