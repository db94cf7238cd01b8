//! scoreflow-ops: windowing, triggers and the spam-filtered team score pipeline.
//!
//! Building blocks:
//! - `FixedWindows`: tumbling event-time windows
//! - `WatermarkClock`: monotonic watermark from event times and explicit marks
//! - `KeyedAggregator` + `TriggerController` = `WindowedSum`, one per key field
//! - `SideInputView` / `SideInputViewBuilder`: versioned per-window mean snapshots
//! - `SpamFilter`: classifies users scoring far above the window mean as spammy
//! - `TeamScores`: team sums over normal users, recomputed when the mean moves
//! - `MeanCombiner`: merges per-partition partial means behind a watermark barrier
//! - `NonSpammerTeamScore`: the full operator, usable with `scoreflow_core::Executor`

pub mod aggregator;
pub mod partition;
pub mod pipeline;
pub mod side_input;
pub mod spam;
pub mod team;
pub mod time;
pub mod trigger;
pub mod window;
pub mod windowed_sum;

pub use aggregator::{KeyedAggregator, TriggerPhase, WindowState};
pub use partition::{partition_for, MeanCombiner};
pub use pipeline::NonSpammerTeamScore;
pub use side_input::{MeanValue, PartialMean, SideInputSnapshot, SideInputView, SideInputViewBuilder, SnapshotRead};
pub use spam::{Classification, FilterDecision, SideInputUnavailable, SpamFilter};
pub use team::{Contribution, TeamScores};
pub use time::{WatermarkClock, WatermarkPolicy};
pub use trigger::{TriggerController, TriggerPolicy, WatermarkAdvance};
pub use window::FixedWindows;
pub use windowed_sum::{Ingest, WindowedSum};

pub mod prelude {
    pub use super::{
        Classification, FixedWindows, MeanValue, NonSpammerTeamScore, SideInputView, SnapshotRead, SpamFilter,
        TeamScores, WindowedSum,
    };
}
