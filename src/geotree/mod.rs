//! Geo-aware scheduling tree: a mutable slow form and a compact,
//! array-based fast form built from it (§4.9, §4.10).

pub mod fast;
pub mod priority;
pub mod slow;

pub use fast::{FastTree, LevelRange};
pub use priority::{BranchKey, ScheduleMode};
pub use slow::{GeoTree, LeafInfo, LeafState};
