//! Ranking and aggregation jobs over the competition store.

pub mod aggregate;
pub mod config;
pub mod counters;
pub mod grouping;
pub mod jobs;
pub mod rank;
pub mod report;
pub mod scheduler;

pub use config::{ScheduleEntry, ScheduleFile, StatsConfig};
pub use counters::{apply_counter_event, read_counters, CounterEvent, CounterValue};
pub use grouping::{Dimension, GroupKey, GroupTable, Window};
pub use jobs::{EngineConfig, Job, JobError, JobSummary, StatsEngine, EPOCHS_DOCUMENT};
pub use rank::{rank_pumpkins, RankTable};
pub use scheduler::{build_scheduler, maybe_build_scheduler};

pub const CRATE_NAME: &str = "pumpkin-stats";
