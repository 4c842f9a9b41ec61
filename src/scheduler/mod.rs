//! Background processing cycles.

pub mod cycle;
pub mod job;
pub mod ticker;

pub use cycle::{CycleReport, CycleScheduler, CycleStatus, HealthReport, HealthStatus};
pub use job::{Job, JobStatus, JobType};
pub use ticker::{CycleSchedule, spawn_cycle_ticker};
