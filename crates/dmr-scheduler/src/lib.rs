//! Admission, in-memory collapse, resource-locked dispatch, and durable
//! follow-up scheduling for the data-mart replicator's task graph.

mod config;
mod error;
mod followup;
mod handler;
mod locks;
mod scheduler;

pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use followup::{FollowUpStore, PostgresFollowUpStore, SqliteFollowUpStore};
pub use handler::{FollowUpScheduler, TaskHandler};
pub use locks::ResourceLocks;
pub use scheduler::{SchedulerState, SchedulingService};
