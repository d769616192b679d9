//! Task, parameter, resource-key, and group types shared by the data-mart
//! replicator's queue consumer, scheduler, and server crates.

mod error;
mod group;
mod params;
mod resource;
mod scheduled;
mod signature;
mod stats;
mod task;

pub use error::{Error, Result};
pub use group::{GroupState, TaskGroup};
pub use params::{ListBuilder, MapBuilder, ParamMap, ParamsBuilder, ParamValue};
pub use resource::ResourceKey;
pub use scheduled::ScheduledTask;
pub use signature::{canonical_params, signature};
pub use stats::{StatValue, Statistics};
pub use task::{Task, TaskBuilder, TaskGroupId, TaskId, TaskState};
