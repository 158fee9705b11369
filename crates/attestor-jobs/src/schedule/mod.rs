//! Recurring automations: the runner and the per-type handlers it fires.

mod handlers;
mod runner;

pub use handlers::{EnqueueJobHandler, HealthCheckHandler, ScheduleHandler, ScheduleHandlers};
pub use runner::ScheduleRunner;
