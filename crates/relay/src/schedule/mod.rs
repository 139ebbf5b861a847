//! Schedule parsing and resolution
//!
//! Decides whether and when a sync should spawn a new run.

mod cron;
mod resolver;

pub use cron::{CronError, CronSchedule};
pub use resolver::{NormalizedSchedule, is_due, next_trigger_at, normalize_schedule};
