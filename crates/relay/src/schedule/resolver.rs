//! Schedule validation and trigger resolution

use chrono::{DateTime, Utc};

use super::CronSchedule;
use crate::error::ValidationErrors;
use crate::models::{ScheduleType, SyncDefinition, SyncIntervalUnit, SyncRun};

/// Schedule fields after validation, with the unused group cleared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSchedule {
    pub schedule_type: ScheduleType,
    pub sync_interval: Option<u32>,
    pub sync_interval_unit: Option<SyncIntervalUnit>,
    pub cron_expression: Option<String>,
}

/// Validate raw schedule input
///
/// Fields belonging to the other schedule types are dropped rather than
/// rejected, so an `interval` sync never keeps a stale cron expression.
pub fn normalize_schedule(
    schedule_type: &str,
    sync_interval: Option<u32>,
    sync_interval_unit: Option<&str>,
    cron_expression: Option<&str>,
) -> Result<NormalizedSchedule, ValidationErrors> {
    let Ok(schedule_type) = schedule_type.parse::<ScheduleType>() else {
        return Err(ValidationErrors::single("schedule_type", "invalid schedule type"));
    };

    let mut errors = ValidationErrors::new();
    let mut schedule = NormalizedSchedule {
        schedule_type,
        sync_interval: None,
        sync_interval_unit: None,
        cron_expression: None,
    };

    match schedule_type {
        ScheduleType::Manual => {}
        ScheduleType::Interval => {
            match sync_interval {
                Some(n) if n > 0 => schedule.sync_interval = Some(n),
                Some(_) => errors.add("sync_interval", "must be greater than 0"),
                None => errors.add("sync_interval", "can't be blank"),
            }
            match sync_interval_unit.map(str::parse::<SyncIntervalUnit>) {
                Some(Ok(unit)) => schedule.sync_interval_unit = Some(unit),
                Some(Err(_)) => errors.add("sync_interval_unit", "is not included in the list"),
                None => errors.add("sync_interval_unit", "can't be blank"),
            }
        }
        ScheduleType::CronExpression => match cron_expression.map(str::trim) {
            Some(expr) if !expr.is_empty() => match CronSchedule::parse(expr) {
                Ok(cron) => schedule.cron_expression = Some(cron.to_string()),
                Err(e) => errors.add("cron_expression", format!("is invalid: {}", e.reason)),
            },
            _ => errors.add("cron_expression", "can't be blank"),
        },
    }

    errors.into_result().map(|()| schedule)
}

/// When `sync` should next run, given its most recent run
///
/// Manual syncs never have a trigger time. Interval syncs are due
/// immediately until their first run finishes; an unfinished last run
/// means nothing is due. Cron syncs fire at the first match after the last
/// run was created (or after the sync itself was).
pub fn next_trigger_at(sync: &SyncDefinition, last_run: Option<&SyncRun>) -> Option<DateTime<Utc>> {
    match sync.schedule_type {
        ScheduleType::Manual => None,
        ScheduleType::Interval => {
            let interval = sync.interval()?;
            match last_run {
                None => Some(sync.created_at),
                Some(run) => run.finished_at.map(|finished| finished + interval),
            }
        }
        ScheduleType::CronExpression => {
            let cron = CronSchedule::parse(sync.cron_expression.as_deref()?).ok()?;
            let anchor = last_run.map_or(sync.created_at, |run| run.created_at);
            cron.next_after(anchor)
        }
    }
}

/// Whether `sync` should get a new run at `now`
pub fn is_due(sync: &SyncDefinition, last_run: Option<&SyncRun>, now: DateTime<Utc>) -> bool {
    next_trigger_at(sync, last_run).is_some_and(|at| at <= now)
}
