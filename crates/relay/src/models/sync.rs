//! Sync definition: a scheduled pairing of source, model and destination

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{ConnectorId, JsonMap, ModelId};
use crate::error::ParseEnumError;

/// Unique identifier for a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncId(pub i64);

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a sync decides when to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Manual,
    Interval,
    CronExpression,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Manual => "manual",
            ScheduleType::Interval => "interval",
            ScheduleType::CronExpression => "cron_expression",
        }
    }
}

impl FromStr for ScheduleType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ScheduleType::Manual),
            "interval" => Ok(ScheduleType::Interval),
            "cron_expression" => Ok(ScheduleType::CronExpression),
            other => Err(ParseEnumError::new("schedule type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncIntervalUnit {
    Minutes,
    Hours,
    Days,
}

impl SyncIntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncIntervalUnit::Minutes => "minutes",
            SyncIntervalUnit::Hours => "hours",
            SyncIntervalUnit::Days => "days",
        }
    }

    /// `amount` of this unit as a duration
    pub fn duration(&self, amount: u32) -> Duration {
        let amount = i64::from(amount);
        match self {
            SyncIntervalUnit::Minutes => Duration::minutes(amount),
            SyncIntervalUnit::Hours => Duration::hours(amount),
            SyncIntervalUnit::Days => Duration::days(amount),
        }
    }
}

impl FromStr for SyncIntervalUnit {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minutes" => Ok(SyncIntervalUnit::Minutes),
            "hours" => Ok(SyncIntervalUnit::Hours),
            "days" => Ok(SyncIntervalUnit::Days),
            other => Err(ParseEnumError::new("sync interval unit", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    FullRefresh,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::FullRefresh => "full_refresh",
            SyncMode::Incremental => "incremental",
        }
    }
}

impl FromStr for SyncMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_refresh" => Ok(SyncMode::FullRefresh),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(ParseEnumError::new("sync mode", other)),
        }
    }
}

/// Activation state of a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Created, destination connectivity not yet checked
    #[default]
    Pending,
    /// Eligible for scheduled runs
    Active,
    Disabled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Active => "active",
            SyncStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "active" => Ok(SyncStatus::Active),
            "disabled" => Ok(SyncStatus::Disabled),
            other => Err(ParseEnumError::new("sync status", other)),
        }
    }
}

/// A configured pairing of one source, one model and one destination stream
///
/// Exactly one schedule field group is populated, matching `schedule_type`:
/// `sync_interval` + `sync_interval_unit` for interval syncs,
/// `cron_expression` for cron syncs, neither for manual syncs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDefinition {
    pub id: SyncId,
    pub workspace_id: i64,
    pub source_id: ConnectorId,
    pub destination_id: ConnectorId,
    pub model_id: ModelId,
    pub status: SyncStatus,
    pub schedule_type: ScheduleType,
    pub sync_interval: Option<u32>,
    pub sync_interval_unit: Option<SyncIntervalUnit>,
    pub cron_expression: Option<String>,
    /// Destination catalog stream receiving the records
    pub stream_name: String,
    pub sync_mode: SyncMode,
    /// Incremental watermark column
    pub cursor_field: Option<String>,
    /// Highest cursor value written so far; `None` until the first incremental run
    pub current_cursor_field: Option<String>,
    pub configuration: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub discarded_at: Option<DateTime<Utc>>,
}

impl SyncDefinition {
    pub fn is_discarded(&self) -> bool {
        self.discarded_at.is_some()
    }

    /// Interval between runs, for interval syncs
    pub fn interval(&self) -> Option<Duration> {
        match (self.schedule_type, self.sync_interval, self.sync_interval_unit) {
            (ScheduleType::Interval, Some(amount), Some(unit)) => Some(unit.duration(amount)),
            _ => None,
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.sync_mode == SyncMode::Incremental
    }
}

/// Caller input for creating or updating a sync
///
/// Enumerated fields arrive as raw strings so that unknown values are
/// reported as validation errors instead of deserialization failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncParams {
    pub workspace_id: i64,
    pub source_id: i64,
    pub destination_id: i64,
    pub model_id: i64,
    pub schedule_type: String,
    pub sync_interval: Option<u32>,
    pub sync_interval_unit: Option<String>,
    pub cron_expression: Option<String>,
    pub stream_name: String,
    pub sync_mode: Option<String>,
    pub cursor_field: Option<String>,
    pub configuration: JsonMap,
}
