//! Database models

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Not started
    #[default]
    Todo,
    /// Started
    InProgress,
    /// Waiting on something
    Pending,
    /// Finished
    Done,
}

impl TaskStatus {
    /// Column value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "TODO",
            Self::InProgress => "IN_PROGRESS",
            Self::Pending => "PENDING",
            Self::Done => "DONE",
        }
    }

    /// Parse column value
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "TODO" => Ok(Self::Todo),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "PENDING" => Ok(Self::Pending),
            "DONE" => Ok(Self::Done),
            other => Err(Error::Validation(format!("Invalid TaskStatus: {}", other))),
        }
    }
}

/// Task recurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recurrence {
    /// One-off
    #[default]
    None,
    /// Every day
    Daily,
    /// Every week
    Weekly,
    /// Saturdays and Sundays
    Weekends,
    /// Monday to Friday
    Weekdays,
    /// Every month
    Monthly,
}

impl Recurrence {
    /// Column value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Weekends => "WEEKENDS",
            Self::Weekdays => "WEEKDAYS",
            Self::Monthly => "MONTHLY",
        }
    }

    /// Parse column value
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "NONE" => Ok(Self::None),
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "WEEKENDS" => Ok(Self::Weekends),
            "WEEKDAYS" => Ok(Self::Weekdays),
            "MONTHLY" => Ok(Self::Monthly),
            other => Err(Error::Validation(format!("Invalid Recurrence: {}", other))),
        }
    }
}

/// Category record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Category ID (0 = assign on insert)
    pub id: i64,
    /// Title
    pub title: String,
    /// ARGB colour, e.g. 0xFF3F51B5
    pub color: i64,
    /// Position on the category page
    pub category_page_order: i64,
}

/// Task record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task ID (0 = assign on insert)
    pub id: i64,
    /// Owning category
    pub category_id: i64,
    /// Task text
    pub text: String,
    /// Due date
    pub due: Option<NaiveDate>,
    /// Anchor date for recurring tasks
    pub base_date: Option<NaiveDate>,
    /// Position within its category
    pub single_category_page_order: i64,
    /// Position on the all-categories page
    pub all_category_page_order: i64,
    /// Completion date
    pub completed_date: Option<NaiveDate>,
    /// Recurrence rule
    pub recurrence: Recurrence,
    /// Status
    pub status: TaskStatus,
    /// Archived flag
    pub is_archived: bool,
    /// Reminder instant
    pub reminder_time: Option<DateTime<Utc>>,
}

impl Task {
    /// New task with defaults for everything but the required fields
    pub fn new(category_id: i64, text: impl Into<String>, single_category_page_order: i64) -> Self {
        Self {
            id: 0,
            category_id,
            text: text.into(),
            due: None,
            base_date: None,
            single_category_page_order,
            all_category_page_order: 0,
            completed_date: None,
            recurrence: Recurrence::None,
            status: TaskStatus::Todo,
            is_archived: false,
            reminder_time: None,
        }
    }
}

fn unix_epoch() -> NaiveDate {
    DateTime::<Utc>::UNIX_EPOCH.date_naive()
}

/// Date to epoch-day column value
pub fn to_epoch_day(date: NaiveDate) -> i64 {
    (date - unix_epoch()).num_days()
}

/// Epoch-day column value to date
pub fn from_epoch_day(days: i64) -> Option<NaiveDate> {
    unix_epoch().checked_add_signed(chrono::Duration::try_days(days)?)
}

/// Instant to epoch-millis column value
pub fn to_epoch_millis(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

/// Epoch-millis column value to instant
pub fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}
