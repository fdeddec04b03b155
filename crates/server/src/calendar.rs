//! Calendar view over scheduled tasks.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use taskd_common::{Task, TaskId, TaskStatus};

use crate::store::ScheduleFilter;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalendarQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub assigned_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: TaskId,
    pub title: String,
    pub start: DateTime<Utc>,
    pub status: TaskStatus,
}

impl CalendarEvent {
    /// Tasks without a due date have no place on the calendar.
    pub fn from_task(task: &Task) -> Option<Self> {
        Some(Self {
            id: task.id,
            title: format!("{} ({})", task.title, task.target),
            start: task.due_at?,
            status: task.status,
        })
    }
}

impl CalendarQuery {
    /// The date range applies only when both bounds parse; a lone or
    /// malformed bound is ignored.
    pub fn to_filter(&self) -> ScheduleFilter {
        let start = self.start.as_deref().and_then(parse_date);
        let end = self.end.as_deref().and_then(parse_date);
        let (start, end) = match (start, end) {
            (Some(start), Some(end)) => (Some(start), Some(end)),
            _ => (None, None),
        };

        ScheduleFilter {
            start,
            end,
            target: self
                .assigned_to
                .as_deref()
                .map(str::trim)
                .filter(|target| !target.is_empty())
                .map(str::to_string),
        }
    }
}

/// Accepts RFC 3339, naive `YYYY-MM-DDTHH:MM[:SS]` (read as UTC) and bare
/// dates (midnight UTC).
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
