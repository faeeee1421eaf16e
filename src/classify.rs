use chrono::{DateTime, Duration, Utc};

use crate::models::AttendanceStatus;

/// Upper bound for either limit; one day.
pub const MAX_THRESHOLD_MINUTES: i64 = 24 * 60;

/// Lateness and minimum-attendance limits applied to one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub late_after: Duration,
    pub min_attendance: Duration,
}

impl Thresholds {
    /// Limits are clamped to `0..=MAX_THRESHOLD_MINUTES`.
    pub fn new(late_after_minutes: i64, min_attendance_minutes: i64) -> Self {
        Self {
            late_after: bounded_minutes(late_after_minutes),
            min_attendance: bounded_minutes(min_attendance_minutes),
        }
    }

    /// Limits used when pulling attendance reports from the meetings API.
    pub fn live_sync() -> Self {
        Self::new(15, 5)
    }

    /// Limits used for IT-supplied CSV exports.
    pub fn csv_import() -> Self {
        Self::new(10, 30)
    }

    /// Replaces either limit when an override is given.
    pub fn with_overrides(
        self,
        late_after_minutes: Option<i64>,
        min_attendance_minutes: Option<i64>,
    ) -> Self {
        Self {
            late_after: late_after_minutes
                .map(bounded_minutes)
                .unwrap_or(self.late_after),
            min_attendance: min_attendance_minutes
                .map(bounded_minutes)
                .unwrap_or(self.min_attendance),
        }
    }
}

fn bounded_minutes(minutes: i64) -> Duration {
    Duration::minutes(minutes.clamp(0, MAX_THRESHOLD_MINUTES))
}

/// Never yields `Absent`; that status belongs to roster comparison, not intervals.
pub fn classify(
    join_time: DateTime<Utc>,
    meeting_start: DateTime<Utc>,
    duration_minutes: Option<i32>,
    thresholds: &Thresholds,
) -> AttendanceStatus {
    if join_time - meeting_start > thresholds.late_after {
        return AttendanceStatus::Late;
    }

    match duration_minutes {
        Some(minutes) if Duration::minutes(minutes as i64) < thresholds.min_attendance => {
            AttendanceStatus::Partial
        }
        _ => AttendanceStatus::Present,
    }
}
