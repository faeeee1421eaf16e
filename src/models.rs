use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
    Partial,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(AttendanceStatus::Present),
            "late" => Ok(AttendanceStatus::Late),
            "absent" => Ok(AttendanceStatus::Absent),
            "partial" => Ok(AttendanceStatus::Partial),
            other => anyhow::bail!("unknown attendance status: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Meeting {
    pub id: Uuid,
    pub external_id: String,
    pub title: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub organizer_email: Option<String>,
    pub join_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewMeeting {
    pub external_id: String,
    pub title: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub organizer_email: Option<String>,
    pub join_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Student {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub roster_id: Option<String>,
    pub identity_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewStudent {
    pub email: String,
    pub name: String,
    pub roster_id: Option<String>,
    pub identity_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub meeting_id: Uuid,
    pub student_id: Uuid,
    pub join_time: DateTime<Utc>,
    pub leave_time: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i32>,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAttendanceRecord {
    pub meeting_id: Uuid,
    pub student_id: Uuid,
    pub join_time: DateTime<Utc>,
    pub leave_time: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i32>,
    pub status: AttendanceStatus,
}

/// Meeting metadata as reported by an ingestion source, before validation.
#[derive(Debug, Clone, Default)]
pub struct RawMeeting {
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub organizer_email: Option<String>,
    pub join_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawDuration {
    Seconds(i64),
    Minutes(i64),
}

/// One join-to-leave span for one attendee, exactly as a source reported it.
#[derive(Debug, Clone, Default)]
pub struct RawInterval {
    pub origin: String,
    pub meeting: RawMeeting,
    pub student_email: Option<String>,
    pub student_name: Option<String>,
    pub identity_id: Option<String>,
    pub join_time: Option<String>,
    pub leave_time: Option<String>,
    pub duration: Option<RawDuration>,
}

/// A joined attendance row used for reporting.
#[derive(Debug, Clone)]
pub struct AttendanceRow {
    pub meeting_id: Uuid,
    pub meeting_title: Option<String>,
    pub meeting_start: DateTime<Utc>,
    pub student_id: Uuid,
    pub student_name: String,
    pub student_email: String,
    pub join_time: DateTime<Utc>,
    pub leave_time: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i32>,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub student_id: Option<Uuid>,
    pub meeting_id: Option<Uuid>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub status: Option<AttendanceStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentStats {
    pub total_meetings: i64,
    pub present: i64,
    pub late: i64,
    pub absent: i64,
    pub attendance_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeetingSummary {
    pub meeting: Meeting,
    pub total_attendees: usize,
    pub present: usize,
    pub late: usize,
    pub partial: usize,
}
