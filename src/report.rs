use std::collections::HashMap;
use std::fmt::Write;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{AttendanceRow, AttendanceStatus, MeetingSummary, StudentStats};

#[derive(Debug, Clone)]
pub struct StatusMix {
    pub status: AttendanceStatus,
    pub count: usize,
    pub share: f64,
}

#[derive(Debug, Clone)]
pub struct MeetingBreakdown {
    pub title: String,
    pub start: DateTime<Utc>,
    pub attendees: usize,
    pub late: usize,
    pub partial: usize,
}

#[derive(Debug, Clone)]
pub struct StudentPunctuality {
    pub name: String,
    pub email: String,
    pub records: usize,
    pub on_time_rate: f64,
}

pub fn cutoff(since_days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(since_days.max(1))
}

pub fn status_mix(rows: &[AttendanceRow]) -> Vec<StatusMix> {
    let mut counts: HashMap<AttendanceStatus, usize> = HashMap::new();
    for row in rows {
        *counts.entry(row.status).or_insert(0) += 1;
    }

    let total = rows.len();
    let mut mix: Vec<StatusMix> = counts
        .into_iter()
        .map(|(status, count)| StatusMix {
            status,
            count,
            share: if total == 0 {
                0.0
            } else {
                count as f64 * 100.0 / total as f64
            },
        })
        .collect();

    mix.sort_by(|a, b| b.count.cmp(&a.count).then(a.status.as_str().cmp(b.status.as_str())));
    mix
}

pub fn meeting_breakdown(rows: &[AttendanceRow]) -> Vec<MeetingBreakdown> {
    let mut meetings: HashMap<Uuid, MeetingBreakdown> = HashMap::new();

    for row in rows {
        let entry = meetings.entry(row.meeting_id).or_insert_with(|| MeetingBreakdown {
            title: row.meeting_title.clone().unwrap_or_else(|| "Untitled meeting".to_string()),
            start: row.meeting_start,
            attendees: 0,
            late: 0,
            partial: 0,
        });
        entry.attendees += 1;
        match row.status {
            AttendanceStatus::Late => entry.late += 1,
            AttendanceStatus::Partial => entry.partial += 1,
            _ => {}
        }
    }

    let mut values: Vec<MeetingBreakdown> = meetings.into_values().collect();
    values.sort_by(|a, b| b.start.cmp(&a.start));
    values
}

/// Students ordered from the lowest share of on-time (`present`) records.
pub fn punctuality(rows: &[AttendanceRow]) -> Vec<StudentPunctuality> {
    let mut students: HashMap<Uuid, (StudentPunctuality, usize)> = HashMap::new();

    for row in rows {
        let entry = students.entry(row.student_id).or_insert_with(|| {
            (
                StudentPunctuality {
                    name: row.student_name.clone(),
                    email: row.student_email.clone(),
                    records: 0,
                    on_time_rate: 0.0,
                },
                0,
            )
        });
        entry.0.records += 1;
        if row.status == AttendanceStatus::Present {
            entry.1 += 1;
        }
    }

    let mut values: Vec<StudentPunctuality> = students
        .into_values()
        .map(|(mut student, on_time)| {
            student.on_time_rate = on_time as f64 * 100.0 / student.records as f64;
            student
        })
        .collect();

    values.sort_by(|a, b| {
        a.on_time_rate
            .partial_cmp(&b.on_time_rate)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.email.cmp(&b.email))
    });
    values
}

pub fn build_report(scope: Option<&str>, since: DateTime<Utc>, rows: &[AttendanceRow]) -> String {
    let mut output = String::new();
    let scope_label = scope.unwrap_or("all meetings");

    let _ = writeln!(output, "# Attendance Report");
    let _ = writeln!(
        output,
        "Generated for {} (meetings since {})",
        scope_label,
        since.format("%Y-%m-%d")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Status Mix");

    let mix = status_mix(rows);
    if mix.is_empty() {
        let _ = writeln!(output, "No attendance recorded for this window.");
    } else {
        for entry in mix.iter() {
            let _ = writeln!(
                output,
                "- {}: {} records ({:.1}%)",
                entry.status, entry.count, entry.share
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Meetings");

    let meetings = meeting_breakdown(rows);
    if meetings.is_empty() {
        let _ = writeln!(output, "No meetings with attendance in this window.");
    } else {
        for meeting in meetings.iter() {
            let _ = writeln!(
                output,
                "- {} ({}): {} attendees, {} late, {} partial",
                meeting.title,
                meeting.start.format("%Y-%m-%d %H:%M"),
                meeting.attendees,
                meeting.late,
                meeting.partial
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Least Punctual Students");

    let students = punctuality(rows);
    if students.is_empty() {
        let _ = writeln!(output, "No students with attendance in this window.");
    } else {
        for student in students.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} ({}) on time {:.1}% across {} records",
                student.name, student.email, student.on_time_rate, student.records
            );
        }
    }

    output
}

pub fn format_meeting_summary(summary: &MeetingSummary) -> String {
    let mut output = String::new();
    let title = summary.meeting.title.as_deref().unwrap_or("Untitled meeting");

    let _ = writeln!(output, "{} ({})", title, summary.meeting.external_id);
    let _ = writeln!(
        output,
        "Scheduled {} to {}",
        summary.meeting.start_time.format("%Y-%m-%d %H:%M"),
        summary.meeting.end_time.format("%H:%M")
    );
    let _ = writeln!(
        output,
        "{} attendees: {} present, {} late, {} partial",
        summary.total_attendees, summary.present, summary.late, summary.partial
    );
    output
}

pub fn format_student_summary(
    name: &str,
    stats: &StudentStats,
    recent: &[AttendanceRow],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "{name}");
    let _ = writeln!(
        output,
        "{} past meetings: {} present, {} late, {} absent ({:.2}% attended)",
        stats.total_meetings, stats.present, stats.late, stats.absent, stats.attendance_rate
    );

    if recent.is_empty() {
        let _ = writeln!(output, "No attendance recorded.");
    } else {
        let _ = writeln!(output, "Recent attendance:");
        for row in recent.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} on {}: {}",
                row.meeting_title.as_deref().unwrap_or("Untitled meeting"),
                row.meeting_start.format("%Y-%m-%d"),
                row.status
            );
        }
    }
    output
}
