use std::io::Write;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::models::AttendanceRow;

const MISSING: &str = "N/A";

#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    student_name: &'a str,
    student_email: &'a str,
    meeting_title: &'a str,
    meeting_start: String,
    join_time: String,
    leave_time: String,
    duration_minutes: String,
    status: &'static str,
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl<'a> From<&'a AttendanceRow> for ExportRow<'a> {
    fn from(row: &'a AttendanceRow) -> Self {
        Self {
            student_name: &row.student_name,
            student_email: &row.student_email,
            meeting_title: row.meeting_title.as_deref().unwrap_or(MISSING),
            meeting_start: timestamp(row.meeting_start),
            join_time: timestamp(row.join_time),
            leave_time: row
                .leave_time
                .map(timestamp)
                .unwrap_or_else(|| MISSING.to_string()),
            duration_minutes: row
                .duration_minutes
                .map(|minutes| minutes.to_string())
                .unwrap_or_else(|| MISSING.to_string()),
            status: row.status.as_str(),
        }
    }
}

/// Writes the report rows as CSV with a header line, even when there are no rows.
pub fn write_csv<W: Write>(output: W, rows: &[AttendanceRow]) -> anyhow::Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(output);

    writer.write_record([
        "Student Name",
        "Student Email",
        "Meeting Title",
        "Meeting Start",
        "Join Time",
        "Leave Time",
        "Duration (minutes)",
        "Status",
    ])?;
    for row in rows {
        writer.serialize(ExportRow::from(row))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn export_file(path: &Path, rows: &[AttendanceRow]) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    write_csv(file, rows)?;
    tracing::info!(path = %path.display(), rows = rows.len(), "exported attendance CSV");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    use crate::models::AttendanceStatus;

    fn row(leave: bool, duration: Option<i32>) -> AttendanceRow {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        AttendanceRow {
            meeting_id: Uuid::new_v4(),
            meeting_title: Some("Biology, Lab".to_string()),
            meeting_start: start,
            student_id: Uuid::new_v4(),
            student_name: "Avery Lee".to_string(),
            student_email: "avery@school.edu".to_string(),
            join_time: start + chrono::Duration::minutes(5),
            leave_time: leave.then(|| start + chrono::Duration::minutes(59)),
            duration_minutes: duration,
            status: AttendanceStatus::Present,
        }
    }

    fn render(rows: &[AttendanceRow]) -> String {
        let mut buffer = Vec::new();
        write_csv(&mut buffer, rows).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn exports_header_and_quoted_fields() {
        let output = render(&[row(true, Some(54))]);
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(
            lines[0],
            "Student Name,Student Email,Meeting Title,Meeting Start,\
             Join Time,Leave Time,Duration (minutes),Status"
        );
        assert_eq!(
            lines[1],
            "Avery Lee,avery@school.edu,\"Biology, Lab\",2026-03-02T09:00:00.000Z,\
             2026-03-02T09:05:00.000Z,2026-03-02T09:59:00.000Z,54,present"
        );
    }

    #[test]
    fn missing_values_export_as_placeholder() {
        let mut missing = row(false, None);
        missing.meeting_title = None;

        let output = render(&[missing]);
        let fields: Vec<&str> = output.lines().nth(1).unwrap().split(',').collect();

        assert_eq!(fields[2], "N/A");
        assert_eq!(fields[5], "N/A");
        assert_eq!(fields[6], "N/A");
    }

    #[test]
    fn empty_export_still_has_header() {
        let output = render(&[]);
        assert_eq!(output.lines().count(), 1);
    }
}
