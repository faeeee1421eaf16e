use std::io::Read;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::classify::Thresholds;
use crate::models::{RawDuration, RawInterval, RawMeeting};
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::store::Store;

/// Column layout of the IT department's attendance export.
pub const COLUMNS: [&str; 9] = [
    "meeting_id",
    "meeting_title",
    "meeting_start",
    "meeting_end",
    "student_email",
    "student_name",
    "join_time",
    "leave_time",
    "duration_minutes",
];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CsvRow {
    meeting_id: Option<String>,
    meeting_title: Option<String>,
    meeting_start: Option<String>,
    meeting_end: Option<String>,
    student_email: Option<String>,
    student_name: Option<String>,
    join_time: Option<String>,
    leave_time: Option<String>,
    duration_minutes: Option<String>,
}

impl CsvRow {
    fn into_interval(self, origin: String) -> RawInterval {
        RawInterval {
            origin,
            meeting: RawMeeting {
                external_id: self.meeting_id,
                title: self.meeting_title,
                start_time: self.meeting_start,
                end_time: self.meeting_end,
                organizer_email: None,
                join_url: None,
            },
            student_email: self.student_email,
            student_name: self.student_name,
            identity_id: None,
            join_time: self.join_time,
            leave_time: self.leave_time,
            duration: self.duration_minutes.as_deref().and_then(parse_minutes),
        }
    }
}

#[derive(Debug, Default)]
pub struct CsvBatch {
    pub intervals: Vec<RawInterval>,
    pub errors: Vec<String>,
}

/// Unparseable values are treated as an unknown duration.
fn parse_minutes(value: &str) -> Option<RawDuration> {
    let value = value.trim();
    if let Ok(minutes) = value.parse::<i64>() {
        return Some(RawDuration::Minutes(minutes));
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|minutes| minutes.is_finite())
        .map(|minutes| RawDuration::Minutes(minutes.trunc() as i64))
}

/// Reads every row into a raw interval; rows the CSV reader itself rejects are
/// returned as errors instead.
pub fn parse_csv<R: Read>(input: R) -> anyhow::Result<CsvBatch> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(input);

    let headers = reader.headers().context("failed to read CSV header")?.clone();
    let missing: Vec<&str> = COLUMNS
        .iter()
        .copied()
        .filter(|column| !matches!(*column, "leave_time" | "duration_minutes"))
        .filter(|column| !headers.iter().any(|header| header == *column))
        .collect();
    if !missing.is_empty() {
        anyhow::bail!("CSV header is missing columns: {}", missing.join(", "));
    }

    let mut batch = CsvBatch::default();
    for result in reader.records() {
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                let line = err
                    .position()
                    .map(|position| position.line())
                    .unwrap_or_default();
                batch.errors.push(format!("row {line}: unreadable CSV record: {err}"));
                continue;
            }
        };
        let line = record
            .position()
            .map(|position| position.line())
            .unwrap_or_default();
        let origin = format!("row {line}");

        if record.iter().all(|field| field.is_empty()) {
            continue;
        }

        match record.deserialize::<CsvRow>(Some(&headers)) {
            Ok(row) => batch.intervals.push(row.into_interval(origin)),
            Err(err) => batch.errors.push(format!("{origin}: {err}")),
        }
    }

    tracing::info!(
        rows = batch.intervals.len(),
        rejected = batch.errors.len(),
        "parsed attendance CSV"
    );
    Ok(batch)
}

pub async fn import_csv<S, R>(
    store: &S,
    input: R,
    thresholds: Thresholds,
) -> anyhow::Result<ReconcileSummary>
where
    S: Store + ?Sized,
    R: Read,
{
    let batch = parse_csv(input)?;
    let mut summary = Reconciler::new(store, thresholds).reconcile(batch.intervals).await;
    summary.errors.splice(0..0, batch.errors);
    Ok(summary)
}

pub async fn import_file<S>(
    store: &S,
    path: &Path,
    thresholds: Thresholds,
) -> anyhow::Result<ReconcileSummary>
where
    S: Store + ?Sized,
{
    let file =
        std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    tracing::info!(path = %path.display(), "importing attendance CSV");
    import_csv(store, file, thresholds).await
}
