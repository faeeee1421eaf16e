use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::classify::{classify, Thresholds};
use crate::dedup;
use crate::error::IntervalError;
use crate::models::{
    Meeting, NewAttendanceRecord, NewMeeting, NewStudent, RawInterval, RawMeeting, Student,
};
use crate::normalize::{duration_minutes, non_blank, normalize_email, parse_timestamp};
use crate::store::Store;

/// Observable outcome of one sync or import pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub meetings_created: usize,
    pub students_created: usize,
}

impl ReconcileSummary {
    pub fn merge(&mut self, other: ReconcileSummary) {
        self.created += other.created;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
        self.meetings_created += other.meetings_created;
        self.students_created += other.students_created;
    }
}

enum Outcome {
    Staged,
    Duplicate,
}

#[derive(Default)]
struct Batch {
    meetings: HashMap<String, Meeting>,
    students: HashMap<String, Student>,
    known_joins: HashMap<(Uuid, Uuid), Vec<DateTime<Utc>>>,
    staged: Vec<NewAttendanceRecord>,
    summary: ReconcileSummary,
}

/// Turns raw intervals into classified, de-duplicated attendance records.
///
/// Holds no state between calls; every `reconcile` is an independent batch.
pub struct Reconciler<'a, S: ?Sized> {
    store: &'a S,
    thresholds: Thresholds,
}

impl<'a, S> Reconciler<'a, S>
where
    S: Store + ?Sized,
{
    pub fn new(store: &'a S, thresholds: Thresholds) -> Self {
        Self { store, thresholds }
    }

    pub async fn reconcile<I>(&self, intervals: I) -> ReconcileSummary
    where
        I: IntoIterator<Item = RawInterval>,
    {
        let mut batch = Batch::default();

        for raw in intervals {
            match self.stage(&mut batch, &raw).await {
                Ok(Outcome::Staged) => {}
                Ok(Outcome::Duplicate) => {
                    batch.summary.skipped += 1;
                    tracing::debug!(origin = %raw.origin, "skipping duplicate attendance interval");
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to process attendance interval");
                    batch.summary.errors.push(err.to_string());
                }
            }
        }

        self.persist(&mut batch).await;

        let summary = batch.summary;
        tracing::info!(
            created = summary.created,
            skipped = summary.skipped,
            errors = summary.errors.len(),
            meetings_created = summary.meetings_created,
            students_created = summary.students_created,
            "reconciliation batch complete"
        );
        summary
    }

    async fn stage(&self, batch: &mut Batch, raw: &RawInterval) -> Result<Outcome, IntervalError> {
        let origin = raw.origin.as_str();
        let external_id = required(origin, "meeting_id", raw.meeting.external_id.as_deref())?;
        let email =
            normalize_email(required(origin, "student_email", raw.student_email.as_deref())?);
        let join = required(origin, "join_time", raw.join_time.as_deref())?;
        let join_time = timestamp(origin, "join_time", join)?;
        let leave_time = non_blank(raw.leave_time.as_deref())
            .map(|value| timestamp(origin, "leave_time", value))
            .transpose()?;

        let meeting = self.resolve_meeting(batch, origin, external_id, &raw.meeting).await?;
        let student = self.resolve_student(batch, origin, &email, raw).await?;

        let duration = duration_minutes(raw.duration);
        let status = classify(join_time, meeting.start_time, duration, &self.thresholds);

        let key = (meeting.id, student.id);
        if !batch.known_joins.contains_key(&key) {
            let persisted = dedup::persisted_joins(self.store, meeting.id, student.id).await;
            batch.known_joins.insert(key, persisted);
        }
        let known = batch.known_joins.entry(key).or_default();
        if dedup::is_duplicate(join_time, known.iter().copied()) {
            return Ok(Outcome::Duplicate);
        }
        known.push(join_time);

        batch.staged.push(NewAttendanceRecord {
            meeting_id: meeting.id,
            student_id: student.id,
            join_time,
            leave_time,
            duration_minutes: duration,
            status,
        });
        Ok(Outcome::Staged)
    }

    async fn resolve_meeting(
        &self,
        batch: &mut Batch,
        origin: &str,
        external_id: &str,
        raw: &RawMeeting,
    ) -> Result<Meeting, IntervalError> {
        if let Some(meeting) = batch.meetings.get(external_id) {
            return Ok(meeting.clone());
        }

        let found = self
            .store
            .find_by_external_id(external_id)
            .await
            .map_err(|source| store_error(origin, "meeting lookup", source))?;

        let meeting = match found {
            Some(meeting) => meeting,
            None => {
                let schedule = non_blank(raw.start_time.as_deref())
                    .zip(non_blank(raw.end_time.as_deref()));
                let (start, end) = schedule.ok_or_else(|| IntervalError::MissingSchedule {
                    origin: origin.to_string(),
                    external_id: external_id.to_string(),
                })?;
                let new_meeting = NewMeeting {
                    external_id: external_id.to_string(),
                    title: non_blank(raw.title.as_deref()).map(str::to_string),
                    start_time: timestamp(origin, "meeting_start", start)?,
                    end_time: timestamp(origin, "meeting_end", end)?,
                    organizer_email: non_blank(raw.organizer_email.as_deref()).map(normalize_email),
                    join_url: non_blank(raw.join_url.as_deref()).map(str::to_string),
                };
                let meeting = self
                    .store
                    .create_meeting(new_meeting)
                    .await
                    .map_err(|source| store_error(origin, "meeting create", source))?;
                batch.summary.meetings_created += 1;
                tracing::info!(meeting_id = %meeting.id, external_id, "created meeting");
                meeting
            }
        };

        batch.meetings.insert(external_id.to_string(), meeting.clone());
        Ok(meeting)
    }

    async fn resolve_student(
        &self,
        batch: &mut Batch,
        origin: &str,
        email: &str,
        raw: &RawInterval,
    ) -> Result<Student, IntervalError> {
        if let Some(student) = batch.students.get(email) {
            return Ok(student.clone());
        }

        let found = self
            .store
            .find_by_email(email)
            .await
            .map_err(|source| store_error(origin, "student lookup", source))?;

        let student = match found {
            Some(student) => student,
            None => {
                let name = non_blank(raw.student_name.as_deref()).unwrap_or(email);
                let new_student = NewStudent {
                    email: email.to_string(),
                    name: name.to_string(),
                    roster_id: None,
                    identity_id: non_blank(raw.identity_id.as_deref()).map(str::to_string),
                };
                let student = self
                    .store
                    .create_student(new_student)
                    .await
                    .map_err(|source| store_error(origin, "student create", source))?;
                batch.summary.students_created += 1;
                tracing::info!(student_id = %student.id, email, "created student");
                student
            }
        };

        batch.students.insert(email.to_string(), student.clone());
        Ok(student)
    }

    async fn persist(&self, batch: &mut Batch) {
        if batch.staged.is_empty() {
            return;
        }

        match self.store.bulk_create(&batch.staged).await {
            Ok(inserted) => {
                let dropped = batch.staged.len().saturating_sub(inserted.len());
                if dropped > 0 {
                    tracing::warn!(dropped, "bulk insert skipped conflicting attendance rows");
                }
                batch.summary.created += inserted.len();
                batch.summary.skipped += dropped;
            }
            Err(err) => {
                tracing::error!(error = %err, staged = batch.staged.len(), "bulk insert failed");
                batch.summary.errors.push(format!(
                    "bulk insert of {} attendance records failed: {err:#}",
                    batch.staged.len()
                ));
            }
        }
    }
}

fn required<'v>(
    origin: &str,
    field: &'static str,
    value: Option<&'v str>,
) -> Result<&'v str, IntervalError> {
    non_blank(value).ok_or_else(|| IntervalError::MissingField {
        origin: origin.to_string(),
        field,
    })
}

fn timestamp(
    origin: &str,
    field: &'static str,
    value: &str,
) -> Result<DateTime<Utc>, IntervalError> {
    parse_timestamp(value).ok_or_else(|| IntervalError::InvalidTimestamp {
        origin: origin.to_string(),
        field,
        value: value.to_string(),
    })
}

fn store_error(origin: &str, action: &'static str, source: anyhow::Error) -> IntervalError {
    IntervalError::Store {
        origin: origin.to_string(),
        action,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttendanceStatus, RawDuration};
    use crate::store::memory::MemoryStore;
    use crate::store::MeetingStore;
    use chrono::TimeZone;

    fn interval(origin: &str, email: &str, join: &str, minutes: Option<i64>) -> RawInterval {
        RawInterval {
            origin: origin.to_string(),
            meeting: RawMeeting {
                external_id: Some("teams-101".to_string()),
                title: Some("Algebra II".to_string()),
                start_time: Some("2026-03-02T09:00:00Z".to_string()),
                end_time: Some("2026-03-02T10:00:00Z".to_string()),
                organizer_email: Some("instructor@school.edu".to_string()),
                join_url: None,
            },
            student_email: Some(email.to_string()),
            student_name: Some("Avery Lee".to_string()),
            identity_id: None,
            join_time: Some(join.to_string()),
            leave_time: None,
            duration: minutes.map(RawDuration::Minutes),
        }
    }

    fn status_of(store: &MemoryStore, join: DateTime<Utc>) -> AttendanceStatus {
        store
            .records()
            .into_iter()
            .find(|record| record.join_time == join)
            .map(|record| record.status)
            .expect("record exists")
    }

    #[tokio::test]
    async fn classifies_and_creates_entities() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new(&store, Thresholds::live_sync());

        let summary = reconciler
            .reconcile(vec![
                interval("row 1", "avery@school.edu", "2026-03-02T09:10:00Z", Some(45)),
                interval("row 2", "jules@school.edu", "2026-03-02T09:20:00Z", Some(40)),
                interval("row 3", "kiara@school.edu", "2026-03-02T09:02:00Z", Some(3)),
            ])
            .await;

        assert_eq!(summary.created, 3);
        assert_eq!(summary.skipped, 0);
        assert!(summary.errors.is_empty());
        assert_eq!(summary.meetings_created, 1);
        assert_eq!(summary.students_created, 3);

        let at = |m| Utc.with_ymd_and_hms(2026, 3, 2, 9, m, 0).unwrap();
        assert_eq!(status_of(&store, at(10)), AttendanceStatus::Present);
        assert_eq!(status_of(&store, at(20)), AttendanceStatus::Late);
        assert_eq!(status_of(&store, at(2)), AttendanceStatus::Partial);
    }

    #[tokio::test]
    async fn near_simultaneous_joins_in_one_batch_are_skipped() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new(&store, Thresholds::live_sync());

        let summary = reconciler
            .reconcile(vec![
                interval("row 1", "avery@school.edu", "2026-03-02T09:10:00Z", None),
                interval("row 2", "avery@school.edu", "2026-03-02T09:10:30Z", None),
            ])
            .await;

        assert_eq!(summary.created, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn rejoins_outside_window_are_kept() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new(&store, Thresholds::live_sync());

        let summary = reconciler
            .reconcile(vec![
                interval("row 1", "avery@school.edu", "2026-03-02T09:00:00Z", Some(10)),
                interval("row 2", "avery@school.edu", "2026-03-02T09:30:00Z", Some(20)),
            ])
            .await;

        assert_eq!(summary.created, 2);
        assert_eq!(summary.students_created, 1);
    }

    #[tokio::test]
    async fn rerunning_a_batch_creates_nothing() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new(&store, Thresholds::csv_import());
        let batch = vec![
            interval("row 1", "avery@school.edu", "2026-03-02T09:01:00Z", Some(50)),
            interval("row 2", "jules@school.edu", "2026-03-02T09:04:00Z", Some(55)),
        ];

        let first = reconciler.reconcile(batch.clone()).await;
        let second = reconciler.reconcile(batch).await;

        assert_eq!(first.created, 2);
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, first.created);
        assert_eq!(second.meetings_created, 0);
        assert_eq!(second.students_created, 0);
        assert_eq!(store.records().len(), 2);
    }

    #[tokio::test]
    async fn bad_rows_are_reported_and_the_rest_imported() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new(&store, Thresholds::csv_import());

        let mut missing_email = interval("row 2", "", "2026-03-02T09:05:00Z", None);
        missing_email.student_email = None;
        let bad_join = interval("row 3", "kiara@school.edu", "not a time", None);

        let summary = reconciler
            .reconcile(vec![
                interval("row 1", "avery@school.edu", "2026-03-02T09:01:00Z", None),
                missing_email,
                bad_join,
                interval("row 4", "jules@school.edu", "2026-03-02T09:03:00Z", None),
            ])
            .await;

        assert_eq!(summary.created, 2);
        assert_eq!(summary.errors.len(), 2);
        assert!(summary.errors[0].contains("row 2"));
        assert!(summary.errors[0].contains("student_email"));
        assert!(summary.errors[1].contains("invalid timestamp"));
        assert_eq!(summary.students_created, 2);
    }

    #[tokio::test]
    async fn unknown_meeting_without_schedule_is_an_error() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new(&store, Thresholds::live_sync());

        let mut raw = interval("row 1", "avery@school.edu", "2026-03-02T09:01:00Z", None);
        raw.meeting.start_time = None;

        let summary = reconciler.reconcile(vec![raw]).await;

        assert_eq!(summary.created, 0);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("teams-101"));
        assert!(store.meetings().is_empty());
        assert!(store.students().is_empty());
    }

    #[tokio::test]
    async fn known_meeting_keeps_its_stored_schedule() {
        let store = MemoryStore::new();
        store
            .create_meeting(NewMeeting {
                external_id: "teams-101".to_string(),
                title: Some("Algebra II".to_string()),
                start_time: Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
                end_time: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
                organizer_email: None,
                join_url: None,
            })
            .await
            .unwrap();
        let reconciler = Reconciler::new(&store, Thresholds::live_sync());

        let mut raw = interval("row 1", "avery@school.edu", "2026-03-02T09:01:00Z", None);
        raw.meeting.start_time = None;
        raw.meeting.end_time = None;

        let summary = reconciler.reconcile(vec![raw]).await;

        assert_eq!(summary.created, 1);
        assert_eq!(summary.meetings_created, 0);
        let meetings = store.meetings();
        assert_eq!(meetings.len(), 1);
        assert_eq!(meetings[0].start_time, Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap());
        assert_eq!(store.records()[0].status, AttendanceStatus::Late);
    }

    #[tokio::test]
    async fn failed_history_lookup_fails_open() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new(&store, Thresholds::live_sync());
        let batch = vec![interval("row 1", "avery@school.edu", "2026-03-02T09:01:00Z", None)];
        reconciler.reconcile(batch).await;

        store.fail_attendance_lookups(true);
        let summary = reconciler
            .reconcile(vec![interval("row 1", "avery@school.edu", "2026-03-02T09:01:20Z", None)])
            .await;

        assert_eq!(summary.created, 1);
        assert_eq!(summary.skipped, 0);
        assert!(summary.errors.is_empty());
        assert_eq!(store.records().len(), 2);
    }

    #[tokio::test]
    async fn rows_dropped_by_insert_conflict_count_as_skipped() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new(&store, Thresholds::live_sync());
        let join = "2026-03-02T09:01:00Z";
        reconciler
            .reconcile(vec![interval("row 1", "avery@school.edu", join, None)])
            .await;

        // With history unavailable the row is staged and only the insert catches it.
        store.fail_attendance_lookups(true);
        let summary = reconciler
            .reconcile(vec![interval("row 1", "avery@school.edu", join, None)])
            .await;

        assert_eq!(summary.created, 0);
        assert_eq!(summary.skipped, 1);
        assert!(summary.errors.is_empty());
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn failed_student_create_does_not_abort_batch() {
        let store = MemoryStore::new();
        store.fail_student_create_for(Some("jules@school.edu"));
        let reconciler = Reconciler::new(&store, Thresholds::live_sync());

        let summary = reconciler
            .reconcile(vec![
                interval("row 1", "jules@school.edu", "2026-03-02T09:01:00Z", None),
                interval("row 2", "avery@school.edu", "2026-03-02T09:02:00Z", None),
            ])
            .await;

        assert_eq!(summary.created, 1);
        assert_eq!(summary.students_created, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("student create failed"));
    }

    #[tokio::test]
    async fn failed_bulk_insert_is_reported() {
        let store = MemoryStore::new();
        store.fail_bulk_create(true);
        let reconciler = Reconciler::new(&store, Thresholds::live_sync());

        let summary = reconciler
            .reconcile(vec![interval("row 1", "avery@school.edu", "2026-03-02T09:01:00Z", None)])
            .await;

        assert_eq!(summary.created, 0);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("bulk insert of 1"));
        assert_eq!(summary.meetings_created, 1);
    }

    #[tokio::test]
    async fn email_case_and_missing_name_resolve_consistently() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new(&store, Thresholds::live_sync());

        let mut unnamed = interval("row 1", " Avery@School.edu ", "2026-03-02T09:01:00Z", None);
        unnamed.student_name = None;
        let later = interval("row 2", "avery@school.edu", "2026-03-02T09:40:00Z", None);

        let summary = reconciler.reconcile(vec![unnamed, later]).await;

        assert_eq!(summary.created, 2);
        let students = store.students();
        assert_eq!(students.len(), 1);
        assert_eq!(students[0].email, "avery@school.edu");
        assert_eq!(students[0].name, "avery@school.edu");
    }

    #[tokio::test]
    async fn second_durations_are_truncated_before_classifying() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new(&store, Thresholds::live_sync());

        let mut raw = interval("row 1", "avery@school.edu", "2026-03-02T09:00:30Z", None);
        raw.duration = Some(RawDuration::Seconds(299));
        raw.leave_time = Some("2026-03-02T09:05:29Z".to_string());

        reconciler.reconcile(vec![raw]).await;

        let records = store.records();
        assert_eq!(records[0].duration_minutes, Some(4));
        assert_eq!(records[0].status, AttendanceStatus::Partial);
        assert!(records[0].leave_time.is_some());
    }

    #[test]
    fn summaries_merge_field_by_field() {
        let mut total = ReconcileSummary {
            created: 2,
            skipped: 1,
            errors: vec!["row 1: bad".to_string()],
            meetings_created: 1,
            students_created: 2,
        };
        total.merge(ReconcileSummary {
            created: 3,
            skipped: 0,
            errors: vec!["row 9: bad".to_string()],
            meetings_created: 0,
            students_created: 1,
        });

        assert_eq!(total.created, 5);
        assert_eq!(total.skipped, 1);
        assert_eq!(total.errors.len(), 2);
        assert_eq!(total.meetings_created, 1);
        assert_eq!(total.students_created, 3);
    }
}
