use anyhow::Context;
use chrono::{Duration, Utc};
use serde::Serialize;

use crate::classify::Thresholds;
use crate::graph::{intervals_from_records, MeetingSource};
use crate::models::RawMeeting;
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::store::Store;

pub const MAX_DAYS_BACK: i64 = 30;

#[derive(Debug, Default, Serialize)]
pub struct RecentSync {
    pub meetings_found: usize,
    pub meetings_failed: usize,
    pub summary: ReconcileSummary,
}

/// Pulls every attendance report of one online meeting and reconciles each
/// report as its own batch.
pub async fn sync_meeting<S, G>(
    store: &S,
    source: &G,
    user_id: &str,
    meeting_id: &str,
    thresholds: Thresholds,
) -> anyhow::Result<ReconcileSummary>
where
    S: Store + ?Sized,
    G: MeetingSource + ?Sized,
{
    tracing::info!(meeting_id, "starting attendance sync");

    let known = store
        .find_by_external_id(meeting_id)
        .await
        .with_context(|| format!("failed to look up meeting {meeting_id}"))?;

    let meeting = match known {
        Some(_) => RawMeeting {
            external_id: Some(meeting_id.to_string()),
            ..RawMeeting::default()
        },
        None => source
            .online_meeting(user_id, meeting_id)
            .await
            .with_context(|| format!("failed to fetch meeting {meeting_id}"))?
            .to_raw(),
    };

    let reports = source
        .attendance_reports(user_id, meeting_id)
        .await
        .with_context(|| format!("failed to fetch attendance reports for {meeting_id}"))?;

    let mut summary = ReconcileSummary::default();
    if reports.is_empty() {
        tracing::warn!(meeting_id, "no attendance reports found");
        return Ok(summary);
    }

    let reconciler = Reconciler::new(store, thresholds);
    for report in reports {
        match source.attendance_records(user_id, meeting_id, &report.id).await {
            Ok(records) => {
                let intervals = intervals_from_records(&meeting, records);
                summary.merge(reconciler.reconcile(intervals).await);
            }
            Err(err) => {
                tracing::error!(
                    report_id = %report.id,
                    error = %err,
                    "failed to fetch attendance records"
                );
                summary
                    .errors
                    .push(format!("attendance report {}: {err}", report.id));
            }
        }
    }

    tracing::info!(meeting_id, "completed attendance sync");
    Ok(summary)
}

/// Syncs every online meeting the user had in the last `days_back` days.
pub async fn sync_recent<S, G>(
    store: &S,
    source: &G,
    user_id: &str,
    days_back: i64,
    thresholds: Thresholds,
) -> anyhow::Result<RecentSync>
where
    S: Store + ?Sized,
    G: MeetingSource + ?Sized,
{
    let days_back = days_back.clamp(1, MAX_DAYS_BACK);
    let end = Utc::now();
    let start = end - Duration::days(days_back);
    tracing::info!(%start, %end, "syncing recent meetings");

    let meetings = source
        .online_meetings_between(user_id, start, end)
        .await
        .context("failed to list recent meetings")?;

    let mut result = RecentSync {
        meetings_found: meetings.len(),
        ..RecentSync::default()
    };

    for meeting in meetings {
        match sync_meeting(store, source, user_id, &meeting.id, thresholds).await {
            Ok(summary) => result.summary.merge(summary),
            Err(err) => {
                tracing::error!(meeting_id = %meeting.id, error = %err, "failed to sync meeting");
                result.meetings_failed += 1;
                result.summary.errors.push(format!("meeting {}: {err:#}", meeting.id));
            }
        }
    }

    tracing::info!(
        meetings = result.meetings_found,
        failed = result.meetings_failed,
        "completed syncing recent meetings"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::DateTime;

    use crate::graph::{
        AttendanceInterval, AttendanceRecord, AttendanceReport, GraphError, Identity, OnlineMeeting,
    };
    use crate::models::AttendanceStatus;
    use crate::store::memory::MemoryStore;

    #[derive(Default)]
    struct FakeGraph {
        meetings: HashMap<String, OnlineMeeting>,
        reports: HashMap<String, Vec<String>>,
        records: HashMap<String, Vec<AttendanceRecord>>,
        metadata_calls: AtomicUsize,
    }

    impl FakeGraph {
        fn with_meeting(mut self, id: &str, start: &str) -> Self {
            self.meetings.insert(
                id.to_string(),
                OnlineMeeting {
                    id: id.to_string(),
                    subject: Some(format!("Meeting {id}")),
                    start_date_time: Some(start.to_string()),
                    end_date_time: Some("2026-03-02T10:00:00Z".to_string()),
                    join_web_url: Some(format!("https://teams.example/{id}")),
                    participants: None,
                },
            );
            self
        }

        fn with_report(
            mut self,
            meeting_id: &str,
            report_id: &str,
            records: Vec<AttendanceRecord>,
        ) -> Self {
            self.reports
                .entry(meeting_id.to_string())
                .or_default()
                .push(report_id.to_string());
            self.records.insert(report_id.to_string(), records);
            self
        }
    }

    fn attendee(email: &str, spans: &[(&str, i64)]) -> AttendanceRecord {
        AttendanceRecord {
            email_address: Some(email.to_string()),
            identity: Some(Identity {
                id: Some(format!("aad-{email}")),
                display_name: Some(email.split('@').next().unwrap_or(email).to_string()),
            }),
            attendance_intervals: spans
                .iter()
                .map(|(join, seconds)| AttendanceInterval {
                    join_date_time: Some(join.to_string()),
                    leave_date_time: None,
                    duration_in_seconds: Some(*seconds),
                })
                .collect(),
        }
    }

    fn avery(join: &str, seconds: i64) -> Vec<AttendanceRecord> {
        vec![attendee("avery@school.edu", &[(join, seconds)])]
    }

    async fn sync(store: &MemoryStore, graph: &FakeGraph, meeting_id: &str) -> ReconcileSummary {
        sync_meeting(store, graph, "instructor@school.edu", meeting_id, Thresholds::live_sync())
            .await
            .unwrap()
    }

    fn not_found() -> GraphError {
        GraphError::Api {
            status: 404,
            body: "not found".to_string(),
        }
    }

    #[async_trait]
    impl MeetingSource for FakeGraph {
        async fn online_meeting(
            &self,
            _user_id: &str,
            meeting_id: &str,
        ) -> Result<OnlineMeeting, GraphError> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            self.meetings.get(meeting_id).cloned().ok_or_else(not_found)
        }

        async fn attendance_reports(
            &self,
            _user_id: &str,
            meeting_id: &str,
        ) -> Result<Vec<AttendanceReport>, GraphError> {
            Ok(self
                .reports
                .get(meeting_id)
                .map(|ids| ids.iter().map(|id| AttendanceReport { id: id.clone() }).collect())
                .unwrap_or_default())
        }

        async fn attendance_records(
            &self,
            _user_id: &str,
            _meeting_id: &str,
            report_id: &str,
        ) -> Result<Vec<AttendanceRecord>, GraphError> {
            self.records.get(report_id).cloned().ok_or_else(not_found)
        }

        async fn online_meetings_between(
            &self,
            _user_id: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<OnlineMeeting>, GraphError> {
            let mut meetings: Vec<OnlineMeeting> = self.meetings.values().cloned().collect();
            meetings.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(meetings)
        }
    }

    #[tokio::test]
    async fn sync_creates_meeting_and_classifies_spans() {
        let store = MemoryStore::new();
        let graph = FakeGraph::default()
            .with_meeting("om-1", "2026-03-02T09:00:00Z")
            .with_report(
                "om-1",
                "r-1",
                vec![
                    attendee("avery@school.edu", &[("2026-03-02T09:10:00Z", 2700)]),
                    attendee("jules@school.edu", &[("2026-03-02T09:20:00Z", 2400)]),
                    attendee("kiara@school.edu", &[("2026-03-02T09:02:00Z", 180)]),
                ],
            );

        let summary = sync(&store, &graph, "om-1").await;

        assert_eq!(summary.created, 3);
        assert_eq!(summary.meetings_created, 1);
        assert_eq!(summary.students_created, 3);

        let students = store.students();
        let status_for = |email: &str| {
            let student = students.iter().find(|s| s.email == email).unwrap();
            store
                .records()
                .into_iter()
                .find(|r| r.student_id == student.id)
                .unwrap()
                .status
        };
        assert_eq!(status_for("avery@school.edu"), AttendanceStatus::Present);
        assert_eq!(status_for("jules@school.edu"), AttendanceStatus::Late);
        assert_eq!(status_for("kiara@school.edu"), AttendanceStatus::Partial);
        assert_eq!(students[0].identity_id.as_deref(), Some("aad-avery@school.edu"));
    }

    #[tokio::test]
    async fn overlapping_reports_are_deduplicated_across_batches() {
        let store = MemoryStore::new();
        let graph = FakeGraph::default()
            .with_meeting("om-1", "2026-03-02T09:00:00Z")
            .with_report("om-1", "r-1", avery("2026-03-02T09:10:00Z", 600))
            .with_report("om-1", "r-2", avery("2026-03-02T09:10:30Z", 600));

        let summary = sync(&store, &graph, "om-1").await;

        assert_eq!(summary.created, 1);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn resync_skips_metadata_fetch_and_creates_nothing() {
        let store = MemoryStore::new();
        let graph = FakeGraph::default()
            .with_meeting("om-1", "2026-03-02T09:00:00Z")
            .with_report("om-1", "r-1", avery("2026-03-02T09:01:00Z", 3000));

        let first = sync(&store, &graph, "om-1").await;
        let second = sync(&store, &graph, "om-1").await;

        assert_eq!(graph.metadata_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, first.created);
    }

    #[tokio::test]
    async fn unreachable_metadata_is_fatal() {
        let store = MemoryStore::new();
        let graph = FakeGraph::default();

        let err = sync_meeting(&store, &graph, "u", "missing", Thresholds::live_sync())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("missing"));
        assert!(store.meetings().is_empty());
    }

    #[tokio::test]
    async fn meeting_without_reports_is_an_empty_summary() {
        let store = MemoryStore::new();
        let graph = FakeGraph::default().with_meeting("om-1", "2026-03-02T09:00:00Z");

        let summary = sync(&store, &graph, "om-1").await;

        assert_eq!(summary, ReconcileSummary::default());
    }

    #[tokio::test]
    async fn recent_sync_continues_past_failing_meetings() {
        let store = MemoryStore::new();
        let mut graph = FakeGraph::default()
            .with_meeting("om-1", "2026-03-02T09:00:00Z")
            .with_meeting("om-2", "2026-03-02T09:00:00Z")
            .with_report("om-1", "r-1", avery("2026-03-02T09:01:00Z", 3000));
        graph
            .reports
            .insert("om-2".to_string(), vec!["r-missing".to_string()]);

        let result = sync_recent(&store, &graph, "u", 90, Thresholds::live_sync())
            .await
            .unwrap();

        assert_eq!(result.meetings_found, 2);
        assert_eq!(result.meetings_failed, 0);
        assert_eq!(result.summary.created, 1);
        assert_eq!(result.summary.meetings_created, 1);
        assert_eq!(result.summary.errors.len(), 1);
        assert!(result.summary.errors[0].contains("r-missing"));
    }
}
