use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::classify::Thresholds;
use crate::models::{
    AttendanceRecord, AttendanceRow, AttendanceStatus, Meeting, MeetingSummary,
    NewAttendanceRecord, NewMeeting, NewStudent, RawDuration, RawInterval, RawMeeting,
    ReportFilter, Student, StudentStats,
};
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::store::{AttendanceStore, MeetingStore, StudentStore};

const MEETING_COLUMNS: &str =
    "id, external_id, title, start_time, end_time, organizer_email, join_url";
const STUDENT_COLUMNS: &str = "id, email, name, roster_id, identity_id";
const RECORD_COLUMNS: &str =
    "id, meeting_id, student_id, join_time, leave_time, duration_minutes, status";

// Seven binds per row keeps each chunk well under the Postgres parameter limit.
const BULK_CHUNK: usize = 1000;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed store handed to the reconciler.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn meeting_from_row(row: &PgRow) -> Meeting {
    Meeting {
        id: row.get("id"),
        external_id: row.get("external_id"),
        title: row.get("title"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        organizer_email: row.get("organizer_email"),
        join_url: row.get("join_url"),
    }
}

fn student_from_row(row: &PgRow) -> Student {
    Student {
        id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
        roster_id: row.get("roster_id"),
        identity_id: row.get("identity_id"),
    }
}

fn record_from_row(row: &PgRow) -> anyhow::Result<AttendanceRecord> {
    let status: String = row.get("status");
    Ok(AttendanceRecord {
        id: row.get("id"),
        meeting_id: row.get("meeting_id"),
        student_id: row.get("student_id"),
        join_time: row.get("join_time"),
        leave_time: row.get("leave_time"),
        duration_minutes: row.get("duration_minutes"),
        status: status.parse()?,
    })
}

#[async_trait]
impl MeetingStore for PgStore {
    async fn find_by_external_id(&self, external_id: &str) -> anyhow::Result<Option<Meeting>> {
        let query = format!(
            "SELECT {MEETING_COLUMNS} FROM meeting_attendance.meetings WHERE external_id = $1"
        );
        let row = sqlx::query(&query)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(meeting_from_row))
    }

    async fn create_meeting(&self, meeting: NewMeeting) -> anyhow::Result<Meeting> {
        // The no-op update returns the existing row when another batch won the race.
        let query = format!(
            r#"
            INSERT INTO meeting_attendance.meetings
            (id, external_id, title, start_time, end_time, organizer_email, join_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (external_id) DO UPDATE
            SET external_id = EXCLUDED.external_id
            RETURNING {MEETING_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(&meeting.external_id)
            .bind(&meeting.title)
            .bind(meeting.start_time)
            .bind(meeting.end_time)
            .bind(&meeting.organizer_email)
            .bind(&meeting.join_url)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to insert meeting {}", meeting.external_id))?;
        Ok(meeting_from_row(&row))
    }
}

#[async_trait]
impl StudentStore for PgStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<Student>> {
        let query =
            format!("SELECT {STUDENT_COLUMNS} FROM meeting_attendance.students WHERE email = $1");
        let row = sqlx::query(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(student_from_row))
    }

    async fn create_student(&self, student: NewStudent) -> anyhow::Result<Student> {
        let query = format!(
            r#"
            INSERT INTO meeting_attendance.students (id, email, name, roster_id, identity_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (email) DO UPDATE
            SET email = EXCLUDED.email
            RETURNING {STUDENT_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(&student.email)
            .bind(&student.name)
            .bind(&student.roster_id)
            .bind(&student.identity_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to insert student {}", student.email))?;
        Ok(student_from_row(&row))
    }
}

#[async_trait]
impl AttendanceStore for PgStore {
    async fn find_by_meeting_and_student(
        &self,
        meeting_id: Uuid,
        student_id: Uuid,
    ) -> anyhow::Result<Vec<AttendanceRecord>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM meeting_attendance.attendance_records \
             WHERE meeting_id = $1 AND student_id = $2 ORDER BY join_time ASC"
        );
        let rows = sqlx::query(&query)
            .bind(meeting_id)
            .bind(student_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn bulk_create(
        &self,
        records: &[NewAttendanceRecord],
    ) -> anyhow::Result<Vec<AttendanceRecord>> {
        let mut inserted = Vec::with_capacity(records.len());
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin attendance insert")?;

        // Dropping `tx` on an early return rolls back every chunk already sent.
        for chunk in records.chunks(BULK_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO meeting_attendance.attendance_records \
                 (id, meeting_id, student_id, join_time, leave_time, duration_minutes, status) ",
            );
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(Uuid::new_v4())
                    .push_bind(record.meeting_id)
                    .push_bind(record.student_id)
                    .push_bind(record.join_time)
                    .push_bind(record.leave_time)
                    .push_bind(record.duration_minutes)
                    .push_bind(record.status.as_str());
            });
            builder.push(" ON CONFLICT (meeting_id, student_id, join_time) DO NOTHING RETURNING ");
            builder.push(RECORD_COLUMNS);

            let rows = builder
                .build()
                .fetch_all(&mut *tx)
                .await
                .context("failed to bulk insert attendance records")?;
            for row in rows.iter() {
                inserted.push(record_from_row(row)?);
            }
        }

        tx.commit()
            .await
            .context("failed to commit attendance records")?;
        Ok(inserted)
    }
}

/// Loads a demo meeting through the reconciler; safe to run repeatedly.
pub async fn seed(store: &PgStore) -> anyhow::Result<ReconcileSummary> {
    let meeting = RawMeeting {
        external_id: Some("seed-algebra-2026-02-02".to_string()),
        title: Some("Algebra II Study Hall".to_string()),
        start_time: Some("2026-02-02T15:00:00Z".to_string()),
        end_time: Some("2026-02-02T16:00:00Z".to_string()),
        organizer_email: Some("advisor@groupscholar.com".to_string()),
        join_url: None,
    };

    let attendees = vec![
        ("avery.lee@groupscholar.com", "Avery Lee", "2026-02-02T14:58:00Z", 62),
        ("jules.moreno@groupscholar.com", "Jules Moreno", "2026-02-02T15:21:00Z", 39),
        ("kiara.patel@groupscholar.com", "Kiara Patel", "2026-02-02T15:03:00Z", 4),
    ];

    let intervals: Vec<RawInterval> = attendees
        .into_iter()
        .map(|(email, name, join, minutes)| RawInterval {
            origin: format!("seed {email}"),
            meeting: meeting.clone(),
            student_email: Some(email.to_string()),
            student_name: Some(name.to_string()),
            identity_id: None,
            join_time: Some(join.to_string()),
            leave_time: None,
            duration: Some(RawDuration::Minutes(minutes)),
        })
        .collect();

    let reconciler = Reconciler::new(store, Thresholds::live_sync());
    Ok(reconciler.reconcile(intervals).await)
}

pub async fn list_students(pool: &PgPool) -> anyhow::Result<Vec<Student>> {
    let query =
        format!("SELECT {STUDENT_COLUMNS} FROM meeting_attendance.students ORDER BY name ASC");
    let rows = sqlx::query(&query).fetch_all(pool).await?;
    Ok(rows.iter().map(student_from_row).collect())
}

/// Case-insensitive substring match on name, email or roster id.
pub async fn search_students(pool: &PgPool, term: &str) -> anyhow::Result<Vec<Student>> {
    let query = format!(
        "SELECT {STUDENT_COLUMNS} FROM meeting_attendance.students \
         WHERE name ILIKE $1 OR email ILIKE $1 OR roster_id ILIKE $1 \
         ORDER BY name ASC"
    );
    let rows = sqlx::query(&query)
        .bind(format!("%{}%", term.trim()))
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(student_from_row).collect())
}

pub async fn list_meetings(pool: &PgPool, limit: i64) -> anyhow::Result<Vec<Meeting>> {
    let query = format!(
        "SELECT {MEETING_COLUMNS} FROM meeting_attendance.meetings \
         ORDER BY start_time DESC LIMIT $1"
    );
    let rows = sqlx::query(&query).bind(limit).fetch_all(pool).await?;
    Ok(rows.iter().map(meeting_from_row).collect())
}

pub async fn find_meeting(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<Meeting>> {
    let query = format!("SELECT {MEETING_COLUMNS} FROM meeting_attendance.meetings WHERE id = $1");
    let row = sqlx::query(&query).bind(id).fetch_optional(pool).await?;
    Ok(row.as_ref().map(meeting_from_row))
}

pub async fn find_student(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<Student>> {
    let query = format!("SELECT {STUDENT_COLUMNS} FROM meeting_attendance.students WHERE id = $1");
    let row = sqlx::query(&query).bind(id).fetch_optional(pool).await?;
    Ok(row.as_ref().map(student_from_row))
}

pub async fn fetch_attendance(
    pool: &PgPool,
    filter: &ReportFilter,
) -> anyhow::Result<Vec<AttendanceRow>> {
    let mut query = String::from(
        "SELECT ar.meeting_id, m.title AS meeting_title, m.start_time AS meeting_start, \
         ar.student_id, s.name AS student_name, s.email AS student_email, \
         ar.join_time, ar.leave_time, ar.duration_minutes, ar.status \
         FROM meeting_attendance.attendance_records ar \
         JOIN meeting_attendance.students s ON s.id = ar.student_id \
         JOIN meeting_attendance.meetings m ON m.id = ar.meeting_id \
         WHERE TRUE",
    );

    let mut param = 0;
    let mut next = || {
        param += 1;
        param
    };
    if filter.student_id.is_some() {
        query.push_str(&format!(" AND ar.student_id = ${}", next()));
    }
    if filter.meeting_id.is_some() {
        query.push_str(&format!(" AND ar.meeting_id = ${}", next()));
    }
    if filter.start_date.is_some() {
        query.push_str(&format!(" AND m.start_time >= ${}", next()));
    }
    if filter.end_date.is_some() {
        query.push_str(&format!(" AND m.end_time <= ${}", next()));
    }
    if filter.status.is_some() {
        query.push_str(&format!(" AND ar.status = ${}", next()));
    }
    query.push_str(" ORDER BY m.start_time DESC, s.name ASC");

    let mut rows = sqlx::query(&query);
    if let Some(value) = filter.student_id {
        rows = rows.bind(value);
    }
    if let Some(value) = filter.meeting_id {
        rows = rows.bind(value);
    }
    if let Some(value) = filter.start_date {
        rows = rows.bind(value);
    }
    if let Some(value) = filter.end_date {
        rows = rows.bind(value);
    }
    if let Some(value) = filter.status {
        rows = rows.bind(value.as_str());
    }

    let records = rows.fetch_all(pool).await?;
    let mut attendance = Vec::with_capacity(records.len());

    for row in records {
        let status: String = row.get("status");
        attendance.push(AttendanceRow {
            meeting_id: row.get("meeting_id"),
            meeting_title: row.get("meeting_title"),
            meeting_start: row.get("meeting_start"),
            student_id: row.get("student_id"),
            student_name: row.get("student_name"),
            student_email: row.get("student_email"),
            join_time: row.get("join_time"),
            leave_time: row.get("leave_time"),
            duration_minutes: row.get("duration_minutes"),
            status: status.parse()?,
        });
    }

    Ok(attendance)
}

pub async fn meeting_summary(pool: &PgPool, meeting_id: Uuid) -> anyhow::Result<MeetingSummary> {
    let meeting = find_meeting(pool, meeting_id)
        .await?
        .with_context(|| format!("meeting {meeting_id} not found"))?;

    let filter = ReportFilter {
        meeting_id: Some(meeting_id),
        ..ReportFilter::default()
    };
    let records = fetch_attendance(pool, &filter).await?;
    let count = |status: AttendanceStatus| records.iter().filter(|r| r.status == status).count();

    Ok(MeetingSummary {
        total_attendees: records.len(),
        present: count(AttendanceStatus::Present),
        late: count(AttendanceStatus::Late),
        partial: count(AttendanceStatus::Partial),
        meeting,
    })
}

pub async fn student_stats(pool: &PgPool, student_id: Uuid) -> anyhow::Result<StudentStats> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(DISTINCT m.id) AS total_meetings,
            COUNT(CASE WHEN ar.status = 'present' THEN 1 END) AS present,
            COUNT(CASE WHEN ar.status = 'late' THEN 1 END) AS late,
            COUNT(CASE WHEN ar.status = 'absent' THEN 1 END) AS absent,
            COALESCE(ROUND(
                COUNT(DISTINCT CASE WHEN ar.status IN ('present', 'late') THEN m.id END)::numeric
                / NULLIF(COUNT(DISTINCT m.id), 0) * 100,
                2
            ), 0)::float8 AS attendance_rate
        FROM meeting_attendance.meetings m
        LEFT JOIN meeting_attendance.attendance_records ar
            ON ar.meeting_id = m.id AND ar.student_id = $1
        WHERE m.end_time < NOW()
        "#,
    )
    .bind(student_id)
    .fetch_one(pool)
    .await?;

    Ok(StudentStats {
        total_meetings: row.get("total_meetings"),
        present: row.get("present"),
        late: row.get("late"),
        absent: row.get("absent"),
        attendance_rate: row.get("attendance_rate"),
    })
}
