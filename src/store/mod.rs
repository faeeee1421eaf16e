//! Persistence seams used by the reconciler.
//!
//! `db::PgStore` is the production implementation; `memory::MemoryStore` backs
//! tests and `preview::PreviewStore` layers it over a live store for dry runs.

pub mod memory;
pub mod preview;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    AttendanceRecord, Meeting, NewAttendanceRecord, NewMeeting, NewStudent, Student,
};

#[async_trait]
pub trait MeetingStore: Send + Sync {
    async fn find_by_external_id(&self, external_id: &str) -> anyhow::Result<Option<Meeting>>;

    /// Returns the stored row; a concurrent insert of the same external id resolves
    /// to the existing row.
    async fn create_meeting(&self, meeting: NewMeeting) -> anyhow::Result<Meeting>;
}

#[async_trait]
pub trait StudentStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<Student>>;

    async fn create_student(&self, student: NewStudent) -> anyhow::Result<Student>;
}

#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn find_by_meeting_and_student(
        &self,
        meeting_id: Uuid,
        student_id: Uuid,
    ) -> anyhow::Result<Vec<AttendanceRecord>>;

    /// Inserts every row that does not collide with an existing
    /// (meeting, student, join_time) and returns only the inserted rows.
    async fn bulk_create(
        &self,
        records: &[NewAttendanceRecord],
    ) -> anyhow::Result<Vec<AttendanceRecord>>;
}

/// Everything one reconciliation batch reads and writes.
pub trait Store: MeetingStore + StudentStore + AttendanceStore {}

impl<T> Store for T where T: MeetingStore + StudentStore + AttendanceStore {}
