use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    AttendanceRecord, Meeting, NewAttendanceRecord, NewMeeting, NewStudent, Student,
};
use crate::store::memory::MemoryStore;
use crate::store::{AttendanceStore, MeetingStore, StudentStore};

/// Reads fall through to `base`; writes land in a process-local overlay so a
/// batch can be previewed against live data without changing it.
pub struct PreviewStore<'a, S: ?Sized> {
    base: &'a S,
    overlay: MemoryStore,
}

impl<'a, S: ?Sized> PreviewStore<'a, S> {
    pub fn new(base: &'a S) -> Self {
        Self {
            base,
            overlay: MemoryStore::new(),
        }
    }
}

#[async_trait]
impl<'a, S> MeetingStore for PreviewStore<'a, S>
where
    S: MeetingStore + ?Sized,
{
    async fn find_by_external_id(&self, external_id: &str) -> anyhow::Result<Option<Meeting>> {
        if let Some(meeting) = self.overlay.find_by_external_id(external_id).await? {
            return Ok(Some(meeting));
        }
        self.base.find_by_external_id(external_id).await
    }

    async fn create_meeting(&self, meeting: NewMeeting) -> anyhow::Result<Meeting> {
        self.overlay.create_meeting(meeting).await
    }
}

#[async_trait]
impl<'a, S> StudentStore for PreviewStore<'a, S>
where
    S: StudentStore + ?Sized,
{
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<Student>> {
        if let Some(student) = self.overlay.find_by_email(email).await? {
            return Ok(Some(student));
        }
        self.base.find_by_email(email).await
    }

    async fn create_student(&self, student: NewStudent) -> anyhow::Result<Student> {
        self.overlay.create_student(student).await
    }
}

#[async_trait]
impl<'a, S> AttendanceStore for PreviewStore<'a, S>
where
    S: AttendanceStore + ?Sized,
{
    async fn find_by_meeting_and_student(
        &self,
        meeting_id: Uuid,
        student_id: Uuid,
    ) -> anyhow::Result<Vec<AttendanceRecord>> {
        let mut records = self
            .base
            .find_by_meeting_and_student(meeting_id, student_id)
            .await?;
        records.extend(
            self.overlay
                .find_by_meeting_and_student(meeting_id, student_id)
                .await?,
        );
        records.sort_by_key(|record| record.join_time);
        Ok(records)
    }

    async fn bulk_create(
        &self,
        records: &[NewAttendanceRecord],
    ) -> anyhow::Result<Vec<AttendanceRecord>> {
        let mut persisted: HashMap<(Uuid, Uuid), Vec<AttendanceRecord>> = HashMap::new();
        let mut fresh = Vec::with_capacity(records.len());

        for record in records {
            let key = (record.meeting_id, record.student_id);
            if !persisted.contains_key(&key) {
                let rows = self
                    .base
                    .find_by_meeting_and_student(record.meeting_id, record.student_id)
                    .await?;
                persisted.insert(key, rows);
            }
            let conflict = persisted
                .get(&key)
                .is_some_and(|rows| rows.iter().any(|row| row.join_time == record.join_time));
            if !conflict {
                fresh.push(record.clone());
            }
        }

        self.overlay.bulk_create(&fresh).await
    }
}
