use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    AttendanceRecord, Meeting, NewAttendanceRecord, NewMeeting, NewStudent, Student,
};
use crate::store::{AttendanceStore, MeetingStore, StudentStore};

#[derive(Default)]
struct Tables {
    meetings: Vec<Meeting>,
    students: Vec<Student>,
    records: Vec<AttendanceRecord>,
}

#[derive(Default)]
struct Faults {
    attendance_lookup: bool,
    bulk_create: bool,
    student_create: Option<String>,
}

/// Process-local store with optional fault injection.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&tables)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut tables = self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut tables)
    }

    fn faults<T>(&self, f: impl FnOnce(&Faults) -> T) -> T {
        let faults = self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&faults)
    }
}

#[cfg(test)]
impl MemoryStore {
    fn faults_mut(&self, f: impl FnOnce(&mut Faults)) {
        let mut faults = self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut faults);
    }

    pub fn fail_attendance_lookups(&self, fail: bool) {
        self.faults_mut(|faults| faults.attendance_lookup = fail);
    }

    pub fn fail_bulk_create(&self, fail: bool) {
        self.faults_mut(|faults| faults.bulk_create = fail);
    }

    pub fn fail_student_create_for(&self, email: Option<&str>) {
        let email = email.map(str::to_string);
        self.faults_mut(|faults| faults.student_create = email);
    }

    pub fn meetings(&self) -> Vec<Meeting> {
        self.read(|tables| tables.meetings.clone())
    }

    pub fn students(&self) -> Vec<Student> {
        self.read(|tables| tables.students.clone())
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.read(|tables| tables.records.clone())
    }
}

#[async_trait]
impl MeetingStore for MemoryStore {
    async fn find_by_external_id(&self, external_id: &str) -> anyhow::Result<Option<Meeting>> {
        Ok(self.read(|tables| {
            tables
                .meetings
                .iter()
                .find(|meeting| meeting.external_id == external_id)
                .cloned()
        }))
    }

    async fn create_meeting(&self, meeting: NewMeeting) -> anyhow::Result<Meeting> {
        Ok(self.write(|tables| {
            if let Some(existing) = tables
                .meetings
                .iter()
                .find(|row| row.external_id == meeting.external_id)
            {
                return existing.clone();
            }

            let row = Meeting {
                id: Uuid::new_v4(),
                external_id: meeting.external_id,
                title: meeting.title,
                start_time: meeting.start_time,
                end_time: meeting.end_time,
                organizer_email: meeting.organizer_email,
                join_url: meeting.join_url,
            };
            tables.meetings.push(row.clone());
            row
        }))
    }
}

#[async_trait]
impl StudentStore for MemoryStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<Student>> {
        Ok(self.read(|tables| {
            tables
                .students
                .iter()
                .find(|student| student.email == email)
                .cloned()
        }))
    }

    async fn create_student(&self, student: NewStudent) -> anyhow::Result<Student> {
        let refused = self.faults(|faults| {
            faults.student_create.as_deref() == Some(student.email.as_str())
        });
        if refused {
            return Err(anyhow!("connection reset while inserting student {}", student.email));
        }

        Ok(self.write(|tables| {
            if let Some(existing) = tables.students.iter().find(|row| row.email == student.email) {
                return existing.clone();
            }

            let row = Student {
                id: Uuid::new_v4(),
                email: student.email,
                name: student.name,
                roster_id: student.roster_id,
                identity_id: student.identity_id,
            };
            tables.students.push(row.clone());
            row
        }))
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn find_by_meeting_and_student(
        &self,
        meeting_id: Uuid,
        student_id: Uuid,
    ) -> anyhow::Result<Vec<AttendanceRecord>> {
        if self.faults(|faults| faults.attendance_lookup) {
            return Err(anyhow!("attendance lookup timed out"));
        }

        Ok(self.read(|tables| {
            tables
                .records
                .iter()
                .filter(|record| record.meeting_id == meeting_id && record.student_id == student_id)
                .cloned()
                .collect()
        }))
    }

    async fn bulk_create(
        &self,
        records: &[NewAttendanceRecord],
    ) -> anyhow::Result<Vec<AttendanceRecord>> {
        if self.faults(|faults| faults.bulk_create) {
            return Err(anyhow!("bulk insert rejected"));
        }

        Ok(self.write(|tables| {
            let mut inserted = Vec::new();
            for record in records {
                let conflict = tables.records.iter().any(|row| {
                    row.meeting_id == record.meeting_id
                        && row.student_id == record.student_id
                        && row.join_time == record.join_time
                });
                if conflict {
                    continue;
                }

                let row = AttendanceRecord {
                    id: Uuid::new_v4(),
                    meeting_id: record.meeting_id,
                    student_id: record.student_id,
                    join_time: record.join_time,
                    leave_time: record.leave_time,
                    duration_minutes: record.duration_minutes,
                    status: record.status,
                };
                tables.records.push(row.clone());
                inserted.push(row);
            }
            inserted
        }))
    }
}
