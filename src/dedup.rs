use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::store::AttendanceStore;

/// Two joins closer than this are the same physical attendance event.
pub const PROXIMITY_WINDOW_SECS: i64 = 60;

pub fn within_window(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).abs() < Duration::seconds(PROXIMITY_WINDOW_SECS)
}

pub fn is_duplicate<I>(candidate: DateTime<Utc>, existing: I) -> bool
where
    I: IntoIterator<Item = DateTime<Utc>>,
{
    existing.into_iter().any(|join| within_window(candidate, join))
}

/// Join times already persisted for the pair. A failed lookup is logged and
/// reported as empty so the batch keeps going.
pub async fn persisted_joins<S>(store: &S, meeting_id: Uuid, student_id: Uuid) -> Vec<DateTime<Utc>>
where
    S: AttendanceStore + ?Sized,
{
    match store.find_by_meeting_and_student(meeting_id, student_id).await {
        Ok(records) => records.into_iter().map(|record| record.join_time).collect(),
        Err(err) => {
            tracing::warn!(
                %meeting_id,
                %student_id,
                error = %err,
                "attendance lookup failed, treating interval as new"
            );
            Vec::new()
        }
    }
}
