//! Microsoft Graph client for online-meeting attendance reports.
//!
//! Calls are made with a delegated user token supplied by the caller; this
//! module never acquires or refreshes tokens itself.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::models::{RawDuration, RawInterval, RawMeeting};

pub const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Graph API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("no online meeting matches join URL {0}")]
    MeetingNotFound(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineMeeting {
    pub id: String,
    pub subject: Option<String>,
    pub start_date_time: Option<String>,
    pub end_date_time: Option<String>,
    #[serde(alias = "joinUrl")]
    pub join_web_url: Option<String>,
    pub participants: Option<Participants>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Participants {
    pub organizer: Option<Organizer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Organizer {
    pub upn: Option<String>,
}

impl OnlineMeeting {
    pub fn to_raw(&self) -> RawMeeting {
        RawMeeting {
            external_id: Some(self.id.clone()),
            title: self.subject.clone(),
            start_time: self.start_date_time.clone(),
            end_time: self.end_date_time.clone(),
            organizer_email: self
                .participants
                .as_ref()
                .and_then(|participants| participants.organizer.as_ref())
                .and_then(|organizer| organizer.upn.clone()),
            join_url: self.join_web_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttendanceReport {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub email_address: Option<String>,
    pub identity: Option<Identity>,
    #[serde(default)]
    pub attendance_intervals: Vec<AttendanceInterval>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceInterval {
    pub join_date_time: Option<String>,
    pub leave_date_time: Option<String>,
    pub duration_in_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarEvent {
    id: String,
    online_meeting: Option<EventMeetingInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventMeetingInfo {
    join_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Where a sync pass reads meeting metadata and attendance from.
#[async_trait]
pub trait MeetingSource: Send + Sync {
    async fn online_meeting(
        &self,
        user_id: &str,
        meeting_id: &str,
    ) -> Result<OnlineMeeting, GraphError>;

    async fn attendance_reports(
        &self,
        user_id: &str,
        meeting_id: &str,
    ) -> Result<Vec<AttendanceReport>, GraphError>;

    async fn attendance_records(
        &self,
        user_id: &str,
        meeting_id: &str,
        report_id: &str,
    ) -> Result<Vec<AttendanceRecord>, GraphError>;

    /// Online meetings behind the user's calendar events in the window.
    async fn online_meetings_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OnlineMeeting>, GraphError>;
}

pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl GraphClient {
    pub fn new(base_url: &str, access_token: &str) -> Result<Self, GraphError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, GraphError> {
        tracing::debug!(url, "GET");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GraphError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    /// Follows `@odata.nextLink` until the collection is exhausted.
    async fn get_all<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, GraphError> {
        let first = format!("{}{}", self.base_url, path);
        let mut page: Collection<T> = self.get(&first, query).await?;
        let mut items = std::mem::take(&mut page.value);

        while let Some(next) = page.next_link.take() {
            page = self.get(&next, &[]).await?;
            items.append(&mut page.value);
        }

        Ok(items)
    }

    async fn online_meeting_by_join_url(
        &self,
        user_id: &str,
        join_url: &str,
    ) -> Result<OnlineMeeting, GraphError> {
        let filter = format!("JoinWebUrl eq '{}'", join_url.replace('\'', "''"));
        let meetings: Vec<OnlineMeeting> = self
            .get_all(&format!("/users/{user_id}/onlineMeetings"), &[("$filter", filter)])
            .await?;
        meetings
            .into_iter()
            .next()
            .ok_or_else(|| GraphError::MeetingNotFound(join_url.to_string()))
    }
}

#[async_trait]
impl MeetingSource for GraphClient {
    async fn online_meeting(
        &self,
        user_id: &str,
        meeting_id: &str,
    ) -> Result<OnlineMeeting, GraphError> {
        let url = format!("{}/users/{user_id}/onlineMeetings/{meeting_id}", self.base_url);
        let meeting: OnlineMeeting = self.get(&url, &[]).await?;
        tracing::info!(meeting_id, "retrieved online meeting");
        Ok(meeting)
    }

    async fn attendance_reports(
        &self,
        user_id: &str,
        meeting_id: &str,
    ) -> Result<Vec<AttendanceReport>, GraphError> {
        let path = format!("/users/{user_id}/onlineMeetings/{meeting_id}/attendanceReports");
        let reports: Vec<AttendanceReport> = self.get_all(&path, &[]).await?;
        tracing::info!(meeting_id, reports = reports.len(), "retrieved attendance reports");
        Ok(reports)
    }

    async fn attendance_records(
        &self,
        user_id: &str,
        meeting_id: &str,
        report_id: &str,
    ) -> Result<Vec<AttendanceRecord>, GraphError> {
        let path = format!(
            "/users/{user_id}/onlineMeetings/{meeting_id}\
             /attendanceReports/{report_id}/attendanceRecords"
        );
        let records: Vec<AttendanceRecord> = self.get_all(&path, &[]).await?;
        tracing::info!(report_id, records = records.len(), "retrieved attendance records");
        Ok(records)
    }

    async fn online_meetings_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OnlineMeeting>, GraphError> {
        let filter = format!(
            "isOnlineMeeting eq true and start/dateTime ge '{}' and end/dateTime le '{}'",
            start.to_rfc3339_opts(SecondsFormat::Secs, true),
            end.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let events: Vec<CalendarEvent> = self
            .get_all(&format!("/users/{user_id}/calendar/events"), &[("$filter", filter)])
            .await?;
        tracing::info!(user_id, events = events.len(), "retrieved online calendar events");

        let mut meetings = Vec::new();
        for event in events {
            let Some(join_url) = event.online_meeting.and_then(|info| info.join_url) else {
                continue;
            };
            match self.online_meeting_by_join_url(user_id, &join_url).await {
                Ok(meeting) => meetings.push(meeting),
                Err(err) => {
                    tracing::warn!(
                        event_id = %event.id,
                        error = %err,
                        "could not resolve online meeting for event"
                    );
                }
            }
        }

        Ok(meetings)
    }
}

/// Flattens Graph attendance records into one raw interval per attendance span.
pub fn intervals_from_records(
    meeting: &RawMeeting,
    records: Vec<AttendanceRecord>,
) -> Vec<RawInterval> {
    let mut intervals = Vec::new();

    for record in records {
        let display_name = record
            .identity
            .as_ref()
            .and_then(|identity| identity.display_name.clone());
        let identity_id = record.identity.as_ref().and_then(|identity| identity.id.clone());
        let origin = record
            .email_address
            .clone()
            .or_else(|| display_name.clone())
            .unwrap_or_else(|| "unidentified attendee".to_string());

        for span in record.attendance_intervals {
            intervals.push(RawInterval {
                origin: origin.clone(),
                meeting: meeting.clone(),
                student_email: record.email_address.clone(),
                student_name: display_name.clone(),
                identity_id: identity_id.clone(),
                join_time: span.join_date_time,
                leave_time: span.leave_date_time,
                duration: span.duration_in_seconds.map(RawDuration::Seconds),
            });
        }
    }

    intervals
}
