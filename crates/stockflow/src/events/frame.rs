//! Event names, payloads and the text framing used on the push stream.
//!
//! Every event goes out as exactly:
//!
//! ```text
//! event: <name>
//! data: <json>
//!
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_JOB_STARTED: &str = "job:started";
pub const EVENT_JOB_PROGRESS: &str = "job:progress";
pub const EVENT_JOB_COMPLETED: &str = "job:completed";
pub const EVENT_JOB_FAILED: &str = "job:failed";
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// One named event with its payload already serialized to single-line JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    pub fn json<T: Serialize + ?Sized>(event: &str, data: &T) -> serde_json::Result<Self> {
        Ok(Self::new(event, serde_json::to_string(data)?))
    }

    /// Text form for observers that write raw bytes.
    pub fn render(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub client_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted<'a> {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressed {
    pub job_id: Uuid,
    pub progress: f64,
    pub completed_items: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompleted<'a> {
    pub job_id: Uuid,
    pub result: &'a Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailed<'a> {
    pub job_id: Uuid,
    pub error: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub time: String,
}

impl Heartbeat {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            time: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}
