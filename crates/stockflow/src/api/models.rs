use serde::Deserialize;
use serde_json::Value;

use crate::api::error::ApiError;
use crate::jobs::{JobFilter, JobStatus, NewJob};

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub payload: Option<Value>,
}

impl CreateJobRequest {
    /// Reject a missing or blank `type` before anything touches the store.
    pub fn into_new_job(self) -> Result<NewJob, ApiError> {
        let job_type = self
            .job_type
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::BadRequest("type is required".into()))?;

        Ok(NewJob::new(
            job_type,
            self.payload.unwrap_or_else(|| Value::Object(Default::default())),
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub limit: Option<i64>,
}

impl TryFrom<ListJobsQuery> for JobFilter {
    type Error = ApiError;

    fn try_from(q: ListJobsQuery) -> Result<Self, Self::Error> {
        let status = match q.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(
                s.parse::<JobStatus>()
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?,
            ),
        };
        let job_type = q.job_type.filter(|t| !t.trim().is_empty());

        Ok(JobFilter {
            status,
            job_type,
            limit: q.limit,
        })
    }
}
