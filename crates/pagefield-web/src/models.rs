use axum::response::sse::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pagefield_core::{ContributorStats, Credentials, HistorySummary, JobEvent};

// ── Request bodies ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CredentialsBody {
    #[serde(alias = "admin_username")]
    pub username: String,
    #[serde(alias = "admin_password")]
    pub password: String,
}

impl From<CredentialsBody> for Credentials {
    fn from(body: CredentialsBody) -> Self {
        Credentials::new(body.username, body.password)
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryRequest {
    #[serde(flatten)]
    pub credentials: CredentialsBody,
    pub target_username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(alias = "filename")]
    pub reference: String,
}

// ── Response bodies ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ContributorsResponse {
    pub users: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub history: Vec<HistorySummary>,
}

#[derive(Debug, Serialize)]
pub struct ContributorStatsResponse {
    pub user_statistics: Vec<ContributorStats>,
}

// ── SSE Helper ──────────────────────────────────────────────────────────

/// Download path for an artifact reference.
pub fn download_url(reference: &str) -> String {
    format!("/download?reference={reference}")
}

/// Wire form of a job event. The final message also carries a ready-made
/// download URL next to the opaque reference.
pub fn event_payload(event: &JobEvent) -> Value {
    let mut value = serde_json::to_value(event).unwrap_or(Value::Null);
    if let JobEvent::Completed(result) = event
        && let Some(reference) = &result.download_reference
        && let Value::Object(map) = &mut value
    {
        map.insert("download_url".into(), Value::String(download_url(reference)));
    }
    value
}

pub fn sse_event(event: &JobEvent) -> Event {
    Event::default()
        .event(event.kind())
        .data(event_payload(event).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagefield_core::FinalResult;

    fn completed(reference: Option<&str>) -> JobEvent {
        JobEvent::Completed(FinalResult {
            download_reference: reference.map(str::to_string),
            total_time: 4.2,
            total_rows: 3,
            avg_time_per_row: 1.4,
            documents_total: 1,
            documents_failed: 0,
            skipped_pages: Default::default(),
        })
    }

    #[test]
    fn completed_payload_has_download_url() {
        let v = event_payload(&completed(Some("output_data_1_ab.csv")));
        assert_eq!(v["type"], "completed");
        assert_eq!(v["download_reference"], "output_data_1_ab.csv");
        assert_eq!(v["download_url"], "/download?reference=output_data_1_ab.csv");
        assert_eq!(v["total_rows"], 3);
    }

    #[test]
    fn completed_without_rows_has_no_url() {
        let v = event_payload(&completed(None));
        assert!(v.get("download_url").is_none());
        assert!(v["download_reference"].is_null());
    }

    #[test]
    fn history_request_accepts_admin_aliases() {
        let req: HistoryRequest = serde_json::from_str(
            r#"{"admin_username":"root","admin_password":"pw","target_username":"All Users"}"#,
        )
        .unwrap();
        assert_eq!(req.credentials.username, "root");
        assert_eq!(req.target_username.as_deref(), Some("All Users"));
    }

    #[test]
    fn download_query_accepts_filename() {
        let q: DownloadQuery = serde_json::from_str(r#"{"filename":"x.csv"}"#).unwrap();
        assert_eq!(q.reference, "x.csv");
    }
}
