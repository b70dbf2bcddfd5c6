use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

pub mod auth;
pub mod channel;
pub mod config_file;
pub mod export;
pub mod history;
pub mod model;
pub mod orchestrator;
pub mod page;
pub mod raster;
pub mod rate_limit;
pub mod worker;

// Re-export for convenience
pub use auth::{Authorizer, Credentials, Principal, StaticAuthorizer};
pub use channel::{DocumentReporter, ProgressEvent, ProgressReceiver, ProgressSender, progress_channel};
pub use export::{ArtifactRef, ArtifactStore, ExportError, ExportFormat, Exporter};
pub use history::{
    ContributorStats, HistoryEntry, HistoryError, HistoryFilter, HistorySink, HistoryStats,
    HistorySummary, SqliteHistory,
};
pub use model::FieldExtractor;
pub use model::gemini::{GeminiExtractor, ModelConfig};
pub use orchestrator::{AdmissionError, FinalResult, JobEvent, JobOrchestrator, JobRequest, JobStream};
pub use page::{PageExtractor, PageOutcome, PageState, SkipReason};
pub use raster::{PageImage, RasterError, Rasterizer};
pub use rate_limit::{AdaptiveLimiter, ExtractError, RetryPolicy, ThrottledExtractor};
pub use worker::ExtractionWorker;

/// A submitted document awaiting extraction.
///
/// The bytes are immutable and reference-counted so the page-count pre-pass
/// and the owning worker can both read them without copying.
#[derive(Clone)]
pub struct Document {
    pub name: String,
    pub data: Arc<[u8]>,
}

impl Document {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Build a document from an uploaded file, sanitizing the file name.
    pub fn from_upload(filename: &str, data: impl Into<Arc<[u8]>>) -> Self {
        Self::new(sanitize_document_name(filename), data)
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("name", &self.name)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Keep alphanumerics, spaces, `.` and `_`; fall back to `document.pdf`.
pub fn sanitize_document_name(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_'))
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "document.pdf".to_string()
    } else {
        cleaned
    }
}

/// One structured row extracted from a page.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRecord {
    pub document_name: String,
    /// 1-based page the row came from.
    pub page_number: usize,
    pub fields: Map<String, Value>,
}

impl ExtractionRecord {
    /// The record as a flat JSON object, provenance tags last so they win over
    /// any model-supplied field of the same name.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut out = self.fields.clone();
        out.insert("page_number".into(), Value::from(self.page_number));
        out.insert(
            "document_name".into(),
            Value::String(self.document_name.clone()),
        );
        out
    }
}

/// Pipeline tuning shared by every job an orchestrator runs.
#[derive(Debug, Clone)]
pub struct Config {
    pub retry: RetryPolicy,
    /// Capacity of the worker → orchestrator progress channel.
    pub channel_capacity: usize,
    /// How long to wait for worker tasks to exit after their terminal event.
    pub join_grace: Duration,
    /// How long a cancelled job waits for workers before aborting them.
    pub cancel_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            channel_capacity: 256,
            join_grace: Duration::from_secs(5),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `total / count` rounded to two places, or 0 when `count` is 0.
pub fn per_row(total: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        round2(total / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_and_symbols() {
        assert_eq!(sanitize_document_name("../../etc/pass*wd.pdf"), "passwd.pdf");
        assert_eq!(sanitize_document_name("C:\\docs\\invoice #7.pdf"), "invoice 7.pdf");
        assert_eq!(sanitize_document_name("report_2024 final.pdf"), "report_2024 final.pdf");
    }

    #[test]
    fn sanitize_empty_falls_back() {
        assert_eq!(sanitize_document_name("$$$"), "document.pdf");
        assert_eq!(sanitize_document_name("..."), "document.pdf");
    }

    #[test]
    fn record_json_tags_override_fields() {
        let mut fields = Map::new();
        fields.insert("total".into(), Value::from(12));
        fields.insert("page_number".into(), Value::from(99));
        let record = ExtractionRecord {
            document_name: "a.pdf".into(),
            page_number: 2,
            fields,
        };
        let json = record.to_json();
        assert_eq!(json["page_number"], Value::from(2));
        assert_eq!(json["document_name"], Value::from("a.pdf"));
        assert_eq!(json["total"], Value::from(12));
    }

    #[test]
    fn per_row_handles_zero() {
        assert_eq!(per_row(10.0, 0), 0.0);
        assert_eq!(per_row(10.0, 3), 3.33);
        assert_eq!(round2(66.666), 66.67);
    }
}
