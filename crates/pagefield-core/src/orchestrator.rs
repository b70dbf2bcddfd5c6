//! Job admission, fan-out and aggregation.
//!
//! [`JobOrchestrator::run`] checks a request synchronously and, once
//! admitted, spawns one job task that:
//!
//! 1. counts pages across all documents for the global progress estimate
//! 2. spawns one isolated [`ExtractionWorker`] per document
//! 3. drains the progress channel until every document has reported a
//!    terminal event, forwarding each event as it arrives
//! 4. joins the workers, serializes the merged rows and emits the final result
//!
//! Dropping the [`JobStream`] or firing the job's cancellation token stops
//! every worker and ends the stream without a final event.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::auth::{Authorizer, Credentials, Principal};
use crate::channel::{DocumentReporter, ProgressEvent, progress_channel};
use crate::export::Exporter;
use crate::history::{HistoryEntry, HistorySink};
use crate::model::FieldExtractor;
use crate::raster::Rasterizer;
use crate::worker::ExtractionWorker;
use crate::{Config, Document, ExtractionRecord, per_row, round2};

/// A batch submission.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub documents: Vec<Document>,
    pub instructions: String,
    pub credentials: Credentials,
}

/// Synchronous rejection. No worker has been spawned and nothing was written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid credentials")]
    Unauthorized,
    #[error("no documents submitted")]
    NoDocuments,
    #[error("missing extraction instructions")]
    MissingInstructions,
}

/// Job-wide totals carried by the final message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalResult {
    /// `None` when no rows were extracted.
    pub download_reference: Option<String>,
    /// Sum of per-document elapsed seconds.
    pub total_time: f64,
    pub total_rows: usize,
    pub avg_time_per_row: f64,
    pub documents_total: usize,
    pub documents_failed: usize,
    /// Skipped page numbers per completed document that skipped any.
    pub skipped_pages: BTreeMap<String, Vec<usize>>,
}

/// One message on the caller-facing stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    PageProgress {
        document_name: String,
        page_number: usize,
        total_pages: usize,
        percent: f64,
    },
    GlobalProgress {
        percent: f64,
        pages_done: usize,
        pages_total: usize,
    },
    DocumentCompleted {
        document_name: String,
        elapsed_seconds: f64,
        row_count: usize,
        avg_time_per_row: f64,
        skipped_pages: Vec<usize>,
    },
    DocumentFailed {
        document_name: String,
        error: String,
    },
    Completed(FinalResult),
    Error {
        message: String,
    },
}

impl JobEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::PageProgress { .. } => "page_progress",
            JobEvent::GlobalProgress { .. } => "global_progress",
            JobEvent::DocumentCompleted { .. } => "document_completed",
            JobEvent::DocumentFailed { .. } => "document_failed",
            JobEvent::Completed(_) => "completed",
            JobEvent::Error { .. } => "error",
        }
    }

    /// The last message a stream carries.
    pub fn is_final(&self) -> bool {
        matches!(self, JobEvent::Completed(_) | JobEvent::Error { .. })
    }
}

/// Live events of one admitted job.
pub struct JobStream {
    rx: mpsc::Receiver<JobEvent>,
}

impl JobStream {
    /// `None` once the job has finished or was cancelled.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<JobEvent> {
        ReceiverStream::new(self.rx)
    }
}

#[derive(Clone)]
pub struct JobOrchestrator {
    config: Config,
    rasterizer: Arc<dyn Rasterizer>,
    worker: Arc<ExtractionWorker>,
    exporter: Arc<dyn Exporter>,
    history: Arc<dyn HistorySink>,
    authorizer: Arc<dyn Authorizer>,
}

impl JobOrchestrator {
    pub fn new(
        config: Config,
        rasterizer: Arc<dyn Rasterizer>,
        extractor: Arc<dyn FieldExtractor>,
        exporter: Arc<dyn Exporter>,
        history: Arc<dyn HistorySink>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        let worker = Arc::new(ExtractionWorker::new(
            Arc::clone(&rasterizer),
            extractor,
            config.retry,
        ));
        Self {
            config,
            rasterizer,
            worker,
            exporter,
            history,
            authorizer,
        }
    }

    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }

    /// Admit a request and start its job. Must be called within a tokio
    /// runtime.
    pub fn run(
        &self,
        mut request: JobRequest,
        cancel: CancellationToken,
    ) -> Result<JobStream, AdmissionError> {
        let principal = self.admit(&request)?;
        dedupe_names(&mut request.documents);
        tracing::info!(
            user = %principal.username,
            documents = request.documents.len(),
            "job admitted"
        );

        let (out, rx) = mpsc::channel(1);
        let job = self.clone();
        let instructions: Arc<str> = Arc::from(request.instructions.trim());
        tokio::spawn(async move {
            job.drive(principal, request.documents, instructions, out, cancel)
                .await;
        });
        Ok(JobStream { rx })
    }

    fn admit(&self, request: &JobRequest) -> Result<Principal, AdmissionError> {
        let result = if request.documents.is_empty() {
            Err(AdmissionError::NoDocuments)
        } else if request.instructions.trim().is_empty() {
            Err(AdmissionError::MissingInstructions)
        } else {
            self.authorizer
                .authenticate(&request.credentials)
                .ok_or(AdmissionError::Unauthorized)
        };
        if let Err(ref e) = result {
            tracing::warn!(user = %request.credentials.username, error = %e, "job rejected");
        }
        result
    }

    async fn drive(
        self,
        principal: Principal,
        documents: Vec<Document>,
        instructions: Arc<str>,
        out: mpsc::Sender<JobEvent>,
        cancel: CancellationToken,
    ) {
        let cancel = cancel.child_token();
        let documents_total = documents.len();
        let pages_total_estimate = self.count_pages(&documents).await;
        tracing::debug!(documents_total, pages_total_estimate, "page pre-pass done");

        let (tx, mut rx) = progress_channel(self.config.channel_capacity);
        let handles: Vec<JoinHandle<()>> = documents
            .into_iter()
            .map(|doc| {
                let reporter = DocumentReporter::new(doc.name.clone(), tx.clone());
                Arc::clone(&self.worker).spawn_isolated(
                    doc,
                    Arc::clone(&instructions),
                    reporter,
                    cancel.child_token(),
                )
            })
            .collect();
        drop(tx);

        let mut agg = Aggregate::new(documents_total, pages_total_estimate);

        while agg.documents_done < documents_total {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                _ = out.closed() => None,
                ev = rx.recv() => ev,
            };
            let Some(event) = event else {
                break;
            };

            let mut forwarded = Vec::with_capacity(2);
            match event {
                ProgressEvent::PageProgress {
                    document_name,
                    page_number,
                    total_pages,
                    percent,
                } => {
                    forwarded.push(JobEvent::PageProgress {
                        document_name,
                        page_number,
                        total_pages,
                        percent,
                    });
                    forwarded.push(agg.page_done());
                }
                ProgressEvent::DocumentCompleted {
                    document_name,
                    elapsed_seconds,
                    row_count,
                    avg_time_per_row,
                    skipped_pages,
                    records,
                } => {
                    self.write_history(&principal, &document_name, row_count, elapsed_seconds)
                        .await;
                    agg.completed(&document_name, elapsed_seconds, &skipped_pages, records);
                    forwarded.push(JobEvent::DocumentCompleted {
                        document_name,
                        elapsed_seconds,
                        row_count,
                        avg_time_per_row,
                        skipped_pages,
                    });
                }
                ProgressEvent::DocumentFailed {
                    document_name,
                    error,
                } => {
                    tracing::warn!(document = %document_name, error = %error, "document failed");
                    agg.failed();
                    forwarded.push(JobEvent::DocumentFailed {
                        document_name,
                        error,
                    });
                }
            }

            for ev in forwarded {
                if out.send(ev).await.is_err() {
                    break;
                }
            }
            if out.is_closed() {
                break;
            }
        }

        if agg.documents_done < documents_total {
            // Cancelled, disconnected, or a worker vanished without reporting.
            let ending = abandoned_ending(cancel.is_cancelled(), out.is_closed());
            cancel.cancel();
            drop(rx);
            tracing::info!(
                documents_done = agg.documents_done,
                documents_total,
                "job abandoned, discarding partial results"
            );
            join_bounded(handles, self.config.cancel_grace).await;
            if let Some(event) = ending {
                tracing::error!("worker exited without reporting, ending job");
                let _ = out.send(event).await;
            }
            return;
        }

        join_bounded(handles, self.config.join_grace).await;

        let final_event = match self.export(&agg.records).await {
            Ok(download_reference) => JobEvent::Completed(agg.finish(download_reference)),
            Err(message) => {
                tracing::error!(error = %message, "export failed");
                JobEvent::Error { message }
            }
        };
        let _ = out.send(final_event).await;
    }

    async fn count_pages(&self, documents: &[Document]) -> usize {
        let rasterizer = Arc::clone(&self.rasterizer);
        let docs = documents.to_vec();
        tokio::task::spawn_blocking(move || {
            docs.iter()
                .map(|d| match rasterizer.page_count(&d.data) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(document = %d.name, error = %e, "page count failed");
                        0
                    }
                })
                .sum::<usize>()
        })
        .await
        .unwrap_or(0)
    }

    async fn write_history(
        &self,
        principal: &Principal,
        document_name: &str,
        row_count: usize,
        elapsed_seconds: f64,
    ) {
        let history = Arc::clone(&self.history);
        let entry = HistoryEntry {
            contributor: principal.username.clone(),
            document_name: document_name.to_string(),
            row_count,
            elapsed_seconds,
        };
        let result = tokio::task::spawn_blocking(move || history.record(&entry)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(document = %document_name, error = %e, "history write failed"),
            Err(e) => tracing::error!(document = %document_name, error = %e, "history task failed"),
        }
    }

    async fn export(&self, records: &[ExtractionRecord]) -> Result<Option<String>, String> {
        if records.is_empty() {
            return Ok(None);
        }
        let exporter = Arc::clone(&self.exporter);
        let records = records.to_vec();
        match tokio::task::spawn_blocking(move || exporter.serialize(&records)).await {
            Ok(Ok(reference)) => Ok(Some(reference.0)),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("export task failed: {e}")),
        }
    }
}

/// Final message for a job whose drain stopped early. Nothing is sent when
/// the job was cancelled or nobody is listening.
fn abandoned_ending(cancelled: bool, receiver_gone: bool) -> Option<JobEvent> {
    if cancelled || receiver_gone {
        return None;
    }
    Some(JobEvent::Error {
        message: "worker exited without reporting".into(),
    })
}

/// Suffix repeated document names (`a.pdf`, `a_2.pdf`, ...) so each document
/// keys its own events, history rows and skipped pages.
fn dedupe_names(documents: &mut [Document]) {
    let mut seen: HashSet<String> = HashSet::new();
    for doc in documents.iter_mut() {
        if seen.insert(doc.name.clone()) {
            continue;
        }
        let (stem, ext) = match doc.name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
            _ => (doc.name.clone(), String::new()),
        };
        let mut n = 2;
        loop {
            let candidate = format!("{stem}_{n}{ext}");
            if seen.insert(candidate.clone()) {
                doc.name = candidate;
                break;
            }
            n += 1;
        }
    }
}

/// Wait for worker tasks until `grace` runs out, then abort the rest.
async fn join_bounded(handles: Vec<JoinHandle<()>>, grace: std::time::Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    for mut handle in handles {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            tracing::warn!("worker did not exit within grace period, aborting");
            handle.abort();
        }
    }
}

/// Counters and merged rows for one job.
struct Aggregate {
    documents_total: usize,
    documents_done: usize,
    documents_failed: usize,
    pages_total_estimate: usize,
    pages_done: usize,
    percent: f64,
    total_time: f64,
    records: Vec<ExtractionRecord>,
    skipped_pages: BTreeMap<String, Vec<usize>>,
}

impl Aggregate {
    fn new(documents_total: usize, pages_total_estimate: usize) -> Self {
        Self {
            documents_total,
            documents_done: 0,
            documents_failed: 0,
            pages_total_estimate,
            pages_done: 0,
            percent: 0.0,
            total_time: 0.0,
            records: Vec::new(),
            skipped_pages: BTreeMap::new(),
        }
    }

    /// Count a page and return the global progress event. The estimate can
    /// undercount, so the denominator never drops below `pages_done` and the
    /// percentage never decreases.
    fn page_done(&mut self) -> JobEvent {
        self.pages_done += 1;
        let denominator = self.pages_total_estimate.max(self.pages_done);
        let percent = round2(self.pages_done as f64 / denominator as f64 * 100.0);
        self.percent = self.percent.max(percent);
        JobEvent::GlobalProgress {
            percent: self.percent,
            pages_done: self.pages_done,
            pages_total: denominator,
        }
    }

    fn completed(
        &mut self,
        document_name: &str,
        elapsed_seconds: f64,
        skipped_pages: &[usize],
        records: Vec<ExtractionRecord>,
    ) {
        self.documents_done += 1;
        self.total_time += elapsed_seconds;
        self.records.extend(records);
        if !skipped_pages.is_empty() {
            self.skipped_pages
                .entry(document_name.to_string())
                .or_default()
                .extend_from_slice(skipped_pages);
        }
    }

    fn failed(&mut self) {
        self.documents_done += 1;
        self.documents_failed += 1;
    }

    fn finish(self, download_reference: Option<String>) -> FinalResult {
        let total_rows = self.records.len();
        let total_time = round2(self.total_time);
        FinalResult {
            download_reference,
            total_time,
            total_rows,
            avg_time_per_row: per_row(total_time, total_rows),
            documents_total: self.documents_total,
            documents_failed: self.documents_failed,
            skipped_pages: self.skipped_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn global_percent_is_monotonic_when_estimate_is_low() {
        let mut agg = Aggregate::new(1, 2);
        let percents: Vec<f64> = (0..4)
            .map(|_| match agg.page_done() {
                JobEvent::GlobalProgress { percent, .. } => percent,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(percents, vec![50.0, 100.0, 100.0, 100.0]);
    }

    #[test]
    fn final_result_totals() {
        let mut agg = Aggregate::new(3, 5);
        let record = |doc: &str| ExtractionRecord {
            document_name: doc.into(),
            page_number: 1,
            fields: serde_json::Map::new(),
        };
        agg.completed("a.pdf", 2.5, &[], vec![record("a.pdf"), record("a.pdf")]);
        agg.completed("b.pdf", 1.5, &[2], vec![record("b.pdf")]);
        agg.failed();

        let result = agg.finish(Some("out.csv".into()));
        assert_eq!(result.total_rows, 3);
        assert_eq!(result.total_time, 4.0);
        assert_eq!(result.avg_time_per_row, 1.33);
        assert_eq!(result.documents_failed, 1);
        assert_eq!(result.skipped_pages["b.pdf"], vec![2]);
    }

    #[test]
    fn repeated_names_get_suffixes() {
        let mut docs: Vec<Document> = ["a.pdf", "a.pdf", "a_2.pdf", "a.pdf", "notes", "notes"]
            .into_iter()
            .map(|n| Document::new(n, Vec::<u8>::new()))
            .collect();
        dedupe_names(&mut docs);
        let names: Vec<&str> = docs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["a.pdf", "a_2.pdf", "a_2_2.pdf", "a_3.pdf", "notes", "notes_2"]
        );
    }

    #[test]
    fn early_drain_end_reports_error_only_when_unexplained() {
        assert!(abandoned_ending(true, false).is_none());
        assert!(abandoned_ending(false, true).is_none());
        assert!(abandoned_ending(true, true).is_none());
        match abandoned_ending(false, false) {
            Some(ev @ JobEvent::Error { .. }) => assert!(ev.is_final()),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn wire_format_is_tagged() {
        let ev = JobEvent::PageProgress {
            document_name: "a.pdf".into(),
            page_number: 1,
            total_pages: 2,
            percent: 50.0,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], json!("page_progress"));
        assert_eq!(v["percent"], json!(50.0));

        let done = JobEvent::Completed(FinalResult {
            download_reference: None,
            total_time: 0.0,
            total_rows: 0,
            avg_time_per_row: 0.0,
            documents_total: 1,
            documents_failed: 0,
            skipped_pages: BTreeMap::new(),
        });
        let v = serde_json::to_value(&done).unwrap();
        assert_eq!(v["type"], json!("completed"));
        assert!(v["download_reference"].is_null());
        assert_eq!(done.kind(), "completed");
        assert!(done.is_final());
    }
}
