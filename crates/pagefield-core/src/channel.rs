//! Worker → orchestrator progress channel.
//!
//! A bounded tokio mpsc channel: every worker holds a sender, the
//! orchestrator owns the single receiver. Events from one worker arrive in
//! the order it sent them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::ExtractionRecord;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    PageProgress {
        document_name: String,
        page_number: usize,
        total_pages: usize,
        /// Percent of this document's pages done, rounded to two places.
        percent: f64,
    },
    DocumentCompleted {
        document_name: String,
        elapsed_seconds: f64,
        row_count: usize,
        avg_time_per_row: f64,
        skipped_pages: Vec<usize>,
        records: Vec<ExtractionRecord>,
    },
    DocumentFailed {
        document_name: String,
        error: String,
    },
}

impl ProgressEvent {
    pub fn document_name(&self) -> &str {
        match self {
            ProgressEvent::PageProgress { document_name, .. }
            | ProgressEvent::DocumentCompleted { document_name, .. }
            | ProgressEvent::DocumentFailed { document_name, .. } => document_name,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::PageProgress { .. })
    }
}

pub type ProgressSender = mpsc::Sender<ProgressEvent>;
pub type ProgressReceiver = mpsc::Receiver<ProgressEvent>;

pub fn progress_channel(capacity: usize) -> (ProgressSender, ProgressReceiver) {
    mpsc::channel(capacity.max(1))
}

/// One document's handle on the progress channel.
///
/// Emits at most one terminal event. The terminal flag is shared with the
/// worker's panic guard so a panic after completion does not produce a
/// second terminal event.
#[derive(Clone)]
pub struct DocumentReporter {
    document_name: String,
    tx: ProgressSender,
    terminal: Arc<AtomicBool>,
}

impl DocumentReporter {
    pub fn new(document_name: impl Into<String>, tx: ProgressSender) -> Self {
        Self {
            document_name: document_name.into(),
            tx,
            terminal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn document_name(&self) -> &str {
        &self.document_name
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    /// Report a finished page. Returns `false` once the receiver is gone.
    pub async fn page(&self, page_number: usize, total_pages: usize, percent: f64) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.tx
            .send(ProgressEvent::PageProgress {
                document_name: self.document_name.clone(),
                page_number,
                total_pages,
                percent,
            })
            .await
            .is_ok()
    }

    pub async fn complete(
        self,
        elapsed_seconds: f64,
        skipped_pages: Vec<usize>,
        records: Vec<ExtractionRecord>,
    ) {
        let row_count = records.len();
        let event = ProgressEvent::DocumentCompleted {
            document_name: self.document_name.clone(),
            elapsed_seconds,
            row_count,
            avg_time_per_row: crate::per_row(elapsed_seconds, row_count),
            skipped_pages,
            records,
        };
        self.finish(event).await;
    }

    pub async fn fail(self, error: impl Into<String>) {
        let event = ProgressEvent::DocumentFailed {
            document_name: self.document_name.clone(),
            error: error.into(),
        };
        self.finish(event).await;
    }

    async fn finish(&self, event: ProgressEvent) {
        if self.terminal.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.tx.send(event).await.is_err() {
            tracing::debug!(document = %self.document_name, "progress receiver dropped");
        }
    }
}
