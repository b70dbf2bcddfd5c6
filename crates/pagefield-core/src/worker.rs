//! Per-document extraction worker.
//!
//! A worker rasterizes one document, runs every page through the
//! [`PageExtractor`] in order and reports through its [`DocumentReporter`].
//! Workers share nothing with each other; everything they produce goes over
//! the progress channel.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::DocumentReporter;
use crate::model::FieldExtractor;
use crate::page::{PageExtractor, SkipReason};
use crate::raster::{RasterError, Rasterizer};
use crate::rate_limit::RetryPolicy;
use crate::{Document, ExtractionRecord, round2};

pub struct ExtractionWorker {
    rasterizer: Arc<dyn Rasterizer>,
    pages: PageExtractor,
}

impl ExtractionWorker {
    pub fn new(
        rasterizer: Arc<dyn Rasterizer>,
        extractor: Arc<dyn FieldExtractor>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            rasterizer,
            pages: PageExtractor::new(extractor, policy),
        }
    }

    /// Extract one document, emitting a `PageProgress` per page and exactly
    /// one terminal event. Returns without a terminal event only when
    /// `cancel` fires.
    pub async fn run(
        &self,
        document: Document,
        instructions: Arc<str>,
        reporter: DocumentReporter,
        cancel: CancellationToken,
    ) {
        let name = document.name.clone();
        tracing::info!(document = %name, "worker started");

        let rasterizer = Arc::clone(&self.rasterizer);
        let data = Arc::clone(&document.data);
        let rendered = tokio::task::spawn_blocking(move || rasterizer.rasterize(&data)).await;

        let images = match rendered {
            Ok(Ok(images)) if images.is_empty() => {
                reporter.fail(RasterError::Empty.to_string()).await;
                return;
            }
            Ok(Ok(images)) => images,
            Ok(Err(e)) => {
                tracing::error!(document = %name, error = %e, "rasterization failed");
                reporter.fail(e.to_string()).await;
                return;
            }
            Err(join) => {
                let message = if join.is_panic() {
                    panic_message(join.into_panic().as_ref())
                } else {
                    join.to_string()
                };
                tracing::error!(document = %name, error = %message, "rasterizer panicked");
                reporter
                    .fail(format!("rasterization panicked: {message}"))
                    .await;
                return;
            }
        };

        let start = Instant::now();
        let total_pages = images.len();
        let mut records = Vec::new();
        let mut skipped_pages = Vec::new();

        for (idx, image) in images.iter().enumerate() {
            if cancel.is_cancelled() {
                return;
            }
            let page_number = idx + 1;
            let outcome = self.pages.extract(image, &instructions, &cancel).await;

            match outcome.skipped {
                Some(SkipReason::Cancelled) => return,
                Some(_) => skipped_pages.push(page_number),
                None => records.extend(outcome.records.into_iter().map(|fields| {
                    ExtractionRecord {
                        document_name: name.clone(),
                        page_number,
                        fields,
                    }
                })),
            }

            let percent = round2(page_number as f64 / total_pages as f64 * 100.0);
            if !reporter.page(page_number, total_pages, percent).await {
                return;
            }
        }

        let elapsed = round2(start.elapsed().as_secs_f64());
        tracing::info!(
            document = %name,
            rows = records.len(),
            skipped = skipped_pages.len(),
            elapsed_secs = elapsed,
            "worker finished"
        );
        reporter.complete(elapsed, skipped_pages, records).await;
    }

    /// Run [`ExtractionWorker::run`] on its own task. A panic anywhere in the
    /// worker becomes a `DocumentFailed` event for its document.
    pub fn spawn_isolated(
        self: Arc<Self>,
        document: Document,
        instructions: Arc<str>,
        reporter: DocumentReporter,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let guard = reporter.clone();
        let name = document.name.clone();
        tokio::spawn(async move {
            let run = self.run(document, instructions, reporter, cancel);
            if let Err(panic) = AssertUnwindSafe(run).catch_unwind().await {
                let message = panic_message(panic.as_ref());
                tracing::error!(document = %name, error = %message, "worker panicked");
                if !guard.is_terminal() {
                    guard.fail(format!("worker panicked: {message}")).await;
                }
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ProgressEvent, progress_channel};
    use crate::model::mock::{MockExtractor, MockResponse};
    use crate::raster::mock::{MockRasterizer, page_key, pdf};
    use serde_json::json;

    fn worker(extractor: MockExtractor) -> Arc<ExtractionWorker> {
        Arc::new(ExtractionWorker::new(
            Arc::new(MockRasterizer::new()),
            Arc::new(extractor),
            RetryPolicy::default(),
        ))
    }

    async fn collect(mut rx: crate::ProgressReceiver) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn emits_pages_then_completion() {
        let w = worker(MockExtractor::new(MockResponse::Records(json!([{"k": 1}]))));
        let (tx, rx) = progress_channel(16);
        let reporter = DocumentReporter::new("inv.pdf", tx);

        w.spawn_isolated(
            Document::new("inv.pdf", pdf("inv", 3)),
            Arc::from("fields"),
            reporter,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let events = collect(rx).await;
        assert_eq!(events.len(), 4);
        let percents: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::PageProgress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![33.33, 66.67, 100.0]);

        match &events[3] {
            ProgressEvent::DocumentCompleted {
                row_count,
                records,
                skipped_pages,
                ..
            } => {
                assert_eq!(*row_count, 3);
                assert!(skipped_pages.is_empty());
                assert_eq!(records[2].page_number, 3);
                assert_eq!(records[2].document_name, "inv.pdf");
            }
            other => panic!("expected DocumentCompleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn skipped_page_is_recorded() {
        let w = worker(
            MockExtractor::new(MockResponse::Records(json!([{"k": 1}])))
                .with_script(page_key("d", 2), vec![MockResponse::Error("bad".into())]),
        );
        let (tx, rx) = progress_channel(16);

        w.run(
            Document::new("d.pdf", pdf("d", 3)),
            Arc::from("fields"),
            DocumentReporter::new("d.pdf", tx),
            CancellationToken::new(),
        )
        .await;

        let events = collect(rx).await;
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::DocumentCompleted { row_count: 2, skipped_pages, .. }) if skipped_pages == &vec![2]
        ));
    }

    #[tokio::test]
    async fn extractor_panic_becomes_document_failed() {
        let w = worker(MockExtractor::new(MockResponse::Panic));
        let (tx, rx) = progress_channel(16);

        w.spawn_isolated(
            Document::new("p.pdf", pdf("p", 2)),
            Arc::from("fields"),
            DocumentReporter::new("p.pdf", tx),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ProgressEvent::DocumentFailed { error, .. } if error.contains("panicked")
        ));
    }

    #[tokio::test]
    async fn rasterizer_failures_become_document_failed() {
        for data in [b"corrupt".to_vec(), b"panic".to_vec(), pdf("e", 0)] {
            let w = worker(MockExtractor::new(MockResponse::Text("[]".into())));
            let (tx, rx) = progress_channel(4);
            w.spawn_isolated(
                Document::new("bad.pdf", data),
                Arc::from("fields"),
                DocumentReporter::new("bad.pdf", tx),
                CancellationToken::new(),
            )
            .await
            .unwrap();

            let events = collect(rx).await;
            assert_eq!(events.len(), 1);
            assert!(matches!(events[0], ProgressEvent::DocumentFailed { .. }));
        }
    }

    #[tokio::test]
    async fn cancelled_worker_sends_no_terminal_event() {
        let w = worker(MockExtractor::new(MockResponse::Hang));
        let (tx, rx) = progress_channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        w.spawn_isolated(
            Document::new("c.pdf", pdf("c", 2)),
            Arc::from("fields"),
            DocumentReporter::new("c.pdf", tx),
            cancel,
        )
        .await
        .unwrap();

        assert!(collect(rx).await.is_empty());
    }
}
