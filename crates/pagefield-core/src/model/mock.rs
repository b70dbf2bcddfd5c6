//! Scripted model backend for testing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;

use super::FieldExtractor;
use crate::raster::PageImage;
use crate::rate_limit::ExtractError;

/// A configurable response for [`MockExtractor`].
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Return this text verbatim.
    Text(String),
    /// Return the value serialized as JSON inside a fenced block.
    Records(Value),
    /// Return an empty body.
    Empty,
    RateLimited { retry_after: Option<Duration> },
    Error(String),
    /// Never resolve.
    Hang,
    Panic,
}

/// A hand-rolled mock implementing [`FieldExtractor`].
///
/// Responses are scripted per page key (the page image's bytes as UTF-8, see
/// [`crate::raster::mock::page_key`]). Each call pops the next scripted
/// response for its key; once a script is exhausted the fallback is used.
pub struct MockExtractor {
    scripts: Mutex<HashMap<String, Vec<MockResponse>>>,
    fallback: MockResponse,
    delay: Option<Duration>,
    call_count: AtomicUsize,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockExtractor {
    /// Create a mock that returns `response` for every page.
    pub fn new(response: MockResponse) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: response,
            delay: None,
            call_count: AtomicUsize::new(0),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Script the responses for one page, in call order.
    pub fn with_script(self, key: impl Into<String>, mut responses: Vec<MockResponse>) -> Self {
        responses.reverse();
        self.lock_scripts().insert(key.into(), responses);
        self
    }

    /// Simulated latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many times `extract()` has been called, across all pages.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn lock_scripts(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<MockResponse>>> {
        self.scripts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_response(&self, key: &str) -> MockResponse {
        self.lock_scripts()
            .get_mut(key)
            .and_then(|seq| seq.pop())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl FieldExtractor for MockExtractor {
    fn name(&self) -> &str {
        "mock"
    }

    fn extract<'a>(
        &'a self,
        image: &'a PageImage,
        _instructions: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, ExtractError>> + Send + 'a>> {
        let key = String::from_utf8_lossy(&image.png).into_owned();
        self.call_count.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default() += 1;
        let response = self.next_response(&key);
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }

            match response {
                MockResponse::Text(text) => Ok(text),
                MockResponse::Records(value) => Ok(format!("```json\n{value}\n```")),
                MockResponse::Empty => Ok(String::new()),
                MockResponse::RateLimited { retry_after } => {
                    Err(ExtractError::RateLimited { retry_after })
                }
                MockResponse::Error(msg) => Err(ExtractError::Other(msg)),
                MockResponse::Hang => std::future::pending().await,
                MockResponse::Panic => panic!("mock extractor panic on {key}"),
            }
        })
    }
}
