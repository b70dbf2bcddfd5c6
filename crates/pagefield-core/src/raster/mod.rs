//! Page rasterization seam.
//!
//! Rendering is synchronous CPU work; callers run it through
//! `tokio::task::spawn_blocking`.

pub mod mock;

/// Errors from page counting or rendering.
#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error("failed to open document: {0}")]
    Open(String),
    #[error("failed to render page {page}: {message}")]
    Render { page: usize, message: String },
    #[error("document has no pages")]
    Empty,
}

/// A single rendered page, owned by the worker that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct PageImage {
    /// 1-based page index.
    pub number: usize,
    /// PNG-encoded image bytes.
    pub png: Vec<u8>,
}

impl std::fmt::Debug for PageImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageImage")
            .field("number", &self.number)
            .field("png_bytes", &self.png.len())
            .finish()
    }
}

/// Converts a document into ordered page images.
pub trait Rasterizer: Send + Sync {
    /// Number of pages, used by the orchestrator's pre-pass.
    fn page_count(&self, data: &[u8]) -> Result<usize, RasterError>;

    /// Render every page in order. The first element is page 1.
    fn rasterize(&self, data: &[u8]) -> Result<Vec<PageImage>, RasterError>;
}
