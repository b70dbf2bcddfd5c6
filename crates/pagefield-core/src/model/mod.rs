//! Model-call backends that turn a page image plus instructions into raw
//! response text.

use std::future::Future;
use std::pin::Pin;

use crate::raster::PageImage;
use crate::rate_limit::ExtractError;

pub mod gemini;
pub mod mock;

/// A field-extraction model behind a uniform async interface.
///
/// Implementations return the model's raw text; parsing into records happens
/// in [`crate::page`]. Rate-limit responses must be reported as
/// [`ExtractError::RateLimited`] so the caller can back off.
pub trait FieldExtractor: Send + Sync {
    fn name(&self) -> &str;

    fn extract<'a>(
        &'a self,
        image: &'a PageImage,
        instructions: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, ExtractError>> + Send + 'a>>;
}
