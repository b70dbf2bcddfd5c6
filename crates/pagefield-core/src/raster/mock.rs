//! Mock rasterizer for testing.
//!
//! Documents are plain-text descriptors instead of PDFs:
//!
//! - `pages=N;tag=T` renders `N` pages whose payloads are `T:1` .. `T:N`
//! - `corrupt` fails to open
//! - `panic` reports one page but panics while rendering

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{PageImage, RasterError, Rasterizer};

/// Build descriptor bytes for a document with `pages` pages.
pub fn pdf(tag: &str, pages: usize) -> Vec<u8> {
    format!("pages={pages};tag={tag}").into_bytes()
}

/// Key the mock extractor uses to script responses for a page.
pub fn page_key(tag: &str, page: usize) -> String {
    format!("{tag}:{page}")
}

#[derive(Default)]
pub struct MockRasterizer {
    rasterize_calls: AtomicUsize,
}

impl MockRasterizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rasterize_calls(&self) -> usize {
        self.rasterize_calls.load(Ordering::SeqCst)
    }
}

enum Descriptor {
    Pages { count: usize, tag: String },
    Corrupt,
    Panic,
}

fn parse(data: &[u8]) -> Result<Descriptor, RasterError> {
    let text = std::str::from_utf8(data).map_err(|e| RasterError::Open(e.to_string()))?;
    match text.trim() {
        "corrupt" => return Ok(Descriptor::Corrupt),
        "panic" => return Ok(Descriptor::Panic),
        _ => {}
    }

    let mut count = None;
    let mut tag = None;
    for part in text.split(';') {
        match part.split_once('=') {
            Some(("pages", v)) => count = v.trim().parse::<usize>().ok(),
            Some(("tag", v)) => tag = Some(v.trim().to_string()),
            _ => {}
        }
    }
    match (count, tag) {
        (Some(count), Some(tag)) => Ok(Descriptor::Pages { count, tag }),
        _ => Err(RasterError::Open(format!("unrecognized document: {text}"))),
    }
}

impl Rasterizer for MockRasterizer {
    fn page_count(&self, data: &[u8]) -> Result<usize, RasterError> {
        match parse(data)? {
            Descriptor::Pages { count, .. } => Ok(count),
            Descriptor::Corrupt => Err(RasterError::Open("corrupt document".into())),
            Descriptor::Panic => Ok(1),
        }
    }

    fn rasterize(&self, data: &[u8]) -> Result<Vec<PageImage>, RasterError> {
        self.rasterize_calls.fetch_add(1, Ordering::SeqCst);
        match parse(data)? {
            Descriptor::Pages { count, tag } => Ok((1..=count)
                .map(|number| PageImage {
                    number,
                    png: page_key(&tag, number).into_bytes(),
                })
                .collect()),
            Descriptor::Corrupt => Err(RasterError::Open("corrupt document".into())),
            Descriptor::Panic => panic!("mock rasterizer panic"),
        }
    }
}
