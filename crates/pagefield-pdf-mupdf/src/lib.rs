use mupdf::{Colorspace, Document, ImageFormat, Matrix};

use pagefield_core::{PageImage, RasterError, Rasterizer};

/// MuPDF-based implementation of [`Rasterizer`].
///
/// This crate is the sole AGPL island: it isolates the mupdf dependency
/// (which is AGPL-3.0) so that the rest of the pipeline does not
/// transitively depend on it.
///
/// Pages are rendered to RGB PNG at `dpi` (default 200).
pub struct MupdfRasterizer {
    dpi: u32,
}

impl Default for MupdfRasterizer {
    fn default() -> Self {
        Self { dpi: 200 }
    }
}

impl MupdfRasterizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render resolution. Values below 36 are raised to 36.
    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi.max(36);
        self
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    /// PDF user space is 72 units per inch.
    fn scale(&self) -> f32 {
        self.dpi as f32 / 72.0
    }
}

fn open(data: &[u8]) -> Result<Document, RasterError> {
    Document::from_bytes(data, "application/pdf").map_err(|e| RasterError::Open(e.to_string()))
}

impl Rasterizer for MupdfRasterizer {
    fn page_count(&self, data: &[u8]) -> Result<usize, RasterError> {
        let document = open(data)?;
        let count = document
            .page_count()
            .map_err(|e| RasterError::Open(e.to_string()))?;
        Ok(count.max(0) as usize)
    }

    fn rasterize(&self, data: &[u8]) -> Result<Vec<PageImage>, RasterError> {
        let document = open(data)?;
        let count = document
            .page_count()
            .map_err(|e| RasterError::Open(e.to_string()))?;

        let scale = self.scale();
        let matrix = Matrix::new_scale(scale, scale);
        let colorspace = Colorspace::device_rgb();

        let mut images = Vec::with_capacity(count.max(0) as usize);
        for index in 0..count {
            let number = index as usize + 1;
            let render_err = |e: mupdf::Error| RasterError::Render {
                page: number,
                message: e.to_string(),
            };

            let page = document.load_page(index).map_err(render_err)?;
            let pixmap = page
                .to_pixmap(&matrix, &colorspace, false, true)
                .map_err(render_err)?;
            let mut png = Vec::new();
            pixmap
                .write_to(&mut png, ImageFormat::PNG)
                .map_err(render_err)?;

            tracing::debug!(page = number, bytes = png.len(), "page rendered");
            images.push(PageImage { number, png });
        }
        Ok(images)
    }
}
