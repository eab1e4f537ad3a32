//! Raster capture stage.
//!
//! A [`RasterBackend`] turns a caller-owned render surface into a fixed
//! resolution [`Bitmap`]. The generator never builds or mutates the surface;
//! it only hands a reference to the backend.

pub mod scene;

use crate::error::AttemptError;
use async_trait::async_trait;
use image::RgbImage;
use serde::Serialize;

pub use scene::{Scene, SceneElement, SceneRasterizer, Section};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub raster_capture: bool,
    pub blob_assembly: bool,
}

impl Capabilities {
    /// Probes backend `B` for both capabilities. Never panics.
    pub fn detect<B: RasterBackend>() -> Self {
        Self {
            raster_capture: B::raster_available(),
            blob_assembly: B::blob_assembly_available(),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.raster_capture && self.blob_assembly
    }

    pub fn missing(&self) -> Option<&'static str> {
        if !self.raster_capture {
            Some("raster capture is unavailable")
        } else if !self.blob_assembly {
            Some("document blob assembly is unavailable")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureOptions {
    /// Scale applied to the surface layout size.
    pub quality: f64,
    /// Fill for transparent regions.
    pub background: [u8; 3],
}

/// Vertical pixel range `[top, bottom)` that should stay on one page if it fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub top: u32,
    pub bottom: u32,
}

#[derive(Debug, Clone)]
pub struct Bitmap {
    pub image: RgbImage,
    pub keep_together: Vec<Span>,
}

impl Bitmap {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            keep_together: Vec::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn byte_len(&self) -> u64 {
        self.image.as_raw().len() as u64
    }
}

#[async_trait]
pub trait RasterBackend: Send + Sync {
    type Surface: ?Sized + Sync;

    /// Whether this host can rasterize at all.
    fn raster_available() -> bool
    where
        Self: Sized;

    /// Whether captured bitmaps can be encoded into a document on this host.
    fn blob_assembly_available() -> bool
    where
        Self: Sized,
    {
        crate::assemble::blob_assembly_available()
    }

    /// Bytes a capture of `surface` at `opts` would allocate, when known up front.
    fn projected_bytes(&self, _surface: &Self::Surface, _opts: &CaptureOptions) -> Option<u64> {
        None
    }

    /// Capture is a suspension point and is never interrupted midway.
    async fn capture(
        &self,
        surface: &Self::Surface,
        opts: &CaptureOptions,
    ) -> Result<Bitmap, AttemptError>;
}
