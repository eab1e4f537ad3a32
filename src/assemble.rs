//! Document assembler: paginates a captured bitmap onto fixed-size pages and
//! encodes the result as PDF.

use crate::config::{Margins, ReportConfig};
use crate::error::AttemptError;
use crate::raster::{Bitmap, Span};
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};
use tracing::debug;

pub const PT_PER_MM: f64 = 72.0 / 25.4;

// Slices thinner than this are floating-point residue, not content.
const EPS_MM: f64 = 1e-6;

/// One output page and the part of the scaled image visible on it.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSlice {
    pub index: usize,
    /// Distance from the top of the scaled image to the top of this slice (mm).
    pub offset_mm: f64,
    pub height_mm: f64,
    pub src_top: u32,
    pub src_rows: u32,
}

impl PageSlice {
    /// Where the top edge of the full image would sit on this page (mm from page top).
    pub fn image_top_mm(&self, margins: &Margins) -> f64 {
        margins.top - self.offset_mm
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageLayout {
    pub page_mm: (f64, f64),
    pub printable_mm: (f64, f64),
    pub margins: Margins,
    /// Millimetres per bitmap pixel.
    pub scale: f64,
    pub scaled_height_mm: f64,
    pub slices: Vec<PageSlice>,
}

impl PageLayout {
    pub fn page_count(&self) -> usize {
        self.slices.len()
    }
}

/// Splits a `width` x `height` bitmap into page slices for `cfg`.
///
/// Page breaks that would cut through a keep-together span are moved up to the
/// span's top when the span fits on one page. This is best effort only.
pub fn plan_pages(
    width: u32,
    height: u32,
    keep_together: &[Span],
    cfg: &ReportConfig,
) -> Result<PageLayout, AttemptError> {
    if width == 0 || height == 0 {
        return Err(AttemptError::Assembly(format!(
            "bitmap has zero size ({width}x{height})"
        )));
    }
    let (pw, ph) = cfg.printable_mm();
    if pw <= 0.0 || ph <= 0.0 {
        return Err(AttemptError::Assembly("no printable area".to_string()));
    }

    let scale = pw / f64::from(width);
    let scaled_height_mm = f64::from(height) * scale;
    let spans_mm: Vec<(f64, f64)> = keep_together
        .iter()
        .map(|s| (f64::from(s.top) * scale, f64::from(s.bottom) * scale))
        .collect();

    let mut slices = Vec::new();
    let mut offset = 0.0;
    while scaled_height_mm - offset > EPS_MM {
        let remaining = scaled_height_mm - offset;
        let mut slice_h = remaining.min(ph);
        let cut = offset + slice_h;
        if remaining > ph {
            if let Some(&(top, _)) = spans_mm.iter().find(|(top, bottom)| {
                *top > offset + EPS_MM && *top < cut && *bottom > cut && bottom - top <= ph
            }) {
                slice_h = top - offset;
            }
        }

        let src_top = (offset / scale).round() as u32;
        let src_end = (((offset + slice_h) / scale).round() as u32).min(height);
        if src_end > src_top {
            slices.push(PageSlice {
                index: slices.len(),
                offset_mm: offset,
                height_mm: slice_h,
                src_top,
                src_rows: src_end - src_top,
            });
        }
        offset += slice_h;
    }

    debug!(
        "planned {} page(s): scaled_height_mm={scaled_height_mm:.2} printable_height_mm={ph:.2}",
        slices.len()
    );
    Ok(PageLayout {
        page_mm: cfg.page_size_mm(),
        printable_mm: (pw, ph),
        margins: cfg.margins,
        scale,
        scaled_height_mm,
        slices,
    })
}

/// Incrementally writes pages into a PDF document.
pub struct DocumentBuilder {
    doc: Document,
    pages_id: ObjectId,
    kids: Vec<Object>,
    layout: PageLayout,
    jpeg_quality: u8,
    title: Option<String>,
}

impl DocumentBuilder {
    pub fn new(layout: PageLayout, jpeg_quality: u8) -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            kids: Vec::new(),
            layout,
            jpeg_quality,
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn pages_written(&self) -> usize {
        self.kids.len()
    }

    /// Starts a new page and draws the bitmap rows covered by `slice` on it.
    pub fn write_page(&mut self, bitmap: &Bitmap, slice: &PageSlice) -> Result<(), AttemptError> {
        if slice.src_top + slice.src_rows > bitmap.height() {
            return Err(AttemptError::Assembly(format!(
                "slice {} exceeds bitmap height {}",
                slice.index,
                bitmap.height()
            )));
        }
        let rows =
            image::imageops::crop_imm(&bitmap.image, 0, slice.src_top, bitmap.width(), slice.src_rows)
                .to_image();
        let jpeg = encode_jpeg(&rows, self.jpeg_quality)?;

        let image_id = self.doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(rows.width()),
                "Height" => i64::from(rows.height()),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            jpeg,
        ));

        let (page_w, page_h) = self.layout.page_mm;
        let m = &self.layout.margins;
        let draw_w = self.layout.printable_mm.0 * PT_PER_MM;
        let draw_h = slice.height_mm * PT_PER_MM;
        let x = m.left * PT_PER_MM;
        let y = (page_h - m.top - slice.height_mm) * PT_PER_MM;
        let name = format!("Im{}", slice.index + 1);
        let content = format!("q {draw_w:.4} 0 0 {draw_h:.4} {x:.4} {y:.4} cm /{name} Do Q\n");
        let content_id = self
            .doc
            .add_object(Stream::new(dictionary! {}, content.into_bytes()));

        let mut xobjects = Dictionary::new();
        xobjects.set(name.into_bytes(), Object::Reference(image_id));
        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "XObject" => xobjects },
            "MediaBox" => vec![
                0.into(),
                0.into(),
                ((page_w * PT_PER_MM) as f32).into(),
                ((page_h * PT_PER_MM) as f32).into(),
            ],
        });
        self.kids.push(page_id.into());
        Ok(())
    }

    /// Serializes the document. Fails when no page was written.
    pub fn finish(mut self) -> Result<Vec<u8>, AttemptError> {
        if self.kids.is_empty() {
            return Err(AttemptError::Assembly("document has no pages".to_string()));
        }
        let count = self.kids.len() as i64;
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => self.kids,
            "Count" => count,
        };
        self.doc.objects.insert(self.pages_id, Object::Dictionary(pages));
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);

        let mut info = dictionary! {
            "Producer" => Object::string_literal("report-forge"),
        };
        if let Some(title) = &self.title {
            info.set("Title", Object::string_literal(title.as_str()));
        }
        let info_id = self.doc.add_object(info);
        self.doc.trailer.set("Info", info_id);

        self.doc.compress();
        let mut out = Vec::new();
        self.doc
            .save_to(&mut out)
            .map_err(|err| AttemptError::Assembly(format!("pdf encode failed: {err}")))?;
        Ok(out)
    }
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, AttemptError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| AttemptError::Assembly(format!("jpeg encode failed: {err}")))?;
    Ok(buf)
}

/// Whether page images can be encoded and wrapped into a document on this host.
pub fn blob_assembly_available() -> bool {
    encode_jpeg(&RgbImage::new(1, 1), 80).is_ok()
}
