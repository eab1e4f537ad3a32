use super::{Bitmap, CaptureOptions, RasterBackend, Span};
use crate::error::AttemptError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{RgbImage, imageops::FilterType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tiny_skia::{Color, IntSize, Paint, Pixmap, PixmapPaint, Rect, Transform};
use tracing::{debug, warn};

/// Declarative render surface: layout size in CSS pixels plus painted elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_attached")]
    pub attached: bool,
    #[serde(default)]
    pub background: Option<[u8; 4]>,
    #[serde(default)]
    pub elements: Vec<SceneElement>,
    #[serde(default)]
    pub sections: Vec<Section>,
}

fn default_attached() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SceneElement {
    Rect {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        color: [u8; 4],
    },
    Image {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        source: PathBuf,
    },
}

/// Logical report section, in layout pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    #[serde(default)]
    pub name: String,
    pub top: f32,
    pub bottom: f32,
}

impl Scene {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            attached: true,
            background: None,
            elements: Vec::new(),
            sections: Vec::new(),
        }
    }

    /// Loads a scene from JSON; relative image sources resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading surface: {}", path.display()))?;
        let mut scene: Scene = serde_json::from_str(&raw)
            .with_context(|| format!("parsing surface JSON: {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for el in &mut scene.elements {
            if let SceneElement::Image { source, .. } = el {
                if source.is_relative() {
                    *source = base.join(&*source);
                }
            }
        }
        Ok(scene)
    }
}

/// tiny-skia backed rasterizer for [`Scene`] surfaces.
#[derive(Debug, Clone, Default)]
pub struct SceneRasterizer {
    strict_assets: bool,
}

impl SceneRasterizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the attempt on an unreadable image instead of leaving it blank.
    pub fn strict_assets(mut self, strict: bool) -> Self {
        self.strict_assets = strict;
        self
    }

    fn paint_image(
        &self,
        pixmap: &mut Pixmap,
        source: &Path,
        target: (f32, f32, f32, f32),
    ) -> Result<(), AttemptError> {
        let (x, y, w, h) = target;
        let tw = w.round() as u32;
        let th = h.round() as u32;
        if tw == 0 || th == 0 {
            return Ok(());
        }

        let decoded = match image::open(source) {
            Ok(img) => img,
            Err(err) => {
                let msg = format!("{}: {err}", source.display());
                if self.strict_assets {
                    return Err(AttemptError::AssetLoad(msg));
                }
                warn!("asset load failed, leaving blank region: {msg}");
                return Ok(());
            }
        };

        let resized = image::imageops::resize(&decoded.to_rgba8(), tw, th, FilterType::Triangle);
        let mut data = resized.into_raw();
        for px in data.chunks_exact_mut(4) {
            let a = u16::from(px[3]);
            for c in &mut px[..3] {
                *c = ((u16::from(*c) * a + 127) / 255) as u8;
            }
        }
        let layer = IntSize::from_wh(tw, th)
            .and_then(|size| Pixmap::from_vec(data, size))
            .ok_or_else(|| AttemptError::RenderCapture(format!("invalid image layer {tw}x{th}")))?;
        pixmap.draw_pixmap(
            x.round() as i32,
            y.round() as i32,
            layer.as_ref(),
            &PixmapPaint::default(),
            Transform::identity(),
            None,
        );
        Ok(())
    }
}

#[async_trait]
impl RasterBackend for SceneRasterizer {
    type Surface = Scene;

    fn raster_available() -> bool {
        Pixmap::new(1, 1).is_some()
    }

    // RGBA pixmap plus the flattened RGB copy.
    fn projected_bytes(&self, surface: &Scene, opts: &CaptureOptions) -> Option<u64> {
        let (px_w, px_h) = scaled_size(surface, opts.quality);
        Some(u64::from(px_w) * u64::from(px_h) * 7)
    }

    async fn capture(
        &self,
        surface: &Scene,
        opts: &CaptureOptions,
    ) -> Result<Bitmap, AttemptError> {
        if !surface.attached {
            return Err(AttemptError::RenderCapture(
                "surface is not attached".to_string(),
            ));
        }
        if surface.width == 0 || surface.height == 0 {
            return Err(AttemptError::RenderCapture(format!(
                "surface has zero layout size ({}x{})",
                surface.width, surface.height
            )));
        }

        let q = opts.quality;
        let (px_w, px_h) = scaled_size(surface, q);
        let mut pixmap = Pixmap::new(px_w, px_h).ok_or_else(|| {
            AttemptError::RenderCapture(format!("cannot allocate {px_w}x{px_h} pixmap"))
        })?;

        // Host rasterization point; lets the caller's event loop run.
        tokio::task::yield_now().await;

        if let Some([r, g, b, a]) = surface.background {
            pixmap.fill(Color::from_rgba8(r, g, b, a));
        }

        let qf = q as f32;
        let transform = Transform::from_scale(qf, qf);
        for el in &surface.elements {
            match el {
                SceneElement::Rect {
                    x,
                    y,
                    width,
                    height,
                    color,
                } => {
                    let Some(rect) = Rect::from_xywh(*x, *y, *width, *height) else {
                        debug!("skipping degenerate rect at ({x}, {y})");
                        continue;
                    };
                    let mut paint = Paint::default();
                    paint.set_color_rgba8(color[0], color[1], color[2], color[3]);
                    pixmap.fill_rect(rect, &paint, transform, None);
                }
                SceneElement::Image {
                    x,
                    y,
                    width,
                    height,
                    source,
                } => {
                    self.paint_image(
                        &mut pixmap,
                        source,
                        (x * qf, y * qf, width * qf, height * qf),
                    )?;
                }
            }
        }

        let image = flatten(&pixmap, opts.background);
        let keep_together = surface
            .sections
            .iter()
            .filter(|s| s.bottom > s.top && s.top >= 0.0)
            .map(|s| Span {
                top: (f64::from(s.top) * q).floor() as u32,
                bottom: ((f64::from(s.bottom) * q).ceil() as u32).min(px_h),
            })
            .filter(|s| s.bottom > s.top)
            .collect();

        debug!("captured {px_w}x{px_h} quality={q}");
        Ok(Bitmap {
            image,
            keep_together,
        })
    }
}

fn scaled_size(surface: &Scene, quality: f64) -> (u32, u32) {
    (
        (f64::from(surface.width) * quality).round() as u32,
        (f64::from(surface.height) * quality).round() as u32,
    )
}

/// Composites premultiplied RGBA over an opaque fill color.
fn flatten(pixmap: &Pixmap, background: [u8; 3]) -> RgbImage {
    let mut out = RgbImage::new(pixmap.width(), pixmap.height());
    for (dst, src) in out.pixels_mut().zip(pixmap.data().chunks_exact(4)) {
        let inv = 255 - u16::from(src[3]);
        for i in 0..3 {
            let v = u16::from(src[i]) + (u16::from(background[i]) * inv + 127) / 255;
            dst.0[i] = v.min(255) as u8;
        }
    }
    out
}
