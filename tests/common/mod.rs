#![allow(dead_code)]

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use report_forge::{
    AttemptError, Config, ReportData,
    memory::HeapProbe,
    raster::{Bitmap, CaptureOptions, RasterBackend},
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub const MB: u64 = 1024 * 1024;

/// Layout size of the fake surface, in pixels at quality 1.0.
#[derive(Debug, Clone, Copy)]
pub struct FakeSurface {
    pub width: u32,
    pub height: u32,
}

impl FakeSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Backend whose captures fail or succeed according to a script.
/// Once the script is exhausted every capture succeeds.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Option<AttemptError>>>,
    calls: AtomicU32,
    qualities: Mutex<Vec<f64>>,
    times: Mutex<Vec<Instant>>,
    delay: Duration,
}

impl ScriptedBackend {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing_first(n: usize) -> Self {
        let backend = Self::default();
        for i in 0..n {
            backend.push_failure(AttemptError::RenderCapture(format!("boom {}", i + 1)));
        }
        backend
    }

    pub fn always_failing() -> Self {
        Self::failing_first(1000)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_failure(&self, err: AttemptError) {
        self.script.lock().unwrap().push_back(Some(err));
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn qualities(&self) -> Vec<f64> {
        self.qualities.lock().unwrap().clone()
    }

    pub fn times(&self) -> Vec<Instant> {
        self.times.lock().unwrap().clone()
    }
}

#[async_trait]
impl RasterBackend for ScriptedBackend {
    type Surface = FakeSurface;

    fn raster_available() -> bool {
        true
    }

    async fn capture(
        &self,
        surface: &FakeSurface,
        opts: &CaptureOptions,
    ) -> Result<Bitmap, AttemptError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.qualities.lock().unwrap().push(opts.quality);
        self.times.lock().unwrap().push(Instant::now());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front().flatten();
        if let Some(err) = next {
            return Err(err);
        }
        let w = (f64::from(surface.width) * opts.quality).round() as u32;
        let h = (f64::from(surface.height) * opts.quality).round() as u32;
        Ok(Bitmap::new(RgbImage::from_pixel(w, h, Rgb(opts.background))))
    }
}

/// Host without raster support.
pub struct HeadlessBackend;

#[async_trait]
impl RasterBackend for HeadlessBackend {
    type Surface = FakeSurface;

    fn raster_available() -> bool {
        false
    }

    async fn capture(
        &self,
        _surface: &FakeSurface,
        _opts: &CaptureOptions,
    ) -> Result<Bitmap, AttemptError> {
        Err(AttemptError::RenderCapture("no raster support".into()))
    }
}

/// Host that can rasterize but cannot encode documents.
#[derive(Default)]
pub struct BloblessBackend {
    calls: AtomicU32,
}

impl BloblessBackend {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RasterBackend for BloblessBackend {
    type Surface = FakeSurface;

    fn raster_available() -> bool {
        true
    }

    fn blob_assembly_available() -> bool {
        false
    }

    async fn capture(
        &self,
        surface: &FakeSurface,
        opts: &CaptureOptions,
    ) -> Result<Bitmap, AttemptError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Bitmap::new(RgbImage::from_pixel(
            surface.width,
            surface.height,
            Rgb(opts.background),
        )))
    }
}

/// Heap probe replaying scripted readings; the last one repeats.
pub struct ScriptedProbe {
    readings: Mutex<VecDeque<u64>>,
    last: Mutex<u64>,
    hints: AtomicU32,
}

impl ScriptedProbe {
    pub fn new(readings_mb: &[u64]) -> Self {
        Self {
            readings: Mutex::new(readings_mb.iter().map(|mb| mb * MB).collect()),
            last: Mutex::new(0),
            hints: AtomicU32::new(0),
        }
    }

    pub fn hints(&self) -> u32 {
        self.hints.load(Ordering::SeqCst)
    }
}

impl HeapProbe for ScriptedProbe {
    fn used_bytes(&self) -> Option<u64> {
        let mut last = self.last.lock().unwrap();
        if let Some(v) = self.readings.lock().unwrap().pop_front() {
            *last = v;
        }
        Some(*last)
    }

    fn collect_hint(&self) {
        self.hints.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn config(max_retries: u32, retry_delay_ms: u64, backoff_multiplier: f64) -> Config {
    let mut cfg = Config::default();
    cfg.report.quality = 1.0;
    cfg.retry.max_retries = max_retries;
    cfg.retry.retry_delay_ms = retry_delay_ms;
    cfg.retry.backoff_multiplier = backoff_multiplier;
    cfg
}

pub fn sample_report() -> ReportData {
    ReportData::new("Test Intersection", "2024-01-15T10:00:00Z")
}
