use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub memory: MemoryPolicy,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        cfg.validate()
            .with_context(|| format!("validating config: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.report.validate()?;
        self.retry.validate()?;
        self.memory.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageFormat {
    A4,
    Letter,
}

impl PageFormat {
    /// Portrait (width, height) in millimetres.
    pub fn size_mm(self) -> (f64, f64) {
        match self {
            PageFormat::A4 => (210.0, 297.0),
            PageFormat::Letter => (215.9, 279.4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Margins {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}
impl Default for Margins {
    fn default() -> Self {
        Self::uniform(10.0)
    }
}

impl Margins {
    pub fn uniform(mm: f64) -> Self {
        Self {
            top: mm,
            right: mm,
            bottom: mm,
            left: mm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub page_format: PageFormat,
    pub orientation: Orientation,
    pub margins: Margins,
    pub quality: f64,
    pub background: [u8; 3],
    pub jpeg_quality: u8,
}
impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            page_format: PageFormat::A4,
            orientation: Orientation::Portrait,
            margins: Margins::default(),
            quality: 2.0,
            background: [255, 255, 255],
            jpeg_quality: 92,
        }
    }
}

impl ReportConfig {
    /// Page (width, height) in millimetres after applying orientation.
    pub fn page_size_mm(&self) -> (f64, f64) {
        let (w, h) = self.page_format.size_mm();
        match self.orientation {
            Orientation::Portrait => (w, h),
            Orientation::Landscape => (h, w),
        }
    }

    /// Printable (width, height) in millimetres.
    pub fn printable_mm(&self) -> (f64, f64) {
        let (w, h) = self.page_size_mm();
        let m = &self.margins;
        (w - m.left - m.right, h - m.top - m.bottom)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !(self.quality.is_finite() && self.quality > 0.0) {
            return Err(ConfigError::new("report.quality", "must be a positive number"));
        }
        let m = &self.margins;
        if [m.top, m.right, m.bottom, m.left]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(ConfigError::new("report.margins", "must be non-negative"));
        }
        let (pw, ph) = self.printable_mm();
        if pw <= 0.0 || ph <= 0.0 {
            return Err(ConfigError::new(
                "report.margins",
                format!("leave no printable area ({pw:.1} x {ph:.1} mm)"),
            ));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(ConfigError::new("report.jpeg_quality", "must be within 1..=100"));
        }
        Ok(())
    }

    pub fn apply(&self, patch: &ReportConfigPatch) -> std::result::Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(v) = patch.page_format {
            next.page_format = v;
        }
        if let Some(v) = patch.orientation {
            next.orientation = v;
        }
        if let Some(v) = patch.margins {
            next.margins = v;
        }
        if let Some(v) = patch.quality {
            next.quality = v;
        }
        if let Some(v) = patch.background {
            next.background = v;
        }
        if let Some(v) = patch.jpeg_quality {
            next.jpeg_quality = v;
        }
        next.validate()?;
        Ok(next)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportConfigPatch {
    pub page_format: Option<PageFormat>,
    pub orientation: Option<Orientation>,
    pub margins: Option<Margins>,
    pub quality: Option<f64>,
    pub background: Option<[u8; 3]>,
    pub jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
}
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::new("retry.backoff_multiplier", "must be >= 1"));
        }
        Ok(())
    }

    pub fn apply(&self, patch: &RetryPolicyPatch) -> std::result::Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(v) = patch.max_retries {
            next.max_retries = v;
        }
        if let Some(v) = patch.retry_delay_ms {
            next.retry_delay_ms = v;
        }
        if let Some(v) = patch.backoff_multiplier {
            next.backoff_multiplier = v;
        }
        next.validate()?;
        Ok(next)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyPatch {
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryPolicy {
    pub enable_garbage_collection_hint: bool,
    pub chunk_size: u64,
    pub max_memory_usage_mb: u64,
    pub quality_floor: f64,
    pub degrade_factor: f64,
}
impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            enable_garbage_collection_hint: true,
            chunk_size: 1024 * 1024,
            max_memory_usage_mb: 512,
            quality_floor: 0.5,
            degrade_factor: 0.75,
        }
    }
}

impl MemoryPolicy {
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_usage_mb.saturating_mul(1024 * 1024)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::new("memory.chunk_size", "must be positive"));
        }
        if self.max_memory_usage_mb == 0 {
            return Err(ConfigError::new("memory.max_memory_usage_mb", "must be positive"));
        }
        if !(self.quality_floor.is_finite() && self.quality_floor > 0.0) {
            return Err(ConfigError::new("memory.quality_floor", "must be positive"));
        }
        if !(self.degrade_factor > 0.0 && self.degrade_factor < 1.0) {
            return Err(ConfigError::new("memory.degrade_factor", "must be within (0, 1)"));
        }
        Ok(())
    }

    pub fn apply(&self, patch: &MemoryPolicyPatch) -> std::result::Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(v) = patch.enable_garbage_collection_hint {
            next.enable_garbage_collection_hint = v;
        }
        if let Some(v) = patch.chunk_size {
            next.chunk_size = v;
        }
        if let Some(v) = patch.max_memory_usage_mb {
            next.max_memory_usage_mb = v;
        }
        if let Some(v) = patch.quality_floor {
            next.quality_floor = v;
        }
        if let Some(v) = patch.degrade_factor {
            next.degrade_factor = v;
        }
        next.validate()?;
        Ok(next)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPolicyPatch {
    pub enable_garbage_collection_hint: Option<bool>,
    pub chunk_size: Option<u64>,
    pub max_memory_usage_mb: Option<u64>,
    pub quality_floor: Option<f64>,
    pub degrade_factor: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub out_dir: String,
    pub extension: String,
    pub write_summary_json: bool,
}
impl Default for Output {
    fn default() -> Self {
        Self {
            out_dir: "out".into(),
            extension: "pdf".into(),
            write_summary_json: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
