//! Report generator: drives capture, assembly and encoding under the retry,
//! memory and cancellation policies, and publishes status for every transition.

use crate::{
    assemble::{DocumentBuilder, plan_pages},
    cancel::{CancelToken, Checkpoint},
    config::{
        Config, MemoryPolicy, MemoryPolicyPatch, ReportConfig, ReportConfigPatch, RetryPolicy,
        RetryPolicyPatch,
    },
    error::{AttemptError, GenerateError},
    filename::derive_filename,
    memory::{HeapProbe, MemoryMonitor, Verdict, default_probe},
    model::ReportData,
    preview::{PreviewHandle, PreviewStore},
    raster::{Capabilities, CaptureOptions, RasterBackend},
    report::GenerationReport,
    retry::{Backoff, WaitOutcome},
    status::{
        ASSEMBLY_END, CAPTURE_END, DONE, ENCODE_END, GenerationStatus, Stage, StatusPublisher,
        SubscriptionId,
    },
    util::{lock, now_rfc3339},
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

type NameObserver = Arc<dyn Fn(&str) + Send + Sync>;
type RetryObserver = Arc<dyn Fn(u32, &str) + Send + Sync>;

#[derive(Default)]
struct Observers {
    on_success: Option<NameObserver>,
    on_error: Option<NameObserver>,
    on_retry: Option<RetryObserver>,
}

#[derive(Debug, Clone)]
struct Settings {
    report: ReportConfig,
    retry: RetryPolicy,
    memory: MemoryPolicy,
    out_dir: PathBuf,
    extension: String,
}

#[derive(Debug)]
pub enum GenerationOutcome {
    Completed(GenerationReport),
    Cancelled,
}

struct Assembled {
    bytes: Vec<u8>,
    pages: usize,
    quality: f64,
    attempt: u32,
}

enum PipelineEnd {
    Done(Assembled),
    Cancelled { attempt: u32 },
    Failed { error: GenerateError, attempt: u32 },
}

/// Drops the generation's cancel token, and with it the in-progress state,
/// on every exit path.
struct GeneratingGuard<'a>(&'a Mutex<Option<CancelToken>>);

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        lock(self.0).take();
    }
}

pub struct ReportGenerator<B: RasterBackend> {
    backend: B,
    settings: Mutex<Settings>,
    status: StatusPublisher,
    // `Some` exactly while a generation runs.
    active: Mutex<Option<CancelToken>>,
    observers: Mutex<Observers>,
    probe: Arc<dyn HeapProbe>,
    previews: PreviewStore,
}

impl<B: RasterBackend> ReportGenerator<B> {
    pub fn new(backend: B, cfg: &Config) -> Result<Self, GenerateError> {
        cfg.validate()?;
        Ok(Self {
            backend,
            settings: Mutex::new(Settings {
                report: cfg.report.clone(),
                retry: cfg.retry.clone(),
                memory: cfg.memory.clone(),
                out_dir: PathBuf::from(&cfg.output.out_dir),
                extension: cfg.output.extension.clone(),
            }),
            status: StatusPublisher::new(),
            active: Mutex::new(None),
            observers: Mutex::new(Observers::default()),
            probe: default_probe(),
            previews: PreviewStore::new(),
        })
    }

    pub fn with_heap_probe(mut self, probe: Arc<dyn HeapProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_out_dir(self, out_dir: impl Into<PathBuf>) -> Self {
        lock(&self.settings).out_dir = out_dir.into();
        self
    }

    /// Whether this host can capture and assemble at all. Never fails.
    pub fn is_supported() -> bool {
        Capabilities::detect::<B>().is_supported()
    }

    /// Advisory duration for UI display; never enforced.
    pub fn estimate_time(report: &ReportData) -> Duration {
        report.estimate_generation_time()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> ReportConfig {
        lock(&self.settings).report.clone()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        lock(&self.settings).retry.clone()
    }

    pub fn memory_policy(&self) -> MemoryPolicy {
        lock(&self.settings).memory.clone()
    }

    // Updates only affect generations started afterwards; a running one works on its snapshot.
    pub fn update_config(&self, patch: &ReportConfigPatch) -> Result<(), GenerateError> {
        let mut settings = lock(&self.settings);
        settings.report = settings.report.apply(patch)?;
        Ok(())
    }

    pub fn update_retry_policy(&self, patch: &RetryPolicyPatch) -> Result<(), GenerateError> {
        let mut settings = lock(&self.settings);
        settings.retry = settings.retry.apply(patch)?;
        Ok(())
    }

    pub fn update_memory_policy(&self, patch: &MemoryPolicyPatch) -> Result<(), GenerateError> {
        let mut settings = lock(&self.settings);
        settings.memory = settings.memory.apply(patch)?;
        Ok(())
    }

    pub fn on_success<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        lock(&self.observers).on_success = Some(Arc::new(f));
    }

    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        lock(&self.observers).on_error = Some(Arc::new(f));
    }

    pub fn on_retry<F>(&self, f: F)
    where
        F: Fn(u32, &str) + Send + Sync + 'static,
    {
        lock(&self.observers).on_retry = Some(Arc::new(f));
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&GenerationStatus) + Send + Sync + 'static,
    {
        self.status.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.status.unsubscribe(id)
    }

    pub fn status_watch(&self) -> watch::Receiver<GenerationStatus> {
        self.status.watch()
    }

    pub fn status(&self) -> GenerationStatus {
        self.status.current()
    }

    /// Returns a finished generation's status to `Idle`. Ignored unless the
    /// current status is terminal.
    pub fn reset_status(&self) {
        if self.status.current().stage.is_terminal() {
            self.status.reset();
        }
    }

    pub fn is_currently_generating(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Requests cancellation of the running generation. Ignored while idle.
    pub fn cancel_generation(&self) {
        if let Some(token) = lock(&self.active).as_ref() {
            info!("cancellation requested");
            token.cancel();
        }
    }

    pub fn preview_document(&self, url: &str) -> Option<Arc<Vec<u8>>> {
        self.previews.get(url)
    }

    pub fn revoke_preview(&self, url: &str) -> bool {
        self.previews.revoke(url)
    }

    /// Captures, paginates and persists the report as `report_<name>_<date>.<ext>`.
    pub async fn generate(
        &self,
        report: &ReportData,
        surface: &B::Surface,
    ) -> Result<GenerationOutcome, GenerateError> {
        let (_guard, cancel, settings) = self.start()?;
        let started = now_rfc3339();
        let filename = derive_filename(report, &settings.extension);
        info!("generate start file={filename}");

        let assembled = match self.pipeline(&settings, &cancel, report, surface).await {
            PipelineEnd::Done(doc) => doc,
            PipelineEnd::Cancelled { attempt } => {
                self.finish_cancelled(attempt);
                return Ok(GenerationOutcome::Cancelled);
            }
            PipelineEnd::Failed { error, attempt } => {
                self.finish_failed(&error, attempt);
                return Err(error);
            }
        };

        let path = settings.out_dir.join(&filename);
        let written = self
            .persist(
                &path,
                &assembled.bytes,
                settings.memory.chunk_size,
                &cancel,
                assembled.attempt,
            )
            .await;
        match written {
            Ok(true) => {}
            Ok(false) => {
                self.finish_cancelled(assembled.attempt);
                return Ok(GenerationOutcome::Cancelled);
            }
            Err(source) => {
                let error = GenerateError::Persist {
                    path: path.display().to_string(),
                    source,
                };
                self.finish_failed(&error, assembled.attempt);
                return Err(error);
            }
        }

        let summary = GenerationReport {
            filename: filename.clone(),
            path,
            pages: assembled.pages,
            attempts: assembled.attempt,
            quality: assembled.quality,
            bytes: assembled.bytes.len() as u64,
            started,
            finished: now_rfc3339(),
        };
        info!(
            "generate done file={} pages={} attempts={} bytes={}",
            summary.filename, summary.pages, summary.attempts, summary.bytes
        );
        self.finish_completed(&filename, assembled.attempt);
        Ok(GenerationOutcome::Completed(summary))
    }

    /// Same pipeline as [`generate`](Self::generate), but keeps the document in
    /// memory and returns a transient handle. Failures yield `None`.
    pub async fn generate_preview(
        &self,
        report: &ReportData,
        surface: &B::Surface,
    ) -> Option<PreviewHandle> {
        let (_guard, cancel, settings) = match self.start() {
            Ok(started) => started,
            Err(err) => {
                warn!("preview rejected: {err}");
                return None;
            }
        };
        info!("preview start");

        match self.pipeline(&settings, &cancel, report, surface).await {
            PipelineEnd::Done(doc) => {
                let handle = self.previews.insert(doc.bytes, doc.pages);
                info!("preview ready url={} pages={}", handle.url, handle.pages);
                self.finish_completed(&handle.url, doc.attempt);
                Some(handle)
            }
            PipelineEnd::Cancelled { attempt } => {
                self.finish_cancelled(attempt);
                None
            }
            PipelineEnd::Failed { error, attempt } => {
                self.finish_failed(&error, attempt);
                None
            }
        }
    }

    fn start(&self) -> Result<(GeneratingGuard<'_>, CancelToken, Settings), GenerateError> {
        let cancel = {
            let mut active = lock(&self.active);
            if active.is_some() {
                warn!("generate rejected: another generation is in progress");
                return Err(GenerateError::Busy);
            }
            active.insert(CancelToken::new()).clone()
        };
        let guard = GeneratingGuard(&self.active);
        let settings = lock(&self.settings).clone();
        self.status.begin();
        Ok((guard, cancel, settings))
    }

    async fn pipeline(
        &self,
        settings: &Settings,
        cancel: &CancelToken,
        report: &ReportData,
        surface: &B::Surface,
    ) -> PipelineEnd {
        let caps = Capabilities::detect::<B>();
        if let Some(missing) = caps.missing() {
            return PipelineEnd::Failed {
                error: GenerateError::UnsupportedEnvironment(missing.to_string()),
                attempt: 0,
            };
        }

        let backoff = Backoff::new(settings.retry.clone());
        let mut monitor = MemoryMonitor::new(settings.memory.clone(), Arc::clone(&self.probe));
        let mut quality = settings.report.quality;
        let title = format!("Traffic report: {}", report.intersection.name);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self
                .attempt(settings, cancel, surface, &mut monitor, &mut quality, attempt, &title)
                .await;
            monitor.release_all();

            let err = match result {
                Ok(Some(doc)) => return PipelineEnd::Done(doc),
                Ok(None) => return PipelineEnd::Cancelled { attempt },
                Err(err) => err,
            };

            if !err.is_transient() {
                let reason = match err {
                    AttemptError::UnsupportedEnvironment(reason) => reason,
                    other => other.to_string(),
                };
                return PipelineEnd::Failed {
                    error: GenerateError::UnsupportedEnvironment(reason),
                    attempt,
                };
            }
            if !backoff.has_attempts_after(attempt) {
                return PipelineEnd::Failed {
                    error: GenerateError::ExhaustedRetries {
                        attempts: attempt,
                        last: err,
                    },
                    attempt,
                };
            }

            warn!("attempt {attempt} failed, retrying: {err}");
            if checkpoint(cancel, Checkpoint::BeforeBackoff) {
                return PipelineEnd::Cancelled { attempt };
            }
            let progress = self.status.current().progress;
            self.status.advance(Stage::Retrying, progress, attempt);
            if backoff.wait(attempt - 1, cancel).await == WaitOutcome::Cancelled {
                info!("cancelled during backoff wait");
                return PipelineEnd::Cancelled { attempt };
            }
            let on_retry = lock(&self.observers).on_retry.clone();
            if let Some(cb) = on_retry {
                cb(attempt, &err.to_string());
            }
        }
    }

    /// One capture/assemble/encode pass. `Ok(None)` means cancellation was observed.
    async fn attempt(
        &self,
        settings: &Settings,
        cancel: &CancelToken,
        surface: &B::Surface,
        monitor: &mut MemoryMonitor,
        quality: &mut f64,
        attempt: u32,
        title: &str,
    ) -> Result<Option<Assembled>, AttemptError> {
        let background = settings.report.background;
        let projected = |q: f64| {
            self.backend.projected_bytes(
                surface,
                &CaptureOptions {
                    quality: q,
                    background,
                },
            )
        };
        match monitor.check_capture(*quality, projected) {
            Verdict::WithinBudget { .. } => {}
            Verdict::Degrade { quality: q, .. } => *quality = q,
            Verdict::Exceeded { estimated_mb } => {
                return Err(AttemptError::MemoryBudgetExceeded {
                    estimated_mb,
                    limit_mb: monitor.limit_mb(),
                });
            }
        }

        if checkpoint(cancel, Checkpoint::BeforeCapture) {
            return Ok(None);
        }
        if attempt > 1 {
            self.status.advance(Stage::Capturing, 0.0, attempt);
        }
        debug!("attempt {attempt} capture quality={quality}");
        let opts = CaptureOptions {
            quality: *quality,
            background,
        };
        let bitmap = self.backend.capture(surface, &opts).await?;
        let bitmap_bytes = bitmap.byte_len();
        monitor.track(bitmap_bytes);

        if checkpoint(cancel, Checkpoint::AfterCapture) {
            return Ok(None);
        }
        self.status.advance(Stage::Capturing, CAPTURE_END, attempt);

        match monitor.check(*quality) {
            Verdict::WithinBudget { .. } => {}
            Verdict::Degrade {
                estimated_mb,
                quality: q,
            } => {
                *quality = q;
                return Err(AttemptError::MemoryBudgetExceeded {
                    estimated_mb,
                    limit_mb: monitor.limit_mb(),
                });
            }
            Verdict::Exceeded { estimated_mb } => {
                return Err(AttemptError::MemoryBudgetExceeded {
                    estimated_mb,
                    limit_mb: monitor.limit_mb(),
                });
            }
        }

        if checkpoint(cancel, Checkpoint::BeforeAssembly) {
            return Ok(None);
        }
        self.status.advance(Stage::Assembling, CAPTURE_END, attempt);
        let layout = plan_pages(
            bitmap.width(),
            bitmap.height(),
            &bitmap.keep_together,
            &settings.report,
        )?;
        let total = layout.page_count();
        let slices = layout.slices.clone();
        let mut builder =
            DocumentBuilder::new(layout, settings.report.jpeg_quality).with_title(title);
        for slice in &slices {
            if checkpoint(cancel, Checkpoint::BeforePageWrite(slice.index)) {
                return Ok(None);
            }
            builder.write_page(&bitmap, slice)?;
            let done = (slice.index + 1) as f64 / total as f64;
            self.status.advance(
                Stage::Assembling,
                CAPTURE_END + (ASSEMBLY_END - CAPTURE_END) * done,
                attempt,
            );
        }
        drop(bitmap);
        monitor.release(bitmap_bytes);

        self.status.advance(Stage::Encoding, ASSEMBLY_END, attempt);
        let pages = builder.pages_written();
        let bytes = builder.finish()?;
        self.status.advance(Stage::Encoding, ENCODE_END, attempt);

        Ok(Some(Assembled {
            bytes,
            pages,
            quality: *quality,
            attempt,
        }))
    }

    /// Writes `bytes` in `chunk_size` pieces. `Ok(false)` means cancelled; the
    /// partial file is removed on cancellation and on error.
    async fn persist(
        &self,
        path: &Path,
        bytes: &[u8],
        chunk_size: u64,
        cancel: &CancelToken,
        attempt: u32,
    ) -> std::io::Result<bool> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let result = self
            .write_chunks(path, bytes, chunk_size, cancel, attempt)
            .await;
        if !matches!(result, Ok(true)) {
            if let Err(err) = tokio::fs::remove_file(path).await {
                debug!("removing partial {}: {err}", path.display());
            }
        }
        result
    }

    async fn write_chunks(
        &self,
        path: &Path,
        bytes: &[u8],
        chunk_size: u64,
        cancel: &CancelToken,
        attempt: u32,
    ) -> std::io::Result<bool> {
        let mut file = tokio::fs::File::create(path).await?;
        let chunk = usize::try_from(chunk_size).unwrap_or(usize::MAX).max(1);
        let total = bytes.len().max(1) as f64;
        let mut written = 0usize;
        for piece in bytes.chunks(chunk) {
            if checkpoint(cancel, Checkpoint::BeforePersistChunk) {
                return Ok(false);
            }
            file.write_all(piece).await?;
            written += piece.len();
            let progress = ENCODE_END + (DONE - ENCODE_END) * (written as f64 / total);
            self.status.advance(Stage::Encoding, progress.min(DONE - 1.0), attempt);
        }
        file.flush().await?;
        Ok(true)
    }

    fn finish_completed(&self, artifact: &str, attempt: u32) {
        self.status.complete(attempt);
        let cb = lock(&self.observers).on_success.clone();
        if let Some(cb) = cb {
            cb(artifact);
        }
    }

    fn finish_cancelled(&self, attempt: u32) {
        info!("generation cancelled after attempt {attempt}");
        self.status.cancel(attempt);
    }

    fn finish_failed(&self, err: &GenerateError, attempt: u32) {
        let message = err.to_string();
        error!("generation failed: {message}");
        self.status.fail(message.clone(), attempt);
        let cb = lock(&self.observers).on_error.clone();
        if let Some(cb) = cb {
            cb(&message);
        }
    }
}

fn checkpoint(cancel: &CancelToken, at: Checkpoint) -> bool {
    let cancelled = cancel.is_cancelled();
    if cancelled {
        info!("cancellation observed at {at:?}");
    }
    cancelled
}
