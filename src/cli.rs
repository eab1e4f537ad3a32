use crate::{
    config::Config,
    generator::{GenerationOutcome, ReportGenerator},
    model::ReportData,
    raster::{Capabilities, Scene, SceneRasterizer},
    util::ensure_dir,
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "report-forge")]
#[command(about = "Resilient report document generator (capture + pagination + retry)")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./report-forge.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Report whether this host can capture and assemble documents.
    Doctor {},
    /// Print the advisory generation time for a report.
    Estimate {
        #[arg(long)]
        data: PathBuf,
    },
    Generate {
        /// Report data JSON.
        #[arg(long)]
        data: PathBuf,
        /// Render surface (scene JSON).
        #[arg(long)]
        surface: PathBuf,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Retry failed attempts when an image asset cannot be loaded.
        #[arg(long)]
        strict_assets: bool,
    },
    Preview {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        surface: PathBuf,
        /// Also dump the previewed document to this path.
        #[arg(long)]
        dump: Option<PathBuf>,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg_path = resolve_config_path(args.config.as_deref());
    let cfg = match &cfg_path {
        Some(p) => Config::load(p)?,
        None => Config::default(),
    };
    let _guard = init_logging(&args, &cfg)?;
    if cfg_path.is_none() {
        info!("no config file found; using defaults");
    }

    match &args.cmd {
        Command::Doctor {} => doctor(),
        Command::Estimate { data } => estimate(data),
        Command::Generate {
            data,
            surface,
            out_dir,
            strict_assets,
        } => runtime()?.block_on(generate(&cfg, data, surface, out_dir.as_deref(), *strict_assets)),
        Command::Preview {
            data,
            surface,
            dump,
        } => runtime()?.block_on(preview(&cfg, data, surface, dump.as_deref())),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = user {
        return Some(p.to_path_buf());
    }
    ["report-forge.toml", "report-forge.example.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

// Single-threaded cooperative scheduling: one event loop, no worker pool.
fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .with_context(|| "building tokio runtime")
}

fn init_logging(args: &Args, cfg: &Config) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let file_path = resolve_log_path(cfg);
    let (file_layer, guard) = if let Some(path) = file_path.as_deref() {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from(&cfg.output.out_dir).join("report-forge.log"))
}

fn load_report(path: &Path) -> Result<ReportData> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading report data: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing report data: {}", path.display()))
}

fn doctor() -> Result<()> {
    let caps = Capabilities::detect::<SceneRasterizer>();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "capabilities": caps,
            "supported": caps.is_supported(),
            "missing": caps.missing(),
        }))?
    );
    Ok(())
}

fn estimate(data: &Path) -> Result<()> {
    let report = load_report(data)?;
    let estimate = ReportGenerator::<SceneRasterizer>::estimate_time(&report);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "intersection": report.intersection.name,
            "estimated_ms": estimate.as_millis() as u64,
        }))?
    );
    Ok(())
}

fn build_generator(cfg: &Config, strict_assets: bool) -> Result<ReportGenerator<SceneRasterizer>> {
    if !ReportGenerator::<SceneRasterizer>::is_supported() {
        return Err(anyhow!("this host cannot capture or assemble documents"));
    }
    let generator = ReportGenerator::new(SceneRasterizer::new().strict_assets(strict_assets), cfg)?;
    generator.on_retry(|attempt, msg| warn!("attempt {attempt} failed: {msg}"));
    generator.subscribe(|status| {
        tracing::debug!(
            "status stage={:?} progress={:.1} attempt={}",
            status.stage,
            status.progress,
            status.attempt
        )
    });
    Ok(generator)
}

async fn generate(
    cfg: &Config,
    data: &Path,
    surface: &Path,
    out_override: Option<&Path>,
    strict_assets: bool,
) -> Result<()> {
    let report = load_report(data)?;
    let scene = Scene::load(surface)?;
    let out_dir = out_override
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.output.out_dir));
    ensure_dir(&out_dir)?;

    let generator = build_generator(cfg, strict_assets)?.with_out_dir(&out_dir);
    match generator.generate(&report, &scene).await? {
        GenerationOutcome::Completed(summary) => {
            if cfg.output.write_summary_json {
                let stem = summary
                    .filename
                    .rsplit_once('.')
                    .map(|(stem, _)| stem)
                    .unwrap_or(&summary.filename);
                std::fs::write(
                    out_dir.join(format!("{stem}.summary.json")),
                    serde_json::to_string_pretty(&summary)?,
                )?;
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        GenerationOutcome::Cancelled => Err(anyhow!("generation was cancelled")),
    }
}

async fn preview(cfg: &Config, data: &Path, surface: &Path, dump: Option<&Path>) -> Result<()> {
    let report = load_report(data)?;
    let scene = Scene::load(surface)?;
    let generator = build_generator(cfg, false)?;

    let handle = generator
        .generate_preview(&report, &scene)
        .await
        .ok_or_else(|| {
            let status = generator.status();
            anyhow!(
                "preview failed: {}",
                status.error.unwrap_or_else(|| "cancelled".to_string())
            )
        })?;

    if let Some(path) = dump {
        std::fs::write(path, handle.document.as_slice())
            .with_context(|| format!("writing preview: {}", path.display()))?;
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "url": handle.url,
            "pages": handle.pages,
            "bytes": handle.document.len(),
        }))?
    );
    generator.revoke_preview(&handle.url);
    Ok(())
}
