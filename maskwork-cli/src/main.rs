// maskwork command line interface
// Drives the service in-process: segmentation, edits, batches and jobs

use anyhow::{anyhow, bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::{Parser, Subcommand};
use maskwork_core::{EditParams, ImageId, MaskworkConfig, PointPrompt};
use maskwork_eye::{BatchInput, BatchMode};
use maskwork_server::dto::{ApplyRequest, ComponentEdit, SaveComponentRequest, SegmentRequest};
use maskwork_server::{
    telemetry, BatchEvent, InMemoryStatusStore, JobSpec, LocalDirObjectStore, MaskworkService, StreamOutcome,
    Worker,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "maskwork")]
#[command(about = "Point-prompted segmentation and region editing", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show model, cache and store status
    Health {
        /// Load the model before reporting
        #[arg(long)]
        load: bool,
    },

    /// Segment an image from point prompts and write the candidate masks
    Segment {
        image: PathBuf,

        /// `x,y` in [0, 1]; append `,neg` for a negative prompt
        #[arg(long = "point", short = 'p', required = true, value_parser = parse_point)]
        points: Vec<PointPrompt>,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long, default_value = "masks")]
        out_dir: PathBuf,
    },

    /// Segment from points, then edit the best region
    Apply {
        image: PathBuf,

        #[arg(long = "point", short = 'p', required = true, value_parser = parse_point)]
        points: Vec<PointPrompt>,

        /// Edit parameters as JSON, e.g. '{"brightness":0.2,"hue":30}'
        #[arg(long, value_parser = parse_edit)]
        edit: EditParams,

        #[arg(long, short)]
        out: PathBuf,

        /// Also write the edited region's mask here
        #[arg(long)]
        mask_out: Option<PathBuf>,
    },

    /// Apply one edit to every image in a directory
    Batch {
        input_dir: PathBuf,

        /// full-image or single-center-point
        #[arg(long, default_value = "full-image", value_parser = parse_mode)]
        mode: BatchMode,

        #[arg(long, value_parser = parse_edit)]
        edit: EditParams,

        #[arg(long, default_value = "out")]
        out_dir: PathBuf,

        #[arg(long)]
        export_mask: bool,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Run one job description against local directories
    RunJob {
        /// Job JSON file
        job: PathBuf,

        /// Root holding the dataset prefix
        #[arg(long)]
        input_root: PathBuf,

        /// Root receiving `{output_prefix}{filename}`
        #[arg(long)]
        output_root: PathBuf,

        /// Root holding the checkpoint object, used when none resolves locally
        #[arg(long)]
        models_root: Option<PathBuf>,

        #[arg(long, default_value = maskwork_server::worker::DEFAULT_MODEL_KEY)]
        model_key: String,
    },
}

fn parse_point(raw: &str) -> Result<PointPrompt, String> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    let (x, y, positive) = match parts.as_slice() {
        [x, y] => (*x, *y, true),
        [x, y, "neg"] | [x, y, "-"] => (*x, *y, false),
        [x, y, "pos"] | [x, y, "+"] => (*x, *y, true),
        _ => return Err(format!("expected x,y[,neg], got '{}'", raw)),
    };
    let x: f32 = x.parse().map_err(|_| format!("bad x in '{}'", raw))?;
    let y: f32 = y.parse().map_err(|_| format!("bad y in '{}'", raw))?;
    let point = PointPrompt { x_norm: x, y_norm: y, positive };
    if !point.is_valid() {
        return Err(format!("point '{}' is outside [0, 1]", raw));
    }
    Ok(point)
}

fn parse_edit(raw: &str) -> Result<EditParams, String> {
    let edit = EditParams::from_json(raw).map_err(|e| e.to_string())?;
    edit.validate().map_err(|e| e.to_string())?;
    Ok(edit)
}

fn parse_mode(raw: &str) -> Result<BatchMode, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| format!("unknown mode '{}' (full-image, single-center-point)", raw))
}

fn write_b64(path: &Path, b64: &str) -> anyhow::Result<()> {
    let bytes = BASE64.decode(b64).context("service returned invalid base64")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = MaskworkConfig::load(cli.config.as_deref())?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    telemetry::init_logging(&config.logging)?;

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let service = MaskworkService::new(config);
    match cli.command {
        Commands::Health { load } => {
            if load {
                if let Err(e) = service.models().ensure_loaded() {
                    warn!("Model load failed: {}", e);
                }
            }
            print_json(&service.health().await)?;
        }
        Commands::Segment { image, points, top_k, out_dir } => {
            segment(&service, &image, points, top_k, &out_dir).await?;
        }
        Commands::Apply { image, points, edit, out, mask_out } => {
            apply(&service, &image, points, edit, &out, mask_out.as_deref()).await?;
        }
        Commands::Batch { input_dir, mode, edit, out_dir, export_mask } => {
            batch(&service, &input_dir, mode, edit, &out_dir, export_mask).await?;
        }
        Commands::Config => {}
        Commands::RunJob { job, input_root, output_root, models_root, model_key } => {
            run_job(service, &job, input_root, output_root, models_root, model_key).await?;
        }
    }
    Ok(())
}

async fn segment(
    service: &MaskworkService,
    image: &Path,
    points: Vec<PointPrompt>,
    top_k: Option<usize>,
    out_dir: &Path,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    let session = service.init_session(bytes).await?;
    let response = service
        .segment(SegmentRequest {
            session_id: session.session_id,
            points,
            accumulate: true,
            top_k,
        })
        .await?;

    let mut written = Vec::new();
    for candidate in &response.candidates {
        let path = out_dir.join(format!("mask_{}.png", candidate.rank));
        write_b64(&path, &candidate.mask_png)?;
        written.push(json!({
            "rank": candidate.rank,
            "score": candidate.score,
            "area": candidate.area,
            "bbox": candidate.bbox,
            "path": path,
        }));
    }
    print_json(&json!({
        "model_id": response.model_id,
        "point_summary": response.point_summary,
        "candidates": written,
    }))
}

async fn apply(
    service: &MaskworkService,
    image: &Path,
    points: Vec<PointPrompt>,
    edit: EditParams,
    out: &Path,
    mask_out: Option<&Path>,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    let session = service.init_session(bytes).await?;
    let segmented = service
        .segment(SegmentRequest {
            session_id: session.session_id.clone(),
            points,
            accumulate: true,
            top_k: Some(1),
        })
        .await?;
    let best = segmented
        .candidates
        .first()
        .ok_or_else(|| anyhow!("no region found for the given points"))?;

    let component = service
        .save_component(SaveComponentRequest {
            session_id: session.session_id.clone(),
            mask_png: best.mask_png.clone(),
            score: best.score,
            name: None,
        })
        .await?;
    let applied = service
        .apply(ApplyRequest {
            session_id: session.session_id.clone(),
            edits: vec![ComponentEdit { component_id: component.id, params: edit }],
            export_mask: mask_out.is_some(),
        })
        .await?;

    write_b64(out, &applied.image_png)?;
    if let (Some(path), Some(mask)) = (mask_out, applied.mask_png.as_deref()) {
        write_b64(path, mask)?;
    }
    service.evict_session(session.session_id).await;
    info!("Wrote {} (region area {}, score {:.3})", out.display(), component.area, component.score);
    Ok(())
}

async fn batch(
    service: &MaskworkService,
    input_dir: &Path,
    mode: BatchMode,
    edit: EditParams,
    out_dir: &Path,
    export_mask: bool,
) -> anyhow::Result<()> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(input_dir)
        .with_context(|| format!("listing {}", input_dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| service.config().dataset.accepts(n))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    if paths.is_empty() {
        bail!("no images in {}", input_dir.display());
    }

    let mut inputs = Vec::with_capacity(paths.len());
    for path in &paths {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("non UTF-8 file name {}", path.display()))?;
        let bytes = std::fs::read(path)?;
        inputs.push(BatchInput::encoded(ImageId::from(filename.as_str()), filename, bytes));
    }

    let mut stream = service.run_batch(inputs, mode, edit, export_mask).await?;
    let mut outcome = StreamOutcome::default();
    while let Some(event) = stream.next().await {
        outcome.observe(&event);
        match &event {
            BatchEvent::Item { filename, variant_png, mask_png, .. } => {
                write_b64(&out_dir.join(filename), variant_png)?;
                if let Some(mask) = mask_png {
                    write_b64(&out_dir.join(format!("{}.mask.png", filename)), mask)?;
                }
            }
            BatchEvent::Error { filename, error, .. } => warn!("{}: {}", filename, error),
            BatchEvent::Done { .. } => {}
        }
    }
    if !outcome.completed {
        bail!("batch stream ended early");
    }
    print_json(&json!({
        "succeeded": outcome.items,
        "failed": outcome.errors,
        "out_dir": out_dir,
    }))
}

async fn run_job(
    service: MaskworkService,
    job: &Path,
    input_root: PathBuf,
    output_root: PathBuf,
    models_root: Option<PathBuf>,
    model_key: String,
) -> anyhow::Result<()> {
    let body = std::fs::read_to_string(job).with_context(|| format!("reading {}", job.display()))?;
    let spec = JobSpec::from_json(&body)?;

    let status = Arc::new(InMemoryStatusStore::new());
    let mut worker = Worker::new(
        service,
        Arc::new(LocalDirObjectStore::new(input_root)),
        Arc::new(LocalDirObjectStore::new(output_root)),
        status.clone(),
    );
    if let Some(root) = models_root {
        worker = worker.with_model_store(Arc::new(LocalDirObjectStore::new(root)), model_key);
    }

    worker.ensure_checkpoint().await?;
    let terminal = worker.handle_job(&spec).await?;
    print_json(&json!({
        "job_id": spec.job_id,
        "status": terminal,
        "history": status.history(&spec.job_id),
    }))
}
