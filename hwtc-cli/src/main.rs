//! hwtc CLI entrypoint.
//!
//! ```bash
//! hwtc transcode --job job.json --output out.264
//! hwtc plan --job job.json --json
//! hwtc validate --job job.json
//! hwtc devices --caps caps.json --json
//! ```

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use hwtc_codec::reference::ReferenceOpener;
use hwtc_core::codec_traits::FrameSource;
use hwtc_core::error::{EngineError, Result};
use hwtc_pipeline::file_sink::{OutputTarget, open_outputs};
use hwtc_pipeline::job::TranscodeJob;
use hwtc_pipeline::pipeline::{RunReport, TranscodePipeline};
use hwtc_pipeline::plan::{PlanSummary, TranscodePlan, plan};

const JSON_SCHEMA_VERSION: u32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "hwtc",
    version,
    about = "GPU video transcoding core",
    arg_required_else_help = true,
    after_help = "Examples:\n  hwtc validate --job job.json\n  hwtc plan --job job.json --json\n  hwtc transcode --job job.json --output out.264\n  hwtc devices --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Plan and run a transcode job.
    Transcode(TranscodeArgs),
    /// Resolve a job against the device tables and print the plan.
    Plan(PlanArgs),
    /// Check a job file without touching any device.
    Validate(ValidateArgs),
    /// List devices and their encoder capabilities.
    Devices(DevicesArgs),
}

#[derive(Args, Debug, Clone)]
struct JobArgs {
    /// Job file (JSON). The built-in default job is used when absent.
    #[arg(short = 'j', long = "job")]
    job: Option<PathBuf>,

    /// Capability table (JSON) overriding the job's device source.
    #[arg(long = "caps")]
    caps: Option<PathBuf>,

    /// Pin a device id.
    #[arg(short = 'd', long = "device")]
    device: Option<u32>,

    /// Enumerate adapters through the CUDA driver.
    #[arg(long = "cuda", default_value_t = false)]
    cuda: bool,
}

#[derive(Args, Debug, Clone)]
struct TranscodeArgs {
    #[command(flatten)]
    job: JobArgs,

    /// Output file, repeatable; `-` writes to stdout. Replaces the job's outputs.
    #[arg(short = 'o', long = "output")]
    output: Vec<PathBuf>,

    /// Emit the run report as JSON to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct PlanArgs {
    #[command(flatten)]
    job: JobArgs,

    /// Emit the plan as JSON to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct ValidateArgs {
    /// Job file (JSON).
    #[arg(short = 'j', long = "job")]
    job: PathBuf,

    /// Emit the result as JSON to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct DevicesArgs {
    /// Capability table (JSON); the reference device otherwise.
    #[arg(long = "caps")]
    caps: Option<PathBuf>,

    /// Enumerate adapters through the CUDA driver.
    #[arg(long = "cuda", default_value_t = false)]
    cuda: bool,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Transcode(args) if args.json => Some("transcode"),
        Commands::Plan(args) if args.json => Some("plan"),
        Commands::Validate(args) if args.json => Some("validate"),
        Commands::Devices(args) if args.json => Some("devices"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Transcode(args) => build_runtime().and_then(|rt| rt.block_on(run_transcode(args))),
        Commands::Plan(args) => run_plan(args),
        Commands::Validate(args) => run_validate(args),
        Commands::Devices(args) => run_devices(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(err.error_code());
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

// ─── Job loading ─────────────────────────────────────────────────────────

fn load_job(args: &JobArgs) -> Result<TranscodeJob> {
    let mut job = match &args.job {
        Some(path) => TranscodeJob::from_json_file(path)?,
        None => TranscodeJob::default(),
    };
    if let Some(caps) = &args.caps {
        job.device.caps_file = Some(caps.clone());
    }
    if args.device.is_some() {
        job.device.id = args.device;
    }
    job.device.cuda |= args.cuda;
    Ok(job)
}

fn output_target(path: &Path) -> OutputTarget {
    if path.as_os_str() == "-" {
        OutputTarget::Stdout
    } else {
        OutputTarget::File {
            path: path.to_path_buf(),
        }
    }
}

fn plan_job(job: &TranscodeJob) -> Result<(TranscodePlan, Box<dyn FrameSource>)> {
    let source = job.input.open()?;
    let prober = job.device.prober()?;
    let planned = plan(job, source.as_ref(), prober.as_ref(), &HashMap::new())?;
    Ok((planned, source))
}

// ─── Commands ────────────────────────────────────────────────────────────

async fn run_transcode(args: TranscodeArgs) -> Result<()> {
    let mut job = load_job(&args.job)?;
    if !args.output.is_empty() {
        job.outputs = args.output.iter().map(|p| output_target(p)).collect();
    }
    if args.json && job.outputs.contains(&OutputTarget::Stdout) {
        return Err(EngineError::Config(
            "--json cannot be combined with a stdout output".into(),
        ));
    }

    let (planned, source) = plan_job(&job)?;
    for w in &planned.warnings {
        warn!(warning = %w, "Plan warning");
    }
    let sink = open_outputs(&job.outputs)?;

    let pipeline = TranscodePipeline::new(job.runtime.pipeline_config());
    let cancel = pipeline.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping transcode");
            cancel.cancel();
        }
    });

    let started = Instant::now();
    let result = pipeline
        .run(planned, source, Box::new(ReferenceOpener::new()), sink)
        .await;
    interrupt.abort();
    let report = result?;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    if args.json {
        println!("{}", transcode_json(&report, elapsed_ms));
    } else if !job.outputs.contains(&OutputTarget::Stdout) {
        println!("{}", transcode_human(&report, elapsed_ms));
    }
    info!(encoded = report.frames_encoded, elapsed_ms, "Transcode complete");
    Ok(())
}

fn run_plan(args: PlanArgs) -> Result<()> {
    let job = load_job(&args.job)?;
    let (planned, _source) = plan_job(&job)?;
    let summary = planned.summary();
    if args.json {
        println!("{}", plan_json(&summary));
    } else {
        print!("{}", plan_human(&summary));
    }
    Ok(())
}

fn run_validate(args: ValidateArgs) -> Result<()> {
    let job = TranscodeJob::from_json_file(&args.job)?;
    job.validate()?;
    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "validate",
                "ok": true,
                "job": args.job.display().to_string(),
                "outputs": job.outputs.len(),
            })
        );
    } else {
        println!("validate: ok job={}", args.job.display());
    }
    Ok(())
}

fn run_devices(args: DevicesArgs) -> Result<()> {
    let device = hwtc_pipeline::job::DeviceConfig {
        caps_file: args.caps,
        cuda: args.cuda,
        ..Default::default()
    };
    let prober = device.prober()?;
    let devices = prober.probe(None)?;
    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "devices",
                "ok": true,
                "prober": prober.name(),
                "devices": devices,
            })
        );
    } else {
        println!("devices: {}", devices.len());
        for dev in &devices {
            let codecs: Vec<String> = dev.codecs.iter().map(|c| format!("{:?}", c.codec)).collect();
            println!(
                "device={} name={} compute={}.{} cores={} codecs={}",
                dev.id,
                dev.name,
                dev.compute_capability.0,
                dev.compute_capability.1,
                dev.cuda_cores,
                codecs.join(",")
            );
        }
    }
    Ok(())
}

// ─── Output formatting ───────────────────────────────────────────────────

fn command_error_json(command: &str, err: &EngineError) -> serde_json::Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "code": err.error_code(),
        "error": err.to_string(),
    })
}

fn transcode_json(report: &RunReport, elapsed_ms: f64) -> serde_json::Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": "transcode",
        "ok": true,
        "elapsed_ms": elapsed_ms,
        "report": report,
    })
}

fn transcode_human(report: &RunReport, elapsed_ms: f64) -> String {
    let fps = if elapsed_ms > 0.0 {
        report.frames_encoded as f64 * 1000.0 / elapsed_ms
    } else {
        0.0
    };
    format!(
        "transcode: read={} trimmed={} dropped={} duplicated={} encoded={} forced_retrievals={} elapsed_ms={:.3} fps={:.3}",
        report.frames_read,
        report.frames_trimmed,
        report.frames_dropped,
        report.frames_duplicated,
        report.frames_encoded,
        report.forced_retrievals,
        elapsed_ms,
        fps
    )
}

fn plan_json(summary: &PlanSummary) -> serde_json::Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": "plan",
        "ok": true,
        "plan": summary,
    })
}

fn plan_human(s: &PlanSummary) -> String {
    let mut out = format!(
        "plan: device={} ({}) codec={:?} profile={:?} {}x{} fps={} timebase={} pool={}\n",
        s.device_id,
        s.device_name,
        s.codec,
        s.profile,
        s.width,
        s.height,
        s.fps,
        s.timebase,
        s.pool_capacity
    );
    out.push_str(&format!("stages: {}\n", s.stages.join(" -> ")));
    for r in &s.rejected {
        out.push_str(&format!("rejected: device={} reason={}\n", r.id, r.reason));
    }
    for w in &s.warnings {
        out.push_str(&format!("warning: {w}\n"));
    }
    out
}
