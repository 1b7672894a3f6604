use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lessonreel::compiler::{CompileReport, ScenarioCompiler};
use lessonreel::config::{CompilerConfig, FfmpegMode, SynthesisFailurePolicy};
use lessonreel::encoding::FfmpegEncoder;
use lessonreel::error::{CompileError, ErrorEnvelope};
use lessonreel::image_source::InlineImageSource;
use lessonreel::plan::plan_segments;
use lessonreel::scenario::{derive_namespace, load_and_validate_scenario, validate_namespace};
use lessonreel::schema::AudioKind;
use lessonreel::segment::{list_segments, resolve_segment};
use lessonreel::synthesis::CommandSynthesizer;

fn version() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();
    VERSION.get_or_init(|| match option_env!("LESSONREEL_REVISION") {
        Some(revision) => format!("{} ({revision})", env!("CARGO_PKG_VERSION")),
        None => env!("CARGO_PKG_VERSION").to_owned(),
    })
}

#[derive(Debug, Parser)]
#[command(name = "lessonreel")]
#[command(version = version())]
#[command(about = "Compiles branching lesson scenarios into playable video segments")]
struct Cli {
    /// Debug-level logging on stderr.
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate a scenario and summarize it.
    Check {
        scenario: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the segments a build would produce.
    Plan {
        scenario: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Synthesize, encode and write every segment.
    Build(BuildArgs),
    /// Print the file for a segment number and optional branch type.
    Locate {
        namespace_dir: PathBuf,
        number: u32,
        #[arg(long = "type")]
        segment_type: Option<String>,
    },
    /// List the segments present in a namespace directory.
    List {
        namespace_dir: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Debug, clap::Args)]
struct BuildArgs {
    scenario: PathBuf,
    #[arg(short = 'o', long = "output-root")]
    output_root: PathBuf,
    /// Defaults to a name derived from the scenario title.
    #[arg(long)]
    namespace: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Speech program: reads text on stdin, writes audio on stdout.
    #[arg(long = "tts-command")]
    tts_command: String,
    /// Argument for the speech program; `{voice}` is substituted.
    #[arg(long = "tts-arg", allow_hyphen_values = true)]
    tts_args: Vec<String>,
    #[arg(long = "tts-format", value_parser = parse_audio_kind, default_value = "mp3")]
    tts_format: AudioKind,
    #[arg(long, value_enum)]
    ffmpeg: Option<FfmpegArg>,
    #[arg(long)]
    fps: Option<u32>,
    /// Keep going when a line cannot be synthesized.
    #[arg(long = "skip-failed-lines", default_value_t = false)]
    skip_failed_lines: bool,
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FfmpegArg {
    Auto,
    System,
    Sidecar,
}

impl From<FfmpegArg> for FfmpegMode {
    fn from(value: FfmpegArg) -> Self {
        match value {
            FfmpegArg::Auto => Self::Auto,
            FfmpegArg::System => Self::System,
            FfmpegArg::Sidecar => Self::Sidecar,
        }
    }
}

fn parse_audio_kind(value: &str) -> Result<AudioKind, String> {
    AudioKind::parse(value).ok_or_else(|| format!("unsupported audio format '{value}'"))
}

impl Commands {
    fn json(&self) -> bool {
        match self {
            Self::Check { json, .. } | Self::Plan { json, .. } | Self::List { json, .. } => *json,
            Self::Build(args) => args.json,
            Self::Locate { .. } => false,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.command.json();
    init_tracing(cli.verbose, json);

    match run(cli.command).await {
        Ok(code) => code,
        Err(error) => report_error(&error, json),
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "lessonreel=debug"
    } else if json {
        "lessonreel=warn"
    } else {
        "lessonreel=info"
    };
    let filter = if verbose {
        EnvFilter::new(default)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Check { scenario, json } => run_check(&scenario, json),
        Commands::Plan { scenario, json } => run_plan(&scenario, json),
        Commands::Build(args) => run_build(args).await,
        Commands::Locate {
            namespace_dir,
            number,
            segment_type,
        } => {
            let path = resolve_segment(&namespace_dir, number, segment_type.as_deref())?;
            println!("{}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::List {
            namespace_dir,
            json,
        } => run_list(&namespace_dir, json),
    }
}

fn run_check(scenario_path: &Path, json: bool) -> Result<ExitCode> {
    let scenario = load_and_validate_scenario(scenario_path)?;
    let planned = plan_segments(&scenario).len();
    if json {
        let summary = json!({
            "ok": true,
            "title": scenario.title,
            "namespace": derive_namespace(&scenario.title),
            "blocks": scenario.script.len(),
            "branches": scenario.branch_count(),
            "planned_segments": planned,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("OK: {} ({})", scenario_path.display(), scenario.title);
        println!(
            "Blocks: {}  Branches: {}  Planned segments: {}",
            scenario.script.len(),
            scenario.branch_count(),
            planned
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn run_plan(scenario_path: &Path, json: bool) -> Result<ExitCode> {
    let scenario = load_and_validate_scenario(scenario_path)?;
    let plan = plan_segments(&scenario);
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(ExitCode::SUCCESS);
    }
    for segment in &plan {
        println!(
            "{}  {} line(s){}",
            segment.file_name,
            segment.lines.len(),
            if segment.has_image { "" } else { "  [placeholder]" }
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn run_list(namespace_dir: &Path, json: bool) -> Result<ExitCode> {
    let segments = list_segments(namespace_dir)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&segments)?);
    } else {
        for segment in &segments {
            println!("{}", segment.path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_build(args: BuildArgs) -> Result<ExitCode> {
    let scenario = load_and_validate_scenario(&args.scenario)?;
    let mut config = match &args.config {
        Some(path) => CompilerConfig::load(path)?,
        None => CompilerConfig::default(),
    };
    if let Some(mode) = args.ffmpeg {
        config.ffmpeg = mode.into();
    }
    if let Some(fps) = args.fps {
        config.fps = fps;
    }
    if args.skip_failed_lines {
        config.on_synthesis_error = SynthesisFailurePolicy::SkipLine;
    }
    config.validate().context("invalid compiler settings")?;

    let namespace = match args.namespace {
        Some(namespace) => {
            validate_namespace(&namespace)?;
            namespace
        }
        None => derive_namespace(&scenario.title),
    };
    let output_dir = args.output_root.join(&namespace);

    let encoder = FfmpegEncoder::from_config(&config)?;
    let synthesizer = CommandSynthesizer::new(
        args.tts_command,
        args.tts_args,
        args.tts_format,
        config.synthesis_timeout(),
    );
    let compiler = ScenarioCompiler::new(
        Arc::new(synthesizer),
        Arc::new(InlineImageSource),
        Arc::new(encoder),
        config,
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current block");
            on_interrupt.cancel();
        }
    });

    let report = compiler.compile(&scenario, &output_dir, &cancel).await?;
    print_report(&report, args.json)?;
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &CompileReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    info!(
        namespace = %report.namespace,
        fingerprint = %report.scenario_fingerprint,
        "build complete"
    );
    for segment in &report.segments {
        println!("{}", segment.path.display());
    }
    if report.is_partial() {
        println!(
            "Partial build: {} segment(s) written, {} failed:",
            report.segments.len(),
            report.failures.len()
        );
        for failure in &report.failures {
            println!(
                "  {} #{:03} [{}] {}",
                failure.branch_identity.label(),
                failure.sequence_number,
                failure.code,
                failure.message
            );
        }
    }
    Ok(())
}

fn report_error(error: &anyhow::Error, json: bool) -> ExitCode {
    let compile_error = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<CompileError>());

    if json {
        let envelope = match compile_error {
            Some(compile_error) => compile_error.envelope(),
            None => ErrorEnvelope::new("E_FAILED", format!("{error:#}"), None),
        };
        match serde_json::to_string(&envelope) {
            Ok(rendered) => eprintln!("{rendered}"),
            Err(_) => eprintln!("error: {error:#}"),
        }
    } else {
        eprintln!("error: {error:#}");
    }

    match compile_error {
        Some(CompileError::Cancelled { .. }) => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    }
}
