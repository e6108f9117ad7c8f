use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use daybreak_core::codec::{encode_png, UploadKind};
use daybreak_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use daybreak_core::generator::{OnnxLoader, Topology};
use daybreak_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RuntimeLogMode,
    DEFAULT_LOG_FILTER,
};
use daybreak_core::model_inspect::{self, GraphSummary, WeightsInspection};
use daybreak_core::model_store::ModelStore;
use daybreak_core::server::{app_router, model_entries, AppState, ModelEntry};
use daybreak_core::translate::Translator;
use daybreak_core::video::{sample_video, FrameSequence, VideoTranslationMode};
use daybreak_core::ModelId;

#[derive(Parser)]
#[command(
    name = "daybreak",
    about = "Translate night-time scenes into daytime with pretrained GAN generators",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate a single still image.
    Translate(TranslateArgs),
    /// Sample frames from an MP4 and translate them.
    Video(VideoArgs),
    /// List model identifiers and whether their weights are present.
    Models,
    /// Inspect a weights file or exported ONNX model without loading ONNX Runtime.
    Inspect(InspectArgs),
}

#[derive(Args)]
struct TranslateArgs {
    #[arg(short, long, help = "Model identifier, e.g. CycleGAN")]
    model: ModelId,
    #[arg(help = "Input image (PNG, JPEG, BMP, WebP)")]
    input: PathBuf,
    #[arg(short, long, help = "Output PNG path")]
    output: PathBuf,
}

#[derive(Args)]
struct VideoArgs {
    #[arg(short, long, help = "Model identifier, e.g. CycleGAN")]
    model: ModelId,
    #[arg(help = "Input MP4 video")]
    input: PathBuf,
    #[arg(long, help = "Directory for night_NNNN.png / day_NNNN.png pairs")]
    out_dir: PathBuf,
    #[arg(long, help = "Keep every Nth frame (defaults to pipeline.video_sample_stride)")]
    stride: Option<usize>,
    #[arg(long, help = "Translate every sampled frame before writing any")]
    eager: bool,
}

#[derive(Args)]
struct InspectArgs {
    #[arg(help = "Path to a .safetensors weights file or an exported .onnx model")]
    weights: PathBuf,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
    #[arg(long, value_name = "PATH", help = "Also write the compiled ONNX model")]
    export_onnx: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    daybreak_core::runtime::setup_runtime_libs(Some(resolved_data_dir.as_path()));
    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    daybreak_core::runtime::log_runtime_lib_status();
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Translate(args)) => {
            let config = load_config(&resolved_data_dir);
            tokio::task::spawn_blocking(move || run_translate(args, &config, &resolved_data_dir))
                .await?
        }
        Some(Commands::Video(args)) => {
            let config = load_config(&resolved_data_dir);
            tokio::task::spawn_blocking(move || run_video(args, &config, &resolved_data_dir))
                .await?
        }
        Some(Commands::Models) => {
            let config = load_config(&resolved_data_dir);
            let store = build_store(&config, &resolved_data_dir);
            print!("{}", format_model_table(&model_entries(&store)));
            Ok(())
        }
        Some(Commands::Inspect(args)) => run_inspect(args),
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted to crash logs."
        );
    }

    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(parse_env_filter_with_fallback(&file_filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Disabled {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = mode.as_str(),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn build_store(config: &AppConfig, data_dir: &Path) -> ModelStore {
    let assets_dir = config.assets_dir(data_dir);
    info!(
        assets_dir = %assets_dir.display(),
        backend = %config.inference.backend,
        "Model store configured"
    );
    ModelStore::new(OnnxLoader::new(assets_dir, config.inference.backend))
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let store = Arc::new(build_store(&config, &data_dir));
    let state = AppState::new(store, config.pipeline.resolution);
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting daybreak server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn run_translate(args: TranslateArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let file_name = args.input.to_string_lossy();
    if UploadKind::from_file_name(&file_name) == UploadKind::Video {
        bail!(
            "{} looks like a video; use `daybreak video` instead",
            args.input.display()
        );
    }

    let bytes = fs::read(&args.input)
        .with_context(|| format!("failed to read input image: {}", args.input.display()))?;
    let translator = Translator::new(
        Arc::new(build_store(config, data_dir)),
        config.pipeline.resolution,
    );
    let png = translator.translate_bytes(args.model, &bytes)?;

    write_file(&args.output, &png)?;
    info!(output = %args.output.display(), model = %args.model, "Wrote translated image");
    Ok(())
}

fn run_video(args: VideoArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let stride = args.stride.unwrap_or(config.pipeline.video_sample_stride);
    let mode = if args.eager {
        VideoTranslationMode::Eager
    } else {
        config.pipeline.video_translation
    };
    let resolution = config.pipeline.resolution;

    let store = build_store(config, data_dir);
    let generator = store.get_model(args.model)?;

    let started = Instant::now();
    let frames = sample_video(&args.input, stride, resolution)?;
    if frames.is_empty() {
        bail!(
            "{} has fewer than {stride} frames; nothing to translate",
            args.input.display()
        );
    }

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create output directory: {}", args.out_dir.display()))?;

    let mut sequence = FrameSequence::prepare(frames, mode, generator.as_ref(), resolution)?;
    loop {
        let index = sequence.position();
        if let Some(night) = sequence.current() {
            write_file(&args.out_dir.join(frame_file_name("night", index)), &encode_png(night)?)?;
        }
        let day = sequence.translate_current(generator.as_ref(), resolution)?;
        write_file(&args.out_dir.join(frame_file_name("day", index)), &encode_png(day)?)?;

        if !sequence.has_next() {
            break;
        }
        sequence.advance()?;
    }

    info!(
        frames = sequence.len(),
        stride,
        mode = ?mode,
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        out_dir = %args.out_dir.display(),
        "Video translation complete"
    );
    Ok(())
}

fn is_onnx_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"))
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    if is_onnx_file(&args.weights) {
        return run_inspect_onnx(args);
    }

    let topology = Topology::unet(3);
    let report = model_inspect::inspect_weights(&args.weights, &topology)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", format_inspection(&report));
    }

    if let Some(out) = args.export_onnx {
        if !report.topology.matches {
            bail!("refusing to export ONNX: weights do not match the generator topology");
        }
        let written = model_inspect::export_onnx(&args.weights, &topology, &out)?;
        info!(path = %out.display(), bytes = written, "Exported ONNX model");
    }
    Ok(())
}

fn run_inspect_onnx(args: InspectArgs) -> Result<()> {
    if args.export_onnx.is_some() {
        bail!("--export-onnx needs a .safetensors weights file as input");
    }
    let bytes = fs::read(&args.weights)
        .with_context(|| format!("failed to read {}", args.weights.display()))?;
    let summary = model_inspect::inspect_onnx_bytes(&bytes)
        .with_context(|| format!("failed to inspect {}", args.weights.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("sha256:      {}", model_inspect::sha256_hex(&bytes));
        println!("size:        {} bytes", bytes.len());
        print!("{}", format_graph_summary(&summary));
    }
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn frame_file_name(prefix: &str, index: usize) -> String {
    format!("{prefix}_{index:04}.png")
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

fn format_model_table(entries: &[ModelEntry]) -> String {
    let mut out = format!("{:<12} {:<24} {}\n", "MODEL", "WEIGHTS", "AVAILABLE");
    for entry in entries {
        out.push_str(&format!(
            "{:<12} {:<24} {}\n",
            entry.id.as_str(),
            entry.weights_file,
            if entry.available { "yes" } else { "no" }
        ));
    }
    out
}

fn format_inspection(report: &WeightsInspection) -> String {
    let mut out = String::new();
    out.push_str(&format!("sha256:      {}\n", report.sha256));
    out.push_str(&format!("size:        {} bytes\n", report.size_bytes));
    out.push_str(&format!(
        "parameters:  {} in {} tensors (generator expects {})\n",
        report.param_count,
        report.tensors.len(),
        report.topology.expected_param_count
    ));
    for tensor in &report.tensors {
        out.push_str(&format!(
            "  {:<32} {:<5} {:?}\n",
            tensor.name, tensor.dtype, tensor.shape
        ));
    }

    let check = &report.topology;
    if check.matches {
        out.push_str("topology:    ok\n");
    } else {
        out.push_str("topology:    MISMATCH\n");
        if let Some(error) = &check.error {
            out.push_str(&format!("  error: {error}\n"));
        }
        for name in &check.missing {
            out.push_str(&format!("  missing: {name}\n"));
        }
        for name in &check.unexpected {
            out.push_str(&format!("  unexpected: {name}\n"));
        }
        for shape in &check.wrong_shape {
            out.push_str(&format!("  shape: {shape}\n"));
        }
    }

    if let Some(graph) = &report.graph {
        out.push_str(&format_graph_summary(graph));
    }
    out
}

fn format_graph_summary(graph: &GraphSummary) -> String {
    let mut out = format!(
        "graph:       {} nodes, opset {}, {} parameters in {} initializers\n",
        graph.node_count, graph.opset_version, graph.param_count, graph.initializer_count
    );
    for tensor in graph.inputs.iter().chain(&graph.outputs) {
        out.push_str(&format!(
            "  io {:<21} {:<5} {:?}\n",
            tensor.name, tensor.data_type, tensor.shape
        ));
    }
    for (op, count) in &graph.op_counts {
        out.push_str(&format!("  {op:<24} {count}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use daybreak_core::model_inspect::{StoredTensor, TopologyCheck};

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(59.4), "00:00:59");
        assert_eq!(format_duration(3725.0), "01:02:05");
    }

    #[test]
    fn frame_names_are_zero_padded() {
        assert_eq!(frame_file_name("day", 3), "day_0003.png");
        assert_eq!(frame_file_name("night", 1234), "night_1234.png");
    }

    #[test]
    fn model_table_lists_every_entry() {
        let entries = vec![
            ModelEntry {
                id: ModelId::CycleGan,
                weights_file: ModelId::CycleGan.weights_file_name(),
                available: true,
                loaded: false,
            },
            ModelEntry {
                id: ModelId::SegmentGan,
                weights_file: ModelId::SegmentGan.weights_file_name(),
                available: false,
                loaded: false,
            },
        ];

        let table = format_model_table(&entries);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("CycleGAN"));
        assert!(lines[1].ends_with("yes"));
        assert!(lines[2].contains("SegmentGAN.safetensors"));
        assert!(lines[2].ends_with("no"));
    }

    #[test]
    fn inspection_text_lists_mismatches() {
        let report = WeightsInspection {
            sha256: "ab".repeat(32),
            size_bytes: 64,
            tensors: vec![StoredTensor {
                name: "down1.model.0.weight".into(),
                dtype: "F32".into(),
                shape: vec![64, 3, 4, 4],
                elements: 3072,
            }],
            param_count: 3072,
            topology: TopologyCheck {
                matches: false,
                expected_param_count: 41_828_995,
                missing: vec!["final.0.bias".into()],
                ..Default::default()
            },
            graph: None,
        };

        let text = format_inspection(&report);
        assert!(text.contains("generator expects 41828995"));
        assert!(text.contains("topology:    MISMATCH"));
        assert!(text.contains("missing: final.0.bias"));
        assert!(!text.contains("graph:"));
    }

    #[test]
    fn onnx_extension_is_detected_case_insensitively() {
        assert!(is_onnx_file(Path::new("exports/CycleGAN.onnx")));
        assert!(is_onnx_file(Path::new("CycleGAN.ONNX")));
        assert!(!is_onnx_file(Path::new("CycleGAN.safetensors")));
        assert!(!is_onnx_file(Path::new("onnx")));
    }

    #[test]
    fn exported_onnx_model_can_be_inspected_from_the_cli() {
        use daybreak_core::generator::topology::Block;
        use daybreak_core::generator::Weights;

        let dir = tempfile::tempdir().unwrap();
        let topology = Topology {
            image_channels: 3,
            blocks: vec![
                Block::down("down1", 3, 4, false, 0.0),
                Block::output("final", 4, 3),
            ],
        };
        let weights_path = dir.path().join("tiny.safetensors");
        Weights::zeros_for(&topology).write(&weights_path).unwrap();
        let onnx_path = dir.path().join("tiny.onnx");
        model_inspect::export_onnx(&weights_path, &topology, &onnx_path).unwrap();

        let summary = model_inspect::inspect_onnx_bytes(&fs::read(&onnx_path).unwrap()).unwrap();
        let text = format_graph_summary(&summary);
        assert!(text.starts_with("graph:       4 nodes, opset 17"));
        assert!(text.contains("io input"));
        assert!(text.contains("io output"));
        assert!(text.contains("ConvTranspose"));

        run_inspect(InspectArgs {
            weights: onnx_path.clone(),
            json: true,
            export_onnx: None,
        })
        .unwrap();

        let err = run_inspect(InspectArgs {
            weights: onnx_path,
            json: false,
            export_onnx: Some(dir.path().join("again.onnx")),
        })
        .unwrap_err();
        assert!(err.to_string().contains("--export-onnx"));
    }
}
