use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;
use miette::{Context, IntoDiagnostic};

use prism_backend_core::{BackendOptions, BackendRegistry, DiagnosticLevel, OutputContent};
use prism_ir::Module;
use prism_transform::{PipelineConfig, Target};

/// Prism: shader IR transform pipeline
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Input module (Prism IR JSON)
    input: PathBuf,

    /// Pipeline configuration (JSON). Without one, only the transforms the
    /// target always needs run.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shader target the bindings are laid out for
    #[arg(short, long, default_value = "spirv")]
    target: Target,

    /// Output format
    #[arg(short, long, default_value = "ir-dump")]
    emit: String,

    /// Output path (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Dump the transformed IR to stderr
    #[arg(long)]
    emit_ir: bool,

    /// Run and validate the pipeline without producing output
    #[arg(long)]
    dry_run: bool,

    /// Log each pipeline stage
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let source = std::fs::read_to_string(&cli.input)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", cli.input.display()))?;
    let mut module = Module::from_json(&source)
        .map_err(|e| miette::miette!("{e}"))
        .wrap_err_with(|| format!("{} is not a Prism module", cli.input.display()))?;

    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to read {}", path.display()))?;
            PipelineConfig::from_json(&text)
                .map_err(|e| miette::miette!("{e}"))
                .wrap_err_with(|| format!("bad pipeline configuration in {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };

    let pipeline = config
        .build(&module, cli.target)
        .map_err(|e| miette::miette!("{e}"))
        .wrap_err("failed to build the pipeline")?;
    log::info!("running {:?} for {}", pipeline.names(), cli.target);
    pipeline
        .run(&mut module)
        .map_err(|e| miette::miette!("{e}"))
        .wrap_err("pipeline failed")?;

    if cli.emit_ir {
        eprintln!("{}", prism_ir::dump_module(&module));
    }
    if cli.dry_run {
        return Ok(());
    }

    let registry = BackendRegistry::with_builtins();
    let backend = registry.find(&cli.emit).ok_or_else(|| {
        let available = registry.list_targets().join(", ");
        miette::miette!("unknown output format '{}' (available: {})", cli.emit, available)
    })?;
    let opts = BackendOptions {
        stem: cli
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned()),
    };
    let output = backend
        .compile(&module, &opts)
        .map_err(|e| miette::miette!("{e}"))
        .wrap_err_with(|| format!("{} failed", backend.name()))?;

    for diag in &output.diagnostics {
        match diag.level {
            DiagnosticLevel::Warning => log::warn!("{}", diag.message),
            DiagnosticLevel::Info => log::info!("{}", diag.message),
        }
    }

    for file in &output.files {
        match (&cli.output, &file.content) {
            (Some(path), content) => {
                std::fs::write(path, content.as_bytes())
                    .into_diagnostic()
                    .wrap_err_with(|| format!("failed to write {}", path.display()))?;
            }
            (None, OutputContent::Text(text)) => print!("{text}"),
            (None, OutputContent::Binary(_)) => {
                return Err(miette::miette!(
                    "{} produced binary output but no --output path was given",
                    backend.name()
                ));
            }
        }
    }
    Ok(())
}
