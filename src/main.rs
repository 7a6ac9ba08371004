use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use freight::config::{ContextSourceSpec, Delimiters, GeneratorConfig, SelectorCase};
use freight::{Context, Generator, GlobalSource};
use log::{debug, error, info, log_enabled, warn, Level, LevelFilter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

/// Global source picked up from the working directory when none is given.
const DEFAULT_GLOBAL_SOURCE: &str = "freight.yaml";

#[derive(Parser)]
#[command(name = "freight", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a source tree into a destination directory
    Run(RunArgs),
    /// Print the version and build commit
    Version,
}

#[derive(Args)]
struct RunArgs {
    /// Log level: 0 off, 1 error, 2 warn, 3 info, 4 debug, 5 trace
    #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(0..=5))]
    log_level: u8,

    /// Print the planned actions without touching the destination
    #[arg(short, long)]
    dry_run: bool,

    /// Left and right tag delimiters, comma separated
    #[arg(long, default_value = "{{,}}")]
    delimiters: String,

    /// File name prefix marking single templates
    #[arg(long, default_value = "_")]
    prefix: String,

    /// Context source as Name=path.json|yaml, or the path of a global source
    #[arg(short = 'c', long = "context", value_name = "NAME=PATH")]
    contexts: Vec<String>,

    /// Match selector fields ignoring ASCII case
    #[arg(long)]
    ignore_case: bool,

    /// Source directory
    src: PathBuf,

    /// Destination directory
    #[arg(default_value = "build")]
    dst: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("freight {}", freight::version_string());
            ExitCode::SUCCESS
        }
        Commands::Run(args) => {
            init_logger(args.log_level);
            let started = Instant::now();
            match run(args) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("{:#}", e);
                    error!("failed in {:?}", started.elapsed());
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn init_logger(level: u8) {
    let filter = match level {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(filter)
        .format_timestamp_millis()
        .init();
}

fn run(args: RunArgs) -> Result<()> {
    let config = GeneratorConfig {
        delimiters: Delimiters::parse(&args.delimiters)?,
        mode_prefix: args.prefix,
        dry_run: args.dry_run,
        selector_case: if args.ignore_case {
            SelectorCase::Insensitive
        } else {
            SelectorCase::Sensitive
        },
    };
    config.validate()?;

    if !args.src.is_dir() {
        bail!("source directory {:?} does not exist", args.src);
    }

    let context = load_context(&config, &args.contexts)?;
    let generator = Generator::new(config, context)?;
    let plan = generator
        .plan(&[&args.src], &args.dst)
        .with_context(|| format!("failed to plan {:?} into {:?}", args.src, args.dst))?;

    if generator.config().dry_run {
        println!("{}", plan.describe());
        return Ok(());
    }

    let started = Instant::now();
    if let Err(failure) = plan.execute() {
        for orphan in &failure.orphans {
            warn!(
                "left behind by action#{} ({}): {}",
                orphan.action, orphan.description, orphan.error
            );
        }
        return Err(failure.into());
    }
    info!("done in {:?}", started.elapsed());
    Ok(())
}

fn load_context(config: &GeneratorConfig, specs: &[String]) -> Result<Context> {
    let specs = specs
        .iter()
        .map(|s| ContextSourceSpec::parse(s))
        .collect::<Result<Vec<_>, _>>()?;

    let mut global = None;
    for spec in &specs {
        if let ContextSourceSpec::Global(path) = spec {
            if global.is_some() {
                bail!("only one global context source is allowed, got {:?} too", path);
            }
            global = Some(read_global(path)?);
        }
    }
    if global.is_none() {
        global = std::fs::read(DEFAULT_GLOBAL_SOURCE)
            .ok()
            .and_then(|data| GlobalSource::from_yaml(&data).ok());
        if global.is_some() {
            info!("using global context from {}", DEFAULT_GLOBAL_SOURCE);
        }
    }

    let mut context = match global {
        Some(global) => Context::with_global(config.selector_case, global)?,
        None => Context::new(config.selector_case),
    };
    for spec in specs {
        if let ContextSourceSpec::Named { name, path, format } = spec {
            info!("loading {} from {:?}", name, path);
            let data = std::fs::read(&path)
                .with_context(|| format!("failed to read context source {:?}", path))?;
            context
                .load(&name, format, &data)
                .with_context(|| format!("failed to load {:?} into {}", path, name))?;
        }
    }
    context.load_env_vars();
    context.load_os_vars();

    if log_enabled!(Level::Debug) {
        debug!("context: {}", serde_json::to_string_pretty(&context)?);
    }
    Ok(context)
}

fn read_global(path: &Path) -> Result<GlobalSource> {
    let data = std::fs::read(path).with_context(|| format!("failed to read global context {:?}", path))?;
    GlobalSource::from_yaml(&data).with_context(|| format!("failed to load global context {:?}", path))
}
