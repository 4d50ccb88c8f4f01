//! Kestrel CLI: run and inspect compiled BASIC images.

mod console;

use clap::{Parser, Subcommand};
use kestrel_core::image::{Image, ImageError};
use kestrel_core::value::parse_number;
use kestrel_core::Value;
use kestrel_vm::{ConfigError, DebugHook, DebugMode, Outcome, Vm, VmConfig, VmError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn red(s: &str) -> String {
    format!("\x1b[31m{}\x1b[0m", s)
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{}\x1b[0m", s)
}
fn gray(s: &str) -> String {
    format!("\x1b[90m{}\x1b[0m", s)
}

#[derive(Parser)]
#[command(name = "kestrel", version, about = "Run compiled Kestrel BASIC images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a procedure of an image
    Run {
        /// Path to the image JSON
        #[arg()]
        file: PathBuf,

        /// Entry procedure (default: Main)
        #[arg(long, default_value = "Main")]
        entry: String,

        /// Argument passed to the entry procedure; numbers become numeric values
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Config file (default: nearest kestrel.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Log every executed statement line
        #[arg(long)]
        trace_lines: bool,
    },
    /// Print an image's bytecode listing
    Disasm {
        /// Path to the image JSON
        #[arg()]
        file: PathBuf,
    },
    /// Show the effective interpreter settings
    Config {
        /// Config file (default: nearest kestrel.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("cannot read '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid image '{path}': {source}")]
    Image { path: PathBuf, source: ImageError },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Logs each statement and keeps stepping.
struct LineTracer;

impl DebugHook for LineTracer {
    fn on_statement(&mut self, line: u32, start_col: u16, end_col: u16) -> DebugMode {
        tracing::info!(line, start_col, end_col, "statement");
        DebugMode::StepInto
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("KESTREL_LOG")
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_image(path: &Path) -> Result<Image, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Image::from_json(&text).map_err(|source| CliError::Image {
        path: path.to_path_buf(),
        source,
    })
}

fn load_config(explicit: Option<&Path>) -> Result<VmConfig, CliError> {
    match explicit {
        Some(path) => Ok(VmConfig::load_from(path)?),
        None => {
            let (found, config) = VmConfig::load()?;
            if let Some(path) = found {
                tracing::debug!(path = %path.display(), "using config");
            }
            Ok(config)
        }
    }
}

/// Command-line arguments are numbers when they parse as one.
fn arg_value(text: &str) -> Value {
    match parse_number(text) {
        Some(n) if n.fract() == 0.0 && n >= i32::MIN as f64 && n <= i32::MAX as f64 => {
            Value::Long(n as i32)
        }
        Some(n) => Value::Double(n),
        None => Value::string(text),
    }
}

fn cmd_run(
    file: &Path,
    entry: &str,
    args: &[String],
    config: Option<&Path>,
    trace_lines: bool,
) -> Result<Option<Value>, CliError> {
    let image = load_image(file)?;
    let config = load_config(config)?;
    let mut vm = Vm::new(image, config);
    vm.set_io(console::ConsoleIo::new());
    if trace_lines {
        vm.set_debug_hook(LineTracer);
        vm.break_next();
    }
    match vm.call_values(entry, args.iter().map(|a| arg_value(a)))? {
        Outcome::Completed(value) => Ok(Some(value)),
        Outcome::Stopped => Ok(None),
    }
}

fn cmd_disasm(file: &Path) -> Result<String, CliError> {
    let image = load_image(file)?;
    image.disassemble().map_err(|source| CliError::Image {
        path: file.to_path_buf(),
        source,
    })
}

fn cmd_config(config: Option<&Path>) -> Result<String, CliError> {
    let config = load_config(config)?;
    Ok(serde_json::to_string_pretty(&config)?)
}

fn fail(err: CliError) -> ! {
    eprintln!("{} {}", red("error:"), err);
    std::process::exit(1);
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            entry,
            args,
            config,
            trace_lines,
        } => match cmd_run(&file, &entry, &args, config.as_deref(), trace_lines) {
            Ok(Some(Value::Empty)) => {}
            Ok(Some(value)) => println!("{}", value),
            Ok(None) => eprintln!("{}", yellow("stopped")),
            Err(e) => fail(e),
        },
        Commands::Disasm { file } => match cmd_disasm(&file) {
            Ok(listing) => {
                println!("{}", gray(&format!("; {}", file.display())));
                print!("{}", listing);
            }
            Err(e) => fail(e),
        },
        Commands::Config { config } => match cmd_config(config.as_deref()) {
            Ok(json) => println!("{}", json),
            Err(e) => fail(e),
        },
    }
}
