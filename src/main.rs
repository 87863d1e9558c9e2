use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use stillpress::config::{self, PipelineConfig};
use stillpress::output;
use stillpress::pipeline::{self, BuildOptions, PipelineEvent};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stillpress")]
#[command(about = "Upscale, render and index gallery images")]
#[command(long_about = "\
Upscale, render and index gallery images

Low-resolution originals are upscaled by external tools (waifu2x, Real-ESRGAN),
rendered into responsive variants and reconciled with the hand-curated
metadata index.

Layout (defaults, all configurable):

  originals/originals_lowres/      # Sources, any depth
  originals/originals_upscaled/    # Working copies, one per source
  src/assets/{s,s2x,l,l2x}/        # <id>.<format> variants
  src/data/images.json             # Canonical metadata (read-only)
  src/data/images.generated.json   # Full index, ascending by sortKey
  public/data/images.slim.json     # Slim index, newest first

Run 'stillpress gen-config' to generate a documented stillpress.toml.")]
#[command(version)]
struct Cli {
    /// Config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline: upscale → render → index
    Build {
        /// Skip the upscale stage
        #[arg(long)]
        no_upscale: bool,
        /// Remove variant files that no record references
        #[arg(long)]
        clean: bool,
    },
    /// Upscale originals into working copies only
    Upscale,
    /// Render variants and write the indexes without upscaling
    Render {
        /// Remove variant files that no record references
        #[arg(long)]
        clean: bool,
    },
    /// Check the config and both index files without writing anything
    Verify,
    /// Print a stock stillpress.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let load = || config::load_config(&cli.config);

    match cli.command {
        Command::Build { no_upscale, clean } => {
            run_build(
                &load()?,
                BuildOptions {
                    upscale: !no_upscale,
                    clean,
                },
            )?;
        }
        Command::Render { clean } => {
            run_build(
                &load()?,
                BuildOptions {
                    upscale: false,
                    clean,
                },
            )?;
        }
        Command::Upscale => {
            let config = load()?;
            output::print_lines(&output::format_effective_config(&config));
            init_thread_pool(&config.processing);
            println!("Upscale");
            let (tx, printer) = spawn_printer();
            let result = pipeline::upscale_only(&config, Some(&tx));
            drop(tx);
            join_printer(printer);
            output::print_lines(&output::format_upscale_summary(&result?));
        }
        Command::Verify => {
            let report = pipeline::verify(&load()?)?;
            output::print_lines(&output::format_verify_report(&report));
            if !report.is_clean() {
                return Err("index verification failed".into());
            }
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

fn run_build(
    config: &PipelineConfig,
    options: BuildOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    output::print_lines(&output::format_effective_config(config));
    init_thread_pool(&config.processing);
    if options.upscale && config.upscale.enabled {
        println!("Upscale");
    }
    let (tx, printer) = spawn_printer();
    let result = pipeline::build(config, options, Some(&tx));
    drop(tx);
    join_printer(printer);
    let stats = result?;
    output::print_lines(&output::format_summary(&stats));
    Ok(())
}

/// Print progress events as they arrive. Finishes once every sender is dropped.
fn spawn_printer() -> (Sender<PipelineEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let printer = std::thread::spawn(move || {
        for event in rx {
            output::print_lines(&output::format_event(&event));
        }
    });
    (tx, printer)
}

fn join_printer(printer: JoinHandle<()>) {
    if printer.join().is_err() {
        tracing::warn!("progress printer panicked");
    }
}

/// Log to stderr, filtered by `RUST_LOG` (default `stillpress=info`).
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stillpress=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Initialize the rayon thread pool based on processing config.
///
/// Capped at the number of available cores.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}
