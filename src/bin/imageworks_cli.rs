//! ImageWorks CLI - Operator interface for the derivative pipeline
//!
//! Commands: tick, watch, status, show, resolve, approve, reject, override,
//! retry, specs. Outputs JSON to stdout, returns non-zero on failure.

use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use imageworks_core::external::{MockBackgroundRemover, NullNotifier};
use imageworks_core::{
    FileRecordStore, IdentifierResolver, MemoryCatalogLookup, PipelineConfig, RenderSpec,
    Scheduler,
};

#[derive(Parser)]
#[command(name = "imageworks-cli")]
#[command(about = "ImageWorks CLI - Product Image Derivative Pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to pipeline config JSON (defaults apply when absent)
    #[arg(short, long, default_value = "config/pipeline.json")]
    config: PathBuf,

    /// Path to the render spec catalog
    #[arg(short = 's', long, default_value = "config/render_specs.json")]
    specs: PathBuf,

    /// Path to the identifier lookup table (active ids + aliases)
    #[arg(short, long, default_value = "config/catalog_lookup.json")]
    lookup: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scan pass over the input directory
    Tick,

    /// Run scan passes forever at the configured interval
    Watch,

    /// Per-state record counts
    Status,

    /// Show one record as JSON
    Show {
        /// Content hash
        #[arg(long)]
        hash: String,
    },

    /// Resolve a filename to an identifier mapping without touching state
    Resolve {
        /// Bare filename, e.g. J1234567_2.jpg
        #[arg(short, long)]
        filename: String,
    },

    /// Approve a reviewed file and render its derivatives
    Approve {
        #[arg(long)]
        hash: String,
    },

    /// Reject a file
    Reject {
        #[arg(long)]
        hash: String,

        #[arg(short, long)]
        reason: String,
    },

    /// Override a system-derived field, e.g. mapped_identifier
    Override {
        #[arg(long)]
        hash: String,

        #[arg(short, long)]
        field: String,

        #[arg(short, long)]
        value: String,

        #[arg(short, long)]
        reason: String,
    },

    /// Send a decode-failed file back to review
    Retry {
        #[arg(long)]
        hash: String,
    },

    /// List render spec catalog entries
    Specs,
}

fn load_config(path: &Path) -> Result<PipelineConfig, std::io::Error> {
    if path.exists() {
        PipelineConfig::load(path)
    } else {
        Ok(PipelineConfig::default())
    }
}

fn load_lookup(path: &Path) -> Result<MemoryCatalogLookup, std::io::Error> {
    if !path.exists() {
        return Ok(MemoryCatalogLookup::default());
    }
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(r#"{{"error": "Failed to load config: {}"}}"#, e);
            return ExitCode::FAILURE;
        }
    };

    let lookup = match load_lookup(&cli.lookup) {
        Ok(l) => l,
        Err(e) => {
            eprintln!(r#"{{"error": "Failed to load lookup table: {}"}}"#, e);
            return ExitCode::FAILURE;
        }
    };

    // Resolve-only mode needs no store, catalog or collaborators.
    if let Commands::Resolve { filename } = &cli.command {
        let resolver = IdentifierResolver::new(lookup, config.resolver.clone());
        return match resolver.resolve(filename) {
            Ok(mapping) => {
                println!("{}", serde_json::to_string_pretty(&mapping).unwrap());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!(r#"{{"error": "{}"}}"#, e);
                ExitCode::FAILURE
            }
        };
    }

    let catalog = match RenderSpec::load(&cli.specs) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(r#"{{"error": "Failed to load render specs: {}"}}"#, e);
            return ExitCode::FAILURE;
        }
    };

    if let Commands::Specs = &cli.command {
        let entries: Vec<_> = catalog.enabled_entries().collect();
        println!("{}", serde_json::to_string_pretty(&entries).unwrap());
        return ExitCode::SUCCESS;
    }

    let store = match FileRecordStore::open(config.intake.clone(), config.paths.state_file.clone())
    {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!(r#"{{"error": "Failed to open state file: {}"}}"#, e);
            return ExitCode::FAILURE;
        }
    };

    let resolver = IdentifierResolver::new(lookup, config.resolver.clone());
    let scheduler = match Scheduler::new(
        &config,
        Arc::clone(&store),
        resolver,
        catalog,
        Arc::new(MockBackgroundRemover),
        Arc::new(NullNotifier),
    ) {
        Ok(s) => s,
        Err(e) => {
            eprintln!(r#"{{"error": "Failed to start scheduler: {}"}}"#, e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Tick => {
            let summary = scheduler.tick();
            println!("{}", serde_json::to_string_pretty(&summary).unwrap());
            ExitCode::SUCCESS
        }

        Commands::Watch => {
            // The sender side stays alive for the life of the process; the
            // loop exits only with it.
            let (_stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
            scheduler.run_until(stop_rx);
            ExitCode::SUCCESS
        }

        Commands::Status => {
            println!(
                "{}",
                serde_json::to_string_pretty(&store.statistics()).unwrap()
            );
            ExitCode::SUCCESS
        }

        Commands::Show { hash } => match store.get(&hash) {
            Some(record) => {
                println!("{}", serde_json::to_string_pretty(&record).unwrap());
                ExitCode::SUCCESS
            }
            None => {
                eprintln!(r#"{{"error": "Unknown record: {}"}}"#, hash);
                ExitCode::from(2)
            }
        },

        Commands::Approve { hash } => match scheduler.approve(&hash) {
            Ok(record) => {
                println!("{}", serde_json::to_string_pretty(&record).unwrap());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!(r#"{{"error": "{}"}}"#, e);
                ExitCode::from(2)
            }
        },

        Commands::Reject { hash, reason } => match scheduler.reject(&hash, &reason) {
            Ok(record) => {
                println!("{}", serde_json::to_string_pretty(&record).unwrap());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!(r#"{{"error": "{}"}}"#, e);
                ExitCode::from(2)
            }
        },

        Commands::Override {
            hash,
            field,
            value,
            reason,
        } => match store.apply_override(&hash, &field, &value, &reason) {
            Ok(record) => {
                println!("{}", serde_json::to_string_pretty(&record).unwrap());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!(r#"{{"error": "{}"}}"#, e);
                ExitCode::from(2)
            }
        },

        Commands::Retry { hash } => match scheduler.retry_failed(&hash) {
            Ok(record) => {
                println!("{}", serde_json::to_string_pretty(&record).unwrap());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!(r#"{{"error": "{}"}}"#, e);
                ExitCode::from(2)
            }
        },

        Commands::Resolve { .. } | Commands::Specs => unreachable!(),
    }
}
