//! Command-line interface
//!
//! ```bash
//! # Run the pass named by the manifest (discrete / consecutive /
//! # post_dropping)
//! podar prune compress.yaml
//!
//! # Validate a manifest without touching the model
//! podar validate compress.yaml
//!
//! # Show what a manifest would do
//! podar info compress.yaml
//! ```

use crate::calibration::SyntheticTextDataset;
use crate::coordinate::SingleProcess;
use crate::job::{BlockDropMethod, CompressionJob};
use crate::model::{JsonModelProvider, ModelProvider};
use crate::pipeline::CompressionPipeline;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Podar: block-drop compression for transformer checkpoints
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "podar")]
#[command(version)]
#[command(about = "Compress transformer checkpoints by dropping redundant blocks")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a compression pass from a YAML manifest
    Prune(PruneArgs),

    /// Validate a manifest without loading the model
    Validate(ValidateArgs),

    /// Display what a manifest would do
    Info(InfoArgs),
}

/// Arguments for the prune command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct PruneArgs {
    /// Path to the YAML manifest
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,
}

/// Arguments for the validate command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ValidateArgs {
    /// Path to the YAML manifest
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,
}

/// Arguments for the info command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct InfoArgs {
    /// Path to the YAML manifest
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,
}

/// Output verbosity, resolved once from the global flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Errors only (stderr).
    Quiet,
    /// Progress messages.
    Normal,
    /// Progress plus per-stage detail.
    Verbose,
}

impl LogLevel {
    /// Resolve the level from the CLI flags; `--quiet` wins over
    /// `--verbose`.
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        if quiet {
            LogLevel::Quiet
        } else if verbose {
            LogLevel::Verbose
        } else {
            LogLevel::Normal
        }
    }

    /// Print a progress message unless quiet.
    pub fn info(self, msg: &str) {
        if self != LogLevel::Quiet {
            println!("{msg}");
        }
    }

    /// Print a detail message at verbose only.
    pub fn detail(self, msg: &str) {
        if self == LogLevel::Verbose {
            println!("{msg}");
        }
    }
}

/// Execute a CLI command based on the parsed arguments
pub fn run_command(cli: Cli) -> Result<(), String> {
    let log_level = LogLevel::from_flags(cli.verbose, cli.quiet);

    match cli.command {
        Command::Prune(args) => run_prune(args, log_level),
        Command::Validate(args) => run_validate(args, log_level),
        Command::Info(args) => run_info(args, log_level),
    }
}

fn run_prune(args: PruneArgs, level: LogLevel) -> Result<(), String> {
    let job = CompressionJob::from_yaml_file(&args.config).map_err(|e| e.to_string())?;
    let group = SingleProcess::new();
    let provider = JsonModelProvider::new();
    let model = provider.load(&job.model_path).map_err(|e| e.to_string())?;
    let dataset = SyntheticTextDataset::new(model.config.vocab_size as u32, job.seed);

    level.info(&format!(
        "Compressing {} ({} blocks, drop_n = {})",
        job.model_path.display(),
        model.num_blocks(),
        job.drop_n
    ));

    let mut pipeline = CompressionPipeline::new(&job, &group);
    pipeline.run(&model, &dataset, &provider).map_err(|e| e.to_string())?;

    level.info(&format!("Finished: {}", pipeline.state().display_name()));
    level.detail(&format!(
        "Dropped blocks {:?} in {:.2}s",
        pipeline.metrics().dropped,
        pipeline.metrics().total_duration_secs()
    ));
    Ok(())
}

fn run_validate(args: ValidateArgs, level: LogLevel) -> Result<(), String> {
    let job = CompressionJob::from_yaml_file(&args.config).map_err(|e| e.to_string())?;
    level.info(&format!("OK: {} is a valid manifest", args.config.display()));
    level.detail(&format!("model_path: {}", job.model_path.display()));
    Ok(())
}

fn run_info(args: InfoArgs, level: LogLevel) -> Result<(), String> {
    let job = CompressionJob::from_yaml_file(&args.config).map_err(|e| e.to_string())?;
    let pass = match job.block_drop_method {
        BlockDropMethod::Discrete => "prune (discrete policy)",
        BlockDropMethod::Consecutive => "prune (consecutive policy)",
        BlockDropMethod::PostDropping => "post_dropping (surgery + save)",
    };
    level.info(&format!("pass:      {pass}"));
    level.info(&format!("drop_n:    {}", job.drop_n));
    level.info(&format!(
        "calibration: {} x {} tokens from {} ({})",
        job.n_compression_samples,
        job.cutoff_len,
        job.dataset,
        job.data_type.as_str()
    ));
    level.info(&format!("cache:     {}", job.similarity_cache_file.display()));
    level.info(&format!("output:    {}", job.compressed_model_save_path.display()));
    Ok(())
}
