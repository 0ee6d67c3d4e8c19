//! Podar CLI
//!
//! Block-drop compression entry point.
//!
//! # Usage
//!
//! ```bash
//! # First pass: estimate similarities and record the drop plan
//! podar prune compress.yaml        # block_drop_method: discrete|consecutive
//!
//! # Second pass: apply the plan and save the compressed checkpoint
//! podar prune post_dropping.yaml   # block_drop_method: post_dropping
//!
//! # Validate a manifest
//! podar validate compress.yaml
//!
//! # Show manifest info
//! podar info compress.yaml
//! ```

use clap::Parser;
use podar::cli::{run_command, Cli};
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
