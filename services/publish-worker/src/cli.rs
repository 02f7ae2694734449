//! Command line parsing

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use engine::{JobId, StartOptions};

use crate::error::{Error, Result};

#[derive(Debug, Parser)]
#[command(name = "publish-worker", version)]
#[command(about = "Enhance scraped products and publish them to the store")]
pub struct Cli {
    /// Config file; falls back to CONFIG_PATH, then ./publish-worker.toml
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Command {
    /// Load scraped products into a batch
    Import {
        file: PathBuf,
        /// Batch name; defaults to the file name without extension
        #[arg(long = "source", value_name = "REF")]
        source_ref: Option<String>,
    },

    /// Create a pending job for a batch
    Create { source_ref: String },

    /// Start a pending job and wait for it
    Run {
        #[arg(value_parser = job_id)]
        job_id: JobId,
        #[command(flatten)]
        options: RunArgs,
    },

    /// Re-run a stopped, partial, or failed job
    Resume {
        #[arg(value_parser = job_id)]
        job_id: JobId,
        #[command(flatten)]
        options: RunArgs,
    },

    /// Push generated items that have no remote id
    Push {
        #[arg(value_parser = job_id)]
        job_id: JobId,
    },

    /// Stop a job
    Stop {
        #[arg(value_parser = job_id)]
        job_id: JobId,
    },

    /// Print one job, or every job, as JSON
    Status {
        #[arg(value_parser = job_id)]
        job_id: Option<JobId>,
    },

    /// Print image edit key health
    Health,
}

/// Per-run overrides for `run` and `resume`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Args)]
pub struct RunArgs {
    /// Products in flight at once
    #[arg(long, value_name = "N")]
    pub parallelism: Option<usize>,
    /// Process at most N products
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,
    /// Skip the first N products of the batch
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub offset: usize,
}

impl From<RunArgs> for StartOptions {
    fn from(args: RunArgs) -> Self {
        StartOptions {
            parallelism: args.parallelism,
            limit: args.limit,
            offset: args.offset,
        }
    }
}

fn job_id(value: &str) -> std::result::Result<JobId, std::num::ParseIntError> {
    value.parse().map(JobId)
}

/// Batch name for an import: `--source` when given, else the file stem.
pub fn source_ref(file: &Path, source: Option<String>) -> Result<String> {
    match source {
        Some(source) => Ok(source),
        None => file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| Error::NoSourceRef(file.to_path_buf())),
    }
}
