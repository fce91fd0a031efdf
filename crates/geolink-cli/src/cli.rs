use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "geolink", author, version, about = "Multi-source geophysical event pipeline", long_about = None)]
pub struct Cli {
    /// Set the logging level
    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,

    /// Base directory input paths and outputs are resolved against
    #[arg(long, default_value = ".")]
    pub base_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run pipeline stages
    Run {
        /// Configuration file (YAML, or JSON by extension)
        #[arg(long, default_value = "configs/default.yaml")]
        config: PathBuf,
        /// Optional override file deep-merged onto the configuration
        #[arg(long)]
        overrides: Option<PathBuf>,
        /// Comma-separated stage subset, in pipeline order
        #[arg(long)]
        stages: Option<String>,
        /// Event to process (defaults to the first configured event)
        #[arg(long)]
        event_id: Option<String>,
        /// Fail hard instead of packaging partial results
        #[arg(long)]
        strict: bool,
        /// Print the stage order and exit
        #[arg(long)]
        list_stages: bool,
        /// Worker threads ("auto" sizes to the CPU count)
        #[arg(long, default_value = "auto")]
        threads: String,
    },
    /// Assemble and commit the event package
    Finalize {
        #[arg(long, default_value = "configs/default.yaml")]
        config: PathBuf,
        #[arg(long)]
        event_id: String,
        /// Mark FAIL and exit non-zero when required files are missing
        #[arg(long)]
        strict: bool,
    },
    /// Zip a committed event package into event_bundle.zip
    Bundle {
        #[arg(long, default_value = "configs/default.yaml")]
        config: PathBuf,
        #[arg(long)]
        event_id: String,
    },
    /// Render the event summary report
    Render {
        #[arg(long, default_value = "configs/default.yaml")]
        config: PathBuf,
        #[arg(long)]
        event_id: String,
        /// md, html, or both
        #[arg(long, default_value = "md")]
        format: String,
    },
    /// Print the stage order
    Stages,
}
