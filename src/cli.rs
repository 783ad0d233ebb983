use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vw-explorer")]
#[command(about = "Review VIRUS-W observing nights: log, guider seeing and IFU quicklooks", long_about = None)]
pub struct Cli {
    /// Configuration file (default: $VW_EXPLORER_CONFIG or ~/.vw_explorer/config.yml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render the collapsed IFU image of observation files
    Quicklook(QuicklookArgs),

    /// Parse the log, index guider frames, fit the guide star and write plots
    Process {
        /// Parse the log again even if observations_raw.csv exists
        #[arg(long)]
        reload_log: bool,

        /// Skip all PNG and stacked FITS output
        #[arg(long)]
        no_plots: bool,

        /// Stop at the first malformed log line
        #[arg(long)]
        strict: bool,

        /// Observation log to use instead of the configured one
        #[arg(long = "log")]
        log_file: Option<PathBuf>,
    },

    /// Scan the guider directory and update the frame index
    BuildIndex {
        /// Re-read every frame, not only new ones
        #[arg(long)]
        force: bool,

        /// Drop entries whose files no longer exist
        #[arg(long)]
        remove_missing: bool,

        /// Show a progress bar while reading headers
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show the logged observations with fit results when available
    Summary {
        /// Only observations of this target
        #[arg(short, long)]
        target: Option<String>,

        /// Output format (json, csv, table)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// List dither chunks per target
    Chunks {
        /// Only chunks of this target
        #[arg(short, long)]
        target: Option<String>,

        /// Show the summary of one chunk of --target
        #[arg(short, long, requires = "target")]
        index: Option<usize>,
    },

    /// Fit the guide star on every guider frame of one observation
    FitObservation {
        /// Observation name, e.g. vw004123 or 4123
        observation: String,

        /// Center each cutout on the previous fitted centroid
        #[arg(long)]
        follow_star: bool,

        /// Write frame diagnostics and the summary plot
        #[arg(long)]
        plot: bool,
    },

    /// Write a commented default configuration file
    InitConfig {
        /// Where to write it (default: ~/.vw_explorer/config.yml)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct QuicklookArgs {
    /// Observation files or names like vw004123-125 or 4123 (default: newest vw*.fits here)
    pub files: Vec<String>,

    /// Fiber position table (id x y detector_x)
    #[arg(long)]
    pub fibers: Option<PathBuf>,

    /// Output directory for the PNG files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Color map of the fiber fluxes
    #[arg(long, value_enum, default_value_t = QuicklookColorMap::Gray)]
    pub cmap: QuicklookColorMap,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicklookColorMap {
    Gray,
    Viridis,
}

impl From<QuicklookColorMap> for crate::plotting::ColorMap {
    fn from(cmap: QuicklookColorMap) -> Self {
        match cmap {
            QuicklookColorMap::Gray => crate::plotting::ColorMap::Grayscale,
            QuicklookColorMap::Viridis => crate::plotting::ColorMap::Viridis,
        }
    }
}

impl QuicklookArgs {
    pub fn to_options(&self) -> crate::commands::QuicklookOptions {
        crate::commands::QuicklookOptions {
            files: self.files.clone(),
            fibers: self.fibers.clone(),
            output: self.output.clone(),
            cmap: self.cmap.into(),
        }
    }
}

/// The stand-alone quicklook binary
#[derive(Parser)]
#[command(name = "vw-quicklook")]
#[command(about = "Render the collapsed IFU image of VIRUS-W observation files", long_about = None)]
pub struct QuicklookCli {
    /// Configuration file (default: $VW_EXPLORER_CONFIG or ~/.vw_explorer/config.yml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(flatten)]
    pub args: QuicklookArgs,
}

/// Install the tracing subscriber; RUST_LOG wins over `default_level`
pub fn init_logging(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
