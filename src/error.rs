use std::path::PathBuf;

/// Problems with the configuration file or the paths it names. Fatal at startup.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("No configuration file found (tried {0})")]
    NotFound(String),
    #[error("Failed to read configuration file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration file {path}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yml::Error,
    },
    #[error("Configured {key} does not exist: {path}")]
    MissingPath { key: &'static str, path: PathBuf },
    #[error("Configured {key} is not usable: {reason}")]
    InvalidPath { key: &'static str, reason: String },
}

/// A single line of the observation log that does not match the log grammar.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("line {line}: {message}")]
pub struct LogFormatError {
    /// 1-based line number in the log file
    pub line: usize,
    pub message: String,
}

impl LogFormatError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Failures that make a whole log unusable.
#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("Failed to read log file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Log {0} contains no '# date:' lines")]
    NoDates(PathBuf),
    #[error("Log {0} contains no observation lines")]
    NoObservations(PathBuf),
    #[error("Date on line {line} is out of order ({delta} days after the previous date)")]
    DateOrder { line: usize, delta: i64 },
    #[error(transparent)]
    Line(#[from] LogFormatError),
    #[error("Invalid log grammar pattern")]
    Grammar(#[from] regex::Error),
}

/// A guider or observation file whose header or pixels could not be read.
/// Skipped and reported, never fatal for a batch.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{}: {reason}", path.display())]
pub struct FrameReadError {
    pub path: PathBuf,
    pub reason: String,
}

impl FrameReadError {
    pub fn new(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Why a single guide-star fit was rejected.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("fit window at ({x:.1}, {y:.1}) lies outside the {width}x{height} frame")]
    WindowOutOfBounds {
        x: f64,
        y: f64,
        width: usize,
        height: usize,
    },
    #[error("no finite pixels in the fit window")]
    NoSignal,
    #[error("not enough pixels ({points}) for {params} parameters")]
    TooFewPoints { points: usize, params: usize },
    #[error("least-squares did not converge")]
    NotConverged,
    #[error("fit produced non-finite parameters")]
    NonFinite,
    #[error("implausible fit: {0}")]
    Implausible(String),
}

/// Why a guider frame produced no usable star fit.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FrameFailure {
    #[error(transparent)]
    Read(#[from] FrameReadError),
    #[error(transparent)]
    Fit(#[from] FitError),
}

impl FrameFailure {
    /// Short label used in tables and the batch report
    pub fn kind(&self) -> &'static str {
        match self {
            FrameFailure::Read(_) => "read",
            FrameFailure::Fit(_) => "fit",
        }
    }
}

/// An observation whose guider frames cannot be selected at all.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SequenceError {
    #[error("{0} has no exposure time, so no guider time window")]
    NoTimeWindow(String),
    #[error("{0} has no fiducial coordinate")]
    NoFiducial(String),
}

/// Problems producing an IFU quicklook.
#[derive(thiserror::Error, Debug)]
pub enum IfuError {
    #[error("Failed to read fiber table {path}")]
    FiberTableIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid fiber table {path}, line {line}: {message}")]
    FiberTable {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("Fiber table {0} lists no fibers")]
    NoFibers(PathBuf),
    #[error(transparent)]
    Frame(#[from] FrameReadError),
    #[error("{}: {width} columns, x-binned images are not supported", path.display())]
    XBinned { path: PathBuf, width: usize },
}

/// Failures writing PNG plots.
#[derive(thiserror::Error, Debug)]
pub enum PlotError {
    #[error("Failed to create plot file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode image {path}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Nothing to plot: {0}")]
    Empty(String),
}

/// Errors from the CSV tables written and read by the crate.
#[derive(thiserror::Error, Debug)]
pub enum TableError {
    #[error("Failed to access table {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read or write CSV table {path}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Invalid row {row} in {path}: {message}")]
    Row {
        path: PathBuf,
        row: usize,
        message: String,
    },
}
