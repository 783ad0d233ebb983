/// Configuration file handling.
///
/// The configuration is a small YAML document with a required `paths` section
/// and an optional `analysis` section:
///
/// ```yaml
/// paths:
///   log_dir: ~/vw/2024-11          # directory holding log.txt, or the log file itself
///   observation_dir: ~/vw/2024-11/raw
///   guider_dir: ~/vw/2024-11/guider
///   output_dir: ~/vw/2024-11/review
/// analysis:
///   cutout_size: 70
///   clip_sigma: 2.5
/// ```
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::psf_fitting::StarModel;

pub const CONFIG_ENV_VAR: &str = "VW_EXPLORER_CONFIG";
pub const DEFAULT_LOG_NAME: &str = "log.txt";
pub const GUIDER_INDEX_NAME: &str = "guider_index.csv";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub paths: PathsConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Location of the observation log (a file, or a directory containing log.txt)
    #[serde(alias = "data_dir")]
    pub log_dir: PathBuf,
    /// Location of the VIRUS-W observation files
    pub observation_dir: PathBuf,
    /// Root of the guider frame tree
    pub guider_dir: PathBuf,
    /// Destination for everything this tool writes
    pub output_dir: PathBuf,
    /// Fiber position table for the IFU quicklook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifu_fiber_file: Option<PathBuf>,
    /// Where the guider index lives; defaults to guider_dir/guider_index.csv
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guider_index: Option<PathBuf>,
}

/// Tunables for guide-star fitting and aggregation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Side of the square cutout taken around the fiducial, in pixels
    pub cutout_size: usize,
    /// Side of the fit window centered on the brightest cutout pixel
    pub fit_window: usize,
    /// Initial sigma guess in pixels
    pub sigma_guess: f64,
    /// Fits wider than this FWHM (pixels) are rejected
    pub max_fwhm_pix: f64,
    pub clip_sigma: f64,
    pub clip_max_iters: usize,
    pub max_fit_iterations: usize,
    /// Guider plate scale in arcsec per pixel
    pub pixel_scale: f64,
    pub star_model: StarModel,
    /// Center each frame's cutout on the previous successful centroid
    pub follow_star: bool,
    /// Readout overhead between exposures of a multi-file log line, seconds
    pub exposure_overhead_secs: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            cutout_size: 70,
            fit_window: 20,
            sigma_guess: 3.0,
            max_fwhm_pix: 30.0,
            clip_sigma: 2.5,
            clip_max_iters: 5,
            max_fit_iterations: 200,
            pixel_scale: 0.533,
            star_model: StarModel::Symmetric,
            follow_star: false,
            exposure_overhead_secs: 90.0,
        }
    }
}

impl Config {
    /// Build a configuration rooted in a single directory, mostly for tests
    pub fn with_root(root: &Path) -> Self {
        Self {
            paths: PathsConfig {
                log_dir: root.join(DEFAULT_LOG_NAME),
                observation_dir: root.join("observations"),
                guider_dir: root.join("guider"),
                output_dir: root.join("output"),
                ifu_fiber_file: None,
                guider_index: None,
            },
            analysis: AnalysisConfig::default(),
        }
    }

    /// Find the configuration file: explicit path, then $VW_EXPLORER_CONFIG,
    /// then ~/.vw_explorer/config.yml
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(expand_home(path));
        }

        let mut tried = Vec::new();
        if let Some(env_path) = std::env::var_os(CONFIG_ENV_VAR) {
            let path = expand_home(Path::new(&env_path));
            if path.is_file() {
                return Ok(path);
            }
            tried.push(path.display().to_string());
        }

        let default = default_config_path();
        if default.is_file() {
            return Ok(default);
        }
        tried.push(default.display().to_string());

        Err(ConfigError::NotFound(tried.join(", ")))
    }

    /// Load and resolve a configuration file. Relative paths are taken relative
    /// to the directory containing the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(text)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &Path| {
            let p = expand_home(p);
            if p.is_relative() {
                base.join(p)
            } else {
                p
            }
        };
        let paths = &mut self.paths;
        paths.log_dir = resolve(&paths.log_dir);
        paths.observation_dir = resolve(&paths.observation_dir);
        paths.guider_dir = resolve(&paths.guider_dir);
        paths.output_dir = resolve(&paths.output_dir);
        paths.ifu_fiber_file = paths.ifu_fiber_file.as_deref().map(resolve);
        paths.guider_index = paths.guider_index.as_deref().map(resolve);
    }

    /// Check that the input locations exist and create the output directory
    pub fn validate(&self) -> Result<(), ConfigError> {
        let log_file = self.log_file();
        if !log_file.is_file() {
            return Err(ConfigError::MissingPath {
                key: "log_dir",
                path: log_file,
            });
        }
        for (key, dir) in [
            ("observation_dir", &self.paths.observation_dir),
            ("guider_dir", &self.paths.guider_dir),
        ] {
            if !dir.is_dir() {
                return Err(ConfigError::MissingPath {
                    key,
                    path: dir.clone(),
                });
            }
        }
        if let Some(fibers) = &self.paths.ifu_fiber_file {
            if !fibers.is_file() {
                return Err(ConfigError::MissingPath {
                    key: "ifu_fiber_file",
                    path: fibers.clone(),
                });
            }
        }
        self.validate_analysis()?;
        std::fs::create_dir_all(&self.paths.output_dir).map_err(|e| {
            ConfigError::InvalidPath {
                key: "output_dir",
                reason: format!("{}: {}", self.paths.output_dir.display(), e),
            }
        })
    }

    fn validate_analysis(&self) -> Result<(), ConfigError> {
        let a = &self.analysis;
        if a.fit_window < 5 || a.fit_window > a.cutout_size {
            return Err(ConfigError::InvalidPath {
                key: "analysis.fit_window",
                reason: format!(
                    "must be between 5 and cutout_size ({}), got {}",
                    a.cutout_size, a.fit_window
                ),
            });
        }
        if a.clip_sigma <= 0.0 || a.pixel_scale <= 0.0 || a.sigma_guess <= 0.0 {
            return Err(ConfigError::InvalidPath {
                key: "analysis",
                reason: "clip_sigma, pixel_scale and sigma_guess must be positive".into(),
            });
        }
        Ok(())
    }

    /// The log file itself; a directory entry means `<dir>/log.txt`
    pub fn log_file(&self) -> PathBuf {
        if self.paths.log_dir.is_dir() {
            self.paths.log_dir.join(DEFAULT_LOG_NAME)
        } else {
            self.paths.log_dir.clone()
        }
    }

    pub fn guider_index_path(&self) -> PathBuf {
        self.paths
            .guider_index
            .clone()
            .unwrap_or_else(|| self.paths.guider_dir.join(GUIDER_INDEX_NAME))
    }

    pub fn raw_observations_csv(&self) -> PathBuf {
        self.paths.output_dir.join("observations_raw.csv")
    }

    pub fn processed_observations_csv(&self) -> PathBuf {
        self.paths.output_dir.join("observations_processed.csv")
    }

    pub fn dither_chunks_csv(&self) -> PathBuf {
        self.paths.output_dir.join("dither_chunks.csv")
    }

    pub fn sanitized_log_path(&self) -> PathBuf {
        self.paths.output_dir.join("log_sanitized.txt")
    }

    pub fn batch_report_path(&self) -> PathBuf {
        self.paths.output_dir.join("batch_report.json")
    }

    pub fn observation_plot_dir(&self, filename: &str) -> PathBuf {
        self.paths
            .output_dir
            .join("plots")
            .join("observations")
            .join(filename)
    }

    pub fn dither_chunk_plot_dir(&self) -> PathBuf {
        self.paths.output_dir.join("plots").join("dither_chunks")
    }

    pub fn quicklook_dir(&self) -> PathBuf {
        self.paths.output_dir.join("quicklook")
    }
}

pub fn default_config_path() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vw_explorer")
        .join("config.yml")
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Commented starting point written by `init-config`
pub fn template_yaml() -> String {
    let defaults = AnalysisConfig::default();
    format!(
        "# VW Explorer configuration\n\
         paths:\n\
         \x20 # observation log: a file, or a directory containing {log}\n\
         \x20 log_dir: ~/vw/night\n\
         \x20 # VIRUS-W frames (vw######.fits), searched recursively\n\
         \x20 observation_dir: ~/vw/night/raw\n\
         \x20 # guider frames, directly or in one level of day directories\n\
         \x20 guider_dir: ~/vw/night/guider\n\
         \x20 # tables, plots and reports\n\
         \x20 output_dir: ~/vw/night/review\n\
         \x20 # fiber positions for the IFU quicklook (id x y detector_x)\n\
         \x20 # ifu_fiber_file: ~/vw/fibers.txt\n\
         analysis:\n\
         \x20 cutout_size: {cutout}\n\
         \x20 fit_window: {window}\n\
         \x20 sigma_guess: {sigma}\n\
         \x20 max_fwhm_pix: {max_fwhm}\n\
         \x20 clip_sigma: {clip}\n\
         \x20 clip_max_iters: {iters}\n\
         \x20 max_fit_iterations: {fit_iters}\n\
         \x20 pixel_scale: {scale}\n\
         \x20 star_model: symmetric\n\
         \x20 follow_star: false\n\
         \x20 exposure_overhead_secs: {overhead}\n",
        log = DEFAULT_LOG_NAME,
        cutout = defaults.cutout_size,
        window = defaults.fit_window,
        sigma = defaults.sigma_guess,
        max_fwhm = defaults.max_fwhm_pix,
        clip = defaults.clip_sigma,
        iters = defaults.clip_max_iters,
        fit_iters = defaults.max_fit_iterations,
        scale = defaults.pixel_scale,
        overhead = defaults.exposure_overhead_secs,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_uses_analysis_defaults() {
        let yaml = "paths:\n  log_dir: log.txt\n  observation_dir: raw\n  guider_dir: guider\n  output_dir: out\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.analysis, AnalysisConfig::default());
        assert_eq!(config.paths.ifu_fiber_file, None);
    }

    #[test]
    fn test_partial_analysis_section() {
        let yaml = "paths:\n  data_dir: /data\n  observation_dir: /raw\n  guider_dir: /g\n  output_dir: /o\nanalysis:\n  clip_sigma: 3.0\n  star_model: elliptical\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.paths.log_dir, PathBuf::from("/data"));
        assert_eq!(config.analysis.clip_sigma, 3.0);
        assert_eq!(config.analysis.star_model, StarModel::Elliptical);
        assert_eq!(config.analysis.cutout_size, 70);
    }

    #[test]
    fn test_missing_paths_section_is_an_error() {
        assert!(Config::from_yaml("analysis:\n  clip_sigma: 3.0\n").is_err());
    }

    #[test]
    fn test_relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            "paths:\n  log_dir: night\n  observation_dir: raw\n  guider_dir: /abs/guider\n  output_dir: out\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.paths.log_dir, dir.path().join("night"));
        assert_eq!(config.paths.guider_dir, PathBuf::from("/abs/guider"));
        assert_eq!(
            config.guider_index_path(),
            PathBuf::from("/abs/guider").join(GUIDER_INDEX_NAME)
        );
    }

    #[test]
    fn test_log_dir_directory_appends_log_txt() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(dir.path());
        config.paths.log_dir = dir.path().to_path_buf();
        assert_eq!(config.log_file(), dir.path().join(DEFAULT_LOG_NAME));
    }

    #[test]
    fn test_validate_reports_missing_guider_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        std::fs::write(config.log_file(), "# date: 2024-11-02\n").unwrap();
        std::fs::create_dir_all(&config.paths.observation_dir).unwrap();

        match config.validate() {
            Err(ConfigError::MissingPath { key, .. }) => assert_eq!(key, "guider_dir"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_validate_creates_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        std::fs::write(config.log_file(), "# date: 2024-11-02\n").unwrap();
        std::fs::create_dir_all(&config.paths.observation_dir).unwrap();
        std::fs::create_dir_all(&config.paths.guider_dir).unwrap();

        config.validate().unwrap();
        assert!(config.paths.output_dir.is_dir());
    }

    #[test]
    fn test_template_parses() {
        let config = Config::from_yaml(&template_yaml()).unwrap();
        assert_eq!(config.analysis, AnalysisConfig::default());
    }
}
