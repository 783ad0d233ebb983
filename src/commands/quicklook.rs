use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, error};

use crate::config::Config;
use crate::ifu::{load_ifu_data, FiberTable};
use crate::log_parsing::{find_observation_files, parse_vw_filenames};
use crate::plotting::ifu_plots::plot_quicklook;
use crate::plotting::ColorMap;

#[derive(Debug, Clone, Default)]
pub struct QuicklookOptions {
    /// Paths or `vw` names such as `vw004123-125` or `4123`
    pub files: Vec<String>,
    pub fibers: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub cmap: ColorMap,
}

/// The configuration is optional here; an explicitly named file must load
fn optional_config(config_path: Option<&Path>) -> Result<Option<Config>> {
    match Config::locate(config_path) {
        Ok(path) => {
            let config = Config::load(&path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?;
            Ok(Some(config))
        }
        Err(e) => {
            debug!("No configuration: {}", e);
            Ok(None)
        }
    }
}

/// Newest `vw*.fits` in `dir` by modification time
pub fn newest_observation(dir: &Path) -> Option<PathBuf> {
    let pattern = dir.join("vw*.fits");
    glob::glob(&pattern.to_string_lossy())
        .ok()?
        .flatten()
        .filter(|p| p.is_file())
        .max_by_key(|p| {
            std::fs::metadata(p)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH)
        })
}

/// Turn command line arguments into observation files. Existing paths are
/// taken as they are; `vw` names are looked up in `search_dir` and then
/// anywhere below the observation directory.
pub fn resolve_observation_files(
    args: &[String],
    search_dir: &Path,
    observation_dir: Option<&Path>,
) -> Result<Vec<PathBuf>> {
    if args.is_empty() {
        let newest = newest_observation(search_dir).with_context(|| {
            format!("No vw*.fits files in {}", search_dir.display())
        })?;
        return Ok(vec![newest]);
    }

    let mut known: Option<HashMap<String, PathBuf>> = None;
    let mut files = Vec::new();
    for arg in args {
        let path = PathBuf::from(arg);
        if path.is_file() {
            files.push(path);
            continue;
        }
        let names = parse_vw_filenames(arg).map_err(anyhow::Error::msg)?;
        for name in names {
            let local = search_dir.join(format!("{}.fits", name));
            if local.is_file() {
                files.push(local);
                continue;
            }
            let Some(dir) = observation_dir else {
                bail!("{}.fits not found in {}", name, search_dir.display());
            };
            let found = known.get_or_insert_with(|| find_observation_files(dir));
            match found.get(&name) {
                Some(p) => files.push(p.clone()),
                None => bail!(
                    "{}.fits not found in {} or below {}",
                    name,
                    search_dir.display(),
                    dir.display()
                ),
            }
        }
    }
    Ok(files)
}

pub fn quicklook(config_path: Option<&Path>, options: QuicklookOptions) -> Result<()> {
    let config = optional_config(config_path)?;
    let cwd = std::env::current_dir().context("Failed to read the current directory")?;

    let fiber_file = options
        .fibers
        .clone()
        .or_else(|| config.as_ref().and_then(|c| c.paths.ifu_fiber_file.clone()))
        .context("No IFU fiber table: pass --fibers or set paths.ifu_fiber_file")?;
    let fibers = FiberTable::load(&fiber_file)
        .with_context(|| format!("Failed to load fiber table {}", fiber_file.display()))?;

    let files = resolve_observation_files(
        &options.files,
        &cwd,
        config.as_ref().map(|c| c.paths.observation_dir.as_path()),
    )?;
    let output_dir = options
        .output
        .clone()
        .or_else(|| config.as_ref().map(Config::quicklook_dir))
        .unwrap_or_else(|| cwd.clone());

    let mut failed = 0;
    for file in &files {
        let rendered = load_ifu_data(file, &fibers)
            .with_context(|| format!("Failed to collapse {}", file.display()))
            .and_then(|ifu| {
                plot_quicklook(&ifu, options.cmap, &output_dir)
                    .with_context(|| format!("Failed to plot {}", file.display()))
            });
        match rendered {
            Ok(png) => println!("{} -> {}", file.display(), png.display()),
            Err(e) => {
                error!("{:#}", e);
                failed += 1;
            }
        }
    }

    println!("\nTotal: {} quicklook images", files.len() - failed);
    if failed > 0 {
        bail!("{} of {} files could not be rendered", failed, files.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_names_and_paths() {
        let cwd = tempfile::tempdir().unwrap();
        let obs_dir = tempfile::tempdir().unwrap();
        std::fs::write(cwd.path().join("vw004123.fits"), b"").unwrap();
        std::fs::create_dir_all(obs_dir.path().join("night1")).unwrap();
        std::fs::write(obs_dir.path().join("night1/vw004124.fits"), b"").unwrap();

        let files = resolve_observation_files(
            &["vw004123-124".to_string()],
            cwd.path(),
            Some(obs_dir.path()),
        )
        .unwrap();
        assert_eq!(
            files,
            vec![
                cwd.path().join("vw004123.fits"),
                obs_dir.path().join("night1/vw004124.fits"),
            ]
        );

        let err = resolve_observation_files(&["4125".to_string()], cwd.path(), Some(obs_dir.path()));
        assert!(err.unwrap_err().to_string().contains("vw004125.fits not found"));
    }

    #[test]
    fn test_default_is_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_observation_files(&[], dir.path(), None).is_err());

        let older = dir.path().join("vw000001.fits");
        let newer = dir.path().join("vw000002.fits");
        std::fs::write(&older, b"").unwrap();
        std::fs::write(&newer, b"").unwrap();
        let past = SystemTime::now() - std::time::Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&older)
            .unwrap()
            .set_modified(past)
            .unwrap();

        assert_eq!(resolve_observation_files(&[], dir.path(), None).unwrap(), vec![newer]);
    }
}
