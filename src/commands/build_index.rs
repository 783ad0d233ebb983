use anyhow::{Context, Result};
use std::path::Path;

use super::common::load_config;
use crate::guider_index::{build_index, IndexBuildOptions};

pub fn build_guider_index(
    config_path: Option<&Path>,
    force: bool,
    remove_missing: bool,
    verbose: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let index_path = config.guider_index_path();
    let options = IndexBuildOptions {
        force,
        remove_missing,
        verbose,
    };
    let (index, report) = build_index(&config.paths.guider_dir, &index_path, &options)
        .with_context(|| format!("Failed to build guider index {}", index_path.display()))?;

    println!("{:<12} {:>8} {:<20} {:<20}", "Date", "Frames", "First", "Last");
    println!("{:-<64}", "");
    for date in index.dates() {
        let frames = index.frames_on(*date);
        let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
            continue;
        };
        println!(
            "{:<12} {:>8} {:<20} {:<20}",
            date.format("%Y-%m-%d"),
            frames.len(),
            first.timestamp.format("%H:%M:%S%.3f"),
            last.timestamp.format("%H:%M:%S%.3f"),
        );
    }

    println!(
        "\nFiles found: {}, already indexed: {}, added: {}, removed: {}",
        report.files_found, report.already_indexed, report.added, report.removed
    );
    if !report.failures.is_empty() {
        println!("Unreadable files ({}):", report.failures.len());
        for failure in &report.failures {
            println!("  {}", failure);
        }
    }
    println!("\nTotal: {} frames in {}", report.total_entries, index_path.display());
    Ok(())
}
