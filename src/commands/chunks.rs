use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use super::common::{load_config, load_observations};
use crate::dither_chunk::{all_chunks, find_chunk, load_chunks_csv, DitherChunk};
use crate::observation_sequence::ObservationSequence;
use crate::utils::{format_opt, truncate_string};

/// Chunks from `dither_chunks.csv` when it matches the observations,
/// otherwise regrouped from the observations
fn load_chunks(table: &Path, sequence: &ObservationSequence) -> BTreeMap<String, Vec<DitherChunk>> {
    if table.is_file() {
        match load_chunks_csv(table, sequence) {
            Ok(chunks) => {
                debug!("Loaded {} dither chunks from {}", chunks.len(), table.display());
                let mut grouped: BTreeMap<String, Vec<DitherChunk>> = BTreeMap::new();
                for chunk in chunks {
                    grouped.entry(chunk.target.clone()).or_default().push(chunk);
                }
                return grouped;
            }
            Err(e) => warn!("Ignoring stale dither chunk table: {}", e),
        }
    }
    all_chunks(sequence)
}

pub fn list_dither_chunks(
    config_path: Option<&Path>,
    target: Option<&str>,
    chunk_index: Option<usize>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let (sequence, _) = load_observations(&config, false, false, None)?;
    let chunks = load_chunks(&config.dither_chunks_csv(), &sequence);

    if let Some(index) = chunk_index {
        let target = target.context("--index needs --target")?;
        let chunk = find_chunk(&chunks, target, index)
            .with_context(|| format!("Target '{}' has no dither chunk {}", target, index))?;
        println!("{}", chunk.summary(Some(100)));
        return Ok(());
    }

    let selected: Vec<&DitherChunk> = chunks
        .iter()
        .filter(|(t, _)| target.is_none_or(|wanted| t.as_str() == wanted))
        .flat_map(|(_, c)| c)
        .collect();
    if selected.is_empty() {
        match target {
            Some(t) => bail!("No dither chunks for target '{}'", t),
            None => bail!("No dither chunks"),
        }
    }

    println!(
        "{:<16} {:>5} {:>4} {:<19} {:<19} {:<22} {:>8} {:>8} {:<5}",
        "Target", "Chunk", "N", "Start (UT)", "End (UT)", "Files", "Fid X", "Fid Y", "Sky"
    );
    println!("{:-<120}", "");
    for chunk in &selected {
        let (start, end) = match chunk.time_range() {
            Some((s, e)) => (
                s.format("%Y-%m-%d %H:%M:%S").to_string(),
                e.format("%Y-%m-%d %H:%M:%S").to_string(),
            ),
            None => (String::new(), String::new()),
        };
        let files = match (chunk.observations.iter().next(), chunk.observations.iter().last()) {
            (Some(first), Some(last)) if first.filename != last.filename => {
                format!("{}..{}", first.filename, last.filename)
            }
            (Some(first), _) => first.filename.clone(),
            _ => String::new(),
        };
        let fid = chunk.mean_fiducial();
        println!(
            "{:<16} {:>5} {:>4} {:<19} {:<19} {:<22} {:>8} {:>8} {:<5}",
            truncate_string(&chunk.target, 16),
            chunk.chunk_index,
            chunk.len(),
            start,
            end,
            files,
            format_opt(fid.map(|f| f.x), 1),
            format_opt(fid.map(|f| f.y), 1),
            if chunk.is_sky_obs() { "Yes" } else { "No" },
        );
    }

    println!("\nTotal: {} dither chunks", selected.len());
    Ok(())
}
