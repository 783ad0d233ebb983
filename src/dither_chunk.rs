use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::TableError;
use crate::observation::{Fiducial, Observation};
use crate::observation_sequence::ObservationSequence;
use crate::utils::write_atomically;

/// A run of observations of one target whose dither position increases by one
/// from each observation to the next
#[derive(Debug, Clone, PartialEq)]
pub struct DitherChunk {
    pub target: String,
    /// Position of this chunk among the target's chunks, starting at 0
    pub chunk_index: usize,
    pub observations: ObservationSequence,
}

impl DitherChunk {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn time_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        self.observations.time_range()
    }

    /// Mean over the observations that have a fiducial
    pub fn mean_fiducial(&self) -> Option<Fiducial> {
        let fiducials: Vec<Fiducial> = self.observations.iter().filter_map(|o| o.fiducial).collect();
        if fiducials.is_empty() {
            return None;
        }
        let n = fiducials.len() as f64;
        Some(Fiducial::new(
            fiducials.iter().map(|f| f.x).sum::<f64>() / n,
            fiducials.iter().map(|f| f.y).sum::<f64>() / n,
        ))
    }

    pub fn is_sky_obs(&self) -> bool {
        self.observations.iter().all(|o| o.is_sky_obs())
    }

    /// File name used for this chunk's summary plot
    pub fn plot_name(&self) -> String {
        let safe_target: String = self
            .target
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("dither_chunk_{}_{}_summary.png", safe_target, self.chunk_index)
    }

    pub fn summary(&self, max_line_length: Option<usize>) -> String {
        format!(
            "Dither chunk {} of {}\n{}",
            self.chunk_index,
            self.target,
            self.observations.summary(max_line_length)
        )
    }

    fn to_record(&self) -> DitherChunkRecord {
        let (start, end) = match self.time_range() {
            Some((s, e)) => (Some(s), Some(e)),
            None => (None, None),
        };
        let fid = self.mean_fiducial();
        DitherChunkRecord {
            target: self.target.clone(),
            chunk_index: self.chunk_index,
            num_observations: self.len(),
            start_time_ut: start,
            end_time_ut: end,
            observation_names: self
                .observations
                .iter()
                .map(|o| o.filename.as_str())
                .collect::<Vec<_>>()
                .join(";"),
            observation_paths: self
                .observations
                .iter()
                .map(|o| o.fpath.display().to_string())
                .collect::<Vec<_>>()
                .join(";"),
            fid_x_mean: fid.map(|f| f.x),
            fid_y_mean: fid.map(|f| f.y),
            is_sky_obs: self.is_sky_obs(),
        }
    }
}

/// Split one target's observations (in time order) into dither chunks
pub fn chunks_for_target(sequence: &ObservationSequence, target: &str) -> Vec<DitherChunk> {
    let mut groups: Vec<Vec<Observation>> = Vec::new();
    let mut previous_dither: Option<u32> = None;
    for obs in sequence.iter().filter(|o| o.target == target) {
        match (groups.last_mut(), previous_dither) {
            (Some(group), Some(prev)) if obs.dither == prev + 1 => group.push(obs.clone()),
            _ => groups.push(vec![obs.clone()]),
        }
        previous_dither = Some(obs.dither);
    }

    groups
        .into_iter()
        .enumerate()
        .map(|(chunk_index, observations)| DitherChunk {
            target: target.to_string(),
            chunk_index,
            observations: ObservationSequence::new(observations),
        })
        .collect()
}

/// Dither chunks of every target, keyed by target name
pub fn all_chunks(sequence: &ObservationSequence) -> BTreeMap<String, Vec<DitherChunk>> {
    sequence
        .all_targets()
        .into_iter()
        .map(|target| {
            let chunks = chunks_for_target(sequence, &target);
            (target, chunks)
        })
        .collect()
}

pub fn find_chunk<'a>(
    chunks: &'a BTreeMap<String, Vec<DitherChunk>>,
    target: &str,
    chunk_index: usize,
) -> Option<&'a DitherChunk> {
    chunks
        .get(target)?
        .iter()
        .find(|c| c.chunk_index == chunk_index)
}

/// Row of `dither_chunks.csv`; lists are `;`-separated
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DitherChunkRecord {
    pub target: String,
    pub chunk_index: usize,
    pub num_observations: usize,
    pub start_time_ut: Option<NaiveDateTime>,
    pub end_time_ut: Option<NaiveDateTime>,
    pub observation_names: String,
    pub observation_paths: String,
    pub fid_x_mean: Option<f64>,
    pub fid_y_mean: Option<f64>,
    pub is_sky_obs: bool,
}

pub fn save_chunks_csv<'a, I>(chunks: I, path: &Path) -> Result<usize, TableError>
where
    I: IntoIterator<Item = &'a DitherChunk>,
{
    let records: Vec<DitherChunkRecord> = chunks.into_iter().map(|c| c.to_record()).collect();
    write_atomically(path, |file| {
        let mut wtr = csv::Writer::from_writer(&mut *file);
        for record in &records {
            wtr.serialize(record).map_err(std::io::Error::other)?;
        }
        wtr.flush()
    })
    .map_err(|source| TableError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(records.len())
}

/// Read the chunk table back and rebuild chunks from a sequence by file name
pub fn load_chunks_csv(
    path: &Path,
    sequence: &ObservationSequence,
) -> Result<Vec<DitherChunk>, TableError> {
    let mut rdr = csv::Reader::from_path(path).map_err(|source| TableError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    let mut chunks = Vec::new();
    for (i, row) in rdr.deserialize::<DitherChunkRecord>().enumerate() {
        let record = row.map_err(|source| TableError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let mut observations = Vec::new();
        for name in record.observation_names.split(';').filter(|n| !n.is_empty()) {
            let obs = sequence.find(name).ok_or_else(|| TableError::Row {
                path: path.to_path_buf(),
                row: i + 1,
                message: format!("unknown observation {}", name),
            })?;
            observations.push(obs.clone());
        }
        chunks.push(DitherChunk {
            target: record.target,
            chunk_index: record.chunk_index,
            observations: ObservationSequence::new(observations),
        });
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::tests::sample_observation;

    fn obs(name: &str, target: &str, minute: u32, dither: u32) -> Observation {
        let mut o = sample_observation(name, target, (3, minute, 0));
        o.dither = dither;
        o.fiducial = Some(Fiducial::new(100.0 + dither as f64, 200.0));
        o
    }

    fn sequence() -> ObservationSequence {
        ObservationSequence::new(vec![
            obs("vw000001", "M52", 0, 1),
            obs("vw000002", "M52", 10, 2),
            obs("vw000003", "M52", 20, 3),
            obs("vw000004", "NGC1234", 25, 1),
            obs("vw000005", "M52", 30, 1),
            obs("vw000006", "M52", 40, 2),
            obs("vw000007", "M52", 50, 4),
        ])
    }

    #[test]
    fn test_chunks_split_on_dither_breaks() {
        let chunks = chunks_for_target(&sequence(), "M52");
        let sizes: Vec<_> = chunks.iter().map(|c| (c.chunk_index, c.len())).collect();
        assert_eq!(sizes, vec![(0, 3), (1, 2), (2, 1)]);
        assert_eq!(chunks[2].observations.observations()[0].filename, "vw000007");
        assert!(chunks[0].observations.is_single_dither_chunk());
    }

    #[test]
    fn test_chunk_properties() {
        let chunks = all_chunks(&sequence());
        assert_eq!(chunks.len(), 2);
        let first = find_chunk(&chunks, "M52", 0).unwrap();
        let fid = first.mean_fiducial().unwrap();
        assert!((fid.x - 102.0).abs() < 1e-12);
        assert!(first.is_sky_obs());
        assert_eq!(first.plot_name(), "dither_chunk_M52_0_summary.png");
        assert!(find_chunk(&chunks, "M52", 7).is_none());
    }

    #[test]
    fn test_csv_roundtrip_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dither_chunks.csv");
        let seq = sequence();
        let chunks = all_chunks(&seq);
        let written = save_chunks_csv(chunks.values().flatten(), &path).unwrap();
        assert_eq!(written, 4);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("vw000001;vw000002;vw000003"));

        let loaded = load_chunks_csv(&path, &seq).unwrap();
        let original: Vec<&DitherChunk> = chunks.values().flatten().collect();
        assert_eq!(loaded.len(), original.len());
        for (a, b) in loaded.iter().zip(original) {
            assert_eq!(a, b);
        }
    }
}
