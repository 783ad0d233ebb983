use chrono::NaiveDateTime;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::Path;

use crate::error::TableError;
use crate::observation::{Observation, ObservationRecord};
use crate::utils::{wrap_line, write_atomically};

/// Observations ordered by start time
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObservationSequence {
    observations: Vec<Observation>,
}

impl ObservationSequence {
    /// Sorts by start time; observations starting together keep their input order
    pub fn new(mut observations: Vec<Observation>) -> Self {
        observations.sort_by_key(|o| o.start_time);
        Self { observations }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Observation> {
        self.observations.iter()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn find(&self, filename: &str) -> Option<&Observation> {
        self.observations.iter().find(|o| o.filename == filename)
    }

    /// Non-calibration targets, sorted
    pub fn sci_targets(&self) -> Vec<String> {
        self.observations
            .iter()
            .filter(|o| !o.is_calibration())
            .map(|o| o.target.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn all_targets(&self) -> Vec<String> {
        self.observations
            .iter()
            .map(|o| o.target.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn target_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for obs in &self.observations {
            *counts.entry(obs.target.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Earliest and latest start time
    pub fn time_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let first = self.observations.first()?.start_time;
        let last = self.observations.last()?.start_time;
        Some((first, last))
    }

    pub fn is_single_target(&self) -> bool {
        self.sci_targets().len() == 1
    }

    /// One science target whose dither positions step up by exactly one
    pub fn is_single_dither_chunk(&self) -> bool {
        self.is_single_target()
            && self
                .observations
                .windows(2)
                .all(|w| w[1].dither == w[0].dither + 1)
    }

    /// Observations of one target, optionally limited to start times in `[start, end]`
    pub fn for_target(
        &self,
        target: &str,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> ObservationSequence {
        let observations = self
            .observations
            .iter()
            .filter(|o| o.target == target)
            .filter(|o| start.is_none_or(|s| o.start_time >= s))
            .filter(|o| end.is_none_or(|e| o.start_time <= e))
            .cloned()
            .collect();
        Self { observations }
    }

    pub fn summary(&self, max_line_length: Option<usize>) -> String {
        let Some((earliest, latest)) = self.time_range() else {
            return "Summary:\n  No observations\n".to_string();
        };
        let sci_targets = self.sci_targets();
        let counts = self.target_counts();

        let mut summary = String::from("Summary:\n");
        if sci_targets.len() == 1 {
            summary.push_str(&format!("  Target: {}\n", sci_targets[0]));
        } else {
            summary.push_str(&format!(
                "  Targets ({}): {}\n",
                sci_targets.len(),
                sci_targets.join(", ")
            ));
            for target in &sci_targets {
                summary.push_str(&format!(
                    "    {:<10} {}\n",
                    format!("{}:", target),
                    counts.get(target).copied().unwrap_or(0)
                ));
            }
        }
        summary.push_str(&format!(
            "  Time Range:\n    {} to\n    {}\n",
            earliest.format("%Y-%m-%d %H:%M:%S"),
            latest.format("%Y-%m-%d %H:%M:%S")
        ));
        summary.push_str(&format!("  Total Observations: {}\n", self.len()));

        let available = self.observations.iter().filter(|o| o.file_available()).count();
        summary.push_str(&format!("  Number of Available Files: {}\n", available));
        if available < self.len() {
            summary.push_str(&format!(
                "  Number of Missing Files: {}\n",
                self.len() - available
            ));
        }
        let calibrations = self.observations.iter().filter(|o| o.is_calibration()).count();
        if calibrations > 0 {
            summary.push_str(&format!("  Calibration Observations: {}\n", calibrations));
        }
        if self.len() <= 6 {
            let comments: Vec<String> = self
                .observations
                .iter()
                .filter(|o| !o.comments.is_empty())
                .map(|o| format!("[D{}] {}", o.dither, o.trimmed_comments()))
                .collect();
            summary.push_str(&format!("  Comments:\n{}\n", comments.join(";\n")));
        }

        match max_line_length {
            Some(width) => summary
                .lines()
                .flat_map(|line| {
                    if line.chars().count() > width {
                        wrap_line(line, width)
                    } else {
                        vec![line.to_string()]
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
            None => summary,
        }
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut wtr = csv::Writer::from_writer(writer);
        for obs in &self.observations {
            wtr.serialize(obs.to_record())?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Rows are taken in file order and then sorted by start time
    pub fn read_csv<R: Read>(reader: R, source: &Path) -> Result<Self, TableError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut observations = Vec::new();
        for (i, row) in rdr.deserialize::<ObservationRecord>().enumerate() {
            let record = row.map_err(|source_err| TableError::Csv {
                path: source.to_path_buf(),
                source: source_err,
            })?;
            let obs = Observation::from_record(record).map_err(|message| TableError::Row {
                path: source.to_path_buf(),
                row: i + 1,
                message,
            })?;
            observations.push(obs);
        }
        Ok(Self::new(observations))
    }

    pub fn save_csv(&self, path: &Path) -> Result<(), TableError> {
        write_atomically(path, |file| {
            self.write_csv(&mut *file).map_err(std::io::Error::other)
        })
        .map_err(|source| TableError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_csv(path: &Path) -> Result<Self, TableError> {
        let file = std::fs::File::open(path).map_err(|source| TableError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::read_csv(file, path)
    }
}

impl<'a> IntoIterator for &'a ObservationSequence {
    type Item = &'a Observation;
    type IntoIter = std::slice::Iter<'a, Observation>;

    fn into_iter(self) -> Self::IntoIter {
        self.observations.iter()
    }
}
