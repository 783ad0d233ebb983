//! Guider frame index.
//!
//! Maps UT dates to the guider frames taken on them, ordered by the timestamp
//! in each frame's header (`DATE-OBS` + `UT`). Building the index is the only
//! expensive step (one header read per file), so it is persisted as
//! `guider_index.csv` and updated incrementally on later runs.
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{FrameReadError, TableError};
use crate::fits::FitsHeader;
use crate::utils::write_atomically;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GuiderEntry {
    pub timestamp: NaiveDateTime,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuiderIndex {
    by_date: BTreeMap<NaiveDate, Vec<GuiderEntry>>,
}

impl GuiderIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping each date's list in chronological order
    pub fn insert(&mut self, timestamp: NaiveDateTime, path: PathBuf) {
        let entry = GuiderEntry { timestamp, path };
        let list = self.by_date.entry(timestamp.date()).or_default();
        let pos = list.partition_point(|e| e <= &entry);
        list.insert(pos, entry);
    }

    pub fn len(&self) -> usize {
        self.by_date.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.values().all(|v| v.is_empty())
    }

    pub fn dates(&self) -> impl Iterator<Item = &NaiveDate> {
        self.by_date.keys()
    }

    pub fn frames_on(&self, date: NaiveDate) -> &[GuiderEntry] {
        self.by_date.get(&date).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// All entries in chronological order
    pub fn entries(&self) -> impl Iterator<Item = &GuiderEntry> {
        self.by_date.values().flatten()
    }

    /// Frames with `t0 <= timestamp <= t1`, chronological, across date boundaries
    pub fn frames_between(&self, t0: NaiveDateTime, t1: NaiveDateTime) -> Vec<&GuiderEntry> {
        if t1 < t0 {
            return Vec::new();
        }
        self.by_date
            .range(t0.date()..=t1.date())
            .flat_map(|(_, entries)| entries.iter())
            .filter(|e| e.timestamp >= t0 && e.timestamp <= t1)
            .collect()
    }

    pub fn paths(&self) -> HashSet<PathBuf> {
        self.entries().map(|e| e.path.clone()).collect()
    }

    /// Drop entries whose files no longer exist, returning how many were removed
    pub fn retain_existing(&mut self) -> usize {
        let before = self.len();
        for list in self.by_date.values_mut() {
            list.retain(|e| e.path.is_file());
        }
        self.by_date.retain(|_, list| !list.is_empty());
        before - self.len()
    }

    /// Write `date,time,fname`; paths below `root` are stored relative to it
    pub fn save_csv(&self, path: &Path, root: &Path) -> Result<(), TableError> {
        write_atomically(path, |file| {
            let mut wtr = csv::Writer::from_writer(&mut *file);
            for entry in self.entries() {
                let fname = entry.path.strip_prefix(root).unwrap_or(&entry.path);
                wtr.serialize(IndexRecord {
                    date: entry.timestamp.date(),
                    time: entry.timestamp.time(),
                    fname: fname.display().to_string(),
                })
                .map_err(std::io::Error::other)?;
            }
            wtr.flush()
        })
        .map_err(|source| TableError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_csv(path: &Path, root: &Path) -> Result<Self, TableError> {
        let mut rdr = csv::Reader::from_path(path).map_err(|source| TableError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let mut index = GuiderIndex::new();
        for row in rdr.deserialize::<IndexRecord>() {
            let record = row.map_err(|source| TableError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            let fname = PathBuf::from(&record.fname);
            let full = if fname.is_absolute() {
                fname
            } else {
                root.join(fname)
            };
            index.insert(record.date.and_time(record.time), full);
        }
        Ok(index)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexRecord {
    date: NaiveDate,
    time: NaiveTime,
    fname: String,
}

#[derive(Debug, Clone, Default)]
pub struct IndexBuildOptions {
    /// Ignore any existing index and rescan every file
    pub force: bool,
    /// Drop entries for files that have disappeared
    pub remove_missing: bool,
    /// Show a progress bar
    pub verbose: bool,
}

/// What a build pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexBuildReport {
    pub files_found: usize,
    pub already_indexed: usize,
    pub added: usize,
    pub removed: usize,
    pub total_entries: usize,
    #[serde(skip)]
    pub failures: Vec<FrameReadError>,
}

/// `*.fits` directly in `root` and one level of subdirectories, sorted by path
pub fn find_guider_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for pattern in [root.join("*.fits"), root.join("*").join("*.fits")] {
        match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => files.extend(paths.flatten().filter(|p| p.is_file())),
            Err(e) => warn!("Invalid guider pattern {}: {}", pattern.display(), e),
        }
    }
    files.sort();
    files.dedup();
    files
}

/// Timestamp of one guider frame, header only
pub fn read_frame_timestamp(path: &Path) -> Result<NaiveDateTime, FrameReadError> {
    let header = FitsHeader::read(path)?;
    header
        .timestamp()
        .map_err(|reason| FrameReadError::new(path, reason))
}

/// Scan `root` and add every frame not yet in `index`. Unreadable files are
/// reported and left out.
pub fn update_index(
    index: &mut GuiderIndex,
    root: &Path,
    options: &IndexBuildOptions,
) -> IndexBuildReport {
    let mut report = IndexBuildReport::default();
    if options.remove_missing {
        report.removed = index.retain_existing();
        if report.removed > 0 {
            info!("Removed {} index entries for missing files", report.removed);
        }
    }

    let files = find_guider_files(root);
    report.files_found = files.len();
    let known = index.paths();
    let new_files: Vec<PathBuf> = files.into_iter().filter(|f| !known.contains(f)).collect();
    report.already_indexed = report.files_found - new_files.len();

    if new_files.is_empty() {
        info!("No new guider frames to index in {}", root.display());
    } else {
        info!(
            "Guider index: {} new files to index in {}",
            new_files.len(),
            root.display()
        );
        if new_files.len() > 500 {
            warn!("Indexing {} files may take a while", new_files.len());
        }
    }

    let progress = if options.verbose {
        let pb = ProgressBar::new(new_files.len() as u64);
        if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}") {
            pb.set_style(style);
        }
        pb
    } else {
        ProgressBar::hidden()
    };

    for path in new_files {
        match read_frame_timestamp(&path) {
            Ok(timestamp) => {
                debug!("{} -> {}", path.display(), timestamp);
                index.insert(timestamp, path);
                report.added += 1;
            }
            Err(e) => {
                warn!("Skipping guider frame {}", e);
                report.failures.push(e);
            }
        }
        progress.inc(1);
    }
    progress.finish_and_clear();

    report.total_entries = index.len();
    report
}

/// Load the persisted index (unless forced), bring it up to date and write it
/// back atomically
pub fn build_index(
    root: &Path,
    index_path: &Path,
    options: &IndexBuildOptions,
) -> Result<(GuiderIndex, IndexBuildReport), TableError> {
    let mut index = if index_path.is_file() && !options.force {
        let existing = GuiderIndex::load_csv(index_path, root)?;
        info!(
            "Read existing guider index with {} entries from {}",
            existing.len(),
            index_path.display()
        );
        existing
    } else {
        GuiderIndex::new()
    };

    let report = update_index(&mut index, root, options);
    if report.added > 0 || report.removed > 0 || !index_path.is_file() {
        index.save_csv(index_path, root)?;
        info!("Wrote {} entries to {}", index.len(), index_path.display());
    }
    Ok((index, report))
}

/// Load the persisted index without scanning
pub fn load_index(root: &Path, index_path: &Path) -> Result<GuiderIndex, TableError> {
    GuiderIndex::load_csv(index_path, root)
}
