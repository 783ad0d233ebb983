//! Skips and failures collected over a batch run
use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::{FrameFailure, LogFormatError, PlotError, SequenceError};
use crate::guider_index::IndexBuildReport;
use crate::guider_sequence::{AggregateFit, GuiderSequence};
use crate::utils::write_atomically;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineIssue {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileIssue {
    pub path: PathBuf,
    pub reason: String,
}

/// A guider frame that produced no star fit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameIssue {
    pub observation: String,
    pub frame_index: usize,
    pub file: String,
    pub kind: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationIssue {
    pub observation: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub generated_at: NaiveDateTime,
    pub log_file: PathBuf,
    pub observations: usize,
    pub observations_fitted: usize,
    pub aggregates_available: usize,
    pub index_entries: usize,
    pub frames: usize,
    pub frames_fitted: usize,
    pub log_errors: Vec<LineIssue>,
    pub index_read_errors: Vec<FileIssue>,
    pub frame_read_errors: Vec<FrameIssue>,
    pub fit_failures: Vec<FrameIssue>,
    pub sequence_errors: Vec<ObservationIssue>,
    pub plot_errors: Vec<String>,
}

impl BatchReport {
    pub fn new(log_file: &Path) -> Self {
        Self {
            generated_at: Utc::now().naive_utc(),
            log_file: log_file.to_path_buf(),
            observations: 0,
            observations_fitted: 0,
            aggregates_available: 0,
            index_entries: 0,
            frames: 0,
            frames_fitted: 0,
            log_errors: Vec::new(),
            index_read_errors: Vec::new(),
            frame_read_errors: Vec::new(),
            fit_failures: Vec::new(),
            sequence_errors: Vec::new(),
            plot_errors: Vec::new(),
        }
    }

    pub fn record_log_errors(&mut self, errors: &[LogFormatError]) {
        self.log_errors.extend(errors.iter().map(|e| LineIssue {
            line: e.line,
            message: e.message.clone(),
        }));
    }

    pub fn record_index(&mut self, report: &IndexBuildReport) {
        self.index_entries = report.total_entries;
        self.index_read_errors.extend(report.failures.iter().map(|e| FileIssue {
            path: e.path.clone(),
            reason: e.reason.clone(),
        }));
    }

    pub fn record_sequence(&mut self, sequence: &GuiderSequence, aggregate: &AggregateFit) {
        self.observations_fitted += 1;
        if aggregate.is_available() {
            self.aggregates_available += 1;
        }
        self.frames += sequence.len();
        self.frames_fitted += sequence.successes().count();
        for result in sequence.failures() {
            let Some(failure) = result.failure() else {
                continue;
            };
            let issue = FrameIssue {
                observation: sequence.observation.filename.clone(),
                frame_index: result.frame_index,
                file: result.file_name(),
                kind: failure.kind(),
                reason: failure.to_string(),
            };
            match failure {
                FrameFailure::Read(_) => self.frame_read_errors.push(issue),
                FrameFailure::Fit(_) => self.fit_failures.push(issue),
            }
        }
    }

    pub fn record_sequence_error(&mut self, error: &SequenceError) {
        let observation = match error {
            SequenceError::NoTimeWindow(name) | SequenceError::NoFiducial(name) => name.clone(),
        };
        self.sequence_errors.push(ObservationIssue {
            observation,
            reason: error.to_string(),
        });
    }

    pub fn record_plot_error(&mut self, context: &str, error: &PlotError) {
        self.plot_errors.push(format!("{}: {}", context, error));
    }

    pub fn issue_count(&self) -> usize {
        self.log_errors.len()
            + self.index_read_errors.len()
            + self.frame_read_errors.len()
            + self.fit_failures.len()
            + self.sequence_errors.len()
            + self.plot_errors.len()
    }

    /// Human-readable summary with every skipped item
    pub fn render(&self) -> String {
        let mut s = String::from("Batch report\n");
        s.push_str(&format!(
            "  Observations: {} parsed, {} fitted, {} with aggregates\n",
            self.observations, self.observations_fitted, self.aggregates_available
        ));
        s.push_str(&format!(
            "  Guider frames: {} indexed, {} in observation windows, {} fitted\n",
            self.index_entries, self.frames, self.frames_fitted
        ));
        if self.issue_count() == 0 {
            s.push_str("  No problems found\n");
            return s;
        }

        if !self.log_errors.is_empty() {
            s.push_str(&format!("  Log errors ({}):\n", self.log_errors.len()));
            for e in &self.log_errors {
                s.push_str(&format!("    line {}: {}\n", e.line, e.message));
            }
        }
        if !self.index_read_errors.is_empty() {
            s.push_str(&format!(
                "  Unreadable guider files ({}):\n",
                self.index_read_errors.len()
            ));
            for e in &self.index_read_errors {
                s.push_str(&format!("    {}: {}\n", e.path.display(), e.reason));
            }
        }
        for (title, issues) in [
            ("Frame read errors", &self.frame_read_errors),
            ("Fit failures", &self.fit_failures),
        ] {
            if issues.is_empty() {
                continue;
            }
            s.push_str(&format!("  {} ({}):\n", title, issues.len()));
            for e in issues {
                s.push_str(&format!(
                    "    {} frame {} ({}): {}\n",
                    e.observation, e.frame_index, e.file, e.reason
                ));
            }
        }
        if !self.sequence_errors.is_empty() {
            s.push_str(&format!(
                "  Observations skipped ({}):\n",
                self.sequence_errors.len()
            ));
            for e in &self.sequence_errors {
                s.push_str(&format!("    {}\n", e.reason));
            }
        }
        if !self.plot_errors.is_empty() {
            s.push_str(&format!("  Plot errors ({}):\n", self.plot_errors.len()));
            for e in &self.plot_errors {
                s.push_str(&format!("    {}\n", e));
            }
        }
        s
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        write_atomically(path, |file| {
            serde_json::to_writer_pretty(&mut *file, self).map_err(std::io::Error::other)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FitError, FrameReadError};
    use crate::guider_frame::FitResult;
    use crate::observation::tests::sample_observation;
    use crate::observation::Fiducial;

    fn failed(i: usize, failure: FrameFailure) -> FitResult {
        let obs = sample_observation("vw000030", "M52", (3, 0, 0));
        FitResult {
            frame_index: i,
            path: PathBuf::from(format!("/g/frame_{}.fits", i)),
            timestamp: obs.start_time,
            exptime: None,
            airmass: None,
            guess: Fiducial::new(1.0, 1.0),
            outcome: Err(failure),
        }
    }

    #[test]
    fn test_failures_are_sorted_by_kind() {
        let seq = GuiderSequence {
            observation: sample_observation("vw000030", "M52", (3, 0, 0)),
            results: vec![
                failed(0, FrameReadError::new("/g/frame_0.fits", "truncated").into()),
                failed(1, FitError::NotConverged.into()),
            ],
        };
        let mut report = BatchReport::new(Path::new("log.txt"));
        report.record_sequence(&seq, &AggregateFit::Unavailable { n_frames: 2 });
        report.record_sequence_error(&SequenceError::NoFiducial("vw000031".into()));
        report.record_log_errors(&[LogFormatError::new(7, "bad exposure time")]);

        assert_eq!(report.frame_read_errors.len(), 1);
        assert_eq!(report.fit_failures[0].file, "frame_1.fits");
        assert_eq!(report.fit_failures[0].kind, "fit");
        assert_eq!(report.sequence_errors[0].observation, "vw000031");
        assert_eq!(report.issue_count(), 4);
        assert_eq!(report.aggregates_available, 0);

        let text = report.render();
        assert!(text.contains("line 7: bad exposure time"));
        assert!(text.contains("vw000030 frame 0 (frame_0.fits)"));
    }

    #[test]
    fn test_save_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch_report.json");
        let mut report = BatchReport::new(Path::new("log.txt"));
        report.observations = 3;
        report.save(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["observations"], 3);
        assert!(json["fit_failures"].as_array().unwrap().is_empty());
        assert!(report.render().contains("No problems found"));
    }
}
