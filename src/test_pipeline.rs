// End-to-end runs of the batch pipeline on a synthetic night: a log with
// three dithered observations of one target and five guider frames in each
// exposure window, one of them truncated to a bare header.

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use crate::commands::{run_pipeline, ProcessOptions};
    use crate::config::Config;
    use crate::fits::{write_header_only, write_image, CardValue, FitsImage};
    use crate::guider_frame::tests::star_image;
    use crate::guider_sequence::load_processed_csv;

    const LOG: &str = "\
Observer notes, night of 2024-11-02
# date: 2024-11-02
vw000101 03:00 M52_D1 60 3.1 1.4 41,31 1.20 clear
vw000102 03:05 M52_D2 60 3.1 1.4 41,31 1.21 -
vw000103 03:10 M52_D3 60 3.1 1.4 41,31 1.22 thin cirrus
";

    fn frame_cards(minute: u32, second: u32) -> Vec<(&'static str, CardValue)> {
        vec![
            ("DATE-OBS", CardValue::from("2024-11-02")),
            ("UT", CardValue::from(format!("03:{:02}:{:02}.0", minute, second).as_str())),
            ("EXPTIME", CardValue::Real(4.0)),
            ("AIRMASS", CardValue::Real(1.2)),
        ]
    }

    /// Five frames 10 s apart inside each observation window; frame 2 of the
    /// second observation has no data unit
    fn write_guider_night(guider_dir: &Path) -> usize {
        let night = guider_dir.join("20241102");
        std::fs::create_dir_all(&night).unwrap();
        let mut written = 0;
        for (obs, minute) in [0u32, 5, 10].into_iter().enumerate() {
            for frame in 0..5u32 {
                let second = 10 + frame * 10;
                let path = night.join(format!("guider_{:02}{:02}.fits", minute, second));
                let cards = frame_cards(minute, second);
                if obs == 1 && frame == 2 {
                    write_header_only(&path, &cards).unwrap();
                } else {
                    // star near 0-based (40, 30), i.e. the logged fiducial
                    let jitter = 0.1 * frame as f64;
                    let image: FitsImage =
                        star_image(80, 60, (40.0 + jitter, 30.0 - jitter), 2.0, 4000.0, written as u64);
                    let data: Vec<f32> = image.data.iter().map(|&v| v as f32).collect();
                    write_image(&path, 80, 60, &data, &cards).unwrap();
                }
                written += 1;
            }
        }
        written
    }

    fn synthetic_night(log: &str) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(dir.path());
        std::fs::write(&config.paths.log_dir, log).unwrap();
        std::fs::create_dir_all(&config.paths.observation_dir).unwrap();
        assert_eq!(write_guider_night(&config.paths.guider_dir), 15);
        config.analysis.cutout_size = 40;
        config.validate().unwrap();
        (dir, config)
    }

    fn plot_path(config: &Config, observation: &str, name: &str) -> PathBuf {
        config.observation_plot_dir(observation).join(name)
    }

    #[test]
    fn test_full_pipeline() {
        let (_dir, config) = synthetic_night(LOG);
        let options = ProcessOptions {
            plots: true,
            ..ProcessOptions::default()
        };
        let outcome = run_pipeline(&config, &options).unwrap();

        assert_eq!(outcome.observations.len(), 3);
        assert_eq!(outcome.report.index_entries, 15);
        assert_eq!(outcome.report.frames, 15);
        assert_eq!(outcome.report.frames_fitted, 14);
        assert_eq!(outcome.report.aggregates_available, 3);

        let n_fits: Vec<usize> = outcome
            .sequences
            .iter()
            .map(|(_, agg)| agg.stats().unwrap().n_fits)
            .collect();
        assert_eq!(n_fits, vec![5, 4, 5]);
        for (_, agg) in &outcome.sequences {
            let stats = agg.stats().unwrap();
            // sigma 2 px -> FWHM 4.71 px at 0.533"/px
            assert!((stats.fwhm_arcsec_mean - 2.51).abs() < 0.1, "{:?}", stats);
            assert!((stats.centroid_x_mean - 41.2).abs() < 0.2);
        }

        assert_eq!(outcome.report.frame_read_errors.len(), 1);
        let bad = &outcome.report.frame_read_errors[0];
        assert_eq!(bad.observation, "vw000102");
        assert_eq!(bad.frame_index, 2);
        assert!(outcome.report.fit_failures.is_empty());
        assert!(outcome.report.log_errors.is_empty());
        assert!(outcome.report.plot_errors.is_empty(), "{:?}", outcome.report.plot_errors);

        let processed = load_processed_csv(&config.processed_observations_csv()).unwrap();
        assert_eq!(processed.len(), 3);
        assert!(processed.iter().all(|r| r.status == "available"));
        assert!(processed.iter().all(|r| r.dither_chunk_index == Some(0)));
        assert_eq!(processed[1].n_frames, 5);
        assert_eq!(processed[1].n_fits, 4);

        for path in [
            config.raw_observations_csv(),
            config.dither_chunks_csv(),
            config.sanitized_log_path(),
            config.batch_report_path(),
            config.guider_index_path(),
            plot_path(&config, "vw000101", "summary.png"),
            plot_path(&config, "vw000101", "guider_frames.gif"),
            plot_path(&config, "vw000101", "frame_000.png"),
            plot_path(&config, "vw000102", "frame_002.png"),
            plot_path(&config, "vw000103", "stacked.fits"),
            plot_path(&config, "vw000103", "stacked.png"),
            config.dither_chunk_plot_dir().join("dither_chunk_M52_0_summary.png"),
        ] {
            assert!(path.is_file(), "missing {}", path.display());
        }

        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(config.batch_report_path()).unwrap())
                .unwrap();
        assert_eq!(report["frame_read_errors"][0]["kind"], "read");
        assert_eq!(report["aggregates_available"], 3);
    }

    #[test]
    fn test_rerun_uses_saved_tables() {
        let (_dir, config) = synthetic_night(LOG);
        let quiet = ProcessOptions::default();
        let first = run_pipeline(&config, &quiet).unwrap();
        assert!(!plot_path(&config, "vw000101", "summary.png").exists());

        // the log is gone but observations_raw.csv and the index remain
        std::fs::write(&config.paths.log_dir, "# date: 2024-11-02\n").unwrap();
        let second = run_pipeline(&config, &quiet).unwrap();
        assert_eq!(second.observations, first.observations);
        assert_eq!(second.records, first.records);
        assert_eq!(second.report.index_entries, 15);
    }

    #[test]
    fn test_malformed_log_line() {
        let log = format!("{}vw000104 03:15 M52_D4 sixty 3.1 1.4 41,31 1.2 -\n", LOG);
        let (_dir, config) = synthetic_night(&log);

        let outcome = run_pipeline(&config, &ProcessOptions::default()).unwrap();
        assert_eq!(outcome.observations.len(), 3);
        assert_eq!(outcome.report.log_errors.len(), 1);
        assert_eq!(outcome.report.log_errors[0].line, 6);

        let strict = ProcessOptions {
            strict: true,
            reload_log: true,
            ..ProcessOptions::default()
        };
        let err = run_pipeline(&config, &strict).unwrap_err();
        assert!(format!("{:#}", err).contains("line 6"), "{:#}", err);
    }
}
