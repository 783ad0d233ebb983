pub mod cli;
pub mod clipping;
pub mod commands;
pub mod config;
pub mod dither_chunk;
pub mod error;
pub mod fits;
pub mod guider_frame;
pub mod guider_index;
pub mod guider_sequence;
pub mod ifu;
pub mod log_parsing;
pub mod observation;
pub mod observation_sequence;
pub mod plotting;
pub mod psf_fitting;
pub mod report;
pub mod utils;

#[cfg(test)]
mod test_pipeline;

// Re-export commonly used items
pub use config::Config;
pub use guider_sequence::{AggregateFit, GuiderSequence};
pub use observation::Observation;
pub use observation_sequence::ObservationSequence;
