pub mod build_index;
pub mod chunks;
pub mod common;
pub mod fit_observation;
pub mod init_config;
pub mod process;
pub mod quicklook;
pub mod summary;

pub use build_index::build_guider_index;
pub use chunks::list_dither_chunks;
pub use fit_observation::fit_observation;
pub use init_config::init_config;
pub use process::{process, run_pipeline, ProcessOptions, ProcessOutcome};
pub use quicklook::{quicklook, QuicklookOptions};
pub use summary::show_summary;
