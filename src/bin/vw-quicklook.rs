use clap::Parser;
use vw_explorer::cli::{init_logging, QuicklookCli};
use vw_explorer::commands::quicklook;

fn main() -> anyhow::Result<()> {
    let cli = QuicklookCli::parse();
    init_logging(&cli.log_level);
    quicklook(cli.config.as_deref(), cli.args.to_options())
}
