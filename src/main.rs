use clap::Parser;
use vw_explorer::cli::{init_logging, Cli, Commands};
use vw_explorer::commands::{
    build_guider_index, fit_observation, init_config, list_dither_chunks, process, quicklook,
    show_summary, ProcessOptions,
};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Quicklook(args) => {
            quicklook(config, args.to_options())?;
        }
        Commands::Process {
            reload_log,
            no_plots,
            strict,
            log_file,
        } => {
            let options = ProcessOptions {
                reload_log,
                plots: !no_plots,
                strict,
                log_file,
            };
            process(config, options)?;
        }
        Commands::BuildIndex {
            force,
            remove_missing,
            verbose,
        } => {
            build_guider_index(config, force, remove_missing, verbose)?;
        }
        Commands::Summary { target, format } => {
            show_summary(config, target.as_deref(), &format)?;
        }
        Commands::Chunks { target, index } => {
            list_dither_chunks(config, target.as_deref(), index)?;
        }
        Commands::FitObservation {
            observation,
            follow_star,
            plot,
        } => {
            fit_observation(config, &observation, follow_star, plot)?;
        }
        Commands::InitConfig { path, force } => {
            init_config(path.as_deref(), force)?;
        }
    }

    Ok(())
}
