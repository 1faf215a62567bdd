use clap::Parser;
use opampcommander::config::CommanderConfig;
use opampcommander::{logging, run};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "opampcommander", about = "OpAMP control-plane server", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match CommanderConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    logging::init(&config.log.level);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build runtime: {err}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error_msg = %err, "opampcommander exited with error");
            ExitCode::from(err.exit_code())
        }
    }
}
