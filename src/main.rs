use clap::Parser;
use env_logger::{Builder, Env};
use log::{debug, error, info, LevelFilter};
use thiserror::Error;

use stroke_risk::cli::{Cli, Command};
use stroke_risk::pipeline::{self, PipelineConfig};
use stroke_risk::server::{self, ServerConfig};
use stroke_risk::PipelineError;

#[derive(Error, Debug)]
enum AppError {
    #[error(transparent)]
    Training(#[from] PipelineError),
    #[error("server failed: {0}")]
    Server(#[from] std::io::Error),
    #[error("training task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let env = Env::new().filter("STROKE_LOG");
    Builder::new().filter(Some("stroke_risk"), log_level).parse_env(env).init();

    debug!("Arguments {:#?}", cli);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Command::Train(args) => {
            let config = PipelineConfig::from(args);
            let report = tokio::task::spawn_blocking(move || pipeline::train(&config)).await??;
            info!(
                "wrote {} ({} train rows, {} test rows)",
                report.artifact.display(),
                report.train_rows,
                report.test_rows
            );
            if let Some(golden) = &report.golden {
                info!("reference patient probability {:.4}", golden.probability);
            }
        }
        Command::Serve(args) => server::serve(ServerConfig::from(args)).await?,
    }
    Ok(())
}
