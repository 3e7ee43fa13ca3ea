use bi_pipeline::config::{Config, EtlArgs, TablesArgs};
use bi_pipeline::error::Error;
use bi_pipeline::runner;
use clap::{Parser, Subcommand};
use log::error;

#[derive(Parser)]
struct Args {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract, transform and load one task's sources.
    Etl(EtlArgs),
    /// Run the warehouse table tasks for a date.
    Tables(TablesArgs),
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let default_filter = if args.config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let result = match args.command {
        Command::Etl(etl) => runner::run_etl(&args.config, etl).await,
        Command::Tables(tables) => runner::run_tables(&args.config, tables).await,
    };
    if let Err(err) = result {
        error!("pipeline run failed: {}", err);
        std::process::exit(1);
    }

    Ok(())
}
