//! homeserver-backup - encrypted backups to local and cloud storage
//!
//! Main binary entry point for the command-line interface.

use anyhow::Result;
use clap::Parser;
use homeserver_backup::cli::{self, Cli, Commands, Session};
use homeserver_backup::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let session = Session::load(cli.config.as_deref())?;

    let level = session.config.logging.level.clone();
    let log_file = cli.log_file.clone().or_else(|| session.config.logging.log_file.clone());
    let file_logging = match &log_file {
        Some(path) => logging::init_file_logging(path, cli.verbose, &level).is_ok(),
        None => false,
    };
    if !file_logging {
        logging::init_logging(cli.verbose, &level)?;
    }

    match cli.command {
        Commands::Backup(args) => cli::backup::run(args, session).await,
        Commands::List(args) => cli::list::run(args, session).await,
        Commands::Cleanup(args) => cli::cleanup::run(args, session).await,
        Commands::Test(args) => cli::test::run(args, session).await,
        Commands::Download(args) => cli::download::run(args, session).await,
        Commands::Restore(args) => cli::restore::run(args, session).await,
        Commands::Status(args) => cli::status::run(args, session).await,
    }
}
