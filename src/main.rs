mod audit;
mod cli;
mod columns;
mod corrections;
mod db;
mod error;
mod export;
mod fmt;
mod importer;
mod layout;
mod logging;
mod models;
mod permissions;
mod reconciler;
mod remittance;
mod reports;
mod sanitizer;
mod settings;
mod text;
mod validator;

use clap::{CommandFactory, Parser};

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);
    let user = cli.user.as_deref();

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Import { file, competence } => cli::import::run(user, &file, competence),
        Commands::Validate { competence } => cli::validate::run(user, competence),
        Commands::Reconcile { file, competence } => cli::reconcile::run(user, &file, &competence),
        Commands::Report { command } => cli::report::dispatch(user, command),
        Commands::Export { command } => cli::export::dispatch(user, command),
        Commands::Records { command } => cli::records::dispatch(user, command),
        Commands::Imports { command } => cli::imports::dispatch(user, command),
        Commands::Divergences { command } => cli::divergences::dispatch(user, command),
        Commands::Users { command } => cli::users::dispatch(user, command),
        Commands::Reset { yes } => cli::reset::run(user, yes),
        Commands::Backup { output } => cli::backup::run(user, output),
        Commands::Status => cli::status::run(),
        Commands::Demo => cli::demo::run(user),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "malha", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::debug!(error = ?e, "command failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
