mod cli;
mod logging;
mod progress;

use std::process;

use anyhow::{bail, Context};
use audioshelf::storage::models::{LogLevel, OperationStatus};
use audioshelf::Library;
use clap::{CommandFactory, Parser};
use cli::{Cli, Commands};
use colored::*;
use dotenv::dotenv;
use progress::OperationWatcher;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let args = Cli::parse();
    let _guard = logging::init_logger(args.verbose);

    let config = match audioshelf::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let Some(command) = args.command else {
        let _ = Cli::command().print_long_help();
        return Ok(());
    };

    if let Commands::PrintConfig = command {
        println!("Configuration: {:#?}", config);
        return Ok(());
    }

    let library = Library::open(config).context("Error opening library")?;
    let result = run(&library, command);
    let report = library.shutdown();
    if !report.timed_out.is_empty() {
        error!("Operations still running at exit: {:?}", report.timed_out);
    }
    result
}

fn run(library: &Library, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Import { priority } => {
            let mut subscription = library.notifier().subscribe();
            let id = library.start_import(priority)?;
            finish("Import", library, &mut subscription, &id)
        }
        Commands::Organize { priority } => {
            let mut subscription = library.notifier().subscribe();
            let id = library.start_organize(priority)?;
            finish("Organize", library, &mut subscription, &id)
        }
        Commands::Duplicates { json } => {
            let groups = library.dedup().get_duplicate_books()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&groups)?);
                return Ok(());
            }
            if groups.is_empty() {
                info!("No duplicates found");
            }
            for group in groups {
                println!("{} ({} copies)", group.hash.yellow(), group.books.len());
                for book in group.books {
                    println!("    {}  {}", book.id.dimmed(), book.file_path.display());
                }
            }
            Ok(())
        }
        Commands::Block { hash, reason } => {
            library.dedup().add_blocked_hash(&hash, &reason)?;
            println!("{} {}", "Blocked".red(), hash);
            Ok(())
        }
        Commands::Unblock { hash } => {
            library.dedup().remove_blocked_hash(&hash)?;
            println!("{} {}", "Unblocked".green(), hash);
            Ok(())
        }
        Commands::Blocked => {
            for entry in library.dedup().blocked_hashes()? {
                println!(
                    "{}  {}  {}",
                    entry.hash,
                    entry.created_at.format("%Y-%m-%d %H:%M"),
                    entry.reason
                );
            }
            Ok(())
        }
        Commands::Operations { json } => {
            library.queue().flush();
            let ops = library.store().list_operations()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ops)?);
                return Ok(());
            }
            for op in ops {
                let status = match op.status {
                    OperationStatus::Completed => op.status.as_str().green(),
                    OperationStatus::Failed => op.status.as_str().red(),
                    OperationStatus::Canceled => op.status.as_str().yellow(),
                    _ => op.status.as_str().cyan(),
                };
                println!(
                    "{}  {:<9} {:<9} {}/{}  {}",
                    op.id, op.op_type, status, op.progress, op.total, op.message
                );
            }
            Ok(())
        }
        Commands::Logs { id, json } => {
            let entries = library.queue().operation_logs(&id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            for entry in entries {
                let level = match entry.level {
                    LogLevel::Error => entry.level.as_str().red(),
                    LogLevel::Warn => entry.level.as_str().yellow(),
                    _ => entry.level.as_str().normal(),
                };
                println!(
                    "{}  {:<5}  {}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    level,
                    entry.message
                );
            }
            Ok(())
        }
        Commands::PrintConfig => {
            println!("Configuration: {:#?}", library.config());
            Ok(())
        }
    }
}

fn finish(
    label: &str,
    library: &Library,
    subscription: &mut audioshelf::Subscription,
    id: &str,
) -> anyhow::Result<()> {
    let watcher = OperationWatcher::new(label);
    let op = watcher.watch(subscription, library.queue(), id)?;
    match op.status {
        OperationStatus::Completed => {
            info!("{} {}: {}", label, "completed".green(), op.message);
            Ok(())
        }
        status => bail!("{} {}: {}", label, status, op.message),
    }
}

