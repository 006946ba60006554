//! Kiln CLI - load, inspect and invoke WebAssembly compute modules

mod cli;
mod commands;
mod context;
mod error;
mod output;

use clap::Parser;
use cli::Cli;
use colored::Colorize;
use context::CliContext;
pub use error::CliError;
use output::{CommandReport, print_json};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays parseable
    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let format = cli.output.unwrap_or_default();
    let rt = tokio::runtime::Runtime::new()?;

    match rt.block_on(run_command_async(cli)) {
        Ok(()) => Ok(()),
        Err(e) if format.is_json() => {
            print_json(&CommandReport::failed(e.to_string()))?;
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".red(), e);
            std::process::exit(1);
        }
    }
}

async fn run_command_async(cli: Cli) -> Result<(), CliError> {
    use cli::{CacheCommands, Commands, ConfigCommands};

    let ctx = CliContext::load(cli.config.as_deref(), cli.output.unwrap_or_default())?;

    match cli.command {
        Commands::Load { modules } => {
            commands::load::run(&ctx, &modules).await?;
        }

        Commands::Invoke {
            function,
            args,
            module,
        } => {
            commands::invoke::run(&ctx, &function, &args, module.as_deref()).await?;
        }

        Commands::Status { load } => {
            commands::status::run(&ctx, &load).await?;
        }

        Commands::Cache { action } => match action {
            CacheCommands::Stats => commands::cache::run_stats(&ctx).await?,
            CacheCommands::List => commands::cache::run_list(&ctx).await?,
            CacheCommands::Clear => commands::cache::run_clear(&ctx).await?,
        },

        Commands::Config { action } => match action {
            ConfigCommands::Show => commands::config_cmd::run_show(&ctx)?,
            ConfigCommands::Validate => commands::config_cmd::run_validate(&ctx)?,
        },
    }

    Ok(())
}
