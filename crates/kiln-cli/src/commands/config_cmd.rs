//! `kiln config` command implementation

use crate::CliError;
use crate::context::CliContext;
use crate::output::{CommandReport, print_json};
use colored::Colorize;

/// Execute the `kiln config show` command
pub fn run_show(ctx: &CliContext) -> Result<(), CliError> {
    if ctx.format.is_json() {
        return print_json(&ctx.config);
    }

    match &ctx.config_path {
        Some(path) => println!("{} Configuration from {}", "→".green(), path.display()),
        None => println!("{} Built-in default configuration", "→".green()),
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&ctx.config)?);
    Ok(())
}

/// Execute the `kiln config validate` command.
///
/// The configuration was already validated while loading; this reports it.
pub fn run_validate(ctx: &CliContext) -> Result<(), CliError> {
    ctx.config.validate()?;
    let message = format!(
        "Configuration is valid ({} module(s), origin {})",
        ctx.config.modules.len(),
        ctx.config.origin
    );

    if ctx.format.is_json() {
        print_json(&CommandReport::ok(message))?;
    } else {
        println!("{} {}", "✓".green(), message);
    }
    Ok(())
}
