//! `kiln load` command implementation

use crate::CliError;
use crate::context::CliContext;
use crate::output::{ProgressBar, print_json};
use colored::Colorize;
use kiln_core::{ExecutionMode, ModuleLoader};
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
struct LoadOutcome {
    module: String,
    loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<ExecutionMode>,
    elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Load `module` behind a progress bar
pub(crate) async fn load_with_bar(loader: &ModuleLoader, module: &str, quiet: bool) -> Result<(), CliError> {
    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::percent(module)
    };

    match loader.load_with_progress(module, bar.callback()).await {
        Ok(()) => {
            bar.finish_with_message("ready");
            Ok(())
        }
        Err(e) => {
            bar.abandon_with_message("failed");
            Err(e.into())
        }
    }
}

/// Execute the `kiln load` command
pub async fn run(ctx: &CliContext, modules: &[String]) -> Result<(), CliError> {
    let loader = ctx.loader().await?;
    let json = ctx.format.is_json();
    let mut outcomes = Vec::with_capacity(modules.len());

    for module in modules {
        let started = Instant::now();
        let result = load_with_bar(&loader, module, json).await;
        outcomes.push(LoadOutcome {
            module: module.clone(),
            loaded: result.is_ok(),
            mode: loader.module_mode(module),
            elapsed_ms: started.elapsed().as_millis() as u64,
            error: result.err().map(|e| e.to_string()),
        });
    }

    if json {
        print_json(&outcomes)?;
    } else {
        for outcome in &outcomes {
            match (&outcome.mode, &outcome.error) {
                (Some(mode), None) => println!(
                    "{} {} ready ({}, {}ms)",
                    "✓".green(),
                    outcome.module.cyan(),
                    mode,
                    outcome.elapsed_ms
                ),
                (_, Some(error)) => println!("{} {} failed: {}", "✗".red(), outcome.module.cyan(), error),
                (None, None) => println!("{} {} loaded", "✓".green(), outcome.module.cyan()),
            }
        }
    }

    let failed = outcomes.iter().filter(|o| !o.loaded).count();
    if failed > 0 {
        return Err(CliError::Other(format!("{} of {} module(s) failed to load", failed, outcomes.len())));
    }
    Ok(())
}
