//! `kiln status` command implementation

use crate::CliError;
use crate::context::CliContext;
use crate::output::{Table, print_json};
use colored::Colorize;
use comfy_table::Color;
use kiln_core::{LoadState, LoaderStatus};
use tracing::warn;

/// Execute the `kiln status` command
pub async fn run(ctx: &CliContext, preload: &[String]) -> Result<(), CliError> {
    let loader = ctx.loader().await?;
    for module in preload {
        if let Err(e) = loader.load(module).await {
            warn!("Failed to load {}: {}", module, e);
        }
    }

    let status = loader.loader_status().await;
    if ctx.format.is_json() {
        print_json(&status)?;
    } else {
        print_text(&status);
    }
    Ok(())
}

fn print_text(status: &LoaderStatus) {
    println!("{} Loader {}", "→".green(), status.session_id);
    println!("  Execution mode:    {}", status.mode.to_string().cyan());
    println!(
        "  Isolation:         {}",
        if status.isolated_available { "available" } else { "unavailable" }
    );
    if status.downgraded {
        println!("  {}", "Downgraded to inline after an isolated failure".yellow());
    }
    println!();

    let mut table = Table::with_headers(&["Module", "State", "Mode", "Last error"]);
    for (id, module) in &status.modules {
        let row = vec![
            id.clone(),
            state_label(module.state).to_string(),
            module.mode.map(|m| m.to_string()).unwrap_or_default(),
            module.last_error.clone().unwrap_or_default(),
        ];
        match module.state {
            LoadState::Ready => table.add_highlighted_row(row, Color::Green),
            LoadState::Failed => table.add_highlighted_row(row, Color::Red),
            _ => table.add_row(row),
        };
    }
    println!("{}", table);

    if let Some(worker) = &status.worker {
        println!();
        println!(
            "  Worker:            {} ({} pending)",
            worker["state"].as_str().unwrap_or("unknown"),
            worker["pending"]
        );
    }

    let cache = &status.cache;
    println!(
        "  Cache:             {} ({} entries, {} bytes, hit rate {:.0}%)",
        cache.backend,
        cache.entries,
        cache.total_size_bytes,
        cache.hit_rate() * 100.0
    );
}

fn state_label(state: LoadState) -> &'static str {
    match state {
        LoadState::NotLoaded => "not loaded",
        LoadState::Loading => "loading",
        LoadState::Ready => "ready",
        LoadState::Failed => "failed",
    }
}
