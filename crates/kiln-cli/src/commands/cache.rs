//! `kiln cache` command implementation

use crate::CliError;
use crate::context::CliContext;
use crate::output::{CommandReport, Table, print_json};
use colored::Colorize;
use kiln_core::CacheManager;
use serde_json::json;

/// Execute the `kiln cache stats` command
pub async fn run_stats(ctx: &CliContext) -> Result<(), CliError> {
    let cache = CacheManager::open(&ctx.config.cache).await;
    let stats = cache.stats().await;

    if ctx.format.is_json() {
        print_json(&stats)?;
    } else {
        println!("{} Module cache", "→".green());
        println!("  Backend:  {}", stats.backend.cyan());
        if let Some(dir) = ctx.config.cache.resolved_dir()
            && ctx.config.cache.enabled
        {
            println!("  Location: {}", dir.display());
        }
        println!("  Entries:  {}", stats.entries);
        println!("  Size:     {} bytes", stats.total_size_bytes);
    }
    Ok(())
}

/// Execute the `kiln cache list` command
pub async fn run_list(ctx: &CliContext) -> Result<(), CliError> {
    let cache = CacheManager::open(&ctx.config.cache).await;
    let mut entries = cache.store().list().await?;
    entries.sort_by(|a, b| a.key.cmp(&b.key));

    if ctx.format.is_json() {
        return print_json(&entries);
    }

    if entries.is_empty() {
        println!("  No cached modules.");
        return Ok(());
    }

    let rows: Vec<_> = entries
        .iter()
        .map(|entry| {
            json!({
                "key": entry.key,
                "size": entry.size,
                "original size": entry.original_size,
                "compressed": entry.compressed,
                "stored at": entry.stored_at().to_rfc3339(),
            })
        })
        .collect();
    println!("{}", Table::from_json_array(&rows));
    Ok(())
}

/// Execute the `kiln cache clear` command
pub async fn run_clear(ctx: &CliContext) -> Result<(), CliError> {
    let cache = CacheManager::open(&ctx.config.cache).await;
    let before = cache.stats().await.entries;
    cache.clear().await;

    let message = format!("Removed {} cached entries", before);
    if ctx.format.is_json() {
        print_json(&CommandReport::ok(message))?;
    } else {
        println!("{} {}", "✓".green(), message);
    }
    Ok(())
}
