//! `kiln invoke` command implementation

use crate::CliError;
use crate::commands::load::load_with_bar;
use crate::context::CliContext;
use crate::output::{CommandReport, print_json};
use kiln_core::{FunctionInvoker, LoaderError, ModuleArg};
use serde_json::{Value, json};

/// Execute the `kiln invoke` command
pub async fn run(
    ctx: &CliContext,
    function: &str,
    args: &[String],
    module: Option<&str>,
) -> Result<(), CliError> {
    let loader = ctx.loader().await?;
    let module = match module {
        Some(module) => module.to_string(),
        None => loader
            .registry()
            .owner_of(function)
            .ok_or_else(|| LoaderError::UnknownFunction(function.to_string()))?
            .to_string(),
    };

    // Load up front so text mode can show download progress
    load_with_bar(&loader, &module, ctx.format.is_json()).await?;

    let args: Vec<ModuleArg> = args.iter().map(|a| ModuleArg::from(a.as_str())).collect();
    let invoker = FunctionInvoker::new(loader.clone());
    let result = invoker.call(&module, function, &args).await?;

    if ctx.format.is_json() {
        print_json(&CommandReport::with_data(json!({
            "module": module,
            "function": function,
            "mode": loader.module_mode(&module),
            "result": result,
        })))?;
    } else {
        println!("{}", render(&result)?);
    }
    Ok(())
}

/// Text results print as-is; structured results as pretty JSON
fn render(value: &Value) -> Result<String, CliError> {
    Ok(match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string_pretty(other)?,
    })
}
