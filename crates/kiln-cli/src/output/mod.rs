//! Output formatting module
//!
//! Text output for people, JSON for automation, plus tables and progress bars.

mod json;
mod progress;
mod table;

pub use json::{CommandReport, JsonOutput};
pub use progress::ProgressBar;
pub use table::Table;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output for automation
    Json,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        self == Self::Json
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Print a JSON document on stdout
pub fn print_json<T: JsonOutput + ?Sized>(value: &T) -> Result<(), crate::CliError> {
    println!("{}", serde_json::to_string_pretty(&value.to_json())?);
    Ok(())
}
