//! CLI context: resolved configuration and output settings

use crate::CliError;
use crate::output::OutputFormat;
use kiln_core::{LoaderConfig, ModuleLoader};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Configuration files looked up in the working directory when `--config`
/// is not given
const DEFAULT_CONFIG_FILES: [&str; 4] = ["kiln.yaml", "kiln.yml", "kiln.toml", "kiln.json"];

/// Shared context for CLI commands
pub struct CliContext {
    pub config: LoaderConfig,
    /// File the configuration came from; `None` means built-in defaults
    pub config_path: Option<PathBuf>,
    pub format: OutputFormat,
}

impl CliContext {
    /// Resolve the configuration from `--config`, the working directory or
    /// the defaults
    pub fn load(config: Option<&Path>, format: OutputFormat) -> Result<Self, CliError> {
        let config_path = match config {
            Some(path) => Some(path.to_path_buf()),
            None => find_default_config(Path::new(".")),
        };

        let config = match &config_path {
            Some(path) => {
                debug!("Loading configuration from {}", path.display());
                let path = path
                    .to_str()
                    .ok_or_else(|| CliError::ConfigError(format!("non UTF-8 path: {}", path.display())))?;
                LoaderConfig::from_file(path)?
            }
            None => LoaderConfig::default(),
        };

        Ok(Self {
            config,
            config_path,
            format,
        })
    }

    /// Build a loader from the resolved configuration
    pub async fn loader(&self) -> Result<ModuleLoader, CliError> {
        if self.config.modules.is_empty() {
            return Err(CliError::ConfigError(
                "no modules configured; pass --config or create kiln.yaml".to_string(),
            ));
        }
        Ok(ModuleLoader::new(self.config.clone()).await?)
    }
}

fn find_default_config(dir: &Path) -> Option<PathBuf> {
    DEFAULT_CONFIG_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}
