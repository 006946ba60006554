//! Configuration file loading
//!
//! Format is detected from the file extension (YAML, TOML or JSON).
//! `${VAR}` and `$VAR` references are substituted before parsing, and
//! `<PREFIX>_SECTION__FIELD` environment variables override file values.

use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{LoaderError, LoaderResult};

static BRACED_VAR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok());

static SIMPLE_VAR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").ok());

/// Detect configuration format from file extension
///
/// ```rust,ignore
/// use kiln_core::config::detect_format;
///
/// let format = detect_format("kiln.toml")?;
/// ```
pub fn detect_format(path: &str) -> LoaderResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| LoaderError::Config(format!("no file extension on '{}'", path)))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        other => Err(LoaderError::Config(format!(
            "unsupported config format: {}",
            other
        ))),
    }
}

/// Substitute environment variables in a string
///
/// Unset variables are left as written.
pub fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();

    for re in [&*BRACED_VAR, &*SIMPLE_VAR].into_iter().flatten() {
        result = re
            .replace_all(&result, |caps: &regex::Captures| {
                std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
            })
            .to_string();
    }

    result
}

fn build<T>(builder: config::ConfigBuilder<config::builder::DefaultState>) -> LoaderResult<T>
where
    T: DeserializeOwned,
{
    builder
        .build()
        .map_err(|e| LoaderError::Config(format!("parse error: {}", e)))?
        .try_deserialize()
        .map_err(|e| LoaderError::Config(format!("invalid configuration: {}", e)))
}

/// Load configuration from a string with explicit format
pub fn from_str<T>(content: &str, format: FileFormat) -> LoaderResult<T>
where
    T: DeserializeOwned,
{
    let substituted = substitute_env_vars(content);
    build(Cfg::builder().add_source(File::from_str(&substituted, format)))
}

/// Load configuration from a file
pub fn load_config<T>(path: &str) -> LoaderResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    from_str(&content, format)
}

/// Load configuration with environment variable overrides
///
/// For the field `cache.retention_secs` and prefix `KILN`, the variable is
/// `KILN_CACHE__RETENTION_SECS`.
pub fn load_with_env<T>(path: &str, env_prefix: &str) -> LoaderResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let substituted = substitute_env_vars(&content);

    build(
        Cfg::builder()
            .add_source(File::from_str(&substituted, format))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            ),
    )
}
