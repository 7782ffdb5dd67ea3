//! Configuration loading and schema definitions.
//!
//! This module provides types and functions for loading a suite description
//! and runtime flags from TOML files or strings. Suite descriptions are
//! plain in-memory structures; XML suite files and their validation are an
//! external concern that produces the same types.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level layout of a drover TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// The suite to run.
    pub suite: SuiteDescription,

    /// Behaviour flags for the scheduler.
    #[serde(default)]
    pub runtime: RuntimeOptions,
}

/// Loads a suite description from a TOML file.
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The description fails validation (zero worker counts, duplicate names)
///
/// # Example
///
/// ```no_run
/// use drover::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("drover.toml"))?;
/// println!("Suite: {}", config.suite.name);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config.suite.validate()?;

    Ok(config)
}

/// Loads a suite description from a TOML string.
///
/// Useful for testing, embedding configuration, or generating configuration
/// programmatically.
///
/// # Errors
///
/// Returns an error if the string contains invalid TOML syntax or the
/// description fails validation.
///
/// # Example
///
/// ```
/// use drover::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [suite]
///     name = "nightly"
///     parallel = "tests"
///     thread_count = 4
///
///     [runtime]
///     enforce_thread_affinity = true
/// "#)?;
///
/// assert_eq!(config.suite.thread_count, 4);
/// assert!(config.runtime.enforce_thread_affinity);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content).context("Failed to parse config")?;

    config.suite.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_minimal_suite() {
        let config = load_config_str(
            r#"
            [suite]
            name = "smoke"
        "#,
        )
        .unwrap();
        assert_eq!(config.suite.name, "smoke");
        assert_eq!(config.suite.parallel, ParallelMode::None);
        assert!(!config.runtime.strict_parallelism);
    }

    #[test]
    fn load_full_suite() {
        let config = load_config_str(
            r#"
            [suite]
            name = "nightly"
            parallel = "methods"
            thread_count = 8
            data_provider_thread_count = 3
            skip_failed_invocation_counts = true
            time_out_ms = 60000

            [suite.parameters]
            env = "staging"

            [[suite.tests]]
            name = "api"
            parallel = "classes"

            [runtime]
            strict_parallelism = true
        "#,
        )
        .unwrap();
        assert_eq!(config.suite.parallel, ParallelMode::Methods);
        assert_eq!(config.suite.tests.len(), 1);
        assert_eq!(config.suite.tests[0].parallel, Some(ParallelMode::Classes));
        assert_eq!(config.suite.parameters["env"], "staging");
        assert!(config.runtime.strict_parallelism);
    }

    #[test]
    fn invalid_thread_count_is_rejected() {
        let err = load_config_str(
            r#"
            [suite]
            name = "bad"
            thread_count = 0
        "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("thread_count"));
    }
}
