// Configuration loader
// Loads the task configuration from a TOML file, then applies environment overrides

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::settings::TaskConfig;
use crate::errors::config_parse_error;

/// Default config location: ~/.llama-classify/config.toml
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".llama-classify/config.toml"))
}

/// Load configuration from an explicit path, or the default location
pub fn load_config(path: Option<&Path>) -> Result<TaskConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !config_path.exists() {
        bail!(
            "No configuration found at {}.\n\n\
            Create one with at least:\n\n\
            labels = [\"positive\", \"negative\"]\n\n\
            [model]\n\
            base_model = \"meta-llama/Llama-2-7b-hf\"",
            config_path.display()
        );
    }

    let contents = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;

    let config = load_config_from_str(&contents)
        .with_context(|| config_parse_error(&config_path.display().to_string(), "see cause below"))?;

    tracing::info!(
        path = %config_path.display(),
        base_model = %config.model.base_model,
        labels = config.labels.len(),
        "Loaded task configuration"
    );

    Ok(config)
}

/// Parse, apply environment overrides and validate
pub fn load_config_from_str(contents: &str) -> Result<TaskConfig> {
    let mut config: TaskConfig = toml::from_str(contents).context("Failed to parse TOML")?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Environment variables set by distributed launchers take precedence
fn apply_env_overrides<F>(config: &mut TaskConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(world_size) = lookup("WORLD_SIZE") {
        config.distributed.world_size = world_size
            .trim()
            .parse()
            .with_context(|| format!("WORLD_SIZE is not a number: {}", world_size))?;
    }
    Ok(())
}
