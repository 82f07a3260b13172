// Model resolution - local directory or HuggingFace Hub download
// Uses HuggingFace Hub for download management and caching

use anyhow::{anyhow, bail, Context, Result};
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::errors::ClassifyError;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Files making up a base model
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    /// One file, or every shard listed in the index
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Directory holding the tokenizer files
    pub fn tokenizer_dir(&self) -> Result<&Path> {
        self.tokenizer
            .parent()
            .context("Tokenizer path has no parent directory")
    }
}

#[derive(Debug, Deserialize)]
struct WeightsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Shard names referenced by a safetensors index, in stable order
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(index_path)
        .with_context(|| format!("Failed to read {:?}", index_path))?;
    let index: WeightsIndex =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {:?}", index_path))?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    if shards.is_empty() {
        bail!("Weights index {:?} lists no shards", index_path);
    }
    Ok(shards.into_iter().collect())
}

/// Resolves model identifiers to files on disk
pub struct ModelDownloader {
    cache_dir: Option<PathBuf>,
    revision: Option<String>,
}

impl ModelDownloader {
    /// Create new downloader (uses default HF cache: ~/.cache/huggingface/)
    pub fn new() -> Self {
        Self {
            cache_dir: None,
            revision: None,
        }
    }

    /// Create downloader with custom cache directory
    pub fn with_cache_dir(cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir).context("Failed to create cache directory")?;
        Ok(Self {
            cache_dir: Some(cache_dir),
            revision: None,
        })
    }

    /// Pin hub downloads to a branch, tag or commit
    pub fn revision(mut self, revision: Option<String>) -> Self {
        self.revision = revision;
        self
    }

    /// Resolve `identifier`: an existing directory is used in place, anything
    /// else is treated as a hub repository id.
    pub fn resolve(&self, identifier: &str) -> Result<ModelFiles> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            bail!(ClassifyError::InvalidConfig("base model identifier is empty".to_string()));
        }

        let local = Path::new(identifier);
        if local.is_dir() {
            tracing::debug!(dir = %local.display(), "Using local model directory");
            return self.resolve_local(local);
        }
        if local.is_absolute() || identifier.starts_with('.') || identifier.split('/').count() != 2 {
            bail!(ClassifyError::InvalidConfig(format!(
                "'{}' is neither a model directory nor a hub repository id (org/name)",
                identifier
            )));
        }
        self.download(identifier)
    }

    fn resolve_local(&self, dir: &Path) -> Result<ModelFiles> {
        let require = |name: &str| -> Result<PathBuf> {
            let path = dir.join(name);
            if path.exists() {
                Ok(path)
            } else {
                Err(ClassifyError::MissingModelFile(path).into())
            }
        };

        let config = require(CONFIG_FILE)?;
        let tokenizer = require(TOKENIZER_FILE)?;
        let tokenizer_config = Some(dir.join(TOKENIZER_CONFIG_FILE)).filter(|p| p.exists());

        let weights = if dir.join(SINGLE_WEIGHTS_FILE).exists() {
            vec![dir.join(SINGLE_WEIGHTS_FILE)]
        } else if dir.join(WEIGHTS_INDEX_FILE).exists() {
            shard_names(&dir.join(WEIGHTS_INDEX_FILE))?
                .iter()
                .map(|name| require(name))
                .collect::<Result<Vec<_>>>()?
        } else {
            return Err(ClassifyError::MissingModelFile(dir.join(SINGLE_WEIGHTS_FILE)).into());
        };

        Ok(ModelFiles {
            config,
            tokenizer,
            tokenizer_config,
            weights,
        })
    }

    /// Download model files with progress tracking.
    /// This is a blocking operation - spawn in a thread if you need async.
    fn download(&self, repo_id: &str) -> Result<ModelFiles> {
        let mut builder = ApiBuilder::new().with_progress(true);
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        let api = builder.build().context("Failed to initialise HuggingFace Hub client")?;

        let repo = match &self.revision {
            Some(rev) => Repo::with_revision(repo_id.to_string(), RepoType::Model, rev.clone()),
            None => Repo::new(repo_id.to_string(), RepoType::Model),
        };
        let repo = api.repo(repo);

        tracing::info!(repo = repo_id, revision = ?self.revision, "Downloading model to cache");

        let fetch = |name: &str| {
            repo.get(name).map_err(|e| {
                anyhow!(
                    "Failed to download {} from {}: {}\n\
                     Check the repository id and your HuggingFace token at ~/.cache/huggingface/token",
                    name,
                    repo_id,
                    e
                )
            })
        };

        let config = fetch(CONFIG_FILE)?;
        let tokenizer = fetch(TOKENIZER_FILE)?;
        let tokenizer_config = match repo.get(TOKENIZER_CONFIG_FILE) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("Failed to download optional file {}: {}", TOKENIZER_CONFIG_FILE, e);
                None
            }
        };

        let weights = match repo.get(SINGLE_WEIGHTS_FILE) {
            Ok(path) => vec![path],
            Err(_) => {
                tracing::info!("Single model file not found, looking for sharded files...");
                let index = fetch(WEIGHTS_INDEX_FILE)?;
                let shards = shard_names(&index)?;

                let progress = ProgressBar::new(shards.len() as u64);
                progress.set_style(
                    ProgressStyle::with_template("{msg} [{bar:30}] {pos}/{len} shards")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                progress.set_message(repo_id.to_string());

                let mut paths = Vec::with_capacity(shards.len());
                for shard in &shards {
                    paths.push(fetch(shard)?);
                    progress.inc(1);
                }
                progress.finish_and_clear();
                paths
            }
        };

        tracing::info!(repo = repo_id, weight_files = weights.len(), "Download complete");

        Ok(ModelFiles {
            config,
            tokenizer,
            tokenizer_config,
            weights,
        })
    }
}

impl Default for ModelDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn test_local_single_file_model() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");
        touch(dir.path(), SINGLE_WEIGHTS_FILE, "");

        let files = ModelDownloader::new()
            .resolve(dir.path().to_str().unwrap())
            .unwrap();
        assert_eq!(files.weights, vec![dir.path().join(SINGLE_WEIGHTS_FILE)]);
        assert!(files.tokenizer_config.is_none());
        assert_eq!(files.tokenizer_dir().unwrap(), dir.path());
    }

    #[test]
    fn test_custom_cache_dir_is_created() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");
        touch(dir.path(), SINGLE_WEIGHTS_FILE, "");
        let cache = dir.path().join("hub-cache");

        let downloader = ModelDownloader::with_cache_dir(cache.clone()).unwrap();
        assert!(cache.is_dir());
        let files = downloader.resolve(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(files.config, dir.path().join(CONFIG_FILE));
    }

    #[test]
    fn test_local_sharded_model() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");
        touch(dir.path(), TOKENIZER_CONFIG_FILE, "{}");
        touch(
            dir.path(),
            WEIGHTS_INDEX_FILE,
            r#"{"weight_map": {"a": "model-00002-of-00002.safetensors", "b": "model-00001-of-00002.safetensors", "c": "model-00001-of-00002.safetensors"}}"#,
        );
        touch(dir.path(), "model-00001-of-00002.safetensors", "");
        touch(dir.path(), "model-00002-of-00002.safetensors", "");

        let files = ModelDownloader::new()
            .resolve(dir.path().to_str().unwrap())
            .unwrap();
        assert_eq!(files.weights.len(), 2);
        assert!(files.weights[0].ends_with("model-00001-of-00002.safetensors"));
        assert!(files.tokenizer_config.is_some());
    }

    #[test]
    fn test_local_dir_missing_tokenizer() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        let err = ModelDownloader::new()
            .resolve(dir.path().to_str().unwrap())
            .unwrap_err();
        assert!(err.to_string().contains(TOKENIZER_FILE));
    }

    #[test]
    fn test_invalid_identifiers_fail_fast() {
        let downloader = ModelDownloader::new();
        assert!(downloader.resolve("").is_err());
        assert!(downloader.resolve("./does/not/exist").is_err());
        assert!(downloader.resolve("not-a-repo-id").is_err());
    }

    #[test]
    #[ignore] // Requires network - run with: cargo test -- --ignored
    fn test_download_tiny_model() {
        let files = ModelDownloader::new()
            .resolve("HuggingFaceM4/tiny-random-LlamaForCausalLM")
            .unwrap();
        assert!(files.config.exists());
        assert!(!files.weights.is_empty());
    }
}
