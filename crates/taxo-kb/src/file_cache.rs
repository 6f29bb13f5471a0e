//! Download cache for linker artifacts
//!
//! Remote artifacts are fetched once into the cache directory and reused on
//! every later run. Local paths are passed through untouched.
//!
//! Author: hephaex@gmail.com

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use taxo_core::{Result, TaxoError};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::registry::{is_url, safe_relative, ArtifactRef, LinkerPaths};

/// Local files backing a [`LinkerPaths`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub ann_index: PathBuf,
    pub tfidf_vectorizer: PathBuf,
    pub tfidf_vectors: PathBuf,
    pub concept_aliases_list: PathBuf,
}

/// Resolves artifact references to local files
#[derive(Clone)]
pub struct FileCache {
    cache_dir: PathBuf,
    client: reqwest::Client,
}

impl FileCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Local path for an artifact, downloading it first if needed
    pub async fn resolve(&self, reference: &ArtifactRef) -> Result<PathBuf> {
        match reference {
            ArtifactRef::Path(p) if is_url(p) => {
                let target = self.cache_dir.join(url_digest(p));
                self.fetch(p, &target).await?;
                Ok(target)
            }
            ArtifactRef::Path(p) => {
                let path = PathBuf::from(p);
                if !path.exists() {
                    return Err(TaxoError::NotFound(format!("Linker artifact {p}")));
                }
                Ok(path)
            }
            ArtifactRef::Remote(url, name) => {
                let target = self.cache_dir.join(safe_relative(name)?);
                self.fetch(url, &target).await?;
                Ok(target)
            }
        }
    }

    /// Resolve all four linker artifacts
    pub async fn resolve_paths(&self, paths: &LinkerPaths) -> Result<ResolvedPaths> {
        Ok(ResolvedPaths {
            ann_index: self.resolve(&paths.ann_index).await?,
            tfidf_vectorizer: self.resolve(&paths.tfidf_vectorizer).await?,
            tfidf_vectors: self.resolve(&paths.tfidf_vectors).await?,
            concept_aliases_list: self.resolve(&paths.concept_aliases_list).await?,
        })
    }

    async fn fetch(&self, url: &str, target: &Path) -> Result<()> {
        if tokio::fs::try_exists(target).await.unwrap_or(false) {
            debug!(url, path = %target.display(), "Using cached artifact");
            return Ok(());
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TaxoError::StorageError(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        info!(url, path = %target.display(), "Downloading artifact");
        let started = std::time::Instant::now();
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TaxoError::DownloadError(format!("{url}: {e}")))?;

        let tmp = target.with_extension("part");
        let mut file = tokio::fs::File::create(&tmp).await.map_err(|e| {
            TaxoError::StorageError(format!("Failed to create {}: {e}", tmp.display()))
        })?;

        let mut bytes = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TaxoError::DownloadError(format!("{url}: {e}")))?
        {
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(|e| {
                TaxoError::StorageError(format!("Failed to write {}: {e}", tmp.display()))
            })?;
        }
        file.flush().await.map_err(|e| {
            TaxoError::StorageError(format!("Failed to write {}: {e}", tmp.display()))
        })?;
        drop(file);

        tokio::fs::rename(&tmp, target).await.map_err(|e| {
            TaxoError::StorageError(format!("Failed to move {} into cache: {e}", tmp.display()))
        })?;

        info!(
            url,
            bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Downloaded artifact"
        );
        Ok(())
    }
}

/// Cache name for a bare URL
fn url_digest(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}
