//! Local JSON sink for batches the analytical store could not accept.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use portalis_core::Domain;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackBlob {
    pub domain: Domain,
    pub discriminator: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FallbackStore {
    root: PathBuf,
}

impl FallbackStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `{domain}/{domain}_{discriminator}_{timestamp}_{hash}.json` below the root.
    pub fn blob_relative_path(
        &self,
        domain: Domain,
        discriminator: &str,
        written_at: DateTime<Utc>,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = written_at.format("%Y%m%dT%H%M%S%3fZ");
        let short_hash = content_hash.get(..12).unwrap_or(content_hash);
        PathBuf::from(domain.slug()).join(format!(
            "{}_{}_{stamp}_{short_hash}.json",
            domain.slug(),
            sanitize_discriminator(discriminator)
        ))
    }

    /// Persist one batch. Failures are logged and swallowed; an empty batch writes nothing.
    pub async fn store<T: Serialize>(
        &self,
        domain: Domain,
        records: &[T],
        discriminator: &str,
    ) -> Option<PathBuf> {
        if records.is_empty() {
            return None;
        }
        match self.try_store(domain, records, discriminator, Utc::now()).await {
            Ok(path) => {
                info!(
                    domain = %domain,
                    discriminator,
                    records = records.len(),
                    path = %path.display(),
                    "stored batch in fallback storage"
                );
                Some(path)
            }
            Err(err) => {
                error!(
                    domain = %domain,
                    discriminator,
                    records = records.len(),
                    error = %format!("{err:#}"),
                    "failed to store batch in fallback storage"
                );
                None
            }
        }
    }

    async fn try_store<T: Serialize>(
        &self,
        domain: Domain,
        records: &[T],
        discriminator: &str,
        written_at: DateTime<Utc>,
    ) -> anyhow::Result<PathBuf> {
        let bytes = serde_json::to_vec_pretty(records).context("serializing fallback batch")?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path =
            self.blob_relative_path(domain, discriminator, written_at, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = self.root.join(domain.slug());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating fallback directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking fallback path {}", absolute_path.display()))?
        {
            return Ok(absolute_path);
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp fallback file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp fallback file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp fallback file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp fallback file {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(absolute_path)
    }

    /// Every stored blob, oldest name first within each domain.
    pub async fn list(&self) -> anyhow::Result<Vec<FallbackBlob>> {
        let mut blobs = Vec::new();
        for domain in Domain::ALL {
            let dir = self.root.join(domain.slug());
            if !fs::try_exists(&dir)
                .await
                .with_context(|| format!("checking fallback directory {}", dir.display()))?
            {
                continue;
            }
            let mut entries = fs::read_dir(&dir)
                .await
                .with_context(|| format!("reading fallback directory {}", dir.display()))?;
            let mut found = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.starts_with('.') || !name.ends_with(".json") {
                    continue;
                }
                if let Some(discriminator) = parse_discriminator(domain, name) {
                    found.push(FallbackBlob {
                        domain,
                        discriminator,
                        path,
                    });
                }
            }
            found.sort_by(|a, b| a.path.cmp(&b.path));
            blobs.extend(found);
        }
        Ok(blobs)
    }

    pub async fn load<T: DeserializeOwned>(&self, blob: &FallbackBlob) -> anyhow::Result<Vec<T>> {
        let bytes = fs::read(&blob.path)
            .await
            .with_context(|| format!("reading fallback blob {}", blob.path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("decoding fallback blob {}", blob.path.display()))
    }

    pub async fn remove(&self, blob: &FallbackBlob) -> anyhow::Result<()> {
        fs::remove_file(&blob.path)
            .await
            .with_context(|| format!("removing fallback blob {}", blob.path.display()))
    }
}

fn sanitize_discriminator(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "all".to_string()
    } else {
        cleaned
    }
}

fn parse_discriminator(domain: Domain, file_name: &str) -> Option<String> {
    let stem = file_name
        .strip_suffix(".json")?
        .strip_prefix(domain.slug())?
        .strip_prefix('_')?;
    let mut parts = stem.rsplitn(3, '_');
    let _hash = parts.next()?;
    let _stamp = parts.next()?;
    parts.next().map(str::to_string)
}
