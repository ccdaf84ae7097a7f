// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The ingestor seam: where downloaded bytes become a stored resource.
//!
//! The queue hands the wrapped body reader to a [`ResourceIngestor`] and
//! records the returned handle's id. It never looks inside the handle.

use std::path::PathBuf;
use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use super::types::JobParams;

/// Byte stream handed to an ingestor. Cancellation and idle timeouts surface
/// as read errors.
pub type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

/// What an ingestor returns for a stored download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceHandle {
    pub id: String,
}

impl ResourceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Consumes a download stream and stores it.
///
/// Implementations read `reader` to completion or until it errors, and return
/// errors as-is; the worker records them verbatim on the job.
#[async_trait]
pub trait ResourceIngestor: Send + Sync {
    async fn ingest(&self, reader: BodyReader, filename: &str, params: &JobParams) -> Result<ResourceHandle>;
}

/// Stores downloads as flat files in one directory.
///
/// Each body is streamed into a temporary file while being hashed, then
/// renamed to `<hash prefix>-<filename>`. The hash prefix is the resource id.
#[derive(Debug, Clone)]
pub struct DirectoryIngestor {
    root: PathBuf,
}

/// Hex characters of the SHA-256 digest used as resource id.
const ID_LEN: usize = 16;

impl DirectoryIngestor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ResourceIngestor for DirectoryIngestor {
    async fn ingest(&self, mut reader: BodyReader, filename: &str, params: &JobParams) -> Result<ResourceHandle> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create storage directory {:?}", self.root))?;

        let suffix: u32 = rand::thread_rng().gen();
        let temp_path = self.root.join(format!(".incoming-{suffix:08x}"));
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let copied: Result<u64> = async {
            let mut written = 0u64;
            loop {
                let n = reader.read(&mut buf).await.context("Failed to read download stream")?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await.context("Failed to write to temp file")?;
                written += n as u64;
            }
            file.sync_all().await.context("Failed to sync temp file to disk")?;
            Ok(written)
        }
        .await;

        let written = match copied {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        let digest = hex::encode(hasher.finalize());
        let id = digest[..ID_LEN].to_string();
        let final_path = self.root.join(format!("{}-{}", id, sanitize_filename(filename)));
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("Failed to move download into place: {:?}", final_path))?;

        tracing::info!(
            resource_id = %id,
            bytes = written,
            owner_id = ?params.owner_id,
            path = %final_path.display(),
            "Stored download"
        );
        Ok(ResourceHandle::new(id))
    }
}

/// Keep a filename safe for a flat directory.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}
