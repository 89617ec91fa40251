use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, VcsError};
use crate::model::generate_id;

const STAGING_DIR: &str = "tmp";

/// Filesystem tier of the object store.
///
/// Objects live at `{root}/{hash[0..2]}/{hash[2..]}`. Writes are staged under
/// `{root}/tmp/` and renamed into place, so a reader never sees a partial file.
#[derive(Debug, Clone)]
pub struct BlobFs {
    root: PathBuf,
}

/// Removes a staged file unless it was moved into place.
struct StagedFile {
    path: PathBuf,
    placed: bool,
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.placed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl BlobFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, hash: &str) -> Result<PathBuf> {
        if hash.len() < 3 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VcsError::InvalidInput(format!("malformed object hash '{}'", hash)));
        }
        Ok(self.root.join(&hash[..2]).join(&hash[2..]))
    }

    /// Write `contents` for `hash`, gzip-compressing first when asked.
    pub async fn write(&self, hash: &str, contents: &[u8], compress: bool) -> Result<PathBuf> {
        let target = self.path_for(hash)?;
        let bytes = if compress {
            let raw = contents.to_vec();
            tokio::task::spawn_blocking(move || compress_data(&raw))
                .await
                .map_err(|e| VcsError::StorageIo(format!("compression task failed: {}", e)))??
        } else {
            contents.to_vec()
        };

        let staging = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging).await?;
        let mut staged = StagedFile {
            path: staging.join(format!("{}.{}", hash, generate_id())),
            placed: false,
        };

        let mut file = fs::File::create(&staged.path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&staged.path, &target).await?;
        staged.placed = true;

        log::debug!("Wrote object file {} ({} bytes on disk)", target.display(), bytes.len());
        Ok(target)
    }

    pub async fn read(&self, hash: &str, compressed: bool) -> Result<Vec<u8>> {
        let path = self.path_for(hash)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VcsError::StorageIo(format!(
                    "object file missing for {}: {}",
                    hash,
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };

        if !compressed {
            return Ok(bytes);
        }
        tokio::task::spawn_blocking(move || decompress_data(&bytes))
            .await
            .map_err(|e| VcsError::StorageIo(format!("decompression task failed: {}", e)))?
    }

    /// Returns false if there was nothing to remove.
    pub async fn remove(&self, hash: &str) -> Result<bool> {
        let path = self.path_for(hash)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, hash: &str) -> Result<bool> {
        let path = self.path_for(hash)?;
        Ok(fs::try_exists(&path).await?)
    }
}

fn compress_data(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress_data(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
