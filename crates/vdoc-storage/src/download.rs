//! Concurrent ranged download of large objects.
//!
//! Videos routinely run into the hundreds of megabytes, so the worker
//! pulls them in parallel byte ranges and reassembles them on disk
//! instead of streaming a single GET.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::client::ObjectStoreClient;
use crate::error::{StorageError, StorageResult};

/// Tuning for [`download_large_object`].
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Size of each ranged GET in bytes.
    pub part_size: u64,
    /// Maximum ranged GETs in flight at once.
    pub max_concurrency: usize,
    /// Objects at or below this size are fetched with a single GET.
    pub single_shot_threshold: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            part_size: 16 * 1024 * 1024,
            max_concurrency: 4,
            single_shot_threshold: 32 * 1024 * 1024,
        }
    }
}

/// Download an object to `dest`, using concurrent ranged GETs for
/// large objects. The final file size is verified against the object
/// size reported by the store.
pub async fn download_large_object(
    client: &ObjectStoreClient,
    key: &str,
    dest: impl AsRef<Path>,
    config: &DownloadConfig,
) -> StorageResult<u64> {
    let dest = dest.as_ref();
    let total = client.object_size(key).await?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if total <= config.single_shot_threshold {
        debug!("Downloading {} ({} bytes) in one request", key, total);
        client.download_file(key, dest).await?;
        return verify_size(key, dest, total).await;
    }

    let part_count = total.div_ceil(config.part_size);
    info!(
        "Downloading {} ({} bytes) in {} parts",
        key, total, part_count
    );

    // Pre-size the file so parts can be written at their offsets.
    let file = tokio::fs::File::create(dest).await?;
    file.set_len(total).await?;
    drop(file);

    let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
    let mut tasks: JoinSet<StorageResult<()>> = JoinSet::new();

    for part in 0..part_count {
        let start = part * config.part_size;
        let end = ((part + 1) * config.part_size).min(total) - 1;

        let client = client.clone();
        let key = key.to_string();
        let dest = dest.to_path_buf();
        let semaphore = Arc::clone(&semaphore);

        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| StorageError::download_failed(e.to_string()))?;

            let bytes = client.download_range(&key, start, end).await?;

            let mut file = tokio::fs::OpenOptions::new().write(true).open(&dest).await?;
            file.seek(SeekFrom::Start(start)).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;

            debug!("Wrote part {} of {} ({} bytes)", part + 1, part_count, bytes.len());
            Ok(())
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => result?,
            Err(e) => return Err(StorageError::download_failed(e.to_string())),
        }
    }

    verify_size(key, dest, total).await
}

async fn verify_size(key: &str, dest: &Path, expected: u64) -> StorageResult<u64> {
    let actual = tokio::fs::metadata(dest).await?.len();
    if actual != expected {
        return Err(StorageError::IncompleteDownload {
            key: key.to_string(),
            expected,
            actual,
        });
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = DownloadConfig::default();
        assert!(config.part_size > 0);
        assert!(config.max_concurrency > 0);
        assert!(config.single_shot_threshold >= config.part_size);
    }

    #[test]
    fn part_ranges_cover_object_exactly() {
        let config = DownloadConfig {
            part_size: 10,
            max_concurrency: 2,
            single_shot_threshold: 0,
        };
        let total: u64 = 25;
        let part_count = total.div_ceil(config.part_size);
        assert_eq!(part_count, 3);

        let mut covered = 0;
        for part in 0..part_count {
            let start = part * config.part_size;
            let end = ((part + 1) * config.part_size).min(total) - 1;
            assert_eq!(start, covered);
            covered = end + 1;
        }
        assert_eq!(covered, total);
    }

    #[tokio::test]
    async fn verify_size_rejects_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let err = verify_size("videos/a.mp4", &path, 10).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::IncompleteDownload {
                expected: 10,
                actual: 3,
                ..
            }
        ));
    }
}
