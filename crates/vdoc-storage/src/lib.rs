//! S3-compatible object storage client for the VDoc worker.

pub mod client;
pub mod download;
pub mod error;

pub use client::{ObjectStoreClient, ObjectStoreConfig};
pub use download::{download_large_object, DownloadConfig};
pub use error::{StorageError, StorageResult};
