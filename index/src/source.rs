use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use failure::ResultExt;

use needlestack_models::DataSource;

use super::ErrorKind;
use super::Result;

/// Access to object-store blobs.
///
/// Cloud implementations live outside this repository; the filesystem store
/// below serves development clusters and tests.
pub trait BlobStore: Send + Sync {
    fn fetch(&self, bucket: &str, object: &str) -> Result<Vec<u8>>;
    fn last_modified(&self, bucket: &str, object: &str) -> Result<Option<DateTime<Utc>>>;
}

/// Blob store backed by a local directory tree: `<root>/<bucket>/<object>`.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> FsBlobStore {
        FsBlobStore { root: root.into() }
    }

    fn path(&self, bucket: &str, object: &str) -> PathBuf {
        self.root.join(bucket).join(object)
    }
}

impl BlobStore for FsBlobStore {
    fn fetch(&self, bucket: &str, object: &str) -> Result<Vec<u8>> {
        let path = self.path(bucket, object);
        let data = fs::read(&path)
            .with_context(|_| ErrorKind::SourceRead(path.display().to_string()))?;
        Ok(data)
    }

    fn last_modified(&self, bucket: &str, object: &str) -> Result<Option<DateTime<Utc>>> {
        let path = self.path(bucket, object);
        let metadata = fs::metadata(&path)
            .with_context(|_| ErrorKind::SourceRead(path.display().to_string()))?;
        let modified = metadata
            .modified()
            .with_context(|_| ErrorKind::SourceRead(path.display().to_string()))?;
        Ok(Some(DateTime::from(modified)))
    }
}

/// Injected data-source collaborators shared by every backend in a process.
#[derive(Clone)]
pub struct Fetchers {
    blobs: Arc<dyn BlobStore>,
}

impl Fetchers {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Fetchers {
        Fetchers { blobs }
    }

    /// Fetchers resolving blobs under a local directory.
    pub fn filesystem<P: Into<PathBuf>>(root: P) -> Fetchers {
        Fetchers::new(Arc::new(FsBlobStore::new(root)))
    }

    pub fn open(&self, source: &DataSource) -> SourceHandle {
        match source {
            DataSource::LocalFile { path } => SourceHandle::LocalFile { path: path.clone() },
            DataSource::Blob { bucket, object, .. } => SourceHandle::Blob {
                store: Arc::clone(&self.blobs),
                bucket: bucket.clone(),
                object: object.clone(),
            },
        }
    }
}

/// A resolved data source a backend can read and poll for freshness.
#[derive(Clone)]
pub enum SourceHandle {
    LocalFile {
        path: String,
    },
    Blob {
        store: Arc<dyn BlobStore>,
        bucket: String,
        object: String,
    },
}

impl SourceHandle {
    pub fn fetch(&self) -> Result<Vec<u8>> {
        match self {
            SourceHandle::LocalFile { path } => {
                let data = fs::read(path).with_context(|_| ErrorKind::SourceRead(path.clone()))?;
                Ok(data)
            }
            SourceHandle::Blob {
                store,
                bucket,
                object,
            } => store.fetch(bucket, object),
        }
    }

    pub fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        match self {
            SourceHandle::LocalFile { path } => {
                let metadata =
                    fs::metadata(path).with_context(|_| ErrorKind::SourceRead(path.clone()))?;
                let modified = metadata
                    .modified()
                    .with_context(|_| ErrorKind::SourceRead(path.clone()))?;
                Ok(Some(DateTime::from(modified)))
            }
            SourceHandle::Blob {
                store,
                bucket,
                object,
            } => store.last_modified(bucket, object),
        }
    }

    /// Human readable location for logs.
    pub fn describe(&self) -> String {
        match self {
            SourceHandle::LocalFile { path } => path.clone(),
            SourceHandle::Blob { bucket, object, .. } => format!("{}/{}", bucket, object),
        }
    }
}
