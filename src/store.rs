//! Filesystem-backed content-addressed object store.
//!
//! Three sibling directories under the store root:
//! - `tmp/<hex-digest>` — staging, being received.
//! - `new/<hex-digest>` — ingress drop dir, populated externally (mail
//!   ingress in the reference deployment); this crate only lists it as a
//!   filesystem location, it never reads or writes there.
//! - `cur/<hex-digest>` — committed, advertisable, serveable. Immutable once
//!   written; core never deletes a committed object.

use crate::digest::Digest;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("staging file already exists for {0}")]
    AlreadyStaging(Digest),
    #[error("object not found: {0}")]
    NotFound(Digest),
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A handle to one peer's object store rooted at `root`.
#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Open (creating if absent) the tmp/new/cur directory layout at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for sub in ["tmp", "new", "cur"] {
            fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self { root })
    }

    fn tmp_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("tmp").join(digest.to_hex())
    }

    fn cur_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("cur").join(digest.to_hex())
    }

    pub fn new_dir(&self) -> PathBuf {
        self.root.join("new")
    }

    /// Open an exclusive-create staging file for `digest`. Fails if a
    /// staging file for this digest already exists — the exclusive-create
    /// semantics are what let two accidentally-concurrent downloads of the
    /// same digest fail loudly rather than corrupt each other's bytes.
    pub async fn staging_create(&self, digest: &Digest) -> Result<File, StoreError> {
        let path = self.tmp_path(digest);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyStaging(*digest))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Discard a staging file (used when a download fails or a digest
    /// mismatch is detected).
    pub async fn staging_discard(&self, digest: &Digest) -> Result<(), StoreError> {
        match fs::remove_file(self.tmp_path(digest)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a committed object for reading. Returns `StoreError::NotFound`
    /// if it is not in `cur`.
    pub async fn open(&self, digest: &Digest) -> Result<File, StoreError> {
        match File::open(self.cur_path(digest)).await {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(*digest)),
            Err(e) => Err(e.into()),
        }
    }

    /// Commit a staging file into `cur` verbatim (no digest check). Exposed
    /// for callers that already verified the digest themselves; prefer
    /// [`ObjectStore::commit_verified`] on the normal download path.
    pub async fn commit(&self, digest: &Digest) -> Result<(), StoreError> {
        fs::rename(self.tmp_path(digest), self.cur_path(digest)).await?;
        Ok(())
    }

    /// Verify the staged bytes hash to `digest`, then atomically rename
    /// `tmp/<hex> -> cur/<hex>`. On mismatch the staging file is discarded
    /// and `DigestMismatch` is returned; the caller treats this exactly
    /// like a wire-level Fail.
    pub async fn commit_verified(&self, digest: &Digest) -> Result<(), StoreError> {
        let path = self.tmp_path(digest);
        let mut file = File::open(&path).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        drop(file);

        let actual = Digest::of(&buf);
        if actual != *digest {
            self.staging_discard(digest).await?;
            return Err(StoreError::DigestMismatch {
                expected: *digest,
                actual,
            });
        }
        self.commit(digest).await
    }

    pub async fn contains(&self, digest: &Digest) -> bool {
        fs::metadata(self.cur_path(digest)).await.is_ok()
    }

    /// Enumerate committed digests, in directory-listing order (unspecified
    /// beyond "every committed digest appears exactly once").
    pub async fn list(&self) -> Result<Vec<Digest>, StoreError> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(self.root.join("cur")).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(d) = Digest::from_hex(name) {
                    out.push(d);
                }
            }
        }
        Ok(out)
    }

    pub async fn write_object(&self, digest: &Digest, bytes: &[u8]) -> Result<(), StoreError> {
        let mut f = self.staging_create(digest).await?;
        f.write_all(bytes).await?;
        f.flush().await?;
        drop(f);
        self.commit_verified(digest).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn temp_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn staging_create_is_exclusive() {
        let (_dir, store) = temp_store().await;
        let d = Digest::of(b"x");
        let _f1 = store.staging_create(&d).await.unwrap();
        let second = store.staging_create(&d).await;
        assert!(matches!(second, Err(StoreError::AlreadyStaging(_))));
    }

    #[tokio::test]
    async fn commit_verified_accepts_matching_digest() {
        let (_dir, store) = temp_store().await;
        let bytes = b"the quick brown fox";
        let d = Digest::of(bytes);
        let mut f = store.staging_create(&d).await.unwrap();
        f.write_all(bytes).await.unwrap();
        f.flush().await.unwrap();
        drop(f);

        store.commit_verified(&d).await.unwrap();
        assert!(store.contains(&d).await);

        let mut read = store.open(&d).await.unwrap();
        let mut got = Vec::new();
        read.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, bytes);
    }

    #[tokio::test]
    async fn commit_verified_rejects_mismatch_and_discards_staging() {
        let (_dir, store) = temp_store().await;
        let wrong_digest = Digest::of(b"not what's in the file");
        let mut f = store.staging_create(&wrong_digest).await.unwrap();
        f.write_all(b"actual bytes").await.unwrap();
        f.flush().await.unwrap();
        drop(f);

        let err = store.commit_verified(&wrong_digest).await.unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }));
        assert!(!store.contains(&wrong_digest).await);
        // staging file cleaned up — a second staging_create must succeed
        store.staging_create(&wrong_digest).await.unwrap();
    }

    #[tokio::test]
    async fn open_missing_is_not_found() {
        let (_dir, store) = temp_store().await;
        let err = store.open(&Digest::of(b"nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_enumerates_committed_only() {
        let (_dir, store) = temp_store().await;
        let d1 = Digest::of(b"one");
        let d2 = Digest::of(b"two");
        store.write_object(&d1, b"one").await.unwrap();
        // d2 only staged, never committed
        let _f = store.staging_create(&d2).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![d1]);
    }
}
