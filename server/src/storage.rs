use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt, sync::RwLock};
use uuid::Uuid;

use crate::protocol::VideoReference;

const LOG_TAG: &str = "[Lockstep Server]";

/// Extensions the gateway accepts for upload.
pub const ACCEPTED_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv"];

/// On-disk store for the single shared video.
///
/// Uploads are streamed into a temp file while hashed, then renamed to a
/// content-derived name. Only one video is current at a time; committing a
/// new one replaces the reference and deletes the previous file.
pub struct VideoStore {
    dir: PathBuf,
    current: RwLock<Option<String>>,
}

pub struct PendingUpload {
    file: fs::File,
    temp_path: PathBuf,
    hasher: Sha256,
    ext: String,
    bytes: u64,
}

impl VideoStore {
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create upload directory {}", dir.display()))?;
        Ok(Self {
            dir,
            current: RwLock::new(None),
        })
    }

    /// Extract the lowercased extension if it is one we accept.
    pub fn accepted_extension(file_name: &str) -> Option<String> {
        let ext = Path::new(file_name).extension()?.to_str()?.to_lowercase();
        ACCEPTED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
    }

    pub async fn begin(&self, file_name: &str) -> Result<PendingUpload> {
        let Some(ext) = Self::accepted_extension(file_name) else {
            bail!(
                "Unsupported file type {:?} (accepted: {})",
                file_name,
                ACCEPTED_EXTENSIONS.join(", ")
            );
        };
        let temp_path = self.dir.join(format!(".{}.part", Uuid::new_v4()));
        let file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;
        Ok(PendingUpload {
            file,
            temp_path,
            hasher: Sha256::new(),
            ext,
            bytes: 0,
        })
    }

    pub async fn commit(&self, mut upload: PendingUpload) -> Result<VideoReference> {
        if upload.bytes == 0 {
            let _ = fs::remove_file(&upload.temp_path).await;
            bail!("Upload was empty");
        }
        upload.file.flush().await.context("Failed to flush upload")?;
        drop(upload.file);

        let digest = format!("{:x}", upload.hasher.finalize());
        let name = format!("{}.{}", &digest[..16], upload.ext);
        let final_path = self.dir.join(&name);
        fs::rename(&upload.temp_path, &final_path)
            .await
            .with_context(|| format!("Failed to move upload into {}", final_path.display()))?;

        let previous = {
            let mut current = self.current.write().await;
            current.replace(name.clone())
        };
        if let Some(old) = previous.filter(|old| *old != name) {
            let _ = fs::remove_file(self.dir.join(&old)).await;
        }

        tracing::info!("{LOG_TAG} Stored video {} ({} bytes)", name, upload.bytes);
        Ok(VideoReference {
            file_url: format!("/uploads/{name}"),
        })
    }

    pub async fn current(&self) -> Option<VideoReference> {
        let current = self.current.read().await;
        current.as_ref().map(|name| VideoReference {
            file_url: format!("/uploads/{name}"),
        })
    }

    /// Drop the current reference and delete its file. Returns whether a
    /// video was actually stored.
    pub async fn clear(&self) -> bool {
        let taken = self.current.write().await.take();
        match taken {
            Some(name) => {
                let _ = fs::remove_file(self.dir.join(&name)).await;
                tracing::info!("{LOG_TAG} Cleared stored video {}", name);
                true
            }
            None => false,
        }
    }

    /// Resolve a requested file name to a path inside the upload directory.
    /// Names with path separators or parent components are rejected.
    pub async fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return None;
        }
        let path = self.dir.join(name);
        fs::metadata(&path).await.ok()?.is_file().then_some(path)
    }
}

impl PendingUpload {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
        self.file
            .write_all(chunk)
            .await
            .context("Failed to write upload chunk")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store_with_video(dir: &Path, body: &[u8]) -> (VideoStore, VideoReference) {
        let store = VideoStore::open(dir).await.unwrap();
        let mut upload = store.begin("movie.mp4").await.unwrap();
        upload.write(body).await.unwrap();
        let reference = store.commit(upload).await.unwrap();
        (store, reference)
    }

    #[tokio::test]
    async fn upload_becomes_current_reference() {
        let dir = tempdir().unwrap();
        let (store, reference) = store_with_video(dir.path(), b"fake video bytes").await;

        assert!(reference.file_url.starts_with("/uploads/"));
        assert!(reference.file_url.ends_with(".mp4"));
        assert_eq!(store.current().await.unwrap().file_url, reference.file_url);

        let name = reference.file_url.trim_start_matches("/uploads/");
        let path = store.resolve(name).await.unwrap();
        assert_eq!(fs::read(path).await.unwrap(), b"fake video bytes");
    }

    #[tokio::test]
    async fn new_upload_replaces_previous_file() {
        let dir = tempdir().unwrap();
        let (store, first) = store_with_video(dir.path(), b"first").await;
        let first_name = first.file_url.trim_start_matches("/uploads/").to_string();

        let mut upload = store.begin("next.mkv").await.unwrap();
        upload.write(b"second").await.unwrap();
        let second = store.commit(upload).await.unwrap();

        assert_ne!(first.file_url, second.file_url);
        assert!(store.resolve(&first_name).await.is_none());
    }

    #[tokio::test]
    async fn rejects_unsupported_extension_and_empty_body() {
        let dir = tempdir().unwrap();
        let store = VideoStore::open(dir.path()).await.unwrap();
        assert!(store.begin("notes.txt").await.is_err());
        assert!(store.begin("noextension").await.is_err());

        let upload = store.begin("empty.mp4").await.unwrap();
        assert!(store.commit(upload).await.is_err());
        assert!(store.current().await.is_none());
    }

    #[tokio::test]
    async fn clear_removes_file_and_reference() {
        let dir = tempdir().unwrap();
        let (store, reference) = store_with_video(dir.path(), b"bytes").await;
        let name = reference.file_url.trim_start_matches("/uploads/").to_string();

        assert!(store.clear().await);
        assert!(store.current().await.is_none());
        assert!(store.resolve(&name).await.is_none());
        assert!(!store.clear().await);
    }

    #[tokio::test]
    async fn resolve_rejects_traversal() {
        let dir = tempdir().unwrap();
        let (store, _) = store_with_video(dir.path(), b"bytes").await;
        assert!(store.resolve("../secrets").await.is_none());
        assert!(store.resolve("a/b.mp4").await.is_none());
        assert!(store.resolve("").await.is_none());
    }
}
