use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use axum::extract::Multipart;
use infohub_api::{Error as ApiError, Uuid};
use tokio::io::AsyncWriteExt;

use crate::Error;

const STAGING_DIR: &str = ".staging";
const URL_PREFIX: &str = "/uploads/";

/// Directory holding uploaded files, served under `/uploads/`
#[derive(Clone)]
pub struct UploadDir(Arc<PathBuf>);

/// An upload that was fully received but not yet given its final name
///
/// The staging file is removed on drop unless it was committed.
pub struct StagedFile {
    path: Option<PathBuf>,
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            // Blocks the worker, but only for a single unlink
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!(?err, ?path, "failed removing staged upload");
            }
        }
    }
}

fn malformed(field: &str, err: impl std::fmt::Display) -> Error {
    tracing::debug!(%err, "malformed multipart upload");
    Error::Api(ApiError::field(field, "Malformed upload"))
}

impl UploadDir {
    pub async fn new(path: PathBuf) -> anyhow::Result<UploadDir> {
        tokio::fs::create_dir_all(path.join(STAGING_DIR))
            .await
            .with_context(|| format!("creating upload directory {path:?}"))?;
        Ok(UploadDir(Arc::new(path)))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Streams the multipart field called `field` to a staging file, giving up
    /// with `FileTooLarge` as soon as more than `limit` bytes were received
    pub async fn stage(
        &self,
        multipart: &mut Multipart,
        field: &str,
        limit: u64,
    ) -> Result<StagedFile, Error> {
        let mut upload = loop {
            match multipart
                .next_field()
                .await
                .map_err(|e| malformed(field, e))?
            {
                None => {
                    return Err(Error::Api(ApiError::field(field, "No file provided")));
                }
                Some(f) if f.name() == Some(field) => break f,
                Some(_) => continue,
            }
        };

        let path = self
            .0
            .join(STAGING_DIR)
            .join(Uuid::new_v4().to_string());
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("creating staging file {path:?}"))?;
        let mut staged = StagedFile {
            path: Some(path.clone()),
            file_name: String::from(upload.file_name().unwrap_or("")),
            content_type: String::from(upload.content_type().unwrap_or("application/octet-stream")),
            size: 0,
        };
        while let Some(chunk) = upload.chunk().await.map_err(|e| malformed(field, e))? {
            staged.size += chunk.len() as u64;
            if staged.size > limit {
                return Err(Error::Api(ApiError::FileTooLarge { limit }));
            }
            file.write_all(&chunk)
                .await
                .with_context(|| format!("writing to staging file {path:?}"))?;
        }
        file.flush()
            .await
            .with_context(|| format!("flushing staging file {path:?}"))?;
        if staged.size == 0 && staged.file_name.is_empty() {
            return Err(Error::Api(ApiError::field(field, "No file provided")));
        }
        Ok(staged)
    }

    /// Moves the staged file to `<uuid><ext>` and returns the url it is served at
    pub async fn commit(&self, mut staged: StagedFile, ext: &str) -> anyhow::Result<String> {
        let name = format!("{}{}", Uuid::new_v4(), ext);
        let from = staged
            .path
            .take()
            .context("committing an already committed upload")?;
        let to = self.0.join(&name);
        if let Err(err) = tokio::fs::rename(&from, &to).await {
            staged.path = Some(from);
            return Err(err).with_context(|| format!("moving upload to {to:?}"));
        }
        Ok(format!("{URL_PREFIX}{name}"))
    }

    /// Removes a file previously returned by `commit`, ignoring files that are
    /// already gone or urls that do not point into this directory
    pub async fn remove(&self, url: &str) -> anyhow::Result<()> {
        let name = match url.strip_prefix(URL_PREFIX) {
            Some(name) if !name.is_empty() && !name.contains(['/', '\\']) && name != ".." => name,
            _ => {
                tracing::warn!(?url, "refusing to remove upload outside of upload dir");
                return Ok(());
            }
        };
        match tokio::fs::remove_file(self.0.join(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing upload {name:?}")),
        }
    }
}

/// Extension photos are stored under, from their content type
pub fn photo_extension(content_type: &str) -> &'static str {
    match content_type.to_lowercase().as_str() {
        "image/png" => ".png",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        _ => ".jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remove_stays_inside_upload_dir() {
        let dir = tempfile::tempdir().expect("creating tempdir");
        let uploads = UploadDir::new(dir.path().join("uploads")).await.unwrap();
        let outside = dir.path().join("secret.txt");
        tokio::fs::write(&outside, b"keep me").await.unwrap();
        let inside = uploads.path().join("a.txt");
        tokio::fs::write(&inside, b"remove me").await.unwrap();

        uploads.remove("/uploads/../secret.txt").await.unwrap();
        uploads.remove("/elsewhere/a.txt").await.unwrap();
        assert!(outside.exists());
        assert!(inside.exists());

        uploads.remove("/uploads/a.txt").await.unwrap();
        assert!(!inside.exists());
        uploads.remove("/uploads/a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn staged_files_are_cleaned_up_unless_committed() {
        let dir = tempfile::tempdir().expect("creating tempdir");
        let uploads = UploadDir::new(dir.path().to_path_buf()).await.unwrap();
        let staged = |n: &str| {
            let path = uploads.path().join(STAGING_DIR).join(n);
            std::fs::write(&path, b"data").unwrap();
            StagedFile {
                path: Some(path),
                file_name: String::from("notes.txt"),
                content_type: String::from("text/plain"),
                size: 4,
            }
        };

        let dropped = staged("dropped");
        std::mem::drop(dropped);
        assert!(!uploads.path().join(STAGING_DIR).join("dropped").exists());

        let url = uploads.commit(staged("kept"), ".txt").await.unwrap();
        let name = url.strip_prefix(URL_PREFIX).unwrap();
        assert!(name.ends_with(".txt"));
        assert_eq!(std::fs::read(uploads.path().join(name)).unwrap(), b"data");
        assert!(!uploads.path().join(STAGING_DIR).join("kept").exists());
    }

    #[test]
    fn photo_extensions() {
        assert_eq!(photo_extension("image/PNG"), ".png");
        assert_eq!(photo_extension("image/jpeg"), ".jpg");
        assert_eq!(photo_extension("image/jpg"), ".jpg");
        assert_eq!(photo_extension("image/gif"), ".gif");
    }
}
