use anyhow::{bail, Context, Result};
use futures_util::stream;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::protocol::VideoReference;

/// Extensions the gateway accepts; checked locally before any bytes move.
pub const ACCEPTED_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv"];

const UPLOAD_CHUNK: usize = 64 * 1024;

/// HTTP client for the upload/retrieval gateway.
pub struct Gateway {
    http: reqwest::Client,
    base_url: String,
}

impl Gateway {
    /// `base_url` without a trailing slash, e.g. `http://localhost:3005`.
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Upload a video, reporting `(bytes_sent, total_bytes)` as the body
    /// streams out.
    pub async fn upload<F>(&self, path: &Path, on_progress: F) -> Result<VideoReference>
    where
        F: FnMut(u64, u64) + Send + 'static,
    {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .context("File has no usable name")?
            .to_string();
        let Some(ext) = extension_of(&file_name) else {
            bail!(
                "Unsupported file type {:?} (accepted: {})",
                file_name,
                ACCEPTED_EXTENSIONS.join(", ")
            );
        };

        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let total = file
            .metadata()
            .await
            .context("Failed to read file metadata")?
            .len();

        let body = stream::try_unfold(
            (file, 0u64, on_progress),
            move |(mut file, sent, mut notify)| async move {
                let mut buf = vec![0u8; UPLOAD_CHUNK];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<_, std::io::Error>(None);
                }
                buf.truncate(n);
                let sent = sent + n as u64;
                notify(sent, total);
                Ok(Some((buf, (file, sent, notify))))
            },
        );

        let part = Part::stream_with_length(reqwest::Body::wrap_stream(body), total)
            .file_name(file_name)
            .mime_str(mime_for(&ext))
            .context("Invalid mime type")?;
        let form = Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{}/video/upload", self.base_url))
            .multipart(form)
            .send()
            .await
            .context("Upload request failed")?
            .error_for_status()
            .context("Gateway rejected upload")?;

        response
            .json::<VideoReference>()
            .await
            .context("Malformed upload response")
    }

    /// Fetch the current video reference, or None when nothing is uploaded.
    pub async fn current(&self) -> Result<Option<VideoReference>> {
        let response = self
            .http
            .get(format!("{}/video", self.base_url))
            .send()
            .await
            .context("Failed to reach gateway")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let reference = response
            .error_for_status()
            .context("Gateway error")?
            .json::<VideoReference>()
            .await
            .context("Malformed video reference")?;
        Ok(Some(reference))
    }

    /// Clear the stored reference on the server.
    pub async fn clear(&self) -> Result<()> {
        self.http
            .delete(format!("{}/video", self.base_url))
            .send()
            .await
            .context("Failed to reach gateway")?
            .error_for_status()
            .context("Gateway rejected delete")?;
        Ok(())
    }

    /// Full media address: `{base_url}{fileUrl}`.
    pub fn media_url(&self, reference: &VideoReference) -> String {
        format!("{}{}", self.base_url, reference.file_url)
    }
}

fn extension_of(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name).extension()?.to_str()?.to_lowercase();
    ACCEPTED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

fn mime_for(ext: &str) -> &'static str {
    match ext {
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        _ => "video/mp4",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_filter_matches_gateway_contract() {
        assert_eq!(extension_of("Movie Night.MP4").as_deref(), Some("mp4"));
        assert_eq!(extension_of("clip.mkv").as_deref(), Some("mkv"));
        assert_eq!(extension_of("notes.txt"), None);
        assert_eq!(extension_of("noextension"), None);
    }

    #[test]
    fn media_url_appends_relative_file_url() {
        let gateway = Gateway::new("http://localhost:3005/");
        let reference = VideoReference {
            file_url: "/uploads/abc.mp4".into(),
        };
        assert_eq!(
            gateway.media_url(&reference),
            "http://localhost:3005/uploads/abc.mp4"
        );
    }
}
