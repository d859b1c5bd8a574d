//! One-shot HTTP(S) download with a progress callback and cooperative
//! cancellation (§6.4 external collaborator). Grounded on the streamed-download
//! pattern used for binary archive fetches: a long connect timeout but no total
//! request timeout, since multi-hundred-megabyte archives and model files would
//! otherwise be aborted mid-stream.

use crate::error::{CoreError, Result};
use futures_util::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared cancellation flag. Clone it to hand a cancel button to a caller while
/// the download runs on its own task.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Downloader {
    client: reqwest::Client,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("genforge/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .expect("reqwest client builder should not fail with static config");
        Self { client }
    }

    /// Issues a HEAD request to learn content length. Per §4.2, HEAD failures are
    /// non-fatal to the caller — this returns `Ok(None)` rather than erroring on
    /// any failure, leaving it to the caller to treat an unknown size as 0.
    pub async fn head_content_length(&self, url: &str) -> Option<u64> {
        self.client.head(url).send().await.ok()?.content_length()
    }

    /// Streams `url` to `dest`, invoking `on_progress(downloaded, total)` after
    /// every chunk. `total` is 0 when the server didn't report a length.
    /// Returns `Err(DownloadFailed)` with message "cancelled" if `cancel` fires
    /// mid-stream; the partial file is left in place for the caller to clean up.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelHandle,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<()> {
        let response = self.client.get(url).send().await?;
        let total = response.content_length().unwrap_or(0);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut downloaded: u64 = 0;

        let mut stream = response.bytes_stream();
        use tokio::io::AsyncWriteExt;
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(CoreError::DownloadFailed {
                    message: "cancelled".into(),
                    details: None,
                });
            }
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total);
        }
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_handle_reports_state() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn cancel_handle_clones_share_state() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
    }
}
