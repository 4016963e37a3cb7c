use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

/// Some CDNs refuse requests without a browser-looking user agent.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Streams `url` into `dest`, creating parent directories. The file is
/// written under a temporary name and renamed once complete. Returns the
/// number of bytes written.
pub async fn download_to_file(url: &str, dest: &Path) -> anyhow::Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .user_agent(BROWSER_USER_AGENT)
        .build()?;
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("download failed with HTTP {}", status.as_u16());
    }

    let tmp = dest.with_extension("part");
    let mut file = tokio::fs::File::create(&tmp).await?;
    let mut written = 0u64;
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);
    tokio::fs::rename(&tmp, dest).await?;
    tracing::info!(path = %dest.display(), bytes = written, "download complete");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_download_leaves_no_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("nested").join("gen_1.mp4");
        let result = download_to_file("http://127.0.0.1:9/video.mp4", &dest).await;
        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(dir.path().join("nested").is_dir());
    }
}
