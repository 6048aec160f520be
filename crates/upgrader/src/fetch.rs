//! Package acquisition.
//!
//! Downloads are resumable: an interrupted transfer leaves its bytes in the
//! temp directory and the next attempt continues with a range request.
//! Artifacts only become visible under the package store after their MD5
//! matches the control plane's advertised hash; a verified artifact is
//! reused without touching the network.

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use futures::StreamExt;
use md5::{Digest, Md5};
use reqwest::StatusCode;
use reqwest::header::RANGE;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::types::{DownloadOutcome, PackageInfoResponse, PackageMetadata, Project};

/// Timeout to connect and to make progress on the response stream.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Temp files older than this are swept.
const TEMP_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Minimum interval between two progress callbacks.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Byte-level progress callback: `(received, total)`.
pub type ByteProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

pub struct PackageFetcher {
    http: reqwest::Client,
    base_url: String,
    temp_dir: PathBuf,
    package_dir: PathBuf,
}

impl PackageFetcher {
    pub fn new(cfg: &AgentConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("upgrader/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(HTTP_TIMEOUT)
            .read_timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: cfg.http_base(),
            temp_dir: cfg.dirs.temp_dir.clone(),
            package_dir: cfg.dirs.package_dir.clone(),
        })
    }

    /// Fetch package metadata. Any non-success response or transport error
    /// yields `None`.
    pub async fn info(&self, project: Project, file_name: &str) -> Option<PackageMetadata> {
        let url = format!("{}/packages/{project}/{file_name}", self.base_url);
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url, error = %e, "package info request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(url, status = %response.status(), "package info returned non-success");
            return None;
        }
        match response.json::<PackageInfoResponse>().await {
            Ok(body) => body.into_metadata(),
            Err(e) => {
                warn!(url, error = %e, "package info body unparsable");
                None
            }
        }
    }

    fn target_path(&self, project: Project, file_name: &str) -> PathBuf {
        self.package_dir.join(project.as_str()).join(file_name)
    }

    fn temp_path(&self, project: Project, file_name: &str) -> PathBuf {
        self.temp_dir.join(format!("{project}-{file_name}"))
    }

    /// Download a package, resuming any partial temp file, and promote it to
    /// the package store once the content hash verifies.
    pub async fn download(
        &self,
        project: Project,
        metadata: &PackageMetadata,
        progress: Option<ByteProgress<'_>>,
    ) -> Result<DownloadOutcome, AgentError> {
        let target = self.target_path(project, &metadata.file_name);

        if target.is_file() {
            let digest = file_md5(&target)
                .await
                .map_err(|e| AgentError::DownloadFailed(format!("{e:#}")))?;
            if digest.eq_ignore_ascii_case(&metadata.file_md5) {
                info!(file = %target.display(), "verified artifact reused from cache");
                return Ok(DownloadOutcome {
                    file_path: target,
                    cached: true,
                });
            }
            debug!(file = %target.display(), "cached artifact is stale, re-downloading");
        }

        let temp = self.temp_path(project, &metadata.file_name);
        self.fetch_to_temp(project, metadata, &temp, progress)
            .await?;

        let digest = file_md5(&temp)
            .await
            .map_err(|e| AgentError::DownloadFailed(format!("{e:#}")))?;
        if !digest.eq_ignore_ascii_case(&metadata.file_md5) {
            tokio::fs::remove_file(&temp).await.ok();
            return Err(AgentError::DownloadFailed(format!(
                "文件 MD5 校验失败，期望 {}，实际 {digest}",
                metadata.file_md5
            )));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::DownloadFailed(format!("无法创建包目录: {e}")))?;
        }
        promote(&temp, &target)
            .await
            .map_err(|e| AgentError::DownloadFailed(format!("{e:#}")))?;
        info!(file = %target.display(), "package downloaded and verified");

        Ok(DownloadOutcome {
            file_path: target,
            cached: false,
        })
    }

    async fn fetch_to_temp(
        &self,
        project: Project,
        metadata: &PackageMetadata,
        temp: &PathBuf,
        progress: Option<ByteProgress<'_>>,
    ) -> Result<(), AgentError> {
        if let Some(parent) = temp.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::DownloadFailed(format!("无法创建临时目录: {e}")))?;
        }

        let offset = tokio::fs::metadata(temp).await.map(|m| m.len()).unwrap_or(0);
        let url = format!(
            "{}/packages/{project}/{}/download",
            self.base_url, metadata.file_name
        );

        let mut request = self.http.get(&url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
            debug!(url, offset, "resuming download with range request");
        }
        let response = request
            .send()
            .await
            .map_err(|e| AgentError::DownloadFailed(format!("下载请求失败: {e}")))?;
        if !response.status().is_success() {
            return Err(AgentError::DownloadFailed(format!(
                "下载请求返回 {}",
                response.status()
            )));
        }

        // A server that ignores the range header replays the whole file.
        let resuming = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        let total = response
            .content_length()
            .map(|len| len + if resuming { offset } else { 0 });

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resuming)
            .truncate(!resuming)
            .open(temp)
            .await
            .map_err(|e| AgentError::DownloadFailed(format!("无法打开临时文件: {e}")))?;

        let mut received = if resuming { offset } else { 0 };
        let mut last_report: Option<Instant> = None;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AgentError::DownloadFailed(format!("下载中断: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| AgentError::DownloadFailed(format!("写入临时文件失败: {e}")))?;
            received += chunk.len() as u64;
            if let Some(report) = progress {
                if last_report.is_none_or(|t| t.elapsed() >= PROGRESS_INTERVAL) {
                    report(received, total);
                    last_report = Some(Instant::now());
                }
            }
        }
        file.flush()
            .await
            .map_err(|e| AgentError::DownloadFailed(format!("写入临时文件失败: {e}")))?;

        if let Some(report) = progress {
            report(received, total);
        }
        Ok(())
    }

    /// Sweep temp files older than 24 hours. Per-file failures do not stop
    /// the sweep.
    pub async fn cleanup_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.temp_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        let now = SystemTime::now();
        while let Ok(Some(entry)) = entries.next_entry().await.map_err(|e| {
            warn!(error = %e, "temp sweep interrupted");
            e
        }) {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or(Duration::ZERO);
            if age >= TEMP_MAX_AGE {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!(file = %entry.path().display(), error = %e, "failed to sweep temp file");
                    }
                }
            }
        }
        if removed > 0 {
            info!(removed, "aged temp downloads swept");
        }
        Ok(removed)
    }
}

/// Move a verified temp file into place, copying when a rename crosses
/// filesystems.
async fn promote(temp: &PathBuf, target: &PathBuf) -> Result<()> {
    if tokio::fs::rename(temp, target).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(temp, target)
        .await
        .with_context(|| format!("failed to move {} to {}", temp.display(), target.display()))?;
    tokio::fs::remove_file(temp).await.ok();
    Ok(())
}

/// MD5 of a file, hex-encoded. Hashing runs on the blocking pool.
pub async fn file_md5(path: &std::path::Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        use std::io::Read;

        let mut file = std::fs::File::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut hasher = Md5::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .context("hashing task failed")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Serve package metadata and a range-aware download endpoint.
    fn spawn_server(payload: Vec<u8>, advertised_md5: String) -> (String, Arc<AtomicUsize>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let downloads = Arc::new(AtomicUsize::new(0));
        let counter = downloads.clone();

        std::thread::spawn(move || {
            for request in server.incoming_requests() {
                let url = request.url().to_string();
                if url.ends_with("/download") {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let range = request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv("Range"))
                        .map(|h| h.value.as_str().to_string());
                    match range.and_then(|r| {
                        r.strip_prefix("bytes=")
                            .and_then(|s| s.trim_end_matches('-').parse::<usize>().ok())
                    }) {
                        Some(offset) if offset <= payload.len() => {
                            let body = payload[offset..].to_vec();
                            let response = tiny_http::Response::from_data(body)
                                .with_status_code(tiny_http::StatusCode(206));
                            request.respond(response).ok();
                        }
                        _ => {
                            request
                                .respond(tiny_http::Response::from_data(payload.clone()))
                                .ok();
                        }
                    }
                } else {
                    let body = format!(
                        r#"{{"success": true, "data": {{"fileName": "fe-1.zip", "fileMD5": "{advertised_md5}"}}}}"#
                    );
                    request
                        .respond(
                            tiny_http::Response::from_string(body).with_header(
                                tiny_http::Header::from_bytes(
                                    &b"Content-Type"[..],
                                    &b"application/json"[..],
                                )
                                .unwrap(),
                            ),
                        )
                        .ok();
                }
            }
        });

        (format!("http://127.0.0.1:{port}"), downloads)
    }

    fn fetcher_for(base_url: &str, dir: &Path) -> PackageFetcher {
        let mut cfg = AgentConfig::default();
        cfg.server.url = base_url.to_string();
        cfg.dirs = crate::config::DirsConfig::under(dir);
        PackageFetcher::new(&cfg).unwrap()
    }

    fn md5_hex(data: &[u8]) -> String {
        hex::encode(Md5::digest(data))
    }

    fn metadata(file_name: &str, md5: &str) -> PackageMetadata {
        PackageMetadata {
            file_name: file_name.to_string(),
            file_md5: md5.to_string(),
            file_size: None,
            project: Some(Project::Frontend),
        }
    }

    #[tokio::test]
    async fn info_parses_the_data_shape() {
        let payload = b"zip-bytes".to_vec();
        let (base, _) = spawn_server(payload.clone(), md5_hex(&payload));
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher_for(&base, dir.path());

        let meta = fetcher.info(Project::Frontend, "fe-1.zip").await.unwrap();
        assert_eq!(meta.file_name, "fe-1.zip");
        assert_eq!(meta.file_md5, md5_hex(&payload));
    }

    #[tokio::test]
    async fn download_verifies_and_promotes() {
        let payload = b"frontend package contents".to_vec();
        let (base, _) = spawn_server(payload.clone(), md5_hex(&payload));
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher_for(&base, dir.path());
        let meta = metadata("fe-1.zip", &md5_hex(&payload));

        let outcome = fetcher
            .download(Project::Frontend, &meta, None)
            .await
            .unwrap();
        assert!(!outcome.cached);
        assert_eq!(std::fs::read(&outcome.file_path).unwrap(), payload);
        // The temp file was promoted away.
        assert!(!fetcher.temp_path(Project::Frontend, "fe-1.zip").exists());
    }

    #[tokio::test]
    async fn second_download_hits_the_cache() {
        let payload = b"frontend package contents".to_vec();
        let (base, downloads) = spawn_server(payload.clone(), md5_hex(&payload));
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher_for(&base, dir.path());
        let meta = metadata("fe-1.zip", &md5_hex(&payload));

        let first = fetcher
            .download(Project::Frontend, &meta, None)
            .await
            .unwrap();
        assert!(!first.cached);
        let second = fetcher
            .download(Project::Frontend, &meta, None)
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn partial_temp_file_resumes_with_a_range() {
        let payload = b"0123456789abcdefghij".to_vec();
        let (base, _) = spawn_server(payload.clone(), md5_hex(&payload));
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher_for(&base, dir.path());
        let meta = metadata("fe-1.zip", &md5_hex(&payload));

        let temp = fetcher.temp_path(Project::Frontend, "fe-1.zip");
        std::fs::create_dir_all(temp.parent().unwrap()).unwrap();
        std::fs::write(&temp, &payload[..8]).unwrap();

        let outcome = fetcher
            .download(Project::Frontend, &meta, None)
            .await
            .unwrap();
        assert!(!outcome.cached);
        assert_eq!(std::fs::read(&outcome.file_path).unwrap(), payload);
    }

    #[tokio::test]
    async fn hash_mismatch_fails_and_removes_the_temp_file() {
        let payload = b"actual bytes".to_vec();
        let (base, _) = spawn_server(payload.clone(), "0123456789abcdef0123456789abcdef".into());
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher_for(&base, dir.path());
        let meta = metadata("fe-1.zip", "0123456789abcdef0123456789abcdef");

        let err = fetcher
            .download(Project::Frontend, &meta, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::DownloadFailed(_)));
        assert!(err.to_string().contains("MD5"));
        assert!(!fetcher.temp_path(Project::Frontend, "fe-1.zip").exists());
        assert!(!fetcher.target_path(Project::Frontend, "fe-1.zip").exists());
    }

    #[tokio::test]
    async fn temp_sweep_only_touches_old_files() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher_for("http://127.0.0.1:1", dir.path());
        std::fs::create_dir_all(&fetcher.temp_dir).unwrap();
        std::fs::write(fetcher.temp_dir.join("frontend-new.zip"), b"x").unwrap();

        let removed = fetcher.cleanup_temp_files().await.unwrap();
        assert_eq!(removed, 0);
        assert!(fetcher.temp_dir.join("frontend-new.zip").exists());
    }
}
