//! On-disk cache of large downloaded artifacts.
//!
//! A cached file is trusted by presence alone: once it exists at its
//! expected path it is never re-fetched or overwritten. Downloads therefore
//! land in `<name>.part` and are renamed into place only when complete, so an
//! interrupted transfer can never masquerade as a cache hit.

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::BuildError;

const USER_AGENT: &str = concat!("emcomm-iso/", env!("CARGO_PKG_VERSION"));

/// What a cached file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    BaseImage,
    VendorPayload,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::BaseImage => write!(f, "base image"),
            ArtifactKind::VendorPayload => write!(f, "vendor payload"),
        }
    }
}

/// One artifact's slot in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

impl CacheEntry {
    pub fn is_present(&self) -> bool {
        self.path.is_file()
    }

    /// Staging file for an in-progress download.
    pub fn part_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".part");
        self.path.with_file_name(name)
    }
}

/// Retry and progress settings for downloads.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub retries: u32,
    /// Doubles after every failed attempt, capped at 16x.
    pub retry_delay: Duration,
    pub show_progress: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_secs(5),
            show_progress: true,
        }
    }
}

/// The artifact cache directory.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
    options: DownloadOptions,
}

impl ArtifactCache {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            options: DownloadOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry(&self, kind: ArtifactKind, filename: &str) -> CacheEntry {
        CacheEntry {
            kind,
            path: self.dir.join(filename),
        }
    }

    /// Return the cached artifact, downloading it first on a miss.
    pub fn ensure(&self, kind: ArtifactKind, url: &str, filename: &str) -> Result<PathBuf> {
        let entry = self.entry(kind, filename);
        if entry.is_present() {
            info!(%kind, path = %entry.path.display(), "cache hit");
            return Ok(entry.path);
        }

        info!(%kind, %url, "cache miss, downloading");
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache directory {}", self.dir.display()))?;

        let part = entry.part_path();
        http(url, &part, &self.options)
            .map_err(|e| BuildError::Network(format!("{} download failed: {:#}", kind, e)))?;
        fs::rename(&part, &entry.path).with_context(|| {
            format!("Failed to move {} to {}", part.display(), entry.path.display())
        })?;

        info!(%kind, path = %entry.path.display(), "cached");
        Ok(entry.path)
    }

    /// Cached files (not staging files), sorted by name.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read {}", self.dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().map_or(true, |ext| ext != "part"))
            .collect();
        files.sort();
        Ok(files)
    }
}

/// Cache filename for a URL: its last path segment without the query.
pub fn filename_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// How to treat the staging file given the server's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Continuation {
    /// 206: append to the existing bytes.
    Append,
    /// 200: server ignored the range, start over.
    Restart,
    /// 416 on a resumed request: the part file already holds everything.
    AlreadyComplete,
}

fn continuation(status: reqwest::StatusCode, resumed: bool) -> Result<Continuation> {
    use reqwest::StatusCode;
    match status {
        StatusCode::PARTIAL_CONTENT if resumed => Ok(Continuation::Append),
        StatusCode::RANGE_NOT_SATISFIABLE if resumed => Ok(Continuation::AlreadyComplete),
        s if s.is_success() => Ok(Continuation::Restart),
        s => bail!(
            "HTTP {}: {}",
            s.as_u16(),
            s.canonical_reason().unwrap_or("Unknown error")
        ),
    }
}

/// Download `url` into `dest`, resuming from whatever `dest` already holds.
fn http(url: &str, dest: &Path, options: &DownloadOptions) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(30))
        .timeout(None)
        .build()
        .context("Failed to create HTTP client")?;

    let mut attempt = 0;
    loop {
        match http_attempt(&client, url, dest, options) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < options.retries && is_retryable_error(&e) => {
                attempt += 1;
                let delay = options.retry_delay * (1 << (attempt - 1).min(4));
                warn!(error = %format!("{:#}", e), attempt, retries = options.retries, ?delay, "download failed, retrying");
                thread::sleep(delay);
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to download {}", url)),
        }
    }
}

fn http_attempt(
    client: &reqwest::blocking::Client,
    url: &str,
    dest: &Path,
    options: &DownloadOptions,
) -> Result<()> {
    let start_byte = fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
    let resumed = start_byte > 0;

    let mut request = client.get(url);
    if resumed {
        request = request.header("Range", format!("bytes={}-", start_byte));
        info!(bytes = start_byte, "resuming partial download");
    }
    let mut response = request
        .send()
        .with_context(|| format!("HTTP request failed: {}", url))?;

    let (mut file, mut downloaded) = match continuation(response.status(), resumed)? {
        Continuation::AlreadyComplete => {
            debug!(path = %dest.display(), "server reports range satisfied");
            return Ok(());
        }
        Continuation::Append => {
            let file = OpenOptions::new()
                .append(true)
                .open(dest)
                .with_context(|| format!("Failed to open {} for append", dest.display()))?;
            (file, start_byte)
        }
        Continuation::Restart => {
            if resumed {
                info!("server does not support resume, starting fresh");
            }
            let file = File::create(dest)
                .with_context(|| format!("Failed to create {}", dest.display()))?;
            (file, 0)
        }
    };

    let total = response.content_length().map(|len| len + downloaded);
    let bar = progress_bar(total, options.show_progress);
    bar.set_position(downloaded);

    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = response
            .read(&mut buf)
            .with_context(|| format!("Failed to read from {}", url))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .with_context(|| format!("Failed to write to {}", dest.display()))?;
        downloaded += n as u64;
        bar.set_position(downloaded);
    }
    file.flush()
        .with_context(|| format!("Failed to flush {}", dest.display()))?;
    bar.finish_and_clear();

    if let Some(expected) = total {
        if downloaded != expected {
            bail!(
                "Download incomplete for {}: expected {} bytes, got {} bytes (connection reset)",
                url,
                expected,
                downloaded
            );
        }
    }
    Ok(())
}

fn progress_bar(total: Option<u64>, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    match total {
        Some(size) => {
            let bar = ProgressBar::new(size);
            if let Ok(style) = ProgressStyle::default_bar().template(
                "{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
            ) {
                bar.set_style(style.progress_chars("#>-"));
            }
            bar
        }
        None => ProgressBar::new_spinner(),
    }
}

/// Check if an error is likely transient and worth retrying.
fn is_retryable_error(e: &anyhow::Error) -> bool {
    let msg = format!("{:#}", e).to_lowercase();
    msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("connection reset")
        || msg.contains("connection refused")
        || msg.contains("temporarily unavailable")
        || msg.contains("try again")
        || msg.contains("http 502")
        || msg.contains("http 503")
        || msg.contains("http 504")
}
