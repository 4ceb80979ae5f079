//! The three resource-isolated worker pools.
//!
//! Each pool bounds its concurrency with a semaphore; submission returns a
//! join handle resolving to `Result<PathBuf, PhaseFailure>`. Workers report
//! through the shared [`ProgressCallback`] and convert every internal error
//! into a `PhaseFailure` value.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::PhaseFailure;
use crate::model::{PackageTask, TaskPhase};
use crate::progress::ProgressCallback;

/// Download retry configuration: delays are 1 s, 2 s, 4 s.
const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_BASE_SECS: f64 = 1.0;

/// Extraction retry configuration (antivirus scan stalls).
const MAX_EXTRACT_ATTEMPTS: u32 = 3;
const EXTRACT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Shared progress sink type.
pub(crate) type Progress = Arc<dyn ProgressCallback>;

// ---------------------------------------------------------------------------
// Download pool
// ---------------------------------------------------------------------------

/// Pool for downloading package archives over HTTP.
///
/// Streams each response into a `<archive>.download` temp file while
/// hashing with SHA-256, then atomically renames into place. Transient
/// network and I/O failures retry up to three times with exponential
/// backoff; HTTP status errors do not retry.
#[derive(Debug, Clone)]
pub struct DownloadPool {
    semaphore: Arc<Semaphore>,
    client: reqwest::Client,
    max_workers: usize,
}

impl DownloadPool {
    /// Create a pool with the given concurrency bound.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        // Bound connection establishment, not the whole transfer: large
        // toolchain archives legitimately take minutes to stream.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            client,
            max_workers,
        }
    }

    /// Concurrency bound.
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Submit a download job; resolves to the downloaded archive path.
    pub fn submit(&self, task: &PackageTask, callback: Progress) -> JoinHandle<Result<PathBuf, PhaseFailure>> {
        let semaphore = Arc::clone(&self.semaphore);
        let client = self.client.clone();
        let task = task.clone();
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| PhaseFailure::new("download pool shut down"))?;
            download_with_retries(&client, &task, &callback).await
        })
    }
}

async fn download_with_retries(
    client: &reqwest::Client,
    task: &PackageTask,
    callback: &Progress,
) -> Result<PathBuf, PhaseFailure> {
    let archive_path = archive_path_for(task)?;
    let parent = archive_path
        .parent()
        .ok_or_else(|| PhaseFailure::new("archive path has no parent directory"))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| PhaseFailure::new(format!("failed to create {}: {e}", parent.display())))?;

    // The .download extension keeps antivirus scanners off the partial file.
    let temp_file = PathBuf::from(format!("{}.download", archive_path.display()));

    let mut last_error = String::new();
    for attempt in 0..MAX_DOWNLOAD_ATTEMPTS {
        if attempt > 0 {
            let delay = RETRY_BACKOFF_BASE_SECS * f64::from(1u32 << (attempt - 1));
            callback.on_progress(
                &task.name,
                TaskPhase::Downloading,
                0,
                0,
                &format!("Retry {attempt}/{} after {delay:.0}s...", MAX_DOWNLOAD_ATTEMPTS - 1),
            );
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        match download_attempt(client, task, &archive_path, &temp_file, callback).await {
            Ok(path) => return Ok(path),
            Err(DownloadError::Fatal(message)) => {
                cleanup_temp_file(&temp_file).await;
                return Err(PhaseFailure::new(message));
            },
            Err(DownloadError::Transient(message)) => {
                warn!(
                    task = %task.name,
                    attempt = attempt + 1,
                    max = MAX_DOWNLOAD_ATTEMPTS,
                    error = %message,
                    "download attempt failed"
                );
                cleanup_temp_file(&temp_file).await;
                last_error = message;
            },
        }
    }
    Err(PhaseFailure::new(last_error))
}

enum DownloadError {
    /// Worth another attempt (connection, timeout, local I/O).
    Transient(String),
    /// Not worth retrying (HTTP status and friends).
    Fatal(String),
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_status() {
            Self::Fatal(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

impl From<io::Error> for DownloadError {
    fn from(e: io::Error) -> Self {
        Self::Transient(e.to_string())
    }
}

async fn download_attempt(
    client: &reqwest::Client,
    task: &PackageTask,
    archive_path: &Path,
    temp_file: &Path,
    callback: &Progress,
) -> Result<PathBuf, DownloadError> {
    let response = client.get(&task.url).send().await?.error_for_status()?;

    let total_size = response.content_length().unwrap_or(0);
    let mut downloaded: u64 = 0;
    let mut hasher = Sha256::new();
    let started = task.started_at.unwrap_or_else(Instant::now);

    callback.on_progress(
        &task.name,
        TaskPhase::Downloading,
        0,
        total_size,
        "Starting download...",
    );

    let mut file = tokio::fs::File::create(temp_file).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
        callback.on_progress(
            &task.name,
            TaskPhase::Downloading,
            downloaded,
            total_size,
            &format_transfer_speed(downloaded, started),
        );
    }
    file.flush().await?;
    drop(file);

    let digest = hex::encode(hasher.finalize());
    debug!(task = %task.name, sha256 = %digest, bytes = downloaded, "download hashed");

    // Move temp into place; copy+unlink when rename is refused (existing
    // destination on some filesystems).
    if tokio::fs::rename(temp_file, archive_path).await.is_err() {
        tokio::fs::copy(temp_file, archive_path).await?;
        let _ = tokio::fs::remove_file(temp_file).await;
    }

    callback.on_progress(
        &task.name,
        TaskPhase::Downloading,
        total_size.max(downloaded),
        total_size.max(downloaded),
        "Download complete",
    );
    Ok(archive_path.to_path_buf())
}

/// Derive the archive path: dest parent + final URL path segment.
fn archive_path_for(task: &PackageTask) -> Result<PathBuf, PhaseFailure> {
    let last_segment = task
        .url
        .rsplit('/')
        .next()
        .unwrap_or(task.url.as_str());
    let archive_name = last_segment.split('?').next().unwrap_or(last_segment);
    if archive_name.is_empty() {
        return Err(PhaseFailure::new(format!(
            "cannot derive archive name from url: {}",
            task.url
        )));
    }
    let parent = task
        .dest_path
        .parent()
        .ok_or_else(|| PhaseFailure::new("destination path has no parent directory"))?;
    Ok(parent.join(archive_name))
}

async fn cleanup_temp_file(temp_file: &Path) {
    let _ = tokio::fs::remove_file(temp_file).await;
}

// ---------------------------------------------------------------------------
// Unpack pool
// ---------------------------------------------------------------------------

/// Pool for extracting downloaded archives.
///
/// Supports `.tar.xz`, `.tar.gz`, `.tgz`, `.txz` and `.zip`. Extraction
/// runs on the blocking thread pool; permission errors (typically antivirus
/// scans holding files) retry up to three times with a 2 s delay.
#[derive(Debug, Clone)]
pub struct UnpackPool {
    semaphore: Arc<Semaphore>,
    max_workers: usize,
}

impl UnpackPool {
    /// Create a pool with the given concurrency bound.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            max_workers,
        }
    }

    /// Concurrency bound.
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Submit an unpack job; resolves to the extraction path.
    pub fn submit(
        &self,
        task: &PackageTask,
        archive_path: PathBuf,
        callback: Progress,
    ) -> JoinHandle<Result<PathBuf, PhaseFailure>> {
        let semaphore = Arc::clone(&self.semaphore);
        let name = task.name.clone();
        let dest_path = task.dest_path.clone();
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| PhaseFailure::new("unpack pool shut down"))?;
            unpack_with_retries(&name, &archive_path, &dest_path, &callback).await
        })
    }
}

async fn unpack_with_retries(
    name: &str,
    archive_path: &Path,
    dest_path: &Path,
    callback: &Progress,
) -> Result<PathBuf, PhaseFailure> {
    let mut last_error = String::new();
    for attempt in 0..MAX_EXTRACT_ATTEMPTS {
        if attempt > 0 {
            callback.on_progress(
                name,
                TaskPhase::Unpacking,
                0,
                0,
                &format!("Retry {attempt}/{} after extraction error...", MAX_EXTRACT_ATTEMPTS - 1),
            );
            tokio::time::sleep(EXTRACT_RETRY_DELAY).await;
        } else {
            callback.on_progress(name, TaskPhase::Unpacking, 0, 0, "Starting extraction...");
        }

        let name_owned = name.to_owned();
        let archive = archive_path.to_path_buf();
        let dest = dest_path.to_path_buf();
        let cb = Arc::clone(callback);
        let outcome = tokio::task::spawn_blocking(move || {
            extract_archive(&name_owned, &archive, &dest, &cb)
        })
        .await
        .map_err(|e| PhaseFailure::new(format!("unpack worker died: {e}")))?;

        match outcome {
            Ok(path) => {
                callback.on_progress(name, TaskPhase::Unpacking, 1, 1, "Extraction complete");
                return Ok(path);
            },
            Err(ExtractError::Unsupported(message)) => return Err(PhaseFailure::new(message)),
            Err(ExtractError::Permission(message)) => {
                warn!(
                    task = name,
                    attempt = attempt + 1,
                    max = MAX_EXTRACT_ATTEMPTS,
                    error = %message,
                    "extraction attempt failed with permission error"
                );
                last_error = message;
            },
            Err(ExtractError::Other(message)) => return Err(PhaseFailure::new(message)),
        }
    }
    Err(PhaseFailure::new(last_error))
}

enum ExtractError {
    /// Unknown archive extension; never retried.
    Unsupported(String),
    /// Permission denied; retried (antivirus interference).
    Permission(String),
    /// Anything else; not retried.
    Other(String),
}

impl From<io::Error> for ExtractError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::PermissionDenied {
            Self::Permission(e.to_string())
        } else {
            Self::Other(e.to_string())
        }
    }
}

/// Blocking extraction of one archive into `dest_path`.
fn extract_archive(
    name: &str,
    archive_path: &Path,
    dest_path: &Path,
    callback: &Progress,
) -> Result<PathBuf, ExtractError> {
    let parent = dest_path
        .parent()
        .ok_or_else(|| ExtractError::Other("destination has no parent directory".into()))?;
    let archive_file_name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_owned());
    let temp_extract = parent.join(format!("temp_extract_{archive_file_name}"));

    if temp_extract.exists() {
        let _ = std::fs::remove_dir_all(&temp_extract);
    }
    std::fs::create_dir_all(&temp_extract)?;

    let result = (|| -> Result<PathBuf, ExtractError> {
        let lower = archive_file_name.to_lowercase();
        if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
            extract_tar(name, archive_path, &temp_extract, TarCompression::Xz, callback)?;
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            extract_tar(name, archive_path, &temp_extract, TarCompression::Gz, callback)?;
        } else if lower.ends_with(".zip") {
            extract_zip(name, archive_path, &temp_extract, callback)?;
        } else {
            return Err(ExtractError::Unsupported(format!(
                "Unsupported archive format: {archive_file_name}"
            )));
        }

        // Let scanners settle before files are moved.
        #[cfg(windows)]
        std::thread::sleep(Duration::from_secs(1));

        // GitHub-style tarballs wrap everything in one top-level directory;
        // strip that level.
        let entries: Vec<PathBuf> = std::fs::read_dir(&temp_extract)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .collect();
        let source_dir = match entries.as_slice() {
            [single] if single.is_dir() => single.clone(),
            _ => temp_extract.clone(),
        };

        if dest_path.exists() {
            std::fs::remove_dir_all(dest_path)?;
        }
        std::fs::rename(&source_dir, dest_path)?;
        Ok(dest_path.to_path_buf())
    })();

    if temp_extract.exists() {
        let _ = std::fs::remove_dir_all(&temp_extract);
    }
    result
}

#[derive(Clone, Copy)]
enum TarCompression {
    Gz,
    Xz,
}

fn tar_reader(
    archive_path: &Path,
    compression: TarCompression,
) -> Result<Box<dyn io::Read>, ExtractError> {
    let file = std::fs::File::open(archive_path)?;
    Ok(match compression {
        TarCompression::Gz => Box::new(flate2::read::GzDecoder::new(file)),
        TarCompression::Xz => Box::new(xz2::read::XzDecoder::new(file)),
    })
}

fn extract_tar(
    name: &str,
    archive_path: &Path,
    dest: &Path,
    compression: TarCompression,
    callback: &Progress,
) -> Result<(), ExtractError> {
    // First pass counts members so extraction can report real progress.
    let total = tar::Archive::new(tar_reader(archive_path, compression)?)
        .entries()
        .map_err(ExtractError::from)?
        .count() as u64;

    let mut archive = tar::Archive::new(tar_reader(archive_path, compression)?);
    let step = (total / 20).max(1);
    for (i, entry) in archive.entries().map_err(ExtractError::from)?.enumerate() {
        let mut entry = entry.map_err(ExtractError::from)?;
        entry.unpack_in(dest).map_err(ExtractError::from)?;
        let done = i as u64 + 1;
        if done % step == 0 || done == total {
            callback.on_progress(
                name,
                TaskPhase::Unpacking,
                done,
                total,
                &format!("Extracting files ({done}/{total})"),
            );
        }
    }
    Ok(())
}

fn extract_zip(
    name: &str,
    archive_path: &Path,
    dest: &Path,
    callback: &Progress,
) -> Result<(), ExtractError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| ExtractError::Other(e.to_string()))?;
    let total = archive.len() as u64;
    let step = (total / 20).max(1);
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ExtractError::Other(e.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(ExtractError::Other(format!(
                "archive entry escapes extraction root: {}",
                entry.name()
            )));
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&out_path)?;
            io::copy(&mut entry, &mut out)?;
        }
        let done = i as u64 + 1;
        if done % step == 0 || done == total {
            callback.on_progress(
                name,
                TaskPhase::Unpacking,
                done,
                total,
                &format!("Extracting files ({done}/{total})"),
            );
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Install pool
// ---------------------------------------------------------------------------

/// Pool for post-extraction verification and fingerprinting.
///
/// Counts files, sums sizes, rejects empty extractions, and writes a
/// `.pipeline_fingerprint.json` capturing what was installed.
#[derive(Debug, Clone)]
pub struct InstallPool {
    semaphore: Arc<Semaphore>,
    max_workers: usize,
}

impl InstallPool {
    /// Create a pool with the given concurrency bound.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            max_workers,
        }
    }

    /// Concurrency bound.
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Submit an install job; resolves to the final installation path.
    pub fn submit(
        &self,
        task: &PackageTask,
        extracted_path: PathBuf,
        callback: Progress,
    ) -> JoinHandle<Result<PathBuf, PhaseFailure>> {
        let semaphore = Arc::clone(&self.semaphore);
        let task = task.clone();
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| PhaseFailure::new("install pool shut down"))?;
            tokio::task::spawn_blocking(move || install_package(&task, &extracted_path, &callback))
                .await
                .map_err(|e| PhaseFailure::new(format!("install worker died: {e}")))?
        })
    }
}

fn install_package(
    task: &PackageTask,
    extracted_path: &Path,
    callback: &Progress,
) -> Result<PathBuf, PhaseFailure> {
    if !extracted_path.exists() {
        return Err(PhaseFailure::new(format!(
            "Extracted path does not exist: {}",
            extracted_path.display()
        )));
    }

    callback.on_progress(
        &task.name,
        TaskPhase::Installing,
        0,
        3,
        "Verifying package contents...",
    );

    let mut file_count: u64 = 0;
    let mut total_size: u64 = 0;
    for entry in walkdir::WalkDir::new(extracted_path)
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.file_type().is_file() {
            file_count += 1;
            if let Ok(meta) = entry.metadata() {
                total_size += meta.len();
            }
        }
    }

    if file_count == 0 {
        return Err(PhaseFailure::new(format!(
            "No files found in extracted package: {}",
            extracted_path.display()
        )));
    }

    callback.on_progress(
        &task.name,
        TaskPhase::Installing,
        1,
        3,
        &format!("Found {file_count} files ({})", format_size(total_size)),
    );

    callback.on_progress(
        &task.name,
        TaskPhase::Installing,
        2,
        3,
        "Generating fingerprint...",
    );

    let fingerprint = serde_json::json!({
        "name": task.name,
        "version": task.version,
        "url": task.url,
        "file_count": file_count,
        "total_size": total_size,
        "installed_at": chrono::Utc::now().to_rfc3339(),
    });
    let fingerprint_path = extracted_path.join(".pipeline_fingerprint.json");
    let rendered = serde_json::to_string_pretty(&fingerprint)
        .map_err(|e| PhaseFailure::new(e.to_string()))?;
    std::fs::write(&fingerprint_path, rendered)
        .map_err(|e| PhaseFailure::new(format!("failed to write fingerprint: {e}")))?;

    callback.on_progress(
        &task.name,
        TaskPhase::Installing,
        3,
        3,
        "Installation complete",
    );
    Ok(extracted_path.to_path_buf())
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

/// Human-readable byte count: `2.1 GB`, `512.0 KB`, `42 B`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub(crate) fn format_size(size_bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if size_bytes >= GB {
        format!("{:.1} GB", size_bytes as f64 / GB as f64)
    } else if size_bytes >= MB {
        format!("{:.1} MB", size_bytes as f64 / MB as f64)
    } else if size_bytes >= KB {
        format!("{:.1} KB", size_bytes as f64 / KB as f64)
    } else {
        format!("{size_bytes} B")
    }
}

/// Transfer speed since `started`, falling back to a plain byte count when
/// no time has elapsed.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn format_transfer_speed(downloaded_bytes: u64, started: Instant) -> String {
    let elapsed = started.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        let speed = (downloaded_bytes as f64 / elapsed) as u64;
        format!("{}/s", format_size(speed))
    } else {
        format_size(downloaded_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use std::io::Write;

    fn progress() -> Progress {
        Arc::new(NoopProgress)
    }

    fn make_task(name: &str, dest: &Path) -> PackageTask {
        PackageTask::new(name, format!("http://localhost/{name}.tar.gz"), "1.0", dest)
    }

    fn build_targz(path: &Path, entries: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[tokio::test]
    async fn test_unpack_targz_strips_single_top_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("pkg.tar.gz");
        build_targz(
            &archive,
            &[
                ("pkg-1.0/bin/tool", "elf"),
                ("pkg-1.0/README", "hello"),
            ],
        );
        let dest = tmp.path().join("pkg");
        let task = make_task("pkg", &dest);

        let pool = UnpackPool::new(2);
        let result = pool
            .submit(&task, archive, progress())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, dest);
        assert!(dest.join("bin/tool").is_file());
        assert!(dest.join("README").is_file());
        // The wrapping pkg-1.0/ level is gone.
        assert!(!dest.join("pkg-1.0").exists());
    }

    #[tokio::test]
    async fn test_unpack_zip_multiple_top_entries_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("pkg.zip");
        let file = std::fs::File::create(&archive).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("a.txt", options).unwrap();
        writer.write_all(b"aaa").unwrap();
        writer.start_file("b.txt", options).unwrap();
        writer.write_all(b"bbb").unwrap();
        writer.finish().unwrap();

        let dest = tmp.path().join("pkg");
        let task = make_task("pkg", &dest);
        let pool = UnpackPool::new(1);
        pool.submit(&task, archive, progress())
            .await
            .unwrap()
            .unwrap();
        assert!(dest.join("a.txt").is_file());
        assert!(dest.join("b.txt").is_file());
    }

    #[tokio::test]
    async fn test_unpack_unsupported_extension_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("pkg.rar");
        std::fs::write(&archive, b"not an archive").unwrap();
        let dest = tmp.path().join("pkg");
        let task = make_task("pkg", &dest);

        let pool = UnpackPool::new(1);
        let err = pool
            .submit(&task, archive, progress())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.message.contains("Unsupported archive format"));
    }

    #[tokio::test]
    async fn test_install_writes_fingerprint() {
        let tmp = tempfile::tempdir().unwrap();
        let extracted = tmp.path().join("pkg");
        std::fs::create_dir_all(extracted.join("bin")).unwrap();
        std::fs::write(extracted.join("bin/tool"), b"elf").unwrap();

        let task = make_task("pkg", &extracted);
        let pool = InstallPool::new(1);
        pool.submit(&task, extracted.clone(), progress())
            .await
            .unwrap()
            .unwrap();

        let fingerprint: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(extracted.join(".pipeline_fingerprint.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(fingerprint["name"], "pkg");
        assert_eq!(fingerprint["file_count"], 1);
        assert!(fingerprint["installed_at"].is_string());
    }

    #[tokio::test]
    async fn test_install_rejects_empty_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let extracted = tmp.path().join("pkg");
        std::fs::create_dir_all(&extracted).unwrap();

        let task = make_task("pkg", &extracted);
        let pool = InstallPool::new(1);
        let err = pool
            .submit(&task, extracted, progress())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.message.contains("No files found"));
    }

    #[test]
    fn test_archive_path_from_url() {
        let task = PackageTask::new(
            "t",
            "https://example.com/releases/toolchain-1.2.tar.xz?token=abc",
            "1.2",
            "/opt/cache/toolchain",
        );
        let path = archive_path_for(&task).unwrap();
        assert_eq!(path, PathBuf::from("/opt/cache/toolchain-1.2.tar.xz"));
    }

    #[test]
    fn test_format_size_units() {
        assert_eq!(format_size(17), "17 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.0 GB");
    }
}
