//! Resumable, checksum-verified single-file HTTP(S) downloads.
//!
//! Bytes are appended to `<dest>.partial` under an exclusive advisory lock and the
//! file is renamed into place only once the stream completed (and, when a digest
//! is expected, matched it). An interrupted transfer leaves the `.partial` file
//! behind; the next attempt resumes it with a `Range: bytes=N-` request.

pub mod progress;

use crate::digest::{Digest, Hasher};
use crate::error::{DepotError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use progress::Progress;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CHUNK_SIZE: usize = 1024 * 1024;
const DISK_SPACE_MARGIN: u64 = 8 * 1024 * 1024;

/// Path of the in-progress download for `dest`
#[must_use]
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

/// The transfer engine: one shared blocking HTTP client plus progress settings
#[derive(Clone, Debug)]
pub struct Transfer {
    client: Client,
    progress_interval: Duration,
}

impl Transfer {
    #[must_use]
    pub fn new(client: Client, progress_interval: Duration) -> Self {
        Self {
            client,
            progress_interval,
        }
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Download `url` to `dest`, resuming a previous `.partial` file if one exists
    pub fn fetch(&self, url: &str, headers: &HeaderMap, dest: &Path, show_progress: bool) -> Result<u64> {
        self.fetch_verified(url, headers, dest, show_progress, None)
    }

    /// Like [`Transfer::fetch`] but the completed file must hash to `expected`
    pub fn fetch_verified(
        &self,
        url: &str,
        headers: &HeaderMap,
        dest: &Path,
        show_progress: bool,
        expected: Option<&Digest>,
    ) -> Result<u64> {
        self.download(url, dest, show_progress, expected, |offset| {
            let mut request = self.client.get(url).headers(headers.clone());
            if let Some(offset) = offset {
                request = request.header(RANGE, format!("bytes={offset}-"));
            }
            Ok(request.send()?)
        })
    }

    /// Core download loop. `send` issues the request, receiving the resume
    /// offset when a non-empty partial file is already on disk. It is called
    /// a second time, without an offset, when the partial has to be restarted.
    pub fn download<F>(
        &self,
        label: &str,
        dest: &Path,
        show_progress: bool,
        expected: Option<&Digest>,
        mut send: F,
    ) -> Result<u64>
    where
        F: FnMut(Option<u64>) -> Result<Response>,
    {
        let partial = partial_path(dest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&partial)?;
        let mut file = lock_exclusive(file, &partial)?;

        let existing = file.metadata()?.len();
        let mut response = send((existing > 0).then_some(existing))?;

        let mut offset = existing;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
            // The partial may already hold every byte
            if let Some(want) = expected.filter(|d| d.is_verifiable()) {
                file.seek(SeekFrom::Start(0))?;
                let mut hasher = Hasher::new();
                hasher.consume(&mut (&*file).take(existing))?;
                if &hasher.finish() == want {
                    drop(file);
                    fs::rename(&partial, dest)?;
                    tracing::info!("{label} was already complete ({existing} bytes)");
                    return Ok(existing);
                }
            }
            tracing::debug!("Range not satisfiable for {label}, restarting from zero");
            file.set_len(0)?;
            offset = 0;
            response = send(None)?;
        }

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => {
                if existing > 0 {
                    tracing::debug!("Server ignored range request for {label}, restarting from zero");
                    file.set_len(0)?;
                    offset = 0;
                }
            }
            status => return Err(DepotError::http(label, status)),
        }

        let remaining = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let (Some(len), Some(dir)) = (remaining, partial.parent()) {
            check_disk_space(dir, len)?;
        }

        let verify = expected.filter(|d| d.is_verifiable());
        if let Some(d) = expected.filter(|d| !d.is_verifiable()) {
            tracing::debug!("Digest {d} uses an unsupported algorithm, skipping verification");
        }

        let mut hasher = verify.map(|_| Hasher::new());
        if let Some(h) = hasher.as_mut() {
            if offset > 0 {
                file.seek(SeekFrom::Start(0))?;
                h.consume(&mut (&*file).take(offset))?;
            }
        }

        if offset > 0 {
            tracing::info!("Resuming {label} at byte {offset}");
        }
        let mut progress = Progress::new(
            dest.file_name().and_then(|n| n.to_str()).unwrap_or(label),
            remaining.map(|r| r + offset),
            offset,
            self.progress_interval,
            show_progress,
        );

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| DepotError::transfer(label, format!("stream interrupted: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            if let Some(h) = hasher.as_mut() {
                h.update(&buf[..n]);
            }
            received += n as u64;
            progress.advance(n as u64);
        }
        file.flush()?;
        progress.finish();

        if let Some(len) = remaining {
            if received < len {
                return Err(DepotError::transfer(
                    label,
                    format!("stream ended after {received} of {len} bytes"),
                ));
            }
        }

        if let (Some(want), Some(h)) = (verify, hasher) {
            let actual = h.finish();
            if &actual != want {
                drop(file);
                fs::remove_file(&partial)?;
                return Err(DepotError::DigestMismatch {
                    subject: label.to_string(),
                    expected: want.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        let total = offset + received;
        drop(file);
        fs::rename(&partial, dest)?;
        tracing::debug!("Downloaded {label} to {} ({total} bytes)", dest.display());
        Ok(total)
    }
}

fn lock_exclusive(file: File, path: &Path) -> Result<Flock<File>> {
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
        if errno == Errno::EWOULDBLOCK || errno == Errno::EAGAIN {
            DepotError::transfer(
                path.display().to_string(),
                "download already in progress in another process",
            )
        } else {
            DepotError::Io(std::io::Error::from(errno))
        }
    })
}

/// Check if enough disk space is available
fn check_disk_space(dir: &Path, required_bytes: u64) -> Result<()> {
    let stats = nix::sys::statvfs::statvfs(dir)
        .map_err(|e| DepotError::Other(format!("Failed to check disk space: {e}")))?;

    #[allow(clippy::unnecessary_cast)]
    let available_bytes = stats.blocks_available() as u64 * stats.fragment_size() as u64;
    let required_with_margin = required_bytes + DISK_SPACE_MARGIN;

    if available_bytes < required_with_margin {
        return Err(DepotError::Other(format!(
            "Not enough disk space in {}: {} required, {} available",
            dir.display(),
            progress::format_bytes(required_with_margin),
            progress::format_bytes(available_bytes)
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/s/blobs/sha256-abc")),
            PathBuf::from("/s/blobs/sha256-abc.partial")
        );
        assert_eq!(
            partial_path(Path::new("model.gguf")),
            PathBuf::from("model.gguf.partial")
        );
    }

    #[test]
    fn test_second_lock_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.partial");
        let first = OpenOptions::new().create(true).append(true).open(&path).unwrap();
        let second = OpenOptions::new().append(true).open(&path).unwrap();

        let held = lock_exclusive(first, &path).unwrap();
        let err = lock_exclusive(second, &path).err().unwrap();
        assert!(err.to_string().contains("already in progress"));

        drop(held);
        let third = OpenOptions::new().append(true).open(&path).unwrap();
        assert!(lock_exclusive(third, &path).is_ok());
    }

    #[test]
    fn test_disk_space_check_small_file_passes() {
        let dir = TempDir::new().unwrap();
        assert!(check_disk_space(dir.path(), 1024).is_ok());
        assert!(check_disk_space(dir.path(), u64::MAX / 2).is_err());
    }
}
