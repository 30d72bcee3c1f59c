//! Resumable HTTP downloads into `<dest>.part`.
//!
//! `fetch_part` and `fetch_parts` stop once the partial file is complete and
//! size-checked, so callers can verify it before `commit` moves it to its
//! final name. `download` and `download_parts` do both steps.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use tokio::io::AsyncWriteExt;

use crate::error::NidoError;
use crate::progress::{ProgressSink, Throttle};

#[derive(Debug, Clone, Default)]
pub struct Downloader {
    client: reqwest::Client,
}

/// Sibling path holding the bytes fetched so far.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

impl Downloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetch `url` to `dest`, resuming from `dest.part` when present.
    /// Returns the number of bytes in `dest`.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        expected_size: Option<u64>,
        progress: &dyn ProgressSink,
    ) -> Result<u64, NidoError> {
        let bytes = self.fetch_part(url, dest, expected_size, progress).await?;
        commit(dest).await?;
        tracing::info!(url, path = %dest.display(), bytes, "download complete");
        Ok(bytes)
    }

    /// Complete `dest.part` from `url` without moving it into place.
    ///
    /// The final size must match both the server-reported total and
    /// `expected_size`, when either is known. On mismatch the partial file is
    /// kept for the next attempt.
    pub async fn fetch_part(
        &self,
        url: &str,
        dest: &Path,
        expected_size: Option<u64>,
        progress: &dyn ProgressSink,
    ) -> Result<u64, NidoError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| NidoError::Io {
                    context: format!("creating directory {}", parent.display()),
                    source: e,
                })?;
        }

        let part = part_path(dest);
        let mut restarted = false;

        let (response, offset) = loop {
            let offset = tokio::fs::metadata(&part)
                .await
                .map(|m| m.len())
                .unwrap_or(0);

            let mut request = self.client.get(url);
            if offset > 0 {
                request = request.header(RANGE, format!("bytes={offset}-"));
            }
            let response = request.send().await.map_err(|e| NidoError::Download {
                message: format!("request to {url} failed"),
                source: Some(Box::new(e)),
            })?;

            match response.status() {
                StatusCode::PARTIAL_CONTENT if offset > 0 => {
                    let start = response
                        .headers()
                        .get(CONTENT_RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(content_range_start);
                    if start == Some(offset) {
                        tracing::info!(url, offset, "resuming download");
                        break (response, offset);
                    }
                    tracing::warn!(url, offset, ?start, "server resumed at another offset, restarting");
                    remove_partial(&part).await?;
                }
                StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 && !restarted => {
                    tracing::warn!(url, offset, "server rejected resume range, restarting");
                    remove_partial(&part).await?;
                    restarted = true;
                }
                status if status.is_success() => {
                    if offset > 0 {
                        tracing::info!(url, %status, "server ignored range, restarting");
                    }
                    break (response, 0);
                }
                status => {
                    return Err(NidoError::Download {
                        message: format!("HTTP {status} from {url}"),
                        source: None,
                    });
                }
            }
        };

        let reported_total = if offset > 0 {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(content_range_total)
        } else {
            response.content_length()
        };
        progress.start(reported_total.or(expected_size).unwrap_or(0), offset);

        let mut file = if offset > 0 {
            tokio::fs::OpenOptions::new().append(true).open(&part).await
        } else {
            tokio::fs::File::create(&part).await
        }
        .map_err(|e| NidoError::Io {
            context: format!("opening {}", part.display()),
            source: e,
        })?;

        let mut downloaded = offset;
        let mut throttle = Throttle::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    // keep what we have for the next resume
                    let _ = file.flush().await;
                    return Err(NidoError::Download {
                        message: format!("error reading response body from {url}"),
                        source: Some(Box::new(e)),
                    });
                }
            };
            file.write_all(&chunk).await.map_err(|e| NidoError::Io {
                context: format!("writing {}", part.display()),
                source: e,
            })?;
            downloaded += chunk.len() as u64;
            if throttle.ready() {
                progress.update(downloaded);
            }
        }
        file.flush().await.map_err(|e| NidoError::Io {
            context: format!("flushing {}", part.display()),
            source: e,
        })?;
        drop(file);
        progress.update(downloaded);
        progress.finish();

        for expected in [reported_total, expected_size].into_iter().flatten() {
            if downloaded != expected {
                return Err(NidoError::DownloadSize {
                    path: part.display().to_string(),
                    expected,
                    actual: downloaded,
                });
            }
        }

        Ok(downloaded)
    }

    /// Fetch a split asset: each part is downloaded (and resumable) on its
    /// own, then the parts are concatenated into `dest`.
    pub async fn download_parts(
        &self,
        urls: &[String],
        dest: &Path,
        expected_size: Option<u64>,
        progress: &dyn ProgressSink,
    ) -> Result<u64, NidoError> {
        let bytes = self.fetch_parts(urls, dest, expected_size, progress).await?;
        commit(dest).await?;
        Ok(bytes)
    }

    /// Split-asset counterpart of `fetch_part`: the concatenation is left in
    /// `dest.part`.
    pub async fn fetch_parts(
        &self,
        urls: &[String],
        dest: &Path,
        expected_size: Option<u64>,
        progress: &dyn ProgressSink,
    ) -> Result<u64, NidoError> {
        let mut pieces = Vec::with_capacity(urls.len());
        for (i, url) in urls.iter().enumerate() {
            let piece = piece_path(dest, i);
            if tokio::fs::metadata(&piece).await.is_err() {
                self.download(url, &piece, None, progress).await?;
            } else {
                tracing::debug!(path = %piece.display(), "part already downloaded");
            }
            pieces.push(piece);
        }

        let part = part_path(dest);
        let mut out = tokio::fs::File::create(&part)
            .await
            .map_err(|e| NidoError::Io {
                context: format!("creating {}", part.display()),
                source: e,
            })?;
        let mut total = 0u64;
        for piece in &pieces {
            let mut input = tokio::fs::File::open(piece)
                .await
                .map_err(|e| NidoError::Io {
                    context: format!("opening {}", piece.display()),
                    source: e,
                })?;
            total += tokio::io::copy(&mut input, &mut out)
                .await
                .map_err(|e| NidoError::Io {
                    context: format!("appending {} to {}", piece.display(), part.display()),
                    source: e,
                })?;
        }
        out.flush().await.map_err(|e| NidoError::Io {
            context: format!("flushing {}", part.display()),
            source: e,
        })?;
        drop(out);

        if let Some(expected) = expected_size
            && total != expected
        {
            return Err(NidoError::DownloadSize {
                path: part.display().to_string(),
                expected,
                actual: total,
            });
        }

        for piece in &pieces {
            let _ = tokio::fs::remove_file(piece).await;
        }

        tracing::info!(path = %part.display(), parts = pieces.len(), bytes = total, "assembled split download");
        Ok(total)
    }
}

/// Move a completed `dest.part` to `dest`.
pub async fn commit(dest: &Path) -> Result<(), NidoError> {
    let part = part_path(dest);
    tokio::fs::rename(&part, dest)
        .await
        .map_err(|e| NidoError::Io {
            context: format!("renaming {} to {}", part.display(), dest.display()),
            source: e,
        })
}

fn piece_path(dest: &Path, index: usize) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{index:03}"));
    dest.with_file_name(name)
}

async fn remove_partial(part: &Path) -> Result<(), NidoError> {
    match tokio::fs::remove_file(part).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(NidoError::Io {
            context: format!("removing {}", part.display()),
            source: e,
        }),
    }
}

/// First byte from `Content-Range: bytes 100-199/1000`.
fn content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    range.split_once('-')?.0.trim().parse().ok()
}

/// Total length from `Content-Range: bytes 100-199/1000`; `None` for `*`.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}
