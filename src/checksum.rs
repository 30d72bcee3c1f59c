use std::fmt;
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest, Sha256, Sha512};
use tokio::io::AsyncReadExt;

use crate::error::NidoError;

const CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl FromStr for ChecksumAlgorithm {
    type Err = NidoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => Err(NidoError::UnsupportedAlgorithm {
                algorithm: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => f.write_str("sha256"),
            Self::Sha512 => f.write_str("sha512"),
        }
    }
}

/// Lowercase hex digest of the file, streamed in 64 KiB chunks.
pub async fn digest_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, NidoError> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => stream_digest::<Sha256>(path).await,
        ChecksumAlgorithm::Sha512 => stream_digest::<Sha512>(path).await,
    }
}

async fn stream_digest<D: Digest>(path: &Path) -> Result<String, NidoError> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| NidoError::Io {
        context: format!("opening {} for hashing", path.display()),
        source: e,
    })?;
    let mut hasher = D::new();
    let mut buffer = vec![0u8; CHUNK];
    loop {
        let read = file.read(&mut buffer).await.map_err(|e| NidoError::Io {
            context: format!("reading {}", path.display()),
            source: e,
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Check `path` against `expected`. Digests compare case-insensitively.
pub async fn verify(path: &Path, expected: &str, algorithm: &str) -> Result<(), NidoError> {
    let algorithm: ChecksumAlgorithm = algorithm.parse()?;
    let actual = digest_file(path, algorithm).await?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(NidoError::ChecksumMismatch {
            path: path.display().to_string(),
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        });
    }
    tracing::debug!(path = %path.display(), %algorithm, "checksum verified");
    Ok(())
}
