//! Streaming content hasher (C1).
//!
//! Pure function of file bytes: deterministic regardless of chunk size,
//! so callers may tune [`CHUNK_SIZE`] without affecting downstream hashes.

use crate::error::PipelineError;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Read buffer size for streaming hash computation.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// The two equivalent encodings of a SHA-256 digest the rest of the system
/// uses: `hex` for the unique store index, `b64url` for compact external ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHash {
    pub hex: String,
    pub b64url: String,
}

impl ContentHash {
    fn from_digest(digest: &[u8]) -> Self {
        Self {
            hex: hex_encode(digest),
            b64url: URL_SAFE_NO_PAD.encode(digest),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String never fails");
    }
    out
}

/// Streams `path` through SHA-256 in [`CHUNK_SIZE`] chunks.
///
/// Fails with [`PipelineError::Io`] if the file can't be read, or
/// [`PipelineError::EmptyFile`] if it contains zero bytes.
pub async fn hash_file(path: &std::path::Path) -> Result<(ContentHash, u64), PipelineError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| PipelineError::io(path.display().to_string(), e.to_string()))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total_bytes: u64 = 0;

    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| PipelineError::io(path.display().to_string(), e.to_string()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total_bytes += n as u64;
    }

    if total_bytes == 0 {
        return Err(PipelineError::empty_file(path.display().to_string()));
    }

    let digest = hasher.finalize();
    Ok((ContentHash::from_digest(&digest), total_bytes))
}

/// Hashes an in-memory buffer; used by tests and by callers that already
/// hold the bytes (e.g. the embedding cache's `SHA-256(model || 0x00 || text)`
/// key, see [`crate::embedding_cache`]).
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentHash::from_digest(&hasher.finalize())
}
