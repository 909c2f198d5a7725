//! Content digests for dedup probes and per-slice integrity.

use bytes::Bytes;
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;

use unidrive_common::{Error, Result};

use super::plan::{SlicePlan, KIB_256};

/// Whole-payload digests plus the head digest some vendors require.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub size: u64,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    /// MD5 of the first 256 KiB.
    pub head_md5: String,
}

impl ContentDigest {
    /// Hash a payload on the blocking pool.
    pub async fn compute(data: Bytes) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::compute_sync(&data))
            .await
            .map_err(|e| Error::Vendor(format!("Digest task failed: {}", e)))
    }

    fn compute_sync(data: &[u8]) -> Self {
        let head = &data[..data.len().min(KIB_256 as usize)];
        Self {
            size: data.len() as u64,
            md5: hex::encode(Md5::digest(data)),
            sha1: hex::encode(Sha1::digest(data)),
            sha256: hex::encode(Sha256::digest(data)),
            head_md5: hex::encode(Md5::digest(head)),
        }
    }
}

/// Lowercase hex MD5 of one slice.
pub fn slice_md5(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// MD5 of every slice in plan order.
pub async fn slice_hashes(data: Bytes, plan: &SlicePlan) -> Result<Vec<String>> {
    let ranges: Vec<(usize, usize)> = plan
        .slices
        .iter()
        .map(|s| (s.offset as usize, s.end() as usize))
        .collect();
    tokio::task::spawn_blocking(move || {
        ranges
            .into_iter()
            .map(|(start, end)| slice_md5(&data[start..end]))
            .collect()
    })
    .await
    .map_err(|e| Error::Vendor(format!("Digest task failed: {}", e)))
}
