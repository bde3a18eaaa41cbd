//! The remote metadata blob: a single well-known object holding the
//! tombstones this synchronizer has asserted. Fetched at the start of a
//! run, merged by the Record Merger, and re-published (only when changed)
//! before any parallel mutation.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vaultsync_core::{BlobClient, BlobStoreError};

use crate::cipher::{CipherError, PathCipher};

use super::record::{PathRecord, Tombstone, now_millis};

/// Reserved remote keys. The current JSON blob, and the legacy name whose
/// presence means the remote was written by an incompatible newer version.
pub const METADATA_KEY: &str = "_vaultsync_metadata_on_remote.json";
pub const METADATA_KEY_LEGACY: &str = "_vaultsync_metadata_on_remote.bin";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("remote store error: {0}")]
    Store(#[from] BlobStoreError),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("metadata blob is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteMetadata {
    #[serde(default)]
    pub deletions: Vec<Tombstone>,
}

pub fn serialize_metadata(metadata: &RemoteMetadata) -> Result<Vec<u8>, MetadataError> {
    Ok(serde_json::to_vec(metadata)?)
}

pub fn deserialize_metadata(bytes: &[u8]) -> Result<RemoteMetadata, MetadataError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Order-insensitive equality: the deletion list order is an artifact of
/// map iteration, not meaning.
pub fn metadata_equal(a: &RemoteMetadata, b: &RemoteMetadata) -> bool {
    let mut left = a.deletions.clone();
    let mut right = b.deletions.clone();
    left.sort_by(|x, y| x.key.cmp(&y.key).then(x.action_when.cmp(&y.action_when)));
    right.sort_by(|x, y| x.key.cmp(&y.key).then(x.action_when.cmp(&y.action_when)));
    left == right
}

/// Downloads and decodes the metadata blob; absent blob means no
/// tombstones yet.
pub async fn fetch_metadata(
    client: &BlobClient,
    cipher: Option<&PathCipher>,
    metadata_record: Option<&PathRecord>,
) -> Result<RemoteMetadata, MetadataError> {
    let Some(record) = metadata_record else {
        return Ok(RemoteMetadata::default());
    };
    let remote_key = record.remote_encrypted_key.as_deref().unwrap_or(&record.key);
    let mut bytes = client.get(remote_key, None).await?;
    if let Some(cipher) = cipher {
        bytes = cipher.decrypt_content(&bytes)?;
    }
    deserialize_metadata(&bytes)
}

/// Publishes the tombstone list, reusing the existing encrypted key when
/// one is known. Skipped when there is nothing to publish or the remote
/// blob already carries the same set. Returns whether an upload happened.
pub async fn publish_metadata(
    client: &BlobClient,
    cipher: Option<&PathCipher>,
    metadata_record: Option<&PathRecord>,
    orig: &RemoteMetadata,
    deletions: &[Tombstone],
) -> Result<bool, MetadataError> {
    if deletions.is_empty() {
        return Ok(false);
    }

    let new_metadata = RemoteMetadata {
        deletions: deletions.to_vec(),
    };
    if metadata_equal(orig, &new_metadata) {
        return Ok(false);
    }

    let remote_key = match cipher {
        Some(cipher) => match metadata_record.and_then(|r| r.remote_encrypted_key.clone()) {
            Some(existing) => existing,
            None => cipher.encrypt_key(METADATA_KEY)?,
        },
        None => METADATA_KEY.to_string(),
    };

    let mut content = serialize_metadata(&new_metadata)?;
    if let Some(cipher) = cipher {
        content = cipher.encrypt_content(&content)?;
    }
    client.put(&remote_key, content, Some(now_millis())).await?;
    Ok(true)
}
