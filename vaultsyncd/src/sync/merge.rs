//! Builds the merged per-path record table out of the four state sources:
//! the remote listing, the remote tombstone list, the local tree walk and
//! the local action history. Later overlays only ever add information to a
//! record, so overlay order is not load-bearing except for history, which
//! is applied last and in recorded order.

use std::collections::HashMap;

use thiserror::Error;
use vaultsync_core::RemoteItem;

use crate::cipher::{CipherError, PathCipher, encrypted_size};
use crate::history::{ActionType, HistoryError, HistoryStore, KeyType, LocalHistoryEntry};
use crate::vault::LocalEntry;

use super::metadata::{METADATA_KEY, METADATA_KEY_LEGACY};
use super::paths::{SkipOptions, is_skip_item};
use super::record::{PathRecord, Tombstone};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("cipher error while parsing remote listing: {0}")]
    Cipher(#[from] CipherError),
    #[error("history store error: {0}")]
    History(#[from] HistoryError),
    #[error("remote was written by an incompatible version (found {0})")]
    IncompatibleRemote(String),
}

/// Remote listing translated into plan records, plus the reserved metadata
/// object if the remote carries one.
#[derive(Debug, Default)]
pub struct ParsedRemote {
    pub records: HashMap<String, PathRecord>,
    pub metadata_record: Option<PathRecord>,
}

/// Translates the raw remote listing into records keyed by logical path.
///
/// With encryption active every remote key is decrypted first. Each entry
/// is then looked up in the backward path mapping; a trusted mapping
/// restores the original local mtime (remote stores rarely preserve it)
/// and the pre-encryption size.
pub async fn parse_remote_items(
    remote: &[RemoteItem],
    history: &HistoryStore,
    cipher: Option<&PathCipher>,
) -> Result<ParsedRemote, MergeError> {
    let mut out = ParsedRemote::default();

    for entry in remote {
        let key = match cipher {
            Some(cipher) => cipher.decrypt_key(&entry.key)?,
            None => entry.key.clone(),
        };

        if key == METADATA_KEY_LEGACY {
            return Err(MergeError::IncompatibleRemote(key));
        }

        let mut record = PathRecord::new(&key);
        record.exist_remote = true;
        record.modified_remote = Some(entry.last_modified);
        record.remote_etag = entry.etag.clone();
        if cipher.is_some() {
            record.remote_encrypted_key = Some(entry.key.clone());
            record.size_remote_enc = Some(entry.size);
        } else {
            record.size_remote = Some(entry.size);
        }

        if let Some(mapping) = history
            .mapping_by_remote_key(&entry.key, entry.last_modified, entry.etag.as_deref())
            .await?
        {
            if let Some(local_mtime) = mapping.local_mtime {
                record.modified_remote = Some(local_mtime);
                record.change_remote_mtime_using_mapping = true;
            }
            if cipher.is_some() {
                record.size_remote = mapping.local_size;
            }
        }

        if key == METADATA_KEY {
            out.metadata_record = Some(record);
        } else {
            out.records.insert(key, record);
        }
    }

    Ok(out)
}

/// Merges the four sources into one record table. `parsed_remote` is
/// consumed as the base layer; the remote tombstones, the local tree and
/// finally the local action history are folded on top. Skipped paths are
/// filtered out of every source.
pub fn ensemble_records(
    parsed_remote: HashMap<String, PathRecord>,
    remote_tombstones: &[Tombstone],
    local: &[LocalEntry],
    local_history: &[LocalHistoryEntry],
    opts: &SkipOptions,
    encrypted: bool,
) -> HashMap<String, PathRecord> {
    let mut records: HashMap<String, PathRecord> = parsed_remote
        .into_iter()
        .filter(|(key, _)| !is_skip_item(key, opts))
        .collect();

    for tombstone in remote_tombstones {
        if is_skip_item(&tombstone.key, opts) {
            continue;
        }
        let record = records
            .entry(tombstone.key.clone())
            .or_insert_with(|| PathRecord::new(&tombstone.key));
        record.delete_time_remote = Some(tombstone.action_when);
    }

    for entry in local {
        if is_skip_item(&entry.key, opts) {
            continue;
        }
        let record = records
            .entry(entry.key.clone())
            .or_insert_with(|| PathRecord::new(&entry.key));
        record.exist_local = true;
        let size = if entry.is_folder {
            0
        } else {
            // a copy or restore can leave mtime older than ctime
            record.modified_local = Some(entry.mtime.max(entry.ctime));
            entry.size
        };
        // folder walk times carry no sync meaning; only rename history
        // may give a folder a local modified time
        record.size_local = Some(size);
        if encrypted {
            record.size_local_enc = Some(encrypted_size(size));
        }
    }

    for entry in local_history {
        let key = match entry.key_type {
            KeyType::Folder if !entry.key.ends_with('/') => format!("{}/", entry.key),
            _ => entry.key.clone(),
        };
        if is_skip_item(&key, opts) {
            continue;
        }
        match entry.action_type {
            ActionType::Delete | ActionType::Rename => {
                let record = records
                    .entry(key.clone())
                    .or_insert_with(|| PathRecord::new(&key));
                record.delete_time_local = Some(entry.action_when);
            }
            ActionType::RenameDestination => {
                // only meaningful for a path that still exists in some
                // source; a destination that has since vanished is noise
                if let Some(record) = records.get_mut(&key) {
                    let merged = record
                        .modified_local
                        .map_or(entry.action_when, |m| m.max(entry.action_when));
                    record.modified_local = Some(merged);
                    record.change_local_mtime_using_mapping = true;
                }
            }
        }
    }

    records
}
