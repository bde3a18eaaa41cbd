//! The per-path decision tree. Pure functions over one merged
//! [`PathRecord`] plus the kept-folder context; the only side effects are
//! mutating the record in place and updating that context set.
//!
//! Branch numbers identify which rule fired and are stable across
//! refactors; they are diagnostics, never logic.

use std::collections::HashSet;

use thiserror::Error;

use super::paths::parent_folder;
use super::record::{Decision, PathRecord};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("abnormal local modified time for {key}")]
    AbnormalLocalModifiedTime { key: String },
    #[error("abnormal remote modified time for {key}")]
    AbnormalRemoteModifiedTime { key: String },
    #[error("abnormal local deletion time for {key}")]
    AbnormalLocalDeleteTime { key: String },
    #[error("abnormal remote deletion time for {key}")]
    AbnormalRemoteDeleteTime { key: String },
    #[error("encryption is active but {key} has no encrypted size")]
    MissingEncryptedSize { key: String },
    #[error("{key} has a local modified time but no local size")]
    MissingLocalSize { key: String },
    #[error("{key} has a remote modified time but no remote size")]
    MissingRemoteSize { key: String },
    #[error("no decision reached for {key}")]
    Undecided { key: String },
    #[error("folder {key} must be kept but exists on neither side")]
    KeptFolderMissingBothSides { key: String },
    #[error("deletion decision for {key} carries no deletion timestamp")]
    MissingDeletionTimestamp { key: String },
}

/// Live folder stat capability. When the host cannot provide true
/// creation/modification times for folders, the "recreated after
/// deletion" override is skipped and folders are deleted more
/// aggressively than files in equivalent timing scenarios.
pub trait FolderChangeTimes {
    /// max(ctime, mtime) in epoch millis for a folder key, when it exists
    /// on disk.
    fn folder_change_time(&self, key: &str) -> Option<i64>;
}

/// Decides one file record. Missing timestamps compare as −1, so the
/// four-way maximum is total; the largest timestamp wins.
pub fn decide_file(
    r: &mut PathRecord,
    kept_folder: &mut HashSet<String>,
    skip_size_larger_than: i64,
    encrypted: bool,
) -> Result<(), PlanError> {
    if r.is_folder() {
        return Ok(());
    }

    check_sanity(r, encrypted)?;

    let size_local_comp = if encrypted { r.size_local_enc } else { r.size_local };
    let size_remote_comp = if encrypted { r.size_remote_enc } else { r.size_remote };
    let threshold = skip_size_larger_than;

    let delete_local = r.delete_time_local.unwrap_or(-1);
    let delete_remote = r.delete_time_remote.unwrap_or(-1);

    // 1. local modified time is the maximum
    if r.exist_local {
        let modified_local = r.modified_local.unwrap_or(-1);
        let modified_remote = if r.exist_remote {
            r.modified_remote.unwrap_or(-1)
        } else {
            -1
        };
        if modified_local >= modified_remote
            && modified_local >= delete_local
            && modified_local >= delete_remote
        {
            let Some(local) = size_local_comp else {
                return Err(PlanError::MissingLocalSize { key: r.key.clone() });
            };
            if r.modified_remote == Some(modified_local) {
                // both sides modified at the same instant
                if size_local_comp == size_remote_comp {
                    r.set_decision(Decision::SkipUploading, 1);
                } else if threshold <= 0 {
                    r.set_decision(Decision::UploadLocalToRemote, 2);
                } else if local <= threshold {
                    match size_remote_comp {
                        Some(remote) if remote <= threshold => {
                            r.set_decision(Decision::UploadLocalToRemote, 18);
                        }
                        _ => r.set_decision(Decision::ErrorRemoteTooLargeConflictLocal, 19),
                    }
                } else {
                    match size_remote_comp {
                        Some(remote) if remote <= threshold => {
                            r.set_decision(Decision::ErrorLocalTooLargeConflictRemote, 20);
                        }
                        _ => r.set_decision(Decision::SkipUploadingTooLarge, 21),
                    }
                }
            } else if threshold <= 0 {
                r.set_decision(Decision::UploadLocalToRemote, 4);
            } else if local <= threshold {
                match size_remote_comp {
                    None => r.set_decision(Decision::UploadLocalToRemote, 22),
                    Some(remote) if remote <= threshold => {
                        r.set_decision(Decision::UploadLocalToRemote, 23);
                    }
                    Some(_) => r.set_decision(Decision::ErrorRemoteTooLargeConflictLocal, 24),
                }
            } else {
                match size_remote_comp {
                    None => r.set_decision(Decision::SkipUploadingTooLarge, 25),
                    Some(remote) if remote <= threshold => {
                        r.set_decision(Decision::ErrorLocalTooLargeConflictRemote, 26);
                    }
                    Some(_) => r.set_decision(Decision::SkipUploadingTooLarge, 27),
                }
            }
            kept_folder.insert(parent_folder(&r.key));
            return Ok(());
        }
    }

    // 2. remote modified time is the strict maximum
    if r.exist_remote {
        let modified_remote = r.modified_remote.unwrap_or(-1);
        let modified_local = if r.exist_local {
            r.modified_local.unwrap_or(-1)
        } else {
            -1
        };
        if modified_remote > modified_local
            && modified_remote >= delete_local
            && modified_remote >= delete_remote
        {
            let Some(remote) = size_remote_comp else {
                return Err(PlanError::MissingRemoteSize { key: r.key.clone() });
            };
            if threshold <= 0 {
                r.set_decision(Decision::DownloadRemoteToLocal, 5);
            } else if remote <= threshold {
                match size_local_comp {
                    None => r.set_decision(Decision::DownloadRemoteToLocal, 28),
                    Some(local) if local <= threshold => {
                        r.set_decision(Decision::DownloadRemoteToLocal, 29);
                    }
                    Some(_) => r.set_decision(Decision::ErrorLocalTooLargeConflictRemote, 30),
                }
            } else {
                match size_local_comp {
                    None => r.set_decision(Decision::SkipDownloadingTooLarge, 31),
                    Some(local) if local <= threshold => {
                        r.set_decision(Decision::ErrorRemoteTooLargeConflictLocal, 32);
                    }
                    Some(_) => r.set_decision(Decision::SkipDownloadingTooLarge, 33),
                }
            }
            kept_folder.insert(parent_folder(&r.key));
            return Ok(());
        }
    }

    // 3. local deletion time is the maximum
    if let Some(del_local) = r.delete_time_local {
        let modified_local = if r.exist_local {
            r.modified_local.unwrap_or(-1)
        } else {
            -1
        };
        let modified_remote = if r.exist_remote {
            r.modified_remote.unwrap_or(-1)
        } else {
            -1
        };
        if del_local >= modified_local && del_local >= modified_remote && del_local >= delete_remote
        {
            if threshold <= 0 {
                r.set_decision(Decision::UploadLocalDelHistToRemote, 6);
            } else {
                let local_too_large =
                    r.exist_local && size_local_comp.is_some_and(|s| s > threshold);
                let remote_too_large =
                    r.exist_remote && size_remote_comp.is_some_and(|s| s > threshold);
                match (local_too_large, remote_too_large) {
                    (true, true) => r.set_decision(Decision::SkipUsingLocalDelTooLarge, 34),
                    (true, false) => {
                        if r.exist_remote {
                            r.set_decision(Decision::ErrorLocalTooLargeConflictRemote, 35);
                        } else {
                            r.set_decision(Decision::SkipUsingLocalDelTooLarge, 36);
                        }
                    }
                    (false, true) => {
                        if r.exist_local {
                            r.set_decision(Decision::ErrorLocalTooLargeConflictRemote, 37);
                        } else {
                            r.set_decision(Decision::SkipUsingLocalDelTooLarge, 38);
                        }
                    }
                    (false, false) => r.set_decision(Decision::UploadLocalDelHistToRemote, 39),
                }
            }
            return Ok(());
        }
    }

    // 4. remote deletion time is the maximum
    if let Some(del_remote) = r.delete_time_remote {
        let modified_local = if r.exist_local {
            r.modified_local.unwrap_or(-1)
        } else {
            -1
        };
        let modified_remote = if r.exist_remote {
            r.modified_remote.unwrap_or(-1)
        } else {
            -1
        };
        if del_remote >= modified_local
            && del_remote >= modified_remote
            && del_remote >= delete_local
        {
            if threshold <= 0 {
                r.set_decision(Decision::KeepRemoteDelHist, 7);
            } else {
                let local_too_large =
                    r.exist_local && size_local_comp.is_some_and(|s| s > threshold);
                let remote_too_large =
                    r.exist_remote && size_remote_comp.is_some_and(|s| s > threshold);
                match (local_too_large, remote_too_large) {
                    (true, true) => r.set_decision(Decision::SkipUsingRemoteDelTooLarge, 40),
                    (true, false) => {
                        if r.exist_remote {
                            r.set_decision(Decision::ErrorLocalTooLargeConflictRemote, 41);
                        } else {
                            r.set_decision(Decision::SkipUsingRemoteDelTooLarge, 42);
                        }
                    }
                    (false, true) => {
                        if r.exist_local {
                            r.set_decision(Decision::ErrorLocalTooLargeConflictRemote, 43);
                        } else {
                            r.set_decision(Decision::SkipUsingRemoteDelTooLarge, 44);
                        }
                    }
                    (false, false) => r.set_decision(Decision::KeepRemoteDelHist, 45),
                }
            }
            return Ok(());
        }
    }

    Err(PlanError::Undecided { key: r.key.clone() })
}

/// Decides one folder record. Must run strictly after every descendant so
/// the kept-folder set already reflects all children.
pub fn decide_folder(
    r: &mut PathRecord,
    kept_folder: &mut HashSet<String>,
    folder_stat: Option<&dyn FolderChangeTimes>,
) -> Result<(), PlanError> {
    if !r.is_folder() {
        return Ok(());
    }

    if kept_folder.contains(&r.key) {
        // some descendant requires this folder; so does its parent
        kept_folder.insert(parent_folder(&r.key));
        resolve_keep(r, 12, 13)?;
    } else if r.delete_time_local.is_some() || r.delete_time_remote.is_some() {
        let delete_local = r.delete_time_local.unwrap_or(-1);
        let delete_remote = r.delete_time_remote.unwrap_or(-1);

        // recreated after deletion: live stat wins over both tombstones
        if r.exist_local
            && let Some(stat) = folder_stat
            && let Some(change_time) = stat.folder_change_time(&r.key)
            && change_time > 0
            && change_time >= delete_local
            && change_time >= delete_remote
        {
            kept_folder.insert(parent_folder(&r.key));
            resolve_keep(r, 14, 15)?;
        }

        // moved here after deletion: a rename-destination mtime newer than
        // both tombstones keeps the folder as well
        if r.exist_local
            && r.change_local_mtime_using_mapping
            && r.modified_local
                .is_some_and(|m| m > 0 && m > delete_local && m > delete_remote)
        {
            kept_folder.insert(parent_folder(&r.key));
            resolve_keep(r, 16, 17)?;
        }

        if r.decision.is_none() {
            if delete_local > 0 && delete_local > delete_remote {
                r.set_decision(Decision::UploadLocalDelHistToRemoteFolder, 8);
            } else {
                r.set_decision(Decision::KeepRemoteDelHistFolder, 9);
            }
        }
    } else {
        kept_folder.insert(parent_folder(&r.key));
        resolve_keep(r, 10, 11)?;
    }

    // consumed; keep the set small
    kept_folder.remove(&r.key);
    Ok(())
}

fn resolve_keep(r: &mut PathRecord, skip_branch: u8, create_branch: u8) -> Result<(), PlanError> {
    if r.exist_local && r.exist_remote {
        r.set_decision(Decision::SkipFolder, skip_branch);
        Ok(())
    } else if r.exist_local || r.exist_remote {
        r.set_decision(Decision::CreateFolder, create_branch);
        Ok(())
    } else {
        Err(PlanError::KeptFolderMissingBothSides { key: r.key.clone() })
    }
}

fn check_sanity(r: &PathRecord, encrypted: bool) -> Result<(), PlanError> {
    if r.exist_local && !r.modified_local.is_some_and(|t| t > 0) {
        return Err(PlanError::AbnormalLocalModifiedTime { key: r.key.clone() });
    }
    if r.exist_remote && !r.modified_remote.is_some_and(|t| t > 0) {
        return Err(PlanError::AbnormalRemoteModifiedTime { key: r.key.clone() });
    }
    if r.delete_time_local.is_some_and(|t| t <= 0) {
        return Err(PlanError::AbnormalLocalDeleteTime { key: r.key.clone() });
    }
    if r.delete_time_remote.is_some_and(|t| t <= 0) {
        return Err(PlanError::AbnormalRemoteDeleteTime { key: r.key.clone() });
    }
    if encrypted
        && ((r.exist_local && r.size_local_enc.is_none())
            || (r.exist_remote && r.size_remote_enc.is_none()))
    {
        return Err(PlanError::MissingEncryptedSize { key: r.key.clone() });
    }
    Ok(())
}
