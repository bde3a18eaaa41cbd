//! Turns a merged record table into a decided [`SyncPlan`]. Keys are
//! visited longest-first so every file and subfolder is decided before the
//! folder that contains it, which is what makes the kept-folder threading
//! in [`super::decision`] correct.

use std::collections::{HashMap, HashSet};

use super::decision::{FolderChangeTimes, PlanError, decide_file, decide_folder};
use super::record::{
    Decision, PathRecord, SyncPlan, Tombstone, TriggerKind, now_millis, unix_millis_to_str,
};

/// A decided plan plus the derived views the executor needs.
#[derive(Debug)]
pub struct PlanOutput {
    pub plan: SyncPlan,
    /// Keys in decision order (longest first), for sequential execution.
    pub sorted_keys: Vec<String>,
    /// Tombstones the plan asserts; published to the remote metadata blob
    /// before any mutation runs.
    pub deletions: Vec<Tombstone>,
    /// Records whose decision is a size conflict. Non-empty means the run
    /// must stop before executing anything.
    pub sizes_go_wrong: Vec<PathRecord>,
}

pub fn build_sync_plan(
    mut records: HashMap<String, PathRecord>,
    trigger: TriggerKind,
    skip_size_larger_than: i64,
    encrypted: bool,
    folder_stat: Option<&dyn FolderChangeTimes>,
) -> Result<PlanOutput, PlanError> {
    let mut sorted_keys: Vec<String> = records.keys().cloned().collect();
    sorted_keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    let mut kept_folder: HashSet<String> = HashSet::new();
    for key in &sorted_keys {
        let record = records
            .get_mut(key)
            .ok_or_else(|| PlanError::Undecided { key: key.clone() })?;
        if record.is_folder() {
            decide_folder(record, &mut kept_folder, folder_stat)?;
        } else {
            decide_file(record, &mut kept_folder, skip_size_larger_than, encrypted)?;
        }
        record.modified_local_fmt = record.modified_local.and_then(unix_millis_to_str);
        record.modified_remote_fmt = record.modified_remote.and_then(unix_millis_to_str);
        record.delete_time_local_fmt = record.delete_time_local.and_then(unix_millis_to_str);
        record.delete_time_remote_fmt = record.delete_time_remote.and_then(unix_millis_to_str);
    }

    let mut deletions = Vec::new();
    let mut sizes_go_wrong = Vec::new();
    for key in &sorted_keys {
        let record = &records[key];
        let Some(decision) = record.decision else {
            return Err(PlanError::Undecided { key: key.clone() });
        };
        if decision.is_deletion() {
            let action_when = match decision {
                Decision::UploadLocalDelHistToRemote
                | Decision::UploadLocalDelHistToRemoteFolder => record.delete_time_local,
                _ => record.delete_time_remote,
            }
            .ok_or_else(|| PlanError::MissingDeletionTimestamp { key: key.clone() })?;
            deletions.push(Tombstone {
                key: key.clone(),
                action_when,
            });
        } else if decision.is_size_conflict() {
            sizes_go_wrong.push(record.clone());
        }
    }

    let ts = now_millis();
    let plan = SyncPlan {
        ts,
        ts_fmt: unix_millis_to_str(ts),
        trigger,
        records,
    };
    Ok(PlanOutput {
        plan,
        sorted_keys,
        deletions,
        sizes_go_wrong,
    })
}
