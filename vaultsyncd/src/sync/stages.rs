//! Splits a decided plan into the three execution stages. Stage order is a
//! safety property: folders are created shallow-first so parents exist
//! before children, deletions run deep-first so children disappear before
//! their parents, and content transfers only start once the tree shape is
//! settled.

use std::collections::BTreeMap;

use super::paths::key_level;
use super::record::{Decision, PathRecord, SyncPlan};

#[derive(Debug, Default)]
pub struct ExecutionStages {
    /// Folder creations grouped by depth; executed in ascending level
    /// order, parallel within a level.
    pub folder_creations: BTreeMap<u32, Vec<PathRecord>>,
    /// Deletions grouped by depth; executed in descending level order.
    pub deletions: BTreeMap<u32, Vec<PathRecord>>,
    /// Uploads and downloads, one unordered bucket.
    pub transfers: Vec<PathRecord>,
    /// Operations that actually do something; skips are not counted.
    pub real_total: usize,
}

pub fn split_into_stages(plan: &SyncPlan, sorted_keys: &[String]) -> ExecutionStages {
    let mut stages = ExecutionStages::default();

    for key in sorted_keys {
        let Some(record) = plan.records.get(key) else {
            continue;
        };
        let Some(decision) = record.decision else {
            continue;
        };
        if decision.is_skip() || decision.is_size_conflict() {
            continue;
        }
        let level = key_level(key);
        if decision == Decision::CreateFolder {
            stages
                .folder_creations
                .entry(level)
                .or_default()
                .push(record.clone());
        } else if decision.is_deletion() {
            stages.deletions.entry(level).or_default().push(record.clone());
        } else {
            stages.transfers.push(record.clone());
        }
    }

    stages.real_total = stages
        .folder_creations
        .values()
        .map(Vec::len)
        .sum::<usize>()
        + stages.deletions.values().map(Vec::len).sum::<usize>()
        + stages.transfers.len();
    stages
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::sync::record::TriggerKind;

    fn decided(key: &str, decision: Decision) -> PathRecord {
        let mut r = PathRecord::new(key);
        r.set_decision(decision, 0);
        r
    }

    fn split(records: Vec<PathRecord>) -> ExecutionStages {
        let mut sorted_keys: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
        sorted_keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        let records: HashMap<String, PathRecord> =
            records.into_iter().map(|r| (r.key.clone(), r)).collect();
        let plan = SyncPlan {
            ts: 0,
            ts_fmt: None,
            trigger: TriggerKind::Manual,
            records,
        };
        split_into_stages(&plan, &sorted_keys)
    }

    #[test]
    fn groups_folder_creations_by_level() {
        let stages = split(vec![
            decided("a/", Decision::CreateFolder),
            decided("a/b/", Decision::CreateFolder),
            decided("a/b/c/", Decision::CreateFolder),
        ]);
        let levels: Vec<u32> = stages.folder_creations.keys().copied().collect();
        assert_eq!(levels, vec![1, 2, 3]);
        assert_eq!(stages.real_total, 3);
    }

    #[test]
    fn deletions_are_grouped_for_deep_first_execution() {
        let stages = split(vec![
            decided("a/", Decision::KeepRemoteDelHistFolder),
            decided("a/b.md", Decision::KeepRemoteDelHist),
        ]);
        let deep_first: Vec<u32> = stages.deletions.keys().rev().copied().collect();
        assert_eq!(deep_first, vec![2, 1]);
    }

    #[test]
    fn transfers_share_one_bucket() {
        let stages = split(vec![
            decided("a.md", Decision::UploadLocalToRemote),
            decided("b.md", Decision::DownloadRemoteToLocal),
        ]);
        assert_eq!(stages.transfers.len(), 2);
        assert!(stages.folder_creations.is_empty());
    }

    #[test]
    fn skips_are_dropped_and_not_counted() {
        let stages = split(vec![
            decided("a.md", Decision::SkipUploading),
            decided("b/", Decision::SkipFolder),
            decided("c.md", Decision::SkipUploadingTooLarge),
            decided("d.md", Decision::UploadLocalToRemote),
        ]);
        assert_eq!(stages.real_total, 1);
        assert_eq!(stages.transfers.len(), 1);
    }
}
