use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Everything the plan can decide to do with one path. Closed set; the
/// scheduler dispatches on it with an exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Decision {
    // files
    SkipUploading,
    UploadLocalToRemote,
    DownloadRemoteToLocal,
    UploadLocalDelHistToRemote,
    KeepRemoteDelHist,
    // size policy outcomes
    SkipUploadingTooLarge,
    SkipDownloadingTooLarge,
    SkipUsingLocalDelTooLarge,
    SkipUsingRemoteDelTooLarge,
    ErrorLocalTooLargeConflictRemote,
    ErrorRemoteTooLargeConflictLocal,
    // folders
    CreateFolder,
    UploadLocalDelHistToRemoteFolder,
    KeepRemoteDelHistFolder,
    SkipFolder,
}

impl Decision {
    /// Decisions that perform no work at execution time.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Decision::SkipUploading
                | Decision::SkipFolder
                | Decision::SkipUploadingTooLarge
                | Decision::SkipDownloadingTooLarge
                | Decision::SkipUsingLocalDelTooLarge
                | Decision::SkipUsingRemoteDelTooLarge
        )
    }

    /// Decisions that propagate a deletion and thus publish a tombstone.
    pub fn is_deletion(&self) -> bool {
        matches!(
            self,
            Decision::UploadLocalDelHistToRemote
                | Decision::KeepRemoteDelHist
                | Decision::UploadLocalDelHistToRemoteFolder
                | Decision::KeepRemoteDelHistFolder
        )
    }

    /// Size conflicts require manual resolution before anything executes.
    pub fn is_size_conflict(&self) -> bool {
        matches!(
            self,
            Decision::ErrorLocalTooLargeConflictRemote | Decision::ErrorRemoteTooLargeConflictLocal
        )
    }

    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            Decision::UploadLocalToRemote | Decision::DownloadRemoteToLocal
        )
    }
}

/// The merged view of one path across all four state sources, plus the
/// decision reached for it. Built fresh every run; only the containing
/// plan is persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathRecord {
    pub key: String,
    #[serde(default)]
    pub exist_local: bool,
    #[serde(default)]
    pub exist_remote: bool,
    pub modified_local: Option<i64>,
    pub modified_remote: Option<i64>,
    pub delete_time_local: Option<i64>,
    pub delete_time_remote: Option<i64>,
    pub size_local: Option<i64>,
    pub size_local_enc: Option<i64>,
    pub size_remote: Option<i64>,
    pub size_remote_enc: Option<i64>,
    pub remote_encrypted_key: Option<String>,
    /// Etag from the remote listing, used to verify downloaded content.
    pub remote_etag: Option<String>,
    /// Set when a rename-destination history entry rewrote the local mtime.
    #[serde(default)]
    pub change_local_mtime_using_mapping: bool,
    /// Set when the backward path mapping rewrote the remote mtime.
    #[serde(default)]
    pub change_remote_mtime_using_mapping: bool,
    pub decision: Option<Decision>,
    /// Which rule fired. Diagnostic only, never load-bearing.
    pub decision_branch: Option<u8>,

    pub modified_local_fmt: Option<String>,
    pub modified_remote_fmt: Option<String>,
    pub delete_time_local_fmt: Option<String>,
    pub delete_time_remote_fmt: Option<String>,
}

impl PathRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn is_folder(&self) -> bool {
        self.key.ends_with('/')
    }

    pub fn set_decision(&mut self, decision: Decision, branch: u8) {
        self.decision = Some(decision);
        self.decision_branch = Some(branch);
    }
}

/// A deletion event propagated between the two sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub key: String,
    /// Epoch milliseconds.
    pub action_when: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerKind {
    Manual,
    Auto,
    Dry,
    AutoOnceInit,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Auto => "auto",
            TriggerKind::Dry => "dry",
            TriggerKind::AutoOnceInit => "autoOnceInit",
        }
    }
}

/// The full decided table plus provenance. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan {
    pub ts: i64,
    pub ts_fmt: Option<String>,
    pub trigger: TriggerKind,
    pub records: HashMap<String, PathRecord>,
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Epoch-millisecond timestamp rendered as RFC 3339, for the persisted
/// plan and diagnostics.
pub fn unix_millis_to_str(millis: i64) -> Option<String> {
    let ts = OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000).ok()?;
    ts.format(&Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_groups_are_disjoint() {
        let all = [
            Decision::SkipUploading,
            Decision::UploadLocalToRemote,
            Decision::DownloadRemoteToLocal,
            Decision::UploadLocalDelHistToRemote,
            Decision::KeepRemoteDelHist,
            Decision::SkipUploadingTooLarge,
            Decision::SkipDownloadingTooLarge,
            Decision::SkipUsingLocalDelTooLarge,
            Decision::SkipUsingRemoteDelTooLarge,
            Decision::ErrorLocalTooLargeConflictRemote,
            Decision::ErrorRemoteTooLargeConflictLocal,
            Decision::CreateFolder,
            Decision::UploadLocalDelHistToRemoteFolder,
            Decision::KeepRemoteDelHistFolder,
            Decision::SkipFolder,
        ];
        for decision in all {
            let groups = [
                decision.is_skip(),
                decision.is_deletion(),
                decision.is_size_conflict(),
                decision.is_transfer(),
                decision == Decision::CreateFolder,
            ];
            assert_eq!(
                groups.iter().filter(|g| **g).count(),
                1,
                "{decision:?} must belong to exactly one execution group"
            );
        }
    }

    #[test]
    fn decision_serializes_as_camel_case() {
        let json = serde_json::to_string(&Decision::UploadLocalDelHistToRemote).unwrap();
        assert_eq!(json, "\"uploadLocalDelHistToRemote\"");
    }

    #[test]
    fn formats_epoch_millis() {
        assert_eq!(
            unix_millis_to_str(1_704_067_200_000).as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }
}
