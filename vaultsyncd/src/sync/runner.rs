//! One full reconciliation run, from connectivity check to executed plan.
//! The runner owns the shared context and enforces that only a single run
//! is in flight at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use vaultsync_core::{BlobClient, BlobStoreError};

use crate::cipher::{PasswordCheckReason, PathCipher, check_password};
use crate::config::SyncConfig;
use crate::history::{HistoryError, HistoryStore};
use crate::vault::{LocalVault, VaultError};

use super::decision::PlanError;
use super::merge::{MergeError, ensemble_records, parse_remote_items};
use super::metadata::{MetadataError, fetch_metadata, publish_metadata};
use super::plan::build_sync_plan;
use super::record::TriggerKind;
use super::scheduler::{ProgressFn, SyncContext, SyncError, execute_plan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Preparing,
    ListingRemote,
    CheckingPassword,
    ParsingRemote,
    ListingLocal,
    GeneratingPlan,
    Syncing,
    Cleaning,
    Finish,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Preparing => "preparing",
            SyncStatus::ListingRemote => "listing_remote",
            SyncStatus::CheckingPassword => "checking_password",
            SyncStatus::ParsingRemote => "parsing_remote",
            SyncStatus::ListingLocal => "listing_local",
            SyncStatus::GeneratingPlan => "generating_plan",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Cleaning => "cleaning",
            SyncStatus::Finish => "finish",
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("a sync run is already in progress")]
    Busy,
    #[error("remote store is not reachable")]
    NoConnectivity,
    #[error("password check failed: {0:?}")]
    PasswordCheck(PasswordCheckReason),
    #[error(transparent)]
    Store(#[from] BlobStoreError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("could not serialize the plan: {0}")]
    PlanSerialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub ts: i64,
    pub trigger: TriggerKind,
    pub records: usize,
    pub deletions: usize,
    /// False for a dry run.
    pub executed: bool,
}

pub struct SyncRunner {
    config: SyncConfig,
    ctx: SyncContext,
    busy: AtomicBool,
    status: Mutex<SyncStatus>,
}

impl SyncRunner {
    pub async fn new(config: SyncConfig) -> Result<Self, RunError> {
        let client = Arc::new(BlobClient::new(&config.base_url, config.token.clone())?);
        let vault = Arc::new(LocalVault::new(config.local_root.clone()));
        let history = Arc::new(HistoryStore::open(&config.db_path).await?);
        let cipher = if config.encrypted() {
            Some(Arc::new(PathCipher::new(&config.password)))
        } else {
            None
        };
        let ctx = SyncContext {
            client,
            vault,
            history,
            cipher,
            concurrency: config.concurrency.max(1),
        };
        Ok(Self {
            config,
            ctx,
            busy: AtomicBool::new(false),
            status: Mutex::new(SyncStatus::Idle),
        })
    }

    pub fn history(&self) -> &HistoryStore {
        &self.ctx.history
    }

    pub fn status(&self) -> SyncStatus {
        match self.status.lock() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_status(&self, status: SyncStatus) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status;
        }
        eprintln!("[vaultsyncd] status: {}", status.as_str());
    }

    /// A progress sink that logs every finished operation.
    pub fn log_progress() -> ProgressFn {
        Arc::new(|p| {
            eprintln!(
                "[vaultsyncd] ({}/{}) {:?} {}",
                p.completed, p.total, p.decision, p.key
            );
        })
    }

    pub async fn run(
        &self,
        trigger: TriggerKind,
        on_progress: ProgressFn,
    ) -> Result<SyncReport, RunError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RunError::Busy);
        }
        let result = self.run_inner(trigger, on_progress).await;
        self.set_status(match result {
            Ok(_) => SyncStatus::Finish,
            Err(_) => SyncStatus::Idle,
        });
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(
        &self,
        trigger: TriggerKind,
        on_progress: ProgressFn,
    ) -> Result<SyncReport, RunError> {
        let ctx = &self.ctx;
        let config = &self.config;

        self.set_status(SyncStatus::Preparing);
        if !ctx.client.check_connectivity().await {
            return Err(RunError::NoConnectivity);
        }

        self.set_status(SyncStatus::ListingRemote);
        let remote = ctx.client.list_all(None).await?;
        eprintln!("[vaultsyncd] remote listing: {} item(s)", remote.len());

        self.set_status(SyncStatus::CheckingPassword);
        let check = check_password(&remote, &config.password);
        if !check.ok {
            return Err(RunError::PasswordCheck(check.reason));
        }

        self.set_status(SyncStatus::ParsingRemote);
        let cipher = ctx.cipher.as_deref();
        let parsed = parse_remote_items(&remote, &ctx.history, cipher).await?;
        let metadata =
            fetch_metadata(&ctx.client, cipher, parsed.metadata_record.as_ref()).await?;
        ctx.history
            .cache_remote_tombstones(&metadata.deletions)
            .await?;

        self.set_status(SyncStatus::ListingLocal);
        let local = ctx.vault.list_all()?;
        let local_history = ctx.history.load_file_history().await?;
        eprintln!(
            "[vaultsyncd] local listing: {} entr(ies), {} history row(s)",
            local.len(),
            local_history.len()
        );

        self.set_status(SyncStatus::GeneratingPlan);
        let metadata_record = parsed.metadata_record.clone();
        let records = ensemble_records(
            parsed.records,
            &metadata.deletions,
            &local,
            &local_history,
            &config.skip_options(),
            config.encrypted(),
        );
        let output = build_sync_plan(
            records,
            trigger,
            config.skip_size_larger_than,
            config.encrypted(),
            Some(&*ctx.vault),
        )?;
        ctx.history
            .insert_sync_plan(
                output.plan.ts,
                trigger.as_str(),
                &serde_json::to_string(&output.plan)?,
            )
            .await?;

        let report = SyncReport {
            ts: output.plan.ts,
            trigger,
            records: output.plan.records.len(),
            deletions: output.deletions.len(),
            executed: trigger != TriggerKind::Dry,
        };

        if trigger == TriggerKind::Dry {
            eprintln!(
                "[vaultsyncd] dry run: {} record(s), {} deletion(s), nothing executed",
                report.records, report.deletions
            );
            return Ok(report);
        }

        self.set_status(SyncStatus::Syncing);
        if !output.sizes_go_wrong.is_empty() {
            for record in &output.sizes_go_wrong {
                eprintln!(
                    "[vaultsyncd] size conflict: {} ({:?})",
                    record.key, record.decision
                );
            }
            return Err(SyncError::SizeConflicts(output.sizes_go_wrong.clone()).into());
        }
        // tombstones go out before any mutation so an interrupted run
        // never loses a deletion
        publish_metadata(
            &ctx.client,
            cipher,
            metadata_record.as_ref(),
            &metadata,
            &output.deletions,
        )
        .await?;
        execute_plan(ctx, &output, on_progress).await?;

        self.set_status(SyncStatus::Cleaning);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn make_runner(server: &MockServer, dir: &tempfile::TempDir) -> SyncRunner {
        let config = SyncConfig {
            base_url: server.uri(),
            token: "tok".into(),
            password: String::new(),
            local_root: dir.path().join("vault"),
            db_path: dir.path().join("state.db"),
            concurrency: 1,
            skip_size_larger_than: 0,
            sync_underscore_items: false,
            sync_config_dir: false,
            config_dir: ".vaultsync".into(),
        };
        std::fs::create_dir_all(dir.path().join("vault")).unwrap();
        SyncRunner::new(config).await.unwrap()
    }

    fn mount_ping_and_empty_listing(server: &MockServer) -> (Mock, Mock) {
        let ping = Mock::given(method("GET"))
            .and(path("/v1/ping"))
            .respond_with(ResponseTemplate::new(200));
        let listing = Mock::given(method("GET"))
            .and(path("/v1/blobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [],
                "limit": 1000,
                "offset": 0,
                "total": 0,
            })));
        (ping, listing)
    }

    #[tokio::test]
    async fn unreachable_remote_aborts_the_run() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(&server, &dir).await;
        let result = runner
            .run(TriggerKind::Manual, SyncRunner::log_progress())
            .await;
        assert!(matches!(result, Err(RunError::NoConnectivity)));
        assert_eq!(runner.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn dry_run_plans_and_persists_but_never_mutates() {
        let server = MockServer::start().await;
        let (ping, listing) = mount_ping_and_empty_listing(&server);
        ping.mount(&server).await;
        listing.mount(&server).await;

        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(&server, &dir).await;
        std::fs::write(dir.path().join("vault/a.md"), b"hello").unwrap();

        let report = runner
            .run(TriggerKind::Dry, SyncRunner::log_progress())
            .await
            .unwrap();
        assert!(!report.executed);
        assert_eq!(report.records, 1);

        let plan = runner.history().latest_sync_plan().await.unwrap().unwrap();
        assert!(plan.contains("uploadLocalToRemote"));

        // no PUT/DELETE ever reached the store
        let mutations = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.method != wiremock::http::Method::GET)
            .count();
        assert_eq!(mutations, 0);
    }

    #[tokio::test]
    async fn full_run_uploads_new_local_files() {
        let server = MockServer::start().await;
        let (ping, listing) = mount_ping_and_empty_listing(&server);
        ping.mount(&server).await;
        listing.mount(&server).await;
        Mock::given(method("PUT"))
            .and(path("/v1/blobs/content"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "last_modified": 1000i64,
                "size": 5i64,
                "etag": null,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(&server, &dir).await;
        std::fs::write(dir.path().join("vault/a.md"), b"hello").unwrap();

        let report = runner
            .run(TriggerKind::Manual, SyncRunner::log_progress())
            .await
            .unwrap();
        assert!(report.executed);
        assert_eq!(runner.status(), SyncStatus::Finish);
    }

    #[tokio::test]
    async fn password_mismatch_is_caught_before_planning() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/ping"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/blobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"key": "plain.md", "last_modified": 1000i64, "size": 5i64}],
                "limit": 1000,
                "offset": 0,
                "total": 1,
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            base_url: server.uri(),
            token: "tok".into(),
            password: "hunter2".into(),
            local_root: dir.path().join("vault"),
            db_path: dir.path().join("state.db"),
            concurrency: 1,
            skip_size_larger_than: 0,
            sync_underscore_items: false,
            sync_config_dir: false,
            config_dir: ".vaultsync".into(),
        };
        std::fs::create_dir_all(&config.local_root).unwrap();
        let runner = SyncRunner::new(config).await.unwrap();

        let result = runner
            .run(TriggerKind::Manual, SyncRunner::log_progress())
            .await;
        assert!(matches!(
            result,
            Err(RunError::PasswordCheck(
                PasswordCheckReason::RemoteNotEncryptedLocalHasPassword
            ))
        ));
    }
}
