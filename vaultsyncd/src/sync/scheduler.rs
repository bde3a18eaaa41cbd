//! Executes a decided plan against the vault and the remote store.
//!
//! Two modes: strictly sequential (concurrency 1) in plan order, or a
//! staged worker pool that runs folder creations, then deletions, then
//! transfers, each stage bounded by the configured concurrency. Failures
//! are collected rather than aborting mid-flight; past a threshold the
//! remaining work is abandoned.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use vaultsync_core::{BlobClient, BlobStoreError};

use crate::cipher::{CipherError, PathCipher};
use crate::history::{HistoryError, HistoryStore, SyncMetaMapping};
use crate::vault::{LocalVault, VaultError};

use super::plan::PlanOutput;
use super::record::{Decision, PathRecord, now_millis};
use super::stages::split_into_stages;

/// After this many task failures the rest of the run is abandoned.
pub const MAX_TASK_FAILURES: usize = 3;
pub const TOO_MANY_ERRORS_MARKER: &str = "too many errors, stop the remaining tasks";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote store error: {0}")]
    Store(#[from] BlobStoreError),
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    #[error("history store error: {0}")]
    History(#[from] HistoryError),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("{} path(s) exceed the size policy", .0.len())]
    SizeConflicts(Vec<PathRecord>),
    #[error("{} task(s) failed during execution", .0.len())]
    Aggregate(Vec<TaskFailure>),
}

/// Everything a dispatched operation needs, cheaply cloneable into worker
/// tasks.
#[derive(Clone)]
pub struct SyncContext {
    pub client: Arc<BlobClient>,
    pub vault: Arc<LocalVault>,
    pub history: Arc<HistoryStore>,
    pub cipher: Option<Arc<PathCipher>>,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct SyncProgress<'a> {
    pub completed: usize,
    pub total: usize,
    pub key: &'a str,
    pub decision: Decision,
}

pub type ProgressFn = Arc<dyn Fn(SyncProgress<'_>) + Send + Sync>;

struct RunState {
    completed: AtomicUsize,
    total: usize,
    failures: Mutex<Vec<TaskFailure>>,
    cancelled: AtomicBool,
}

impl RunState {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub async fn execute_plan(
    ctx: &SyncContext,
    output: &PlanOutput,
    on_progress: ProgressFn,
) -> Result<(), SyncError> {
    if !output.sizes_go_wrong.is_empty() {
        return Err(SyncError::SizeConflicts(output.sizes_go_wrong.clone()));
    }

    if ctx.concurrency <= 1 {
        return execute_sequential(ctx, output, on_progress).await;
    }

    let mut stages = split_into_stages(&output.plan, &output.sorted_keys);

    let state = Arc::new(RunState {
        completed: AtomicUsize::new(0),
        total: stages.real_total,
        failures: Mutex::new(Vec::new()),
        cancelled: AtomicBool::new(false),
    });

    let mut buckets: Vec<Vec<PathRecord>> = Vec::new();
    buckets.extend(std::mem::take(&mut stages.folder_creations).into_values());
    buckets.extend(std::mem::take(&mut stages.deletions).into_values().rev());
    buckets.push(std::mem::take(&mut stages.transfers));

    for bucket in buckets {
        if bucket.is_empty() {
            continue;
        }
        run_bucket(ctx, bucket, &state, &on_progress).await;
        // any failure in a drained bucket stops the later phases
        let failed = match state.failures.lock() {
            Ok(guard) => !guard.is_empty(),
            Err(_) => true,
        };
        if failed {
            break;
        }
    }

    let mut failures = match state.failures.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    if failures.is_empty() {
        return Ok(());
    }
    if state.is_cancelled() {
        failures.push(TaskFailure {
            key: "*".to_string(),
            message: TOO_MANY_ERRORS_MARKER.to_string(),
        });
    }
    Err(SyncError::Aggregate(failures))
}

/// Plan order is deepest-first, which already deletes children before
/// parents; folder creation relies on recursive mkdir and a flat remote
/// namespace, so one pass is safe. Every decided key is dispatched (skips
/// are no-ops inside the dispatch), so the progress stream covers the
/// whole plan. The first error aborts the run.
async fn execute_sequential(
    ctx: &SyncContext,
    output: &PlanOutput,
    on_progress: ProgressFn,
) -> Result<(), SyncError> {
    let total = output.sorted_keys.len();
    let mut completed = 0usize;
    for key in &output.sorted_keys {
        let Some(record) = output.plan.records.get(key) else {
            continue;
        };
        let Some(decision) = record.decision else {
            continue;
        };
        dispatch_operation(ctx, record).await?;
        completed += 1;
        on_progress(SyncProgress {
            completed,
            total,
            key,
            decision,
        });
    }
    Ok(())
}

/// Drains a bucket in waves of `concurrency` tasks. The failure threshold
/// is evaluated between waves: tasks already in flight always finish and
/// still count, while nothing new starts once the bucket is cancelled.
async fn run_bucket(
    ctx: &SyncContext,
    records: Vec<PathRecord>,
    state: &Arc<RunState>,
    on_progress: &ProgressFn,
) {
    let width = ctx.concurrency.max(1);
    for wave in records.chunks(width) {
        if state.is_cancelled() {
            break;
        }
        let mut handles = Vec::with_capacity(wave.len());
        for record in wave {
            let ctx = ctx.clone();
            let state = Arc::clone(state);
            let on_progress = Arc::clone(on_progress);
            let record = record.clone();
            handles.push(tokio::spawn(async move {
                match dispatch_operation(&ctx, &record).await {
                    Ok(()) => {
                        let completed = state.completed.fetch_add(1, Ordering::SeqCst) + 1;
                        if let Some(decision) = record.decision {
                            on_progress(SyncProgress {
                                completed,
                                total: state.total,
                                key: &record.key,
                                decision,
                            });
                        }
                    }
                    Err(err) => {
                        eprintln!("[vaultsyncd] task failed for {}: {err}", record.key);
                        if let Ok(mut failures) = state.failures.lock() {
                            failures.push(TaskFailure {
                                key: record.key.clone(),
                                message: err.to_string(),
                            });
                            if failures.len() >= MAX_TASK_FAILURES {
                                state.cancelled.store(true, Ordering::SeqCst);
                            }
                        }
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn resolve_remote_key(ctx: &SyncContext, record: &PathRecord) -> Result<String, SyncError> {
    if let Some(existing) = &record.remote_encrypted_key {
        return Ok(existing.clone());
    }
    match &ctx.cipher {
        Some(cipher) => Ok(cipher.encrypt_key(&record.key)?),
        None => Ok(record.key.clone()),
    }
}

async fn dispatch_operation(ctx: &SyncContext, record: &PathRecord) -> Result<(), SyncError> {
    let Some(decision) = record.decision else {
        return Ok(());
    };
    if decision.is_skip() || decision.is_size_conflict() {
        return Ok(());
    }
    let key = &record.key;

    match decision {
        Decision::CreateFolder => {
            if !record.exist_local {
                ctx.vault.mkdirp(key).await?;
            }
            if !record.exist_remote {
                let remote_key = resolve_remote_key(ctx, record)?;
                let content = match &ctx.cipher {
                    Some(cipher) => cipher.encrypt_content(&[])?,
                    None => Vec::new(),
                };
                let mtime = record.modified_local.unwrap_or_else(now_millis);
                let meta = ctx.client.put(&remote_key, content, Some(mtime)).await?;
                ctx.history
                    .upsert_mapping(&SyncMetaMapping {
                        local_key: key.clone(),
                        local_mtime: record.modified_local,
                        local_size: Some(0),
                        remote_key,
                        remote_mtime: Some(meta.last_modified),
                        remote_size: Some(meta.size),
                        etag: meta.etag,
                    })
                    .await?;
            }
            ctx.history.clear_history_for(key).await?;
        }
        Decision::UploadLocalToRemote => {
            let content = ctx.vault.read_file(key).await?;
            let plain_size = content.len() as i64;
            let mtime = record.modified_local.unwrap_or_else(now_millis);
            let remote_key = resolve_remote_key(ctx, record)?;
            let payload = match &ctx.cipher {
                Some(cipher) => cipher.encrypt_content(&content)?,
                None => content,
            };
            let meta = ctx.client.put(&remote_key, payload, Some(mtime)).await?;
            ctx.history
                .upsert_mapping(&SyncMetaMapping {
                    local_key: key.clone(),
                    local_mtime: Some(mtime),
                    local_size: Some(plain_size),
                    remote_key,
                    remote_mtime: Some(meta.last_modified),
                    remote_size: Some(meta.size),
                    etag: meta.etag,
                })
                .await?;
            ctx.history.clear_history_for(key).await?;
        }
        Decision::DownloadRemoteToLocal => {
            let remote_key = record
                .remote_encrypted_key
                .clone()
                .unwrap_or_else(|| key.clone());
            let bytes = ctx
                .client
                .get(&remote_key, record.remote_etag.as_deref())
                .await?;
            let content = match &ctx.cipher {
                Some(cipher) => cipher.decrypt_content(&bytes)?,
                None => bytes,
            };
            let mtime = record.modified_remote.unwrap_or(0);
            ctx.vault.write_file(key, &content, mtime).await?;
            // the mapping must carry the server's own view of the object,
            // not the possibly rewritten plan values
            match ctx.client.head(&remote_key).await {
                Ok(meta) => {
                    ctx.history
                        .upsert_mapping(&SyncMetaMapping {
                            local_key: key.clone(),
                            local_mtime: Some(mtime),
                            local_size: Some(content.len() as i64),
                            remote_key,
                            remote_mtime: Some(meta.last_modified),
                            remote_size: Some(meta.size),
                            etag: meta.etag,
                        })
                        .await?;
                }
                Err(err) => {
                    eprintln!("[vaultsyncd] could not refresh mapping for {key}: {err}");
                }
            }
            ctx.history.clear_history_for(key).await?;
        }
        d if d.is_deletion() => {
            if record.exist_local {
                ctx.vault.delete_to_trash(key)?;
            }
            if record.exist_remote {
                let remote_key = record
                    .remote_encrypted_key
                    .clone()
                    .unwrap_or_else(|| key.clone());
                ctx.client.delete(&remote_key).await?;
            }
            ctx.history.clear_history_for(key).await?;
        }
        _ => {}
    }
    Ok(())
}
