//! Refresh engine
//!
//! The RefreshEngine is responsible for:
//! - Serializing invocations through the cluster-wide lease
//! - Loading or creating the refresh job
//! - Driving the job's stages to completion, checkpointing after each one
//! - Reporting additions and removals through a ReportSender
//!
//! ## Architecture
//!
//! ```text
//!            trigger
//!               │
//!               ▼
//!      ┌─────────────────┐   busy   ┌──────────┐
//!      │  RefreshLock    │─────────▶│ LockBusy │
//!      └─────────────────┘          └──────────┘
//!               │
//!               ▼
//!      ┌─────────────────┐   none   ┌─────────────┐
//!      │ RefreshScheduler│─────────▶│ NothingToDo │
//!      └─────────────────┘          └─────────────┘
//!               │ job @ stage
//!               ▼
//!   MAKE_DIFF ─▶ APPLY_DIFF ─▶ REPORT_REMOVALS ─▶ REPORT_ADDITIONS ─▶ DONE
//!       │            │               │                   │
//!       ▼            ▼               ▼                   ▼
//!   ChangeLog   Unblockable     ReportSender        ReportSender
//!   (write)     Store (batch)   (removals)          (additions)
//! ```
//!
//! ## Resumability
//!
//! Each stage persists the next stage only after its work succeeded. A
//! failed or interrupted invocation leaves the checkpoint where it was, and
//! the next invocation resumes that same job. Every stage after MAKE_DIFF
//! reads the diff back from the change log, so a retried report carries the
//! exact batch of the failed attempt.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::config::{ReasonChangePolicy, RefreshConfig};
use crate::error::Result;
use crate::lock::RefreshLock;
use crate::model::{ChangeKind, Stage, UnblockableDomainChange};
use crate::reconciler::Reconciler;
use crate::scheduler::{RefreshSchedule, RefreshScheduler};
use crate::state::Stores;
use crate::traits::{
    ChangeLogStore, DownloadStatus, RefreshJobStore, RegistryView, ReportBatch, ReportSender,
    UnblockableStore, WriteOutcome,
};

/// Which report endpoint a batch goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Removals,
    Additions,
}

/// Events emitted by the RefreshEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The lease was held elsewhere
    LockBusy,

    /// No blocklist download has completed; no job was created
    NothingToDo,

    /// A job was picked up
    JobScheduled { job_id: String, stage: Stage },

    /// The diff for a job is in the change log
    DiffRecorded {
        job_id: String,
        changes: usize,
        already_present: bool,
    },

    /// One transaction of APPLY_DIFF committed
    BatchApplied {
        job_id: String,
        upserts: usize,
        deletes: usize,
    },

    /// A report was delivered
    ReportSent {
        job_id: String,
        kind: ReportKind,
        domains: usize,
    },

    /// A report stage had nothing to send
    ReportSkipped { job_id: String, kind: ReportKind },

    /// A stage finished and its successor was checkpointed
    StageCompleted { job_id: String, stage: Stage },

    /// The job reached DONE
    JobCompleted { job_id: String },

    /// The invocation stopped at a stage; the job resumes there next time
    JobFailed {
        job_id: String,
        stage: Stage,
        error: String,
    },
}

/// Result of one invocation
///
/// [`RefreshEngine::run`] never fails; every failure is folded into
/// [`RunOutcome::Failed`] after being logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The job ran through DONE
    Completed { job_id: String },

    /// Another invocation holds the lease
    LockBusy,

    /// No completed blocklist download yet
    NothingToDo,

    /// The job handed in was already DONE (nothing was executed)
    AlreadyDone { job_id: String },

    /// The invocation stopped early; the checkpoint is unchanged from the
    /// failing stage
    Failed {
        job_id: Option<String>,
        stage: Option<Stage>,
        error: String,
    },
}

impl RunOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, RunOutcome::Failed { .. })
    }
}

/// Registry collaborators the engine reads from
#[derive(Clone)]
pub struct RegistrySources {
    pub view: Arc<dyn RegistryView>,
    pub downloads: Arc<dyn DownloadStatus>,
}

impl RegistrySources {
    /// Use one object for both roles
    pub fn from_shared<R>(registry: Arc<R>) -> Self
    where
        R: RegistryView + DownloadStatus + 'static,
    {
        Self {
            view: registry.clone(),
            downloads: registry,
        }
    }
}

/// Core refresh engine
///
/// ## Lifecycle
///
/// 1. Create with [`RefreshEngine::new()`]
/// 2. Call [`RefreshEngine::run()`] once per trigger
/// 3. Drain the event receiver (or drop it; events are best-effort)
pub struct RefreshEngine {
    lock: RefreshLock,
    scheduler: RefreshScheduler,
    reconciler: Reconciler,
    jobs: Arc<dyn RefreshJobStore>,
    change_log: Arc<dyn ChangeLogStore>,
    store: Arc<dyn UnblockableStore>,
    sender: Box<dyn ReportSender>,
    transaction_batch_size: usize,
    reason_change_policy: ReasonChangePolicy,
    event_tx: mpsc::Sender<EngineEvent>,
}

impl RefreshEngine {
    /// Create a new refresh engine
    ///
    /// # Parameters
    ///
    /// - `stores`: Job, change log, unblockable and lease stores
    /// - `registry`: Registry view and download status
    /// - `sender`: Report sender implementation
    /// - `clock`: Time source
    /// - `config`: Refresh configuration (storage/reporter sections are
    ///   validated but already materialized in `stores`/`sender`)
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields engine events
    pub fn new(
        stores: Stores,
        registry: RegistrySources,
        sender: Box<dyn ReportSender>,
        clock: Arc<dyn Clock>,
        config: &RefreshConfig,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity);

        let lock = RefreshLock::from_config(stores.leases.clone(), &config.lock, clock.clone());
        let scheduler = RefreshScheduler::new(
            stores.jobs.clone(),
            registry.downloads.clone(),
            clock.clone(),
        );
        let reconciler = Reconciler::new(
            registry.view,
            registry.downloads,
            stores.unblockable.clone(),
            clock,
        )
        .with_commit_time_lag(config.engine.commit_time_lag());

        let engine = Self {
            lock,
            scheduler,
            reconciler,
            jobs: stores.jobs,
            change_log: stores.change_log,
            store: stores.unblockable,
            sender,
            transaction_batch_size: config.engine.transaction_batch_size,
            reason_change_policy: config.engine.reason_change_policy,
            event_tx: tx,
        };

        Ok((engine, rx))
    }

    /// Run one refresh invocation
    ///
    /// Acquires the lease, loads or creates the job and drives it to DONE.
    /// Never returns an error: the outcome says what happened and every
    /// failure has already been logged.
    pub async fn run(&self) -> RunOutcome {
        let result = self
            .lock
            .execute_with_lock(|| async {
                match self.scheduler.schedule().await? {
                    Some(schedule) => Ok(self.drive(schedule).await),
                    None => {
                        self.emit_event(EngineEvent::NothingToDo);
                        Ok(RunOutcome::NothingToDo)
                    }
                }
            })
            .await;

        self.settle(result)
    }

    /// Drive a specific job under the lease
    ///
    /// Used to resume a job picked outside the scheduler. A job that is
    /// already DONE is logged and left alone.
    pub async fn run_schedule(&self, schedule: RefreshSchedule) -> RunOutcome {
        let result = self
            .lock
            .execute_with_lock(move || async move { Ok(self.drive(schedule).await) })
            .await;

        self.settle(result)
    }

    fn settle(&self, result: Result<Option<RunOutcome>>) -> RunOutcome {
        match result {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                info!("Refresh lease {} is held elsewhere, skipping", self.lock.name());
                self.emit_event(EngineEvent::LockBusy);
                RunOutcome::LockBusy
            }
            Err(e) => {
                error!("Refresh invocation failed before any stage ran: {}", e);
                RunOutcome::Failed {
                    job_id: None,
                    stage: None,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Execute stages from the checkpoint until DONE or the first failure
    async fn drive(&self, mut schedule: RefreshSchedule) -> RunOutcome {
        let job_id = schedule.job_id().to_string();

        if schedule.stage().is_done() {
            warn!("Refresh job {} is already DONE, nothing to execute", job_id);
            return RunOutcome::AlreadyDone { job_id };
        }

        info!("Running refresh job {} from {}", job_id, schedule.stage());
        self.emit_event(EngineEvent::JobScheduled {
            job_id: job_id.clone(),
            stage: schedule.stage(),
        });

        while !schedule.stage().is_done() {
            let stage = schedule.stage();

            let result = match self.execute_stage(&job_id, stage).await {
                Ok(()) => schedule.advance(&*self.jobs, stage.next()).await,
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                if e.is_transient() {
                    error!(
                        "Refresh job {} failed at {}: {}. Will resume at {} on the next invocation.",
                        job_id, stage, e, stage
                    );
                } else {
                    error!("Refresh job {} failed at {}: {}", job_id, stage, e);
                }
                self.emit_event(EngineEvent::JobFailed {
                    job_id: job_id.clone(),
                    stage,
                    error: e.to_string(),
                });
                return RunOutcome::Failed {
                    job_id: Some(job_id),
                    stage: Some(stage),
                    error: e.to_string(),
                };
            }

            info!("Refresh job {} finished {}", job_id, stage);
            self.emit_event(EngineEvent::StageCompleted {
                job_id: job_id.clone(),
                stage,
            });
        }

        info!("Refresh job {} completed", job_id);
        self.emit_event(EngineEvent::JobCompleted {
            job_id: job_id.clone(),
        });
        RunOutcome::Completed { job_id }
    }

    async fn execute_stage(&self, job_id: &str, stage: Stage) -> Result<()> {
        match stage {
            Stage::MakeDiff => self.make_diff(job_id).await,
            Stage::ApplyDiff => self.apply_diff(job_id).await,
            Stage::ReportRemovals => self.report(job_id, ReportKind::Removals).await,
            Stage::ReportAdditions => self.report(job_id, ReportKind::Additions).await,
            Stage::Done => Ok(()),
        }
    }

    async fn make_diff(&self, job_id: &str) -> Result<()> {
        // Resumed after the log was written but before the checkpoint
        if self.change_log.exists(job_id).await? {
            let stored = self.change_log.read(job_id).await?;
            warn!(
                "Change log for job {} already exists ({} changes), skipping diff computation",
                job_id,
                stored.len()
            );
            self.emit_event(EngineEvent::DiffRecorded {
                job_id: job_id.to_string(),
                changes: stored.len(),
                already_present: true,
            });
            return Ok(());
        }

        let changes = self.reconciler.compute_diff().await?;

        let (recorded, already_present) = match self.change_log.write(job_id, &changes).await? {
            WriteOutcome::Written => (changes.len(), false),
            WriteOutcome::AlreadyPresent => {
                let stored = self.change_log.read(job_id).await?;
                warn!(
                    "Change log for job {} already exists ({} changes), keeping it and discarding the recomputed diff ({} changes)",
                    job_id,
                    stored.len(),
                    changes.len()
                );
                (stored.len(), true)
            }
        };

        self.emit_event(EngineEvent::DiffRecorded {
            job_id: job_id.to_string(),
            changes: recorded,
            already_present,
        });
        Ok(())
    }

    async fn apply_diff(&self, job_id: &str) -> Result<()> {
        let changes = self.change_log.read(job_id).await?;

        for chunk in changes.chunks(self.transaction_batch_size) {
            let mut upserts = Vec::new();
            let mut deletes = Vec::new();
            for change in chunk {
                match change.kind {
                    ChangeKind::New | ChangeKind::ReasonChanged => {
                        upserts.push(change.domain.clone())
                    }
                    ChangeKind::Removed => deletes.push(change.domain.domain_name.clone()),
                }
            }

            self.store.apply_batch(&upserts, &deletes).await?;
            debug!(
                "Job {}: applied {} upserts, {} deletes",
                job_id,
                upserts.len(),
                deletes.len()
            );
            self.emit_event(EngineEvent::BatchApplied {
                job_id: job_id.to_string(),
                upserts: upserts.len(),
                deletes: deletes.len(),
            });
        }
        Ok(())
    }

    async fn report(&self, job_id: &str, kind: ReportKind) -> Result<()> {
        let changes = self.change_log.read(job_id).await?;
        let batch = match kind {
            ReportKind::Removals => removals_batch(&changes, self.reason_change_policy),
            ReportKind::Additions => additions_batch(&changes, self.reason_change_policy),
        };

        if batch.is_empty() {
            debug!("Job {}: no {:?} to report", job_id, kind);
            self.emit_event(EngineEvent::ReportSkipped {
                job_id: job_id.to_string(),
                kind,
            });
            return Ok(());
        }

        let sent = match kind {
            ReportKind::Removals => self.sender.send_removals(&batch).await,
            ReportKind::Additions => self.sender.send_additions(&batch).await,
        };
        sent.inspect_err(|e| {
            warn!(
                "Sender {} failed to deliver {:?} for job {}: {}",
                self.sender.sender_name(),
                kind,
                job_id,
                e
            )
        })?;

        info!(
            "Job {}: reported {} {:?} via {}",
            job_id,
            batch.len(),
            kind,
            self.sender.sender_name()
        );
        self.emit_event(EngineEvent::ReportSent {
            job_id: job_id.to_string(),
            kind,
            domains: batch.len(),
        });
        Ok(())
    }

    /// Emit an engine event
    fn emit_event(&self, event: EngineEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Event receiver dropped, discarding event");
            }
        }
    }
}

/// Names no longer unblockable under their previous reason
///
/// With [`ReasonChangePolicy::ReportAsRemoveAndAdd`] a reason flip is
/// reported as a removal under the old reason.
pub fn removals_batch(changes: &[UnblockableDomainChange], policy: ReasonChangePolicy) -> ReportBatch {
    let mut batch = ReportBatch::new();
    for change in changes {
        match (change.kind, change.previous_reason, policy) {
            (ChangeKind::Removed, _, _) => batch.push(change.domain.reason, change.domain_name()),
            (ChangeKind::ReasonChanged, Some(previous), ReasonChangePolicy::ReportAsRemoveAndAdd) => {
                batch.push(previous, change.domain_name())
            }
            _ => {}
        }
    }
    batch
}

/// Names newly unblockable (or unblockable under a new reason)
pub fn additions_batch(changes: &[UnblockableDomainChange], policy: ReasonChangePolicy) -> ReportBatch {
    let mut batch = ReportBatch::new();
    for change in changes {
        match (change.kind, policy) {
            (ChangeKind::New, _)
            | (ChangeKind::ReasonChanged, ReasonChangePolicy::ReportAsRemoveAndAdd) => {
                batch.push(change.domain.reason, change.domain_name())
            }
            _ => {}
        }
    }
    batch
}

impl std::fmt::Debug for RefreshEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshEngine")
            .field("lock", &self.lock.name())
            .field("sender", &self.sender.sender_name())
            .field("transaction_batch_size", &self.transaction_batch_size)
            .field("reason_change_policy", &self.reason_change_policy)
            .finish_non_exhaustive()
    }
}
