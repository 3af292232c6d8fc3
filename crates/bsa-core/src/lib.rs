// # bsa-core
//
// Core library for the BSA unblockable-domain refresh pipeline.
//
// ## Architecture Overview
//
// A periodic trigger runs one refresh invocation. Each invocation:
// - **RefreshLock**: Takes a cluster-wide lease (or skips the run)
// - **RefreshScheduler**: Resumes the unfinished job or creates a new one
// - **Reconciler**: Derives the unblockable set from registry state and diffs it
// - **ChangeLogStore**: Records the diff once per job
// - **UnblockableStore**: Receives the diff in batched transactions
// - **ReportSender**: Reports removals, then additions, to the BSA
// - **RefreshEngine**: Drives the stages and checkpoints after each one
//
// ## Design Principles
//
// 1. **Resumability**: A durable stage checkpoint, never trigger-level retries
// 2. **Idempotency**: Every stage can be re-run with the same effect
// 3. **Plugin-Based**: Report senders are registered by type name
// 4. **Library-First**: The daemon is a thin shell around `RefreshEngine`

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod model;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod traits;

// Re-export core types for convenience
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{
    EngineConfig, LockConfig, ReasonChangePolicy, RefreshConfig, ReporterConfig, StorageConfig,
};
pub use engine::{EngineEvent, RefreshEngine, RegistrySources, ReportKind, RunOutcome};
pub use error::{Error, Result};
pub use lock::RefreshLock;
pub use model::{
    ChangeKind, Reason, RefreshJob, ReservationType, Stage, UnblockableDomain,
    UnblockableDomainChange,
};
pub use reconciler::Reconciler;
pub use registry::SenderRegistry;
pub use scheduler::{RefreshSchedule, RefreshScheduler};
pub use state::{MemoryRegistry, Stores};
pub use traits::{ReportBatch, ReportSender, ReportSenderFactory};
