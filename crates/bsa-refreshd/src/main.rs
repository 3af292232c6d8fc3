// # bsa-refreshd - BSA Refresh Daemon
//
// This daemon is a THIN trigger around `bsa_core::RefreshEngine`:
// - DO NOT add reconciliation, reporting or retry logic here
// - All refresh logic lives in bsa-core
// - Configuration is via environment variables ONLY
//
// The daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing tracing and the runtime
// 3. Registering report senders
// 4. Triggering one refresh invocation per interval (or once)
//
// ## Configuration
//
// ### Registry
// - `BSA_REGISTRY_SNAPSHOT`: Path to the JSON registry snapshot, re-read on
//   every invocation
//
// ### Storage
// - `BSA_STORAGE_DIR`: Directory for jobs, change logs, leases and the
//   unblockable set (shared by all workers). Unset means in-memory.
//
// ### Reporter
// - `BSA_REPORTER_TYPE`: Reporter type (http)
// - `BSA_REPORT_BASE_URL`: BSA reporting API base URL
// - `BSA_REPORT_API_KEY`: API key
// - `BSA_REPORT_ADDITIONS_PATH` / `BSA_REPORT_REMOVALS_PATH`: Endpoint paths
//   (optional)
// - `BSA_DRY_RUN`: Log reports instead of sending them (true/false)
//
// ### Refresh
// - `BSA_REFRESH_INTERVAL_SECS`: Seconds between invocations
// - `BSA_RUN_ONCE`: Run a single invocation and exit (true/false)
// - `BSA_TRANSACTION_BATCH_SIZE`: Changes per unblockable store transaction
// - `BSA_COMMIT_TIME_LAG_MS`: Registry commit-time lag in milliseconds
// - `BSA_LEASE_SECS`: Refresh lease duration
// - `BSA_REASON_CHANGE_POLICY`: report_as_remove_and_add | absorb_locally
// - `BSA_LOG_LEVEL`: trace, debug, info, warn, error
//
// ## Example
//
// ```bash
// export BSA_REGISTRY_SNAPSHOT=/var/lib/bsa/registry.json
// export BSA_STORAGE_DIR=/var/lib/bsa/state
// export BSA_REPORT_BASE_URL=https://bsa.example.net/api
// export BSA_REPORT_API_KEY=your_key
// export BSA_REFRESH_INTERVAL_SECS=300
//
// bsa-refreshd
// ```

use anyhow::{Context, Result};
use bsa_core::{
    Clock, EngineEvent, MemoryRegistry, ReasonChangePolicy, RefreshConfig, RefreshEngine,
    RegistrySources, ReporterConfig, RunOutcome, SenderRegistry, StorageConfig, Stores,
    SystemClock,
};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown (or a run-once invocation that did not fail)
/// - 1: Configuration or startup error
/// - 2: Runtime error, including a failed run-once invocation
#[derive(Debug, Clone, Copy)]
enum RefreshdExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<RefreshdExitCode> for ExitCode {
    fn from(code: RefreshdExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;

/// Application configuration
struct Config {
    registry_snapshot: PathBuf,
    storage_dir: Option<String>,
    reporter_type: String,
    report_base_url: String,
    report_api_key: String,
    report_additions_path: Option<String>,
    report_removals_path: Option<String>,
    dry_run: bool,
    refresh_interval_secs: u64,
    run_once: bool,
    transaction_batch_size: Option<usize>,
    commit_time_lag_ms: Option<u64>,
    lease_secs: Option<u64>,
    reason_change_policy: Option<String>,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load configuration through a variable lookup
    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            registry_snapshot: var("BSA_REGISTRY_SNAPSHOT")
                .map(PathBuf::from)
                .context("BSA_REGISTRY_SNAPSHOT is required")?,
            storage_dir: var("BSA_STORAGE_DIR"),
            reporter_type: var("BSA_REPORTER_TYPE").unwrap_or_else(|| "http".to_string()),
            report_base_url: var("BSA_REPORT_BASE_URL").unwrap_or_default(),
            report_api_key: var("BSA_REPORT_API_KEY").unwrap_or_default(),
            report_additions_path: var("BSA_REPORT_ADDITIONS_PATH"),
            report_removals_path: var("BSA_REPORT_REMOVALS_PATH"),
            dry_run: parse_var(&var, "BSA_DRY_RUN")?.unwrap_or(false),
            refresh_interval_secs: parse_var(&var, "BSA_REFRESH_INTERVAL_SECS")?
                .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS),
            run_once: parse_var(&var, "BSA_RUN_ONCE")?.unwrap_or(false),
            transaction_batch_size: parse_var(&var, "BSA_TRANSACTION_BATCH_SIZE")?,
            commit_time_lag_ms: parse_var(&var, "BSA_COMMIT_TIME_LAG_MS")?,
            lease_secs: parse_var(&var, "BSA_LEASE_SECS")?,
            reason_change_policy: var("BSA_REASON_CHANGE_POLICY"),
            log_level: var("BSA_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    ///
    /// Covers required fields, supported types, numeric ranges and obvious
    /// placeholder secrets. Library-level checks run again in
    /// [`RefreshConfig::validate`].
    fn validate(&self) -> Result<()> {
        if self.registry_snapshot.as_os_str().is_empty() {
            anyhow::bail!("BSA_REGISTRY_SNAPSHOT cannot be empty");
        }

        match self.reporter_type.as_str() {
            "http" => {}
            _ => anyhow::bail!(
                "BSA_REPORTER_TYPE '{}' is not supported. \
                Supported reporters: http",
                self.reporter_type
            ),
        }

        if self.report_base_url.is_empty() {
            anyhow::bail!(
                "BSA_REPORT_BASE_URL is required. \
                Set it via: export BSA_REPORT_BASE_URL=https://bsa.example.net/api"
            );
        }
        if !self.report_base_url.starts_with("https://")
            && !self.report_base_url.starts_with("http://")
        {
            anyhow::bail!(
                "BSA_REPORT_BASE_URL must use HTTP or HTTPS scheme. Got: {}",
                self.report_base_url
            );
        }
        if self.report_base_url.starts_with("http://") {
            eprintln!(
                "WARNING: BSA_REPORT_BASE_URL uses HTTP (not HTTPS). \
                The API key will be sent in clear text."
            );
        }

        if self.report_api_key.is_empty() {
            anyhow::bail!(
                "BSA_REPORT_API_KEY is required. \
                Set it via: export BSA_REPORT_API_KEY=your_key"
            );
        }
        let key_lower = self.report_api_key.to_lowercase();
        if key_lower.contains("your_key") || key_lower.contains("replace_me") || key_lower == "key"
        {
            anyhow::bail!(
                "BSA_REPORT_API_KEY appears to be a placeholder. \
                Use the API key issued by the BSA."
            );
        }

        if let Some(ref dir) = self.storage_dir {
            if dir.is_empty() {
                anyhow::bail!("BSA_STORAGE_DIR cannot be empty when set");
            }
            let path = std::path::Path::new(dir);
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                anyhow::bail!(
                    "BSA_STORAGE_DIR parent directory does not exist: {}. \
                    Create it first: sudo mkdir -p {}",
                    parent.display(),
                    parent.display()
                );
            }
        }

        if !(10..=86_400).contains(&self.refresh_interval_secs) {
            anyhow::bail!(
                "BSA_REFRESH_INTERVAL_SECS must be between 10 and 86400 seconds. Got: {}",
                self.refresh_interval_secs
            );
        }

        if let Some(batch_size) = self.transaction_batch_size
            && !(1..=10_000).contains(&batch_size)
        {
            anyhow::bail!(
                "BSA_TRANSACTION_BATCH_SIZE must be between 1 and 10000. Got: {}",
                batch_size
            );
        }

        if let Some(lag) = self.commit_time_lag_ms
            && lag > 60_000
        {
            anyhow::bail!(
                "BSA_COMMIT_TIME_LAG_MS must be at most 60000 milliseconds. Got: {}",
                lag
            );
        }

        if let Some(lease) = self.lease_secs
            && !(1..=3600).contains(&lease)
        {
            anyhow::bail!(
                "BSA_LEASE_SECS must be between 1 and 3600 seconds. Got: {}",
                lease
            );
        }

        self.reason_change_policy()?;

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "BSA_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    fn reason_change_policy(&self) -> Result<Option<ReasonChangePolicy>> {
        match self.reason_change_policy.as_deref() {
            None => Ok(None),
            Some("report_as_remove_and_add") => Ok(Some(ReasonChangePolicy::ReportAsRemoveAndAdd)),
            Some("absorb_locally") => Ok(Some(ReasonChangePolicy::AbsorbLocally)),
            Some(other) => anyhow::bail!(
                "BSA_REASON_CHANGE_POLICY '{}' is not valid. \
                Valid policies: report_as_remove_and_add, absorb_locally",
                other
            ),
        }
    }

    /// Library configuration for the engine and stores
    fn refresh_config(&self) -> Result<RefreshConfig> {
        let mut reporter = ReporterConfig::http(
            self.report_base_url.clone(),
            self.report_api_key.clone(),
            self.dry_run,
        );
        if let ReporterConfig::Http {
            additions_path,
            removals_path,
            ..
        } = &mut reporter
        {
            if let Some(path) = &self.report_additions_path {
                *additions_path = path.clone();
            }
            if let Some(path) = &self.report_removals_path {
                *removals_path = path.clone();
            }
        }

        let mut config = RefreshConfig::new(reporter);
        config.storage = match &self.storage_dir {
            Some(dir) => StorageConfig::File { dir: dir.clone() },
            None => StorageConfig::Memory,
        };
        if let Some(batch_size) = self.transaction_batch_size {
            config.engine.transaction_batch_size = batch_size;
        }
        if let Some(lag) = self.commit_time_lag_ms {
            config.engine.commit_time_lag_ms = lag;
        }
        if let Some(lease) = self.lease_secs {
            config.lock.lease_duration_secs = lease;
        }
        if let Some(policy) = self.reason_change_policy()? {
            config.engine.reason_change_policy = policy;
        }

        config.validate()?;
        Ok(config)
    }

    fn log_level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// Parse an optional variable, rejecting malformed values
fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", key, raw, e)),
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return RefreshdExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return RefreshdExitCode::ConfigError.into();
    }

    let refresh_config = match config.refresh_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration validation error: {}", e);
            return RefreshdExitCode::ConfigError.into();
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return RefreshdExitCode::ConfigError.into();
    }

    info!("Starting bsa-refreshd daemon");
    info!(
        "Registry snapshot: {}, storage: {}",
        config.registry_snapshot.display(),
        config.storage_dir.as_deref().unwrap_or("in-memory")
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return RefreshdExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        match run_daemon(&config, &refresh_config).await {
            Ok(()) => RefreshdExitCode::CleanShutdown,
            Err(e) => {
                error!("Daemon error: {:#}", e);
                RefreshdExitCode::RuntimeError
            }
        }
    });

    result.into()
}

/// Run the daemon until a shutdown signal (or after one invocation)
async fn run_daemon(config: &Config, refresh_config: &RefreshConfig) -> Result<()> {
    let senders = SenderRegistry::new();

    #[cfg(feature = "http")]
    {
        info!("Registering HTTP report sender");
        bsa_report_http::register(&senders);
    }

    if !senders.has_sender(refresh_config.reporter.type_name()) {
        anyhow::bail!(
            "Reporter type '{}' is not compiled in. Available: {:?}",
            refresh_config.reporter.type_name(),
            senders.list_senders()
        );
    }

    if matches!(refresh_config.storage, StorageConfig::Memory) {
        warn!("BSA_STORAGE_DIR is not set; refresh state will not survive a restart");
    }
    let stores = Stores::from_config(&refresh_config.storage)
        .await
        .context("Failed to open refresh stores")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if config.run_once {
        let outcome = refresh_once(config, refresh_config, &stores, &senders, clock).await?;
        if outcome.is_failed() {
            anyhow::bail!("Refresh invocation failed: {:?}", outcome);
        }
        return Ok(());
    }

    let interval = Duration::from_secs(config.refresh_interval_secs);
    info!("Triggering a refresh every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                info!("Received shutdown signal: {}", signal?);
                info!("Shutting down daemon");
                return Ok(());
            }
            _ = ticker.tick() => {
                // Failures are already logged and retried on the next tick
                if let Err(e) =
                    refresh_once(config, refresh_config, &stores, &senders, clock.clone()).await
                {
                    error!("Refresh invocation could not start: {:#}", e);
                }
            }
        }
    }
}

/// Build an engine over the current registry snapshot and run it once
async fn refresh_once(
    config: &Config,
    refresh_config: &RefreshConfig,
    stores: &Stores,
    senders: &SenderRegistry,
    clock: Arc<dyn Clock>,
) -> Result<RunOutcome> {
    let registry = Arc::new(
        MemoryRegistry::from_file(&config.registry_snapshot)
            .await
            .context("Failed to load registry snapshot")?,
    );
    let sender = senders
        .create_sender(&refresh_config.reporter)
        .context("Failed to create report sender")?;

    let (engine, events) = RefreshEngine::new(
        stores.clone(),
        RegistrySources::from_shared(registry),
        sender,
        clock,
        refresh_config,
    )?;
    let logger = tokio::spawn(log_events(events));

    let outcome = engine.run().await;
    drop(engine);

    if let Err(e) = logger.await {
        warn!("Event logger task failed: {}", e);
    }

    match &outcome {
        RunOutcome::Completed { job_id } => info!("Refresh job {} completed", job_id),
        RunOutcome::LockBusy => info!("Another worker is refreshing, skipped"),
        RunOutcome::NothingToDo => info!("No completed blocklist download yet, skipped"),
        RunOutcome::AlreadyDone { job_id } => info!("Refresh job {} was already done", job_id),
        RunOutcome::Failed { job_id, stage, .. } => warn!(
            "Refresh stopped (job {:?}, stage {:?}); it will resume on the next trigger",
            job_id, stage
        ),
    }
    Ok(outcome)
}

/// Log engine events until the engine is dropped
async fn log_events(events: mpsc::Receiver<EngineEvent>) {
    let mut stream = ReceiverStream::new(events);
    while let Some(event) = stream.next().await {
        match event {
            EngineEvent::JobScheduled { job_id, stage } => {
                debug!("Job {} scheduled at {}", job_id, stage)
            }
            EngineEvent::DiffRecorded {
                job_id,
                changes,
                already_present,
            } => debug!(
                "Job {}: {} change(s) in change log (pre-existing: {})",
                job_id, changes, already_present
            ),
            EngineEvent::BatchApplied {
                job_id,
                upserts,
                deletes,
            } => debug!("Job {}: batch of {} upserts, {} deletes", job_id, upserts, deletes),
            EngineEvent::ReportSent {
                job_id,
                kind,
                domains,
            } => debug!("Job {}: reported {} {:?}", job_id, domains, kind),
            other => debug!("Engine event: {:?}", other),
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(received)
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
