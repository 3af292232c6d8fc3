// # BSA HTTP Report Sender
//
// This crate provides the HTTP report sender for the BSA refresh pipeline.
//
// ## Behavior
//
// - ✅ One POST per report stage (additions or removals)
// - ✅ Body is the reason-keyed JSON document, pretty-printed
// - ✅ HTTP timeout configured (30 seconds)
// - ✅ Specific error handling for HTTP status codes (401, 403, 404, 429, 5xx)
// - ✅ Dry-run mode for safe testing
// - ❌ NO retry logic (a failed stage is re-run on the next invocation)
// - ❌ NO batching or splitting (the batch is sent as handed in)
// - ❌ NO background tasks
//
// ## Trust Level: Untrusted (Report Sender)
//
// **Allowed Capabilities**:
// - ✅ Perform HTTP/HTTPS API calls to the configured BSA endpoints only
// - ✅ Serialize the batch document
//
// **Forbidden Capabilities** (enforced by code review):
// - ❌ Spawn tasks or threads
// - ❌ Implement retry logic (owned by the stage machine)
// - ❌ Access the change log or unblockable store
//
// ## Security Requirements
//
// - API key NEVER appears in logs or `Debug` output
// - Sender MUST fail fast if the key is empty
//
// ## API Reference
//
// - Report additions: POST `{base_url}{additions_path}`
// - Report removals: POST `{base_url}{removals_path}`
// - Both take `{"<reason>": ["<domain>", ...]}` with reason in lower case

use async_trait::async_trait;
use bsa_core::config::ReporterConfig;
use bsa_core::traits::{ReportBatch, ReportSender, ReportSenderFactory};
use bsa_core::{Error, Result};
use reqwest::StatusCode;
use std::time::Duration;

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Reporter type name this crate registers under
pub const SENDER_NAME: &str = "http";

/// Which endpoint a request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Additions,
    Removals,
}

impl Endpoint {
    fn label(self) -> &'static str {
        match self {
            Endpoint::Additions => "additions",
            Endpoint::Removals => "removals",
        }
    }
}

/// HTTP report sender for the BSA reporting API
///
/// # Trust Level: Untrusted
///
/// Stateless and single-shot. Retry happens on the next refresh invocation,
/// from the durable stage checkpoint.
///
/// # Dry-Run Mode
///
/// When `dry_run` is true, the sender logs the target URL and the document
/// it would have posted, and reports success without any network call.
pub struct HttpReportSender {
    base_url: String,

    /// ⚠️ NEVER log this value
    api_key: String,

    additions_path: String,
    removals_path: String,
    client: reqwest::Client,
    dry_run: bool,
}

// Custom Debug implementation that hides the API key
impl std::fmt::Debug for HttpReportSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpReportSender")
            .field("base_url", &self.base_url)
            .field("api_key", &"<REDACTED>")
            .field("additions_path", &self.additions_path)
            .field("removals_path", &self.removals_path)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl HttpReportSender {
    /// Create a new HTTP report sender
    ///
    /// # Parameters
    ///
    /// - `base_url`: API base URL (a trailing `/` is ignored)
    /// - `api_key`: Bearer key for the reporting API
    /// - `additions_path`, `removals_path`: Endpoint paths under `base_url`
    /// - `dry_run`: If true, log payloads instead of sending them
    ///
    /// # Errors
    ///
    /// Returns a config error if the key is empty or the HTTP client cannot
    /// be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        additions_path: impl Into<String>,
        removals_path: impl Into<String>,
        dry_run: bool,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(Error::config("BSA reporting API key cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            additions_path: additions_path.into(),
            removals_path: removals_path.into(),
            client,
            dry_run,
        })
    }

    /// Create a sender from a [`ReporterConfig::Http`]
    pub fn from_config(config: &ReporterConfig) -> Result<Self> {
        match config {
            ReporterConfig::Http {
                base_url,
                api_key,
                additions_path,
                removals_path,
                dry_run,
            } => Self::new(
                base_url.clone(),
                api_key.clone(),
                additions_path.clone(),
                removals_path.clone(),
                *dry_run,
            ),
            _ => Err(Error::config("Invalid config for HTTP report sender")),
        }
    }

    fn url(&self, endpoint: Endpoint) -> String {
        let path = match endpoint {
            Endpoint::Additions => &self.additions_path,
            Endpoint::Removals => &self.removals_path,
        };
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, endpoint: Endpoint, batch: &ReportBatch) -> Result<()> {
        let url = self.url(endpoint);
        let body = batch.to_json_pretty()?;

        tracing::info!(
            "Reporting {} unblockable {} to BSA [mode: {}]",
            batch.len(),
            endpoint.label(),
            if self.dry_run { "DRY-RUN" } else { "LIVE" }
        );

        if self.dry_run {
            tracing::info!("[DRY-RUN] Would POST to {} with payload: {}", url, body);
            return Ok(());
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::http(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(status_error(endpoint, status, &error_text));
        }

        tracing::debug!("BSA accepted {} report ({})", endpoint.label(), status);
        Ok(())
    }
}

/// Map a non-success status to a pipeline error
fn status_error(endpoint: Endpoint, status: StatusCode, error_text: &str) -> Error {
    match status.as_u16() {
        401 | 403 => Error::auth(format!(
            "BSA rejected the API key for {}. Status: {}",
            endpoint.label(),
            status
        )),
        404 => Error::not_found(format!(
            "BSA {} endpoint not found. Status: {}",
            endpoint.label(),
            status
        )),
        429 => Error::rate_limited(format!(
            "BSA rate limit exceeded for {}. Status: {}",
            endpoint.label(),
            status
        )),
        500..=599 => Error::http(format!(
            "BSA server error (transient) for {}: {} - {}",
            endpoint.label(),
            status,
            error_text
        )),
        _ => Error::report(format!(
            "BSA {} report failed: {} - {}",
            endpoint.label(),
            status,
            error_text
        )),
    }
}

#[async_trait]
impl ReportSender for HttpReportSender {
    async fn send_additions(&self, batch: &ReportBatch) -> Result<()> {
        self.post(Endpoint::Additions, batch).await
    }

    async fn send_removals(&self, batch: &ReportBatch) -> Result<()> {
        self.post(Endpoint::Removals, batch).await
    }

    fn sender_name(&self) -> &'static str {
        SENDER_NAME
    }
}

pub struct HttpReportSenderFactory;

impl ReportSenderFactory for HttpReportSenderFactory {
    fn create(&self, config: &ReporterConfig) -> Result<Box<dyn ReportSender>> {
        config.validate()?;
        let sender = HttpReportSender::from_config(config)?;
        if sender.dry_run {
            tracing::warn!("HTTP report sender running in DRY-RUN mode - nothing will be reported");
        }
        Ok(Box::new(sender))
    }
}

pub fn register(registry: &bsa_core::SenderRegistry) {
    registry.register_sender(SENDER_NAME, Box::new(HttpReportSenderFactory));
}
