//! # SBQ Courier
//!
//! Command-line courier for one Azure Service Bus queue.
//!
//! A run is strictly linear:
//! - resolve ambient credentials
//! - build a queue client for `sbns-yym-<ENV>-usce.servicebus.windows.net`
//! - send one message to `sbq-yym-<ENV>-usce`
//! - in `send-receive` mode, drain one batch, printing each body to stdout
//! - release the client
//!
//! Settings come from built-in defaults, an optional TOML file, `SBQ__`
//! environment variables and finally command-line flags, in that order.

use clap::{Parser, ValueEnum};
use sbq_runtime::{
    resolve_credentials, AckPolicy, AzureServiceBusConfig, CancellationToken, Message, MessageId,
    OperationContext, OperationError, ProviderConfig, QueueClient, QueueConfig,
    QueueClientFactory, QueueName, ReceiveOptions, ReceiveReport, ResourceNames,
    StaticTokenSource, TokenSource, ValidationError, MAX_RECEIVE_BATCH,
};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Body sent when none is configured
pub const DEFAULT_MESSAGE: &str = "super cool message";

/// Prefix for layered environment configuration, e.g. `SBQ__MAX_MESSAGES=10`
pub const CONFIG_ENV_PREFIX: &str = "SBQ";

// ============================================================================
// CLI Structure
// ============================================================================

/// SBQ Courier - send to and drain an Azure Service Bus queue
#[derive(Parser, Debug)]
#[command(name = "sbq-courier")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Send a message to an Azure Service Bus queue and drain one batch")]
#[command(
    long_about = "Sends one message to sbq-yym-<ENV>-usce on sbns-yym-<ENV>-usce.servicebus.windows.net \
                  using ambient Azure credentials, then optionally receives up to 99 messages, \
                  printing and completing each one"
)]
pub struct Cli {
    /// Environment token substituted into the namespace and queue names
    #[arg(short, long, env = "ENV")]
    pub environment: Option<String>,

    /// Whether to receive after sending
    #[arg(short, long, env = "SBQ_MODE", value_enum)]
    pub mode: Option<Mode>,

    /// Body of the message to send
    #[arg(long, env = "SBQ_MESSAGE")]
    pub message: Option<String>,

    /// Maximum number of messages to receive (1-99)
    #[arg(long)]
    pub max_messages: Option<u32>,

    /// How long to wait for the first message of the batch
    #[arg(long)]
    pub receive_timeout_seconds: Option<u64>,

    /// Deadline applied to each remote operation
    #[arg(long)]
    pub timeout_seconds: Option<u64>,

    /// How a failed completion affects the rest of the batch
    #[arg(long, value_enum)]
    pub ack_policy: Option<AckPolicyArg>,

    /// Queue backend
    #[arg(long, value_enum)]
    pub provider: Option<ProviderKind>,

    /// Configuration file path (TOML)
    #[arg(short, long, env = "SBQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level, used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,
}

/// Run modes
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Send one message and stop
    Send,
    /// Send one message, then receive and complete one batch
    SendReceive,
}

/// Queue backends selectable from the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Azure Service Bus over its REST API
    AzureServiceBus,
    /// Process-local queue, for dry runs
    InMemory,
}

/// Acknowledgement policy options
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckPolicyArg {
    /// Abort the batch at the first failed completion
    StopOnFirstFailure,
    /// Complete every message and report failures together
    BestEffort,
}

impl From<AckPolicyArg> for AckPolicy {
    fn from(value: AckPolicyArg) -> Self {
        match value {
            AckPolicyArg::StopOnFirstFailure => AckPolicy::StopOnFirstFailure,
            AckPolicyArg::BestEffort => AckPolicy::BestEffort,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Resolved courier settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub environment: String,
    pub mode: Mode,
    pub message: String,
    pub max_messages: u32,
    pub receive_timeout_seconds: u64,
    pub timeout_seconds: Option<u64>,
    pub ack_policy: AckPolicyArg,
    pub provider: ProviderKind,
    /// Service Bus base URL override, e.g. a local emulator
    pub endpoint: Option<String>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            environment: String::new(),
            mode: Mode::SendReceive,
            message: DEFAULT_MESSAGE.to_string(),
            max_messages: MAX_RECEIVE_BATCH,
            receive_timeout_seconds: 60,
            timeout_seconds: None,
            ack_policy: AckPolicyArg::StopOnFirstFailure,
            provider: ProviderKind::AzureServiceBus,
            endpoint: None,
        }
    }
}

impl CourierConfig {
    /// Apply explicit command-line values on top of the layered settings
    pub fn with_cli_overrides(mut self, cli: &Cli) -> Self {
        if let Some(environment) = &cli.environment {
            self.environment = environment.clone();
        }
        if let Some(mode) = cli.mode {
            self.mode = mode;
        }
        if let Some(message) = &cli.message {
            self.message = message.clone();
        }
        if let Some(max_messages) = cli.max_messages {
            self.max_messages = max_messages;
        }
        if let Some(seconds) = cli.receive_timeout_seconds {
            self.receive_timeout_seconds = seconds;
        }
        if let Some(seconds) = cli.timeout_seconds {
            self.timeout_seconds = Some(seconds);
        }
        if let Some(policy) = cli.ack_policy {
            self.ack_policy = policy;
        }
        if let Some(provider) = cli.provider {
            self.provider = provider;
        }
        self
    }

    /// Receive options for one batch; the batch cap is clamped to `1..=99`
    pub fn receive_options(&self) -> ReceiveOptions {
        if self.max_messages == 0 || self.max_messages > MAX_RECEIVE_BATCH {
            warn!(
                requested = self.max_messages,
                max = MAX_RECEIVE_BATCH,
                "max_messages out of range; clamping"
            );
        }

        ReceiveOptions::new()
            .with_max_messages(self.max_messages)
            .with_timeout(seconds(self.receive_timeout_seconds))
            .with_ack_policy(self.ack_policy.into())
    }

    /// Context applied to every remote operation of the run
    pub fn operation_context(&self, cancellation: CancellationToken) -> OperationContext {
        let ctx = OperationContext::background().with_cancellation(cancellation);
        match self.timeout_seconds {
            Some(limit) => {
                if self.mode == Mode::SendReceive && limit <= self.receive_timeout_seconds {
                    warn!(
                        timeout_seconds = limit,
                        receive_timeout_seconds = self.receive_timeout_seconds,
                        "Operation deadline does not exceed the receive wait; an empty queue will time out"
                    );
                }
                ctx.with_deadline(seconds(limit))
            }
            None => ctx,
        }
    }

    /// Queue client configuration for the resolved resource names
    pub fn queue_config(&self, names: &ResourceNames) -> QueueConfig {
        match self.provider {
            ProviderKind::AzureServiceBus => {
                let mut azure = AzureServiceBusConfig::for_namespace(&names.namespace_host);
                azure.endpoint = self.endpoint.clone();
                QueueConfig {
                    provider: ProviderConfig::AzureServiceBus(azure),
                }
            }
            ProviderKind::InMemory => QueueConfig::default(),
        }
    }
}

fn seconds(value: u64) -> chrono::Duration {
    let max = i64::MAX / 1000;
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(max).min(max))
}

/// Load settings from the optional file and `SBQ__` environment variables.
///
/// Values that are absent everywhere fall back to [`CourierConfig::default`].
pub fn load_configuration(config_path: Option<&Path>) -> Result<CourierConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        debug!(path = %path.display(), "Loading configuration file");
        builder = builder.add_source(
            config::File::from(path)
                .required(true)
                .format(config::FileFormat::Toml),
        );
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix(CONFIG_ENV_PREFIX).separator("__"),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

// ============================================================================
// Errors
// ============================================================================

/// CLI error types
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Logging initialization failed: {message}")]
    Logging { message: String },

    #[error("{0}")]
    Operation(#[from] OperationError),

    #[error("{failed} of {received} received messages could not be completed")]
    IncompleteBatch { received: usize, failed: usize },
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// ============================================================================
// Run Flow
// ============================================================================

/// Outcome of one courier run
#[derive(Debug)]
pub struct RunSummary {
    pub queue: QueueName,
    pub sent: MessageId,
    /// Present in `send-receive` mode
    pub received: Option<ReceiveReport>,
}

/// Parse arguments, initialise logging and execute one run
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let config = load_configuration(cli.config.as_deref())?.with_cli_overrides(&cli);

    let cancellation = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_ctrl_c(cancellation.clone()));

    let mut stdout = std::io::stdout();
    let result = run(&config, &mut stdout, cancellation).await;
    watcher.abort();

    let summary = result?;
    if let Some(report) = &summary.received {
        if !report.is_clean() {
            return Err(CliError::IncompleteBatch {
                received: report.received,
                failed: report.failed.len(),
            });
        }
    }
    Ok(())
}

async fn cancel_on_ctrl_c(token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupt received; cancelling in-flight operation");
        token.cancel();
    }
}

/// Execute one run against the configured provider.
///
/// Received bodies are written to `out`, one per line. The queue client is
/// released on every path once it has been created.
pub async fn run<W>(
    config: &CourierConfig,
    out: &mut W,
    cancellation: CancellationToken,
) -> Result<RunSummary, CliError>
where
    W: Write + Send,
{
    let names = ResourceNames::for_environment(&config.environment).map_err(ConfigError::from)?;
    if names.is_degenerate() {
        warn!(
            namespace = %names.namespace_host,
            queue = %names.queue_name,
            "ENV is empty; resource names are degenerate and the service will likely reject them"
        );
    }

    info!(
        namespace = %names.namespace_host,
        queue = %names.queue_name,
        mode = ?config.mode,
        provider = ?config.provider,
        "Starting courier run"
    );

    let credential = resolve_token_source(config.provider)?;
    let client = QueueClientFactory::create_client(config.queue_config(&names), credential).await?;

    let ctx = config.operation_context(cancellation);
    let outcome = exchange(&client, &names.queue_name, config, out, &ctx).await;

    if let Err(e) = client.close().await {
        warn!(error = %e, "Failed to release queue client");
    }

    outcome
}

fn resolve_token_source(provider: ProviderKind) -> Result<Arc<dyn TokenSource>, CliError> {
    match provider {
        ProviderKind::AzureServiceBus => Ok(resolve_credentials()?),
        ProviderKind::InMemory => Ok(Arc::new(StaticTokenSource::new("in-memory"))),
    }
}

async fn exchange<W>(
    client: &QueueClient,
    queue: &QueueName,
    config: &CourierConfig,
    out: &mut W,
    ctx: &OperationContext,
) -> Result<RunSummary, CliError>
where
    W: Write + Send,
{
    let sent = client
        .send_message(queue, Message::from_text(&config.message), ctx)
        .await?;

    let received = match config.mode {
        Mode::Send => None,
        Mode::SendReceive => {
            let report = client
                .receive_and_complete(queue, &config.receive_options(), out, ctx)
                .await?;
            for failure in &report.failed {
                warn!(
                    message_id = %failure.message_id,
                    error = %failure.error,
                    "Message left uncompleted; it will be redelivered after its lock expires"
                );
            }
            Some(report)
        }
    };

    Ok(RunSummary {
        queue: queue.clone(),
        sent,
        received,
    })
}

// ============================================================================
// Logging
// ============================================================================

/// Initialize logging based on CLI arguments.
///
/// `RUST_LOG` takes precedence over `--log-level`. Output goes to stderr;
/// stdout carries only message bodies.
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cli.log_level).map_err(|e| CliError::Logging {
            message: format!("invalid log level '{}': {}", cli.log_level, e),
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}
