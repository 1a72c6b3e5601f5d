//! CLI command implementations
//!
//! `serve` boots the hub and blocks until Ctrl-C. `inspect` and `token`
//! are one-shot and print a single JSON line.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::{InMemoryMembership, JwtConfig, JwtIdentityProvider, JwtManager};
use crate::http_server::{HttpServer, HttpServerConfig};
use crate::observability::{init_tracing, LogFormat, MetricsRegistry};
use crate::realtime::{
    Collaborators, EventLog, EventLogConfig, HubConfig, PresenceConfig, RealtimeError,
    RealtimeHub, SessionConfig, TopicKey,
};
use crate::store::InMemoryRecordStore;

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

/// A membership seeded at boot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipGrant {
    pub user_id: Uuid,
    pub topic: TopicKey,
}

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory; events stay in memory when absent
    pub data_dir: Option<String>,

    /// Events always kept per topic
    pub retention_events: usize,

    /// Events younger than this are always kept
    pub retention_age_secs: i64,

    /// Frames a session may hold behind its transport
    pub session_queue_cap: usize,

    /// Transport buffer per session
    pub transport_buffer: usize,

    pub replay_timeout_ms: u64,

    pub replay_batch_limit: usize,

    pub max_subscriptions_per_session: usize,

    pub presence_sweep_interval_secs: i64,

    /// Heartbeat silence after which a user goes offline
    pub presence_timeout_secs: i64,

    pub prune_interval_secs: u64,

    pub http: HttpServerConfig,

    pub jwt: JwtConfig,

    pub log_format: LogFormat,

    /// Memberships granted at boot
    pub memberships: Vec<MembershipGrant>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            retention_events: 10_000,
            retention_age_secs: 24 * 60 * 60,
            session_queue_cap: 256,
            transport_buffer: 64,
            replay_timeout_ms: 5_000,
            replay_batch_limit: 500,
            max_subscriptions_per_session: 100,
            presence_sweep_interval_secs: 30,
            presence_timeout_secs: 60,
            prune_interval_secs: 300,
            http: HttpServerConfig::default(),
            jwt: JwtConfig::default(),
            log_format: LogFormat::default(),
            memberships: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read config: {}", e)))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| CliError::config_error(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Reject values the hub cannot run with
    pub fn validate(&self) -> CliResult<()> {
        // Keeping at least one event preserves the head across restarts
        if self.retention_events == 0 {
            return Err(CliError::config_error("retention_events must be > 0"));
        }
        if self.retention_age_secs <= 0 {
            return Err(CliError::config_error("retention_age_secs must be > 0"));
        }
        if self.session_queue_cap == 0 {
            return Err(CliError::config_error("session_queue_cap must be > 0"));
        }
        if self.transport_buffer == 0 {
            return Err(CliError::config_error("transport_buffer must be > 0"));
        }
        if self.replay_timeout_ms == 0 {
            return Err(CliError::config_error("replay_timeout_ms must be > 0"));
        }
        if self.replay_batch_limit == 0 {
            return Err(CliError::config_error("replay_batch_limit must be > 0"));
        }
        if self.max_subscriptions_per_session == 0 {
            return Err(CliError::config_error(
                "max_subscriptions_per_session must be > 0",
            ));
        }
        if self.presence_sweep_interval_secs <= 0 || self.presence_timeout_secs <= 0 {
            return Err(CliError::config_error(
                "presence_sweep_interval_secs and presence_timeout_secs must be > 0",
            ));
        }
        if self.prune_interval_secs == 0 {
            return Err(CliError::config_error("prune_interval_secs must be > 0"));
        }
        if self.jwt.secret.is_empty() {
            return Err(CliError::config_error("jwt.secret must not be empty"));
        }
        if self.jwt.token_ttl_secs <= 0 {
            return Err(CliError::config_error("jwt.token_ttl_secs must be > 0"));
        }
        self.http.validate().map_err(CliError::config_error)?;
        Ok(())
    }

    /// Directory holding one segment file per topic
    pub fn segment_dir(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| Path::new(dir).join("topics"))
    }

    /// Event log settings derived from this config
    pub fn event_log_config(&self) -> EventLogConfig {
        EventLogConfig {
            retention_events: self.retention_events,
            retention_age: chrono::Duration::seconds(self.retention_age_secs),
            data_dir: self.segment_dir(),
        }
    }

    /// Hub settings derived from this config
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            log: self.event_log_config(),
            session: SessionConfig {
                queue_cap: self.session_queue_cap,
                transport_buffer: self.transport_buffer,
            },
            presence: PresenceConfig {
                sweep_interval: chrono::Duration::seconds(self.presence_sweep_interval_secs),
                timeout: chrono::Duration::seconds(self.presence_timeout_secs),
            },
            replay_timeout: StdDuration::from_millis(self.replay_timeout_ms),
            replay_batch_limit: self.replay_batch_limit,
            max_subscriptions_per_session: self.max_subscriptions_per_session,
            prune_interval: StdDuration::from_secs(self.prune_interval_secs),
        }
    }
}

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Serve { config, port } => serve(&config, port),
        Command::Inspect {
            config,
            topic,
            after,
            limit,
        } => inspect(&config, topic.as_deref(), after, limit),
        Command::Token { config, user } => token(&config, user),
    }
}

fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))
}

/// Open a hub with the collaborators a standalone deployment uses
pub async fn open_hub(config: &Config) -> CliResult<Arc<RealtimeHub>> {
    let membership = Arc::new(InMemoryMembership::new());
    for grant in &config.memberships {
        membership.grant(grant.user_id, &grant.topic);
    }

    let collaborators = Collaborators {
        identity: Arc::new(JwtIdentityProvider::new(JwtManager::new(config.jwt.clone()))),
        membership,
        records: Arc::new(InMemoryRecordStore::new()),
    };

    let hub = RealtimeHub::open(
        config.hub_config(),
        collaborators,
        Arc::new(MetricsRegistry::new()),
    )
    .await?;
    Ok(hub)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

/// Boot the hub and serve until Ctrl-C
pub fn serve(config_path: &Path, port: Option<u16>) -> CliResult<()> {
    let mut config = Config::load(config_path)?;
    if let Some(port) = port {
        config.http.port = port;
    }

    init_tracing(config.log_format);
    tracing::info!(
        config = %config_path.display(),
        data_dir = ?config.data_dir,
        "starting slackline"
    );

    runtime()?.block_on(async {
        let hub = open_hub(&config).await?;
        let background = hub.spawn_background();

        let server = HttpServer::with_hub(config.http.clone(), Arc::clone(&hub));
        let served = server
            .start(shutdown_signal())
            .await
            .map_err(|e| CliError::boot_failed(format!("HTTP server failed: {}", e)));

        hub.shutdown().await;
        for task in background {
            let _ = task.await;
        }
        served
    })
}

/// Print topics, or one topic's retained events, from the durable log
pub fn inspect(config_path: &Path, topic: Option<&str>, after: u64, limit: usize) -> CliResult<()> {
    let config = Config::load(config_path)?;
    if config.data_dir.is_none() {
        return Err(CliError::config_error(
            "inspect needs a data_dir; the in-memory log is not persisted",
        ));
    }
    let topic = topic.map(str::parse::<TopicKey>).transpose()?;

    runtime()?.block_on(async {
        let log = EventLog::open(config.event_log_config()).await?;

        let Some(topic) = topic else {
            let topics: Vec<_> = log
                .topics()
                .into_iter()
                .map(|t| {
                    json!({
                        "topic": t,
                        "head": log.head(&t),
                        "oldest_retained": log.oldest_retained(&t),
                    })
                })
                .collect();
            return write_response(json!({ "topics": topics }));
        };

        match log.read_from(&topic, after, limit) {
            Ok(events) => write_response(json!({
                "topic": topic,
                "head": log.head(&topic),
                "oldest_retained": log.oldest_retained(&topic),
                "events": events,
            })),
            Err(e @ RealtimeError::NotFound { .. }) => write_error(e.code(), &e.to_string()),
            Err(e) => Err(e.into()),
        }
    })
}

/// Print a bearer token for `user_id`
pub fn token(config_path: &Path, user_id: Uuid) -> CliResult<()> {
    let config = Config::load(config_path)?;
    let manager = JwtManager::new(config.jwt);
    let token = manager
        .generate_token(user_id)
        .map_err(|e| CliError::config_error(e.to_string()))?;

    write_response(json!({
        "user_id": user_id,
        "token": token,
    }))
}
