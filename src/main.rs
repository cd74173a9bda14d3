//! Wiring & DI. Entry point: bootstrap adapters, inject into use cases, supervise the
//! ServerQuery session. No business logic here.

use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use ts_forum_sync::adapters::forum::{
    ForumSchema, ForumSource, LibsqlForumStore, RetryingForumStore,
};
use ts_forum_sync::adapters::persistence::{FileAuditLog, GroupMapJson};
use ts_forum_sync::adapters::teamspeak::{EventStream, QuerySettings, TeamSpeakClient};
use ts_forum_sync::domain::DomainError;
use ts_forum_sync::ports::{AuditLog, ChatDirectory, ChatMessenger, ForumStore, GroupMapPersistence};
use ts_forum_sync::shared::{AppConfig, BotSettings, SharedSettings};
use ts_forum_sync::usecases::dispatcher::SettingsLoader;
use ts_forum_sync::usecases::{
    CommandDispatcher, CommandRegistry, CredentialLinker, DispatcherDeps, GroupMapStore,
    IncomingMessage, LoginRateLimiter, Reconciler, RuntimeStatus, SyncScheduler,
};

/// Idle ServerQuery sessions are dropped by the server after a few minutes.
const KEEPALIVE: Duration = Duration::from_secs(120);
/// First store retry delay; doubles per attempt.
const STORE_RETRY_BASE_MS: u64 = 250;
const RECONNECT_BASE_MS: u64 = 1_000;
const RECONNECT_MAX_MS: u64 = 60_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let env_loaded = dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &env_loaded {
        Ok(path) => info!(path = %path.display(), "loaded .env"),
        Err(_) => info!(cwd = %cwd.display(), "no .env found (check CWD)"),
    }

    let cfg = AppConfig::load().map_err(|e| anyhow::anyhow!("configuration: {}", e))?;
    let settings = SharedSettings::new(
        BotSettings::from_config(&cfg).map_err(|e| anyhow::anyhow!("{}", e))?,
    );
    info!(
        data_dir = %cfg.data_dir_or_default().display(),
        prefix = %settings.current().prefix,
        "configuration loaded"
    );

    // --- Forum store: libsql behind timeout + retry ---
    let source = forum_source(&cfg);
    let libsql_store = LibsqlForumStore::connect(&source, forum_schema(&cfg))
        .await
        .map_err(|e| anyhow::anyhow!("forum store: {}", e))?;
    let forum: Arc<dyn ForumStore> = Arc::new(RetryingForumStore::new(
        Arc::new(libsql_store),
        cfg.store_retry_attempts_or_default(),
        STORE_RETRY_BASE_MS,
        cfg.call_timeout(),
    ));

    // --- TeamSpeak: one client shared by directory and messenger ---
    let ts = Arc::new(TeamSpeakClient::new(QuerySettings {
        host: cfg.host_or_default(),
        query_port: cfg.query_port_or_default(),
        server_port: cfg.server_port_or_default(),
        username: cfg.query_username.clone().unwrap_or_default(),
        password: cfg.query_password.clone().unwrap_or_default(),
        nickname: cfg.nickname_or_default(),
        call_timeout: cfg.call_timeout(),
        keepalive: KEEPALIVE,
    }));
    let mut events = ts
        .connect()
        .await
        .map_err(|e| anyhow::anyhow!("ServerQuery: {}", e))?;
    let chat: Arc<dyn ChatDirectory> = Arc::clone(&ts) as Arc<dyn ChatDirectory>;
    let messenger: Arc<dyn ChatMessenger> = Arc::clone(&ts) as Arc<dyn ChatMessenger>;

    // --- Files ---
    let map_path = cfg.group_map_path_or_default();
    info!(path = %map_path.display(), "group map file");
    let persistence: Arc<dyn GroupMapPersistence> = Arc::new(GroupMapJson::new(&map_path));
    let audit: Arc<dyn AuditLog> = Arc::new(FileAuditLog::new(
        cfg.sync_log_path_or_default(),
        cfg.population_log_path_or_default(),
    ));

    // --- Use cases ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let group_map = Arc::new(
        GroupMapStore::load(
            persistence,
            Arc::clone(&chat),
            Arc::clone(&forum),
            settings.clone(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?,
    );
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&chat),
        Arc::clone(&forum),
        Arc::clone(&group_map),
        audit,
        settings.clone(),
        shutdown_rx.clone(),
    ));
    let limiter = Arc::new(LoginRateLimiter::new());
    let linker = Arc::new(CredentialLinker::new(
        Arc::clone(&forum),
        Arc::clone(&reconciler),
        Arc::clone(&limiter),
        settings.clone(),
    ));
    let registry = CommandRegistry::standard().map_err(|e| anyhow::anyhow!("{}", e))?;
    let status = Arc::new(RuntimeStatus::new());
    let reload: SettingsLoader = Arc::new(|| {
        let cfg = AppConfig::load().map_err(|e| DomainError::Config(e.to_string()))?;
        BotSettings::from_config(&cfg)
    });

    let dispatcher = CommandDispatcher::new(DispatcherDeps {
        messenger,
        chat,
        forum,
        linker,
        reconciler: Arc::clone(&reconciler),
        group_map,
        settings: settings.clone(),
        registry,
        status: Arc::clone(&status),
        shutdown: Arc::clone(&shutdown_tx),
        reload,
    });

    // --- Background: scheduled sync + ctrl-c ---
    let scheduler = SyncScheduler::new(reconciler, limiter, settings, shutdown_rx.clone());
    let scheduler_handle = tokio::spawn(scheduler.run());

    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            signal_tx.send_replace(true);
        }
    });

    // --- Supervisor: dispatch messages, reconnect when the session ends ---
    status.mark_connected();
    let mut shutdown = shutdown_rx;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            message = ts.next_message(&mut events) => message,
            _ = shutdown.changed() => continue,
        };
        match next {
            Some((invoker, text)) => {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.dispatch(IncomingMessage { invoker, text }).await;
                });
            }
            None => {
                status.mark_disconnected();
                ts.disconnect().await;
                warn!("ServerQuery session ended");
                match reconnect(&ts, &mut shutdown).await {
                    Some(stream) => {
                        events = stream;
                        status.mark_connected();
                    }
                    None => break,
                }
            }
        }
    }

    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "sync scheduler task failed");
    }
    ts.disconnect().await;
    info!("stopped");
    Ok(())
}

fn forum_source(cfg: &AppConfig) -> ForumSource {
    match &cfg.forum_db_url {
        Some(url) if !url.is_empty() => ForumSource::Remote {
            url: url.clone(),
            token: cfg.forum_db_token.clone().unwrap_or_default(),
        },
        _ => ForumSource::Local(cfg.forum_db_path_or_default()),
    }
}

fn forum_schema(cfg: &AppConfig) -> ForumSchema {
    let defaults = ForumSchema::default();
    ForumSchema {
        table_prefix: cfg.forum_table_prefix.clone().unwrap_or(defaults.table_prefix),
        requests_table: cfg
            .forum_requests_table
            .clone()
            .unwrap_or(defaults.requests_table),
        identity_field: cfg
            .forum_identity_field
            .clone()
            .unwrap_or(defaults.identity_field),
        division_field: cfg
            .forum_division_field
            .clone()
            .unwrap_or(defaults.division_field),
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    Duration::from_millis((RECONNECT_BASE_MS << exponent).min(RECONNECT_MAX_MS))
}

/// Retry `connect` with backoff until it succeeds or shutdown is requested.
async fn reconnect(
    ts: &TeamSpeakClient,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<EventStream> {
    let mut attempt = 0u32;
    loop {
        if *shutdown.borrow() {
            return None;
        }
        attempt += 1;
        let delay = reconnect_delay(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to ServerQuery");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => continue,
        }
        match ts.connect().await {
            Ok(events) => {
                info!(attempt, "ServerQuery session restored");
                return Some(events);
            }
            Err(e) => warn!(attempt, error = %e, "reconnect failed"),
        }
    }
}
