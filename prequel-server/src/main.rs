use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};

use prequel_core::RecordingLogger;
use prequel_server::config::Config;
use prequel_server::notification::{NotificationDispatcher, SlackNotifier};
use prequel_server::provisioning::CommandProvisioner;
use prequel_server::scheduler::StalenessScheduler;
use prequel_server::store::{Database, PrequelRepository};
use prequel_server::{app, get_version, AppState};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting prequel {}", get_version());

    let config = Config::from_env().context("Failed to load configuration")?;

    let recording_logger = if config.recording_enabled {
        info!(
            "Recording enabled, logging to: {}",
            config.recording_log_path
        );
        Some(RecordingLogger::new(PathBuf::from(
            &config.recording_log_path,
        )))
    } else {
        None
    };

    let db_path = config.database_path();
    info!("Using database: {}", db_path.display());
    let database = Database::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    let repository = PrequelRepository::new(database);

    let dispatcher = match config.slack_webhook_url.clone() {
        Some(url) => {
            let notifier = SlackNotifier::new(
                url,
                config.notification_timeout,
                recording_logger.clone(),
            )?;
            info!("Slack notifications enabled");
            NotificationDispatcher::new(Arc::new(notifier), config.notification_timeout)
        }
        None => {
            warn!("SLACK_WEBHOOK_URL not set, notifications disabled");
            NotificationDispatcher::disabled()
        }
    };

    let provisioner =
        CommandProvisioner::new(config.infrastructure_dir.clone(), config.provisioning_timeout)
            .with_recording(recording_logger.clone());
    if config.organization_name.is_none() {
        warn!("ORGANIZATION_NAME not set, repository creation is disabled");
    }

    let scheduler = StalenessScheduler::new(
        repository.clone(),
        dispatcher.clone(),
        config.stale_check_interval,
        config.stale_pr_days,
    )
    .spawn();

    let app_state = Arc::new(AppState {
        webhook_secret: config.github_webhook_secret,
        repository,
        dispatcher,
        provisioner: Arc::new(provisioner),
        organization: config.organization_name,
        stale_pr_days: config.stale_pr_days,
        db_timeout: config.db_timeout,
        recording_logger,
    });

    let router = app(app_state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await;
    info!("Shutdown complete");

    Ok(())
}
