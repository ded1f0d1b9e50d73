use anyhow::Result;
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, str::FromStr, sync::Arc};
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use services::{
    credential_store::CredentialStore,
    drive_client::GoogleDrive,
    job_artifacts::JobArtifacts,
    job_registry::{JobRegistry, run_migrations},
    verifier::{Verifier, WorkerLimits},
};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting sheets-verify with config: {:?}", cfg);

    // --- Ensure data directories exist ---
    fs::create_dir_all(cfg.jobs_dir()).await?;
    tracing::debug!("Using data directory {}", cfg.data_dir.display());

    // --- Initialize SQLite job registry ---
    let connect_options = SqliteConnectOptions::from_str(&cfg.database_url)?.create_if_missing(true);
    if let Some(parent) = connect_options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).await?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?,
    );

    run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize services ---
    let limits = WorkerLimits {
        page_size: cfg.page_size,
        max_concurrent_jobs: cfg.max_concurrent_jobs,
        step_timeout: cfg.step_timeout,
    };
    let credentials = CredentialStore::new(cfg.credential_path());
    let registry = JobRegistry::new(db.clone());
    let artifacts = JobArtifacts::new(cfg.jobs_dir());
    let drive = Arc::new(GoogleDrive::new(
        reqwest::Client::builder()
            .user_agent(concat!("sheets-verify/", env!("CARGO_PKG_VERSION")))
            .build()?,
        cfg.drive_base_url.clone(),
        cfg.token_url.clone(),
    ));
    let verifier = Verifier::new(
        registry.clone(),
        credentials.clone(),
        artifacts.clone(),
        drive.clone(),
        limits,
    );
    let interrupted = verifier.fail_interrupted().await?;
    if interrupted > 0 {
        tracing::warn!("Marked {} interrupted job(s) as failed", interrupted);
    }

    let state = AppState {
        credentials,
        registry,
        artifacts,
        drive,
        verifier,
        data_dir: cfg.data_dir.clone(),
        page_size: limits.page_size,
        request_timeout: limits.step_timeout,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
