use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tracing::{info, warn};

mod config;
mod history;
mod model;
mod routes;
mod shutdown;
#[cfg(feature = "tensorflow")]
mod tf_model;
mod users;
mod utils;

use config::Settings;
use history::JsonHistoryStore;
use model::Detector;
use routes::{build_router, AppState};
use shutdown::shutdown_signal;
use users::JsonUserStore;
use utils::ensure_file_exists;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let settings = Settings::from_env()?;
    tokio::fs::create_dir_all(&settings.upload_dir)
        .await
        .with_context(|| format!("creating {}", settings.upload_dir.display()))?;
    tokio::fs::create_dir_all(&settings.result_dir)
        .await
        .with_context(|| format!("creating {}", settings.result_dir.display()))?;

    match ensure_file_exists(&settings.sample_path, settings.sample_url.as_deref()).await {
        Ok(true) => {}
        Ok(false) => warn!(
            "sample dataset {} not found; /download-sample will answer 404",
            settings.sample_path.display()
        ),
        Err(err) => warn!("sample dataset download failed: {err:#}"),
    }

    let detector = load_detector(&settings).await?;
    let addr: SocketAddr = settings
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address {}", settings.bind_address()))?;

    let state = Arc::new(AppState {
        history: Arc::new(JsonHistoryStore::new(&settings.history_file)),
        users: Arc::new(JsonUserStore::new(&settings.users_file)),
        detector,
        settings,
    });
    let app = build_router(state);

    info!("Listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(not(feature = "tensorflow"))]
async fn load_detector(settings: &Settings) -> Result<Arc<dyn Detector>> {
    info!("Using residual detector, threshold {}", settings.anomaly_threshold);
    Ok(Arc::new(model::ResidualDetector::new(
        &settings.result_dir,
        settings.anomaly_threshold,
    )))
}

#[cfg(feature = "tensorflow")]
async fn load_detector(settings: &Settings) -> Result<Arc<dyn Detector>> {
    info!("Checking model...");
    if !ensure_file_exists(&settings.model_path, settings.model_url.as_deref()).await? {
        anyhow::bail!(
            "model {} is missing and MODEL_URL is not set",
            settings.model_path.display()
        );
    }
    let detector = tf_model::AutoencoderDetector::new(
        &settings.model_path,
        &settings.result_dir,
        settings.anomaly_threshold,
    )
    .context("Failed to load model")?;
    Ok(Arc::new(detector))
}
