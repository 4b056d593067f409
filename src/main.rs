//! Gateway entry point.
//!
//! Exit codes: 0 normal shutdown, 2 bad configuration, 70
//! unrecoverable runtime failure.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use atelier_live::config::Config;
use atelier_live::gallery::{FsBlobStore, GalleryStore, SqliteRecordStore, UrlSigner};
use atelier_live::gateway::{self, AppState};
use atelier_live::session::SessionManager;
use atelier_live::shield::detector::RestFaceDetector;
use atelier_live::shield::PrivacyShield;
use atelier_live::spatial::GenerativeAnalyzer;
use atelier_live::telemetry::Metrics;
use atelier_live::upstream::WsLiveClient;

const EXIT_BAD_CONFIG: i32 = 2;
const EXIT_RUNTIME_FAILURE: i32 = 70;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .init();

    let state = match build_state(config) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("startup failed: {e}");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&state.sessions).run_watchdog(shutdown.clone()));

    tokio::select! {
        result = gateway::run(state) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "gateway failed");
                shutdown.cancel();
                std::process::exit(EXIT_RUNTIME_FAILURE);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }
    shutdown.cancel();
}

fn build_state(config: Config) -> anyhow::Result<AppState> {
    let metrics = Arc::new(Metrics::new());

    let detector = Arc::new(RestFaceDetector::new(
        config.face_detector_url.clone(),
        config.live_api_key.clone(),
    )?);
    let shield = Arc::new(PrivacyShield::new(
        detector,
        config.crowd_threshold,
        config.blur_radius_min,
    ));

    let analyzer = Arc::new(GenerativeAnalyzer::new(
        config.live_api_key.clone(),
        config.spatial_model.clone(),
    )?);

    let live_client = Arc::new(WsLiveClient::new(
        config.live_api_key.clone(),
        config.live_model.clone(),
    ));

    let blobs = Arc::new(FsBlobStore::new(config.blob_bucket.clone()));
    let records = Arc::new(SqliteRecordStore::open(&config.record_namespace)?);
    let gallery = Arc::new(GalleryStore::new(
        blobs,
        records,
        UrlSigner::new(config.url_signing_key.clone(), config.signed_url_ttl),
    ));

    let sessions = SessionManager::new(
        config.clone(),
        live_client,
        Arc::clone(&shield),
        Arc::clone(&metrics),
    )?;

    Ok(AppState::new(
        config, shield, analyzer, gallery, sessions, metrics,
    ))
}
