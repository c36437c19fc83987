//! Posecast server binary entry point
//!
//! Serves WebRTC signaling for camera and monitor peers, the pose pipeline
//! and per-slot MJPEG previews from one process.
//!
//! # Usage
//!
//! ```bash
//! # Two cameras, default calibration, listening on 0.0.0.0:8080
//! cargo run -p posecast-server
//!
//! # Tighter pairing tolerance, color previews at 10 fps
//! cargo run -p posecast-server -- \
//!   --tolerance 0.02 \
//!   --color-preview \
//!   --preview-fps 10
//!
//! # LAN only (no STUN), JSON logs
//! POSECAST_STUN_SERVERS= POSECAST_LOG_JSON=true cargo run -p posecast-server
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info,webrtc=warn`).

mod cli;
mod server;

use clap::Parser;
use cli::Args;
use posecast_core::{NullDetector, SessionManager};
use posecast_webrtc::WebRtcTransportFactory;
use server::PosecastServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(args.log_json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("posecast-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let config = args.posecast_config();
    let webrtc_config = args.webrtc_config();

    info!("Starting posecast server");
    info!("  Bind address: {}", args.bind);
    info!("  Camera slots: {}", config.max_camera_slots);
    info!(
        "  Calibration: {}x{} px, {:.1} deg FOV, {:.3} m baseline",
        config.image_width, config.image_height, config.fov_degrees, config.baseline_m
    );
    info!(
        "  Pairing tolerance: {:.3}s, pose rate: {} Hz",
        config.sync_tolerance_secs, config.target_fps
    );
    info!("  STUN servers: {:?}", webrtc_config.stun_servers);

    let factory = WebRtcTransportFactory::new(webrtc_config)?;
    let manager = SessionManager::new(config, Arc::new(factory), Arc::new(NullDetector))?;

    PosecastServer::new(args.bind, manager)
        .serve(shutdown_signal())
        .await
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,webrtc=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
