use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::EnvFilter;
use zbus::object_server::InterfaceRef;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{RecorderService, BUS_NAME, OBJECT_PATH};
use engine::{Engine, EngineEvent};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facecapd starting");

    let config = config::Config::from_env();
    tracing::info!(
        device = %config.camera_device,
        db = %config.db_path.display(),
        store_version = config.store_version,
        record_overlay = config.record_overlay,
        "configuration loaded"
    );

    let (engine, events) = Engine::new(config);
    let engine = Arc::new(Mutex::new(engine));

    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RecorderService::new(engine.clone()))?
        .build()
        .await?;

    let iface = conn
        .object_server()
        .interface::<_, RecorderService>(OBJECT_PATH)
        .await?;
    let signals = tokio::spawn(forward_events(events, iface));

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facecapd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facecapd shutting down");

    engine.lock().await.shutdown().await;
    signals.abort();
    Ok(())
}

/// Turn engine events into D-Bus signals.
async fn forward_events(
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    iface: InterfaceRef<RecorderService>,
) {
    while let Some(event) = events.recv().await {
        let emitter = iface.signal_emitter();
        let sent = match &event {
            EngineEvent::CatalogChanged => RecorderService::catalog_changed(emitter).await,
            EngineEvent::RecordingFailed(reason) => {
                RecorderService::recording_failed(emitter, reason).await
            }
        };
        if let Err(e) = sent {
            tracing::warn!(?event, error = %e, "failed to emit signal");
        }
    }
}
