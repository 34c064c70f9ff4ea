use crate::engine::{Engine, EngineError};
use facecap_core::RecorderError;
use facecap_hw::CameraError;
use facecap_store::StoreError;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.facecap.Recorder1";
pub const OBJECT_PATH: &str = "/org/facecap/Recorder1";

/// D-Bus interface for the Facecap recording daemon.
///
/// Bus name: org.facecap.Recorder1
/// Object path: /org/facecap/Recorder1
pub struct RecorderService {
    engine: Arc<Mutex<Engine>>,
}

impl RecorderService {
    pub fn new(engine: Arc<Mutex<Engine>>) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.facecap.Recorder1")]
impl RecorderService {
    /// Open the camera and start live detection.
    async fn acquire_camera(&self) -> zbus::fdo::Result<()> {
        tracing::info!("acquire_camera requested");
        self.engine.lock().await.acquire_camera().map_err(into_fdo)
    }

    async fn start_recording(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start_recording requested");
        self.engine.lock().await.start_recording().map_err(into_fdo)
    }

    /// Returns as soon as the recorder is idle; the save completes later and
    /// is announced with `CatalogChanged` or `RecordingFailed`.
    async fn stop_recording(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop_recording requested");
        self.engine.lock().await.stop_recording().map_err(into_fdo)
    }

    /// JSON `{ready, recording, elapsed_seconds, face_count, detecting}`.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.engine.lock().await.status();
        serde_json::to_string(&snapshot).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// JSON array of `{key, size, mime_type, created_at}`, newest first.
    async fn list_recordings(&self) -> zbus::fdo::Result<String> {
        let summaries = self.engine.lock().await.list().await.map_err(into_fdo)?;
        serde_json::to_string(&summaries).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn delete_recording(&self, key: &str) -> zbus::fdo::Result<()> {
        tracing::info!(key, "delete_recording requested");
        self.engine.lock().await.delete(key).await.map_err(into_fdo)
    }

    /// Write the recording to `dir` (empty for the default) and return the path.
    async fn export_recording(&self, key: &str, dir: &str) -> zbus::fdo::Result<String> {
        tracing::info!(key, dir, "export_recording requested");
        let dir = (!dir.is_empty()).then(|| Path::new(dir));
        let path = self.engine.lock().await.export(key, dir).await.map_err(into_fdo)?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// The stored catalog changed.
    #[zbus(signal)]
    pub async fn catalog_changed(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn recording_failed(emitter: &SignalEmitter<'_>, reason: &str) -> zbus::Result<()>;
}

fn into_fdo(err: EngineError) -> zbus::fdo::Error {
    let message = err.to_string();
    match err {
        EngineError::Camera(CameraError::AccessDenied(_)) => zbus::fdo::Error::AccessDenied(message),
        EngineError::Camera(CameraError::DeviceNotFound(_)) => zbus::fdo::Error::FileNotFound(message),
        EngineError::Recorder(RecorderError::UnsupportedFormat(_)) => zbus::fdo::Error::NotSupported(message),
        EngineError::Store(StoreError::NotFound(_)) => zbus::fdo::Error::InvalidArgs(message),
        EngineError::Store(StoreError::Blocked) => zbus::fdo::Error::LimitsExceeded(message),
        _ => zbus::fdo::Error::Failed(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied_maps_to_fdo_access_denied() {
        let err = into_fdo(EngineError::Camera(CameraError::AccessDenied("/dev/video0".into())));
        assert!(matches!(err, zbus::fdo::Error::AccessDenied(_)));
    }

    #[test]
    fn test_missing_key_maps_to_invalid_args() {
        let err = into_fdo(EngineError::Store(StoreError::NotFound("video_1".into())));
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(ref m) if m.contains("video_1")));
    }

    #[test]
    fn test_recorder_misuse_is_generic_failure() {
        let err = into_fdo(EngineError::Recorder(RecorderError::AlreadyRecording));
        assert!(matches!(err, zbus::fdo::Error::Failed(_)));
    }
}
