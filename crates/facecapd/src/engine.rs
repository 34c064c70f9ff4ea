use crate::config::Config;
use facecap_core::task::period_for_fps;
use facecap_core::{
    run_compositor, run_detection_loop, Compositor, DetectionLoop, DetectorError, FfmpegCapture,
    OverlayStyle, Recorder, RecorderError, RecorderState, ScrfdDetector,
};
use facecap_hw::{CameraError, CameraStream, FrameSource};
use facecap_store::{ArtifactSummary, StoreError, VideoStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Notifications for D-Bus clients, drained by the daemon's signal task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The stored catalog changed; listings should be re-read.
    CatalogChanged,
    /// A stopped recording could not be finalized or persisted.
    RecordingFailed(String),
}

/// Snapshot returned by `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub ready: bool,
    pub recording: bool,
    pub elapsed_seconds: u64,
    pub face_count: usize,
    /// False when there is no detection loop or it has died; `face_count`
    /// is then frozen at its last value.
    pub detecting: bool,
}

/// The capture/record pipeline: camera, detection loop, optional compositor,
/// recorder and store.
pub struct Engine {
    config: Config,
    camera: Option<CameraStream>,
    detection: Option<DetectionLoop>,
    compositor: Option<Compositor>,
    recorder: Recorder,
    store: VideoStore,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Engine {
    /// Build the engine without touching the camera. The recorder's refresh
    /// hook is wired to [`EngineEvent::CatalogChanged`].
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let store = VideoStore::new(config.db_path.clone(), config.store_version);
        let backend = Arc::new(FfmpegCapture::probe(config.ffmpeg.clone(), config.record_fps));

        let refresh = events.clone();
        let recorder = Recorder::new(backend, Arc::new(store.clone())).on_saved(Arc::new(move || {
            let _ = refresh.send(EngineEvent::CatalogChanged);
        }));

        let engine = Self {
            config,
            camera: None,
            detection: None,
            compositor: None,
            recorder,
            store,
            events,
        };
        (engine, rx)
    }

    /// Acquire the camera and start detection (plus compositing when
    /// overlay recording is enabled). No-op if already acquired; on access
    /// denial the pipeline stays not-ready.
    pub fn acquire_camera(&mut self) -> Result<(), EngineError> {
        if self.camera.is_some() {
            return Ok(());
        }

        let camera = facecap_hw::acquire(&self.config.camera_device).map_err(|e| {
            if matches!(e, CameraError::AccessDenied(_)) {
                tracing::error!(device = %self.config.camera_device, "camera access denied");
            }
            e
        })?;
        tracing::info!(
            device = %camera.device_path,
            width = camera.width,
            height = camera.height,
            "camera acquired"
        );

        let model_path = self.config.scrfd_model_path();
        let detector = ScrfdDetector::load(&model_path)?;
        tracing::info!(path = %model_path.display(), "SCRFD detector loaded");

        let Some(frames) = camera.stream() else {
            return Err(RecorderError::NoStream.into());
        };
        let period = period_for_fps(self.config.detect_fps);
        let detection = run_detection_loop(frames.clone(), detector, period);

        if self.config.record_overlay {
            self.compositor = Some(run_compositor(
                frames,
                detection.subscribe(),
                OverlayStyle::default(),
                period,
            ));
        }
        self.detection = Some(detection);
        self.camera = Some(camera);
        Ok(())
    }

    pub fn start_recording(&mut self) -> Result<(), EngineError> {
        let source: &dyn FrameSource = match (&self.compositor, &self.camera) {
            (Some(compositor), _) => compositor,
            (None, Some(camera)) => camera,
            (None, None) => return Err(RecorderError::NoStream.into()),
        };
        self.recorder.start(source)?;
        Ok(())
    }

    /// Stop recording and return to idle immediately. The artifact is
    /// finalized and persisted in the background.
    pub fn stop_recording(&mut self) -> Result<(), EngineError> {
        let finalize = self.recorder.stop()?;
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = finalize.wait().await {
                tracing::warn!(error = %e, "recording not saved");
                let _ = events.send(EngineEvent::RecordingFailed(e.to_string()));
            }
        });
        Ok(())
    }

    pub fn status(&self) -> StatusSnapshot {
        let ready = self
            .camera
            .as_ref()
            .is_some_and(|camera| camera.current_frame().is_some());
        StatusSnapshot {
            ready,
            recording: self.recorder.state() == RecorderState::Recording,
            elapsed_seconds: self.recorder.elapsed_seconds(),
            face_count: self.detection.as_ref().map_or(0, DetectionLoop::face_count),
            detecting: self.detection.as_ref().is_some_and(DetectionLoop::is_running),
        }
    }

    pub async fn list(&self) -> Result<Vec<ArtifactSummary>, EngineError> {
        Ok(self.store.list_all().await?)
    }

    /// Delete a recording. A key that is already gone counts as deleted.
    pub async fn delete(&self, key: &str) -> Result<(), EngineError> {
        match self.store.delete(key).await {
            Ok(()) => {
                let _ = self.events.send(EngineEvent::CatalogChanged);
                Ok(())
            }
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(key, "delete of missing recording ignored");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Export to `dir`, or to the configured export directory when `None`.
    pub async fn export(&self, key: &str, dir: Option<&Path>) -> Result<PathBuf, EngineError> {
        let dir = dir.unwrap_or(&self.config.export_dir);
        Ok(self.store.export(key, dir).await?)
    }

    /// Finish any recording, cancel both loops and release the camera.
    pub async fn shutdown(&mut self) {
        if self.recorder.state() == RecorderState::Recording {
            match self.recorder.stop() {
                Ok(finalize) => match finalize.wait().await {
                    Ok(saved) => tracing::info!(key = %saved.key, size = saved.size, "recording saved on shutdown"),
                    Err(e) => tracing::warn!(error = %e, "recording lost on shutdown"),
                },
                Err(e) => tracing::warn!(error = %e, "stop on shutdown failed"),
            }
        }

        if let Some(compositor) = self.compositor.take() {
            compositor.shutdown().await;
        }
        if let Some(detection) = self.detection.take() {
            detection.shutdown().await;
        }
        if let Some(camera) = self.camera.take() {
            let device = camera.device_path.clone();
            match tokio::task::spawn_blocking(move || camera.release()).await {
                Ok(()) => tracing::info!(device = %device, "camera released"),
                Err(e) => tracing::warn!(device = %device, error = %e, "camera release failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facecap_core::VideoArtifact;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config {
            camera_device: dir.path().join("no-such-video0").to_string_lossy().into_owned(),
            model_dir: dir.path().join("models"),
            db_path: dir.path().join("videos.db"),
            store_version: 1,
            record_overlay: false,
            detect_fps: 30,
            record_fps: 30,
            ffmpeg: PathBuf::from("/nonexistent/ffmpeg"),
            export_dir: dir.path().join("exports"),
        }
    }

    #[tokio::test]
    async fn test_status_before_acquire() {
        let dir = TempDir::new().unwrap();
        let (engine, _events) = Engine::new(test_config(&dir));

        let status = engine.status();
        assert!(!status.ready);
        assert!(!status.recording);
        assert_eq!(status.elapsed_seconds, 0);
        assert_eq!(status.face_count, 0);
        assert!(!status.detecting);
    }

    #[tokio::test]
    async fn test_missing_camera_leaves_pipeline_not_ready() {
        let dir = TempDir::new().unwrap();
        let (mut engine, _events) = Engine::new(test_config(&dir));

        let err = engine.acquire_camera().unwrap_err();
        assert!(matches!(err, EngineError::Camera(CameraError::DeviceNotFound(_))));
        assert!(!engine.status().ready);
    }

    #[tokio::test]
    async fn test_start_without_camera_has_no_stream() {
        let dir = TempDir::new().unwrap();
        let (mut engine, _events) = Engine::new(test_config(&dir));

        let err = engine.start_recording().unwrap_err();
        assert!(matches!(err, EngineError::Recorder(RecorderError::NoStream)));
        assert!(!engine.status().recording);
    }

    #[tokio::test]
    async fn test_stop_while_idle() {
        let dir = TempDir::new().unwrap();
        let (mut engine, _events) = Engine::new(test_config(&dir));

        let err = engine.stop_recording().unwrap_err();
        assert!(matches!(err, EngineError::Recorder(RecorderError::NotRecording)));
    }

    #[tokio::test]
    async fn test_delete_emits_catalog_changed() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        VideoStore::new(&config.db_path, 1)
            .save(&VideoArtifact::with_key("video_1000", vec![1, 2, 3], "video/webm"))
            .await
            .unwrap();
        let (engine, mut events) = Engine::new(config);

        assert_eq!(engine.list().await.unwrap().len(), 1);
        engine.delete("video_1000").await.unwrap();
        assert_eq!(events.recv().await, Some(EngineEvent::CatalogChanged));
        assert!(engine.list().await.unwrap().is_empty());

        // Already gone: succeeds without another catalog refresh.
        engine.delete("video_1000").await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_export_defaults_to_configured_dir() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let export_dir = config.export_dir.clone();
        VideoStore::new(&config.db_path, 1)
            .save(&VideoArtifact::with_key("video_2000", vec![7; 16], "video/webm"))
            .await
            .unwrap();
        let (engine, _events) = Engine::new(config);

        let path = engine.export("video_2000", None).await.unwrap();
        assert_eq!(path, export_dir.join("face-recording-video_2000.webm"));
    }
}
