use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite store file.
    pub db_path: PathBuf,
    /// Minimum store version requested on every open.
    pub store_version: u32,
    /// Record the composited stream (boxes burned in) instead of the raw camera.
    pub record_overlay: bool,
    /// Detector and compositor tick rate.
    pub detect_fps: u32,
    /// Encoder frame rate.
    pub record_fps: u32,
    /// Encoder binary.
    pub ffmpeg: PathBuf,
    /// Default destination for exported recordings.
    pub export_dir: PathBuf,
}

impl Config {
    /// Load configuration from `FACECAP_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(&home).join(".local/share"))
            .join("facecap");

        let model_dir = std::env::var("FACECAP_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let db_path = std::env::var("FACECAP_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("videos.db"));

        let export_dir = std::env::var("FACECAP_EXPORT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(&home).join("Videos"));

        Self {
            camera_device: std::env::var("FACECAP_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            db_path,
            store_version: env_u32("FACECAP_STORE_VERSION", 1).max(1),
            record_overlay: std::env::var("FACECAP_RECORD_OVERLAY")
                .map(|v| v == "1")
                .unwrap_or(false),
            detect_fps: env_u32("FACECAP_DETECT_FPS", 30).max(1),
            record_fps: env_u32("FACECAP_RECORD_FPS", 30).max(1),
            ffmpeg: std::env::var("FACECAP_FFMPEG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("ffmpeg")),
            export_dir,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    parse_or(std::env::var(key).ok(), default)
}

fn parse_or(value: Option<String>, default: u32) -> u32 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
