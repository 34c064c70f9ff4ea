use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The only container format recordings are produced and stored in.
pub const VIDEO_MIME_TYPE: &str = "video/webm";

/// Prefix of every artifact key; the suffix is milliseconds since the epoch.
pub const KEY_PREFIX: &str = "video_";

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Full detection output for one frame. Replaces the previous result wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub detections: Vec<BoundingBox>,
    /// Dimensions of the frame the boxes were computed on.
    pub frame_width: u32,
    pub frame_height: u32,
}

impl DetectionResult {
    pub fn face_count(&self) -> usize {
        self.detections.len()
    }
}

/// A finished, immutable recording.
#[derive(Clone, PartialEq, Eq)]
pub struct VideoArtifact {
    key: String,
    blob: Vec<u8>,
    mime_type: String,
}

impl VideoArtifact {
    /// Build a WebM artifact whose key is derived from `created_at`.
    pub fn new(created_at: DateTime<Utc>, blob: Vec<u8>) -> Self {
        Self::with_key(artifact_key(created_at), blob, VIDEO_MIME_TYPE)
    }

    /// Rebuild an artifact from stored parts.
    pub fn with_key(key: impl Into<String>, blob: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            blob,
            mime_type: mime_type.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Payload size in bytes.
    pub fn size(&self) -> u64 {
        self.blob.len() as u64
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_key_timestamp(&self.key)
    }

    /// Download file name for this artifact.
    pub fn export_file_name(&self) -> String {
        export_file_name(&self.key)
    }

    pub fn into_blob(self) -> Vec<u8> {
        self.blob
    }
}

impl std::fmt::Debug for VideoArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoArtifact")
            .field("key", &self.key)
            .field("mime_type", &self.mime_type)
            .field("size", &self.blob.len())
            .finish()
    }
}

/// `"video_" + <milliseconds since epoch>`.
pub fn artifact_key(created_at: DateTime<Utc>) -> String {
    format!("{KEY_PREFIX}{}", created_at.timestamp_millis())
}

/// Recover the creation time encoded in a key's numeric suffix.
pub fn parse_key_timestamp(key: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = key.strip_prefix(KEY_PREFIX)?.parse().ok()?;
    DateTime::from_timestamp_millis(millis)
}

/// `"face-recording-" + key + ".webm"`.
pub fn export_file_name(key: &str) -> String {
    format!("face-recording-{key}.webm")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_key_uses_millis() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(artifact_key(at), "video_1700000000123");
    }

    #[test]
    fn test_parse_key_timestamp() {
        let ts = parse_key_timestamp("video_1000").unwrap();
        assert_eq!(ts.timestamp_millis(), 1000);
    }

    #[test]
    fn test_parse_key_timestamp_rejects_foreign_keys() {
        assert!(parse_key_timestamp("clip_1000").is_none());
        assert!(parse_key_timestamp("video_abc").is_none());
        assert!(parse_key_timestamp("video_").is_none());
    }

    #[test]
    fn test_artifact_size_and_name() {
        let at = DateTime::from_timestamp_millis(2000).unwrap();
        let artifact = VideoArtifact::new(at, vec![0u8; 3000]);
        assert_eq!(artifact.key(), "video_2000");
        assert_eq!(artifact.size(), 3000);
        assert_eq!(artifact.mime_type(), "video/webm");
        assert_eq!(artifact.export_file_name(), "face-recording-video_2000.webm");
        assert_eq!(artifact.created_at(), Some(at));
    }

    #[test]
    fn test_face_count() {
        let b = BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0, confidence: 0.9 };
        let result = DetectionResult { detections: vec![b, b], frame_width: 4, frame_height: 4 };
        assert_eq!(result.face_count(), 2);
        assert_eq!(DetectionResult::default().face_count(), 0);
    }
}
