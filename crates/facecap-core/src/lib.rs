//! facecap-core — live face detection and the capture/record pipeline.
//!
//! Frames from a [`facecap_hw::FrameSource`] feed a cancellable detection
//! loop; an optional compositor burns the boxes into a second stream; the
//! recorder turns either stream into a finished WebM artifact.

pub mod capture;
pub mod compositor;
pub mod detection_loop;
pub mod detector;
pub mod overlay;
pub mod recorder;
pub mod task;
pub mod types;

pub use capture::{CaptureBackend, CaptureError, FfmpegCapture};
pub use compositor::{run_compositor, Compositor};
pub use detection_loop::{run_detection_loop, DetectionLoop};
pub use detector::{Detector, DetectorError, ScrfdDetector};
pub use overlay::{OverlayRenderer, OverlayStyle};
pub use recorder::{ArtifactSink, FinalizeHandle, Recorder, RecorderError, RecorderState, SavedRecording};
pub use types::{BoundingBox, DetectionResult, VideoArtifact, VIDEO_MIME_TYPE};
