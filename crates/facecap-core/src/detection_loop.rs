//! Continuous face detection over a live frame stream.
//!
//! Each tick takes the latest ready frame, runs the detector off the async
//! executor and publishes the boxes. A failed detection keeps the previous
//! result. Only cancellation or a panicking detector ends the loop; the
//! latter is reported through [`DetectionLoop::is_running`].

use crate::detector::Detector;
use crate::task::{frame_ticker, LoopHandle};
use crate::types::DetectionResult;
use facecap_hw::FrameStream;
use std::time::Duration;
use tokio::sync::watch;

/// A running detection loop and the receiver of its published results.
pub struct DetectionLoop {
    handle: LoopHandle,
    results: watch::Receiver<DetectionResult>,
}

impl DetectionLoop {
    /// Latest published detection result (empty until the first success).
    pub fn latest(&self) -> DetectionResult {
        self.results.borrow().clone()
    }

    pub fn face_count(&self) -> usize {
        self.results.borrow().face_count()
    }

    /// Receiver for the overlay renderer and compositor.
    pub fn subscribe(&self) -> watch::Receiver<DetectionResult> {
        self.results.clone()
    }

    /// False once the loop has exited. The last result stays readable.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

/// Start a detection loop ticking every `period`.
///
/// Every call yields a fresh loop with an empty result, so stop-then-start
/// never carries boxes over from a previous run.
pub fn run_detection_loop<D>(frames: FrameStream, detector: D, period: Duration) -> DetectionLoop
where
    D: Detector + 'static,
{
    let (tx, rx) = watch::channel(DetectionResult::default());

    let handle = LoopHandle::spawn("detection", move |cancel| async move {
        let mut detector = detector;
        let mut ticker = frame_ticker(period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(frame) = frames.current_frame() else {
                tracing::trace!("no ready frame; skipping detection tick");
                continue;
            };

            let (width, height) = (frame.width, frame.height);
            let joined = tokio::task::spawn_blocking(move || {
                let outcome = detector.detect(&frame);
                (detector, outcome)
            })
            .await;

            let (returned, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(error = %e, "detector panicked; detection loop stopping");
                    break;
                }
            };
            detector = returned;

            if cancel.is_cancelled() {
                break;
            }

            match outcome {
                Ok(detections) => {
                    tx.send_replace(DetectionResult {
                        detections,
                        frame_width: width,
                        frame_height: height,
                    });
                }
                Err(e) => tracing::debug!(error = %e, "detection failed; keeping previous result"),
            }
        }
        tracing::debug!("detection loop stopped");
    });

    DetectionLoop { handle, results: rx }
}
