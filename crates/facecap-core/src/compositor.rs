//! Overlay-inclusive stream: camera frame with detection boxes burned in.
//!
//! Runs on its own ticker, reading the detection loop's latest result
//! without consuming it, and republishes composited frames as a capturable
//! [`FrameStream`].

use crate::overlay::{OverlayRenderer, OverlayStyle};
use crate::task::{frame_ticker, LoopHandle};
use crate::types::DetectionResult;
use facecap_hw::{frame_channel, Frame, FrameSource, FrameStream};
use image::{imageops, DynamicImage, RgbaImage};
use std::time::Duration;
use tokio::sync::watch;

/// A running compositor loop.
pub struct Compositor {
    handle: LoopHandle,
    output: FrameStream,
}

impl Compositor {
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

impl FrameSource for Compositor {
    fn stream(&self) -> Option<FrameStream> {
        if self.handle.is_cancelled() {
            return None;
        }
        Some(self.output.clone())
    }
}

/// Start compositing `frames` with the boxes from `detections` every `period`.
pub fn run_compositor(
    frames: FrameStream,
    detections: watch::Receiver<DetectionResult>,
    style: OverlayStyle,
    period: Duration,
) -> Compositor {
    let (sink, output) = frame_channel();

    let handle = LoopHandle::spawn("compositor", move |cancel| async move {
        let mut renderer = OverlayRenderer::new(style);
        let mut ticker = frame_ticker(period);
        let mut drawn: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(frame) = frames.current_frame() else {
                continue;
            };

            let result = detections.borrow().clone();
            let overlay = renderer.render(&result, frame.width, frame.height);
            if let Some(merged) = composite(&frame, overlay) {
                sink.publish(merged);
                if drawn % 60 == 0 {
                    tracing::debug!(frame = drawn, faces = result.face_count(), "compositor drawing");
                }
                drawn += 1;
            }
        }
        tracing::debug!(frames = drawn, "compositor stopped");
    });

    Compositor { handle, output }
}

/// Draw `frame`, then `overlay` on top, at the frame's native resolution.
pub fn composite(frame: &Frame, overlay: &RgbaImage) -> Option<Frame> {
    let mut base = DynamicImage::ImageRgb8(frame.to_rgb_image()?).into_rgba8();
    imageops::overlay(&mut base, overlay, 0, 0);

    let mut merged = Frame::from_rgb_image(DynamicImage::ImageRgba8(base).into_rgb8(), frame.sequence);
    merged.timestamp = frame.timestamp;
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use image::Rgba;

    fn gray_frame(width: u32, height: u32) -> Frame {
        Frame {
            data: vec![100; (width * height * 3) as usize],
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: 3,
        }
    }

    #[test]
    fn test_composite_keeps_frame_where_overlay_transparent() {
        let frame = gray_frame(8, 8);
        let mut overlay = RgbaImage::new(8, 8);
        overlay.put_pixel(1, 1, Rgba([255, 0, 0, 255]));

        let merged = composite(&frame, &overlay).unwrap();
        let image = merged.to_rgb_image().unwrap();
        assert_eq!(merged.sequence, 3);
        assert_eq!(image.get_pixel(1, 1).0, [255, 0, 0]);
        assert_eq!(image.get_pixel(5, 5).0, [100, 100, 100]);
    }

    #[test]
    fn test_composite_skips_unready_frame() {
        let frame = Frame {
            data: vec![],
            width: 0,
            height: 0,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        };
        assert!(composite(&frame, &RgbaImage::new(0, 0)).is_none());
    }

    #[tokio::test]
    async fn test_compositor_publishes_boxes_on_frame() {
        let (sink, frames) = frame_channel();
        sink.publish(gray_frame(32, 32));
        let (_tx, detections) = watch::channel(DetectionResult {
            detections: vec![BoundingBox { x: 4.0, y: 4.0, width: 10.0, height: 10.0, confidence: 0.9 }],
            frame_width: 32,
            frame_height: 32,
        });

        let compositor = run_compositor(frames, detections, OverlayStyle::default(), Duration::from_millis(2));
        let mut output = compositor.stream().unwrap();
        let merged = tokio::time::timeout(Duration::from_secs(5), output.next_frame())
            .await
            .unwrap()
            .unwrap();

        let image = merged.to_rgb_image().unwrap();
        assert_eq!(image.dimensions(), (32, 32));
        assert_eq!(image.get_pixel(4, 4).0, [0x25, 0x63, 0xeb]);
        assert_eq!(image.get_pixel(20, 28).0, [100, 100, 100]);

        compositor.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_compositor_has_no_stream() {
        let (_sink, frames) = frame_channel();
        let (_tx, detections) = watch::channel(DetectionResult::default());
        let compositor = run_compositor(frames, detections, OverlayStyle::default(), Duration::from_millis(2));
        compositor.cancel();
        assert!(compositor.stream().is_none());
    }
}
