//! Live frame streams.
//!
//! A producer publishes into a [`FrameSink`]; any number of consumers read the
//! most recent frame through cloned [`FrameStream`]s. Only the latest frame is
//! retained, so slow consumers skip frames instead of queueing them.

use crate::frame::Frame;
use std::sync::Arc;
use tokio::sync::watch;

/// Create a connected sink/stream pair with no frame published yet.
pub fn frame_channel() -> (FrameSink, FrameStream) {
    let (tx, rx) = watch::channel(None);
    (FrameSink { tx }, FrameStream { rx })
}

/// Producer half of a frame channel.
pub struct FrameSink {
    tx: watch::Sender<Option<Arc<Frame>>>,
}

impl FrameSink {
    /// Replace the current frame. Never blocks, even with no consumers.
    pub fn publish(&self, frame: Frame) {
        self.tx.send_replace(Some(Arc::new(frame)));
    }

    /// Drop the current frame so consumers see the source as not ready.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn subscribe(&self) -> FrameStream {
        FrameStream {
            rx: self.tx.subscribe(),
        }
    }
}

/// Consumer half of a frame channel.
#[derive(Clone)]
pub struct FrameStream {
    rx: watch::Receiver<Option<Arc<Frame>>>,
}

impl FrameStream {
    /// The most recent frame, if one has been published and is ready.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.rx.borrow().as_ref().filter(|f| f.is_ready()).cloned()
    }

    /// Wait for the next ready frame published after the last one seen.
    ///
    /// Returns `None` once the producer is gone.
    pub async fn next_frame(&mut self) -> Option<Arc<Frame>> {
        loop {
            self.rx.changed().await.ok()?;
            let frame = self.rx.borrow_and_update().clone();
            if let Some(frame) = frame.filter(|f| f.is_ready()) {
                return Some(frame);
            }
        }
    }
}

/// Anything that can hand out a live frame stream: a camera, a compositor.
pub trait FrameSource: Send + Sync {
    /// The capturable stream, or `None` while the source has not been acquired.
    fn stream(&self) -> Option<FrameStream>;

    /// The most recent ready frame, if any.
    fn current_frame(&self) -> Option<Arc<Frame>> {
        self.stream()?.current_frame()
    }
}

impl FrameSource for FrameSink {
    fn stream(&self) -> Option<FrameStream> {
        Some(self.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_frame(width: u32, height: u32, sequence: u32) -> Frame {
        Frame {
            data: vec![0; (width * height * 3) as usize],
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    #[test]
    fn test_current_frame_empty_until_published() {
        let (sink, stream) = frame_channel();
        assert!(stream.current_frame().is_none());
        sink.publish(rgb_frame(2, 2, 1));
        assert_eq!(stream.current_frame().unwrap().sequence, 1);
    }

    #[test]
    fn test_current_frame_hides_unready_frames() {
        let (sink, stream) = frame_channel();
        sink.publish(rgb_frame(0, 0, 1));
        assert!(stream.current_frame().is_none());
    }

    #[test]
    fn test_clear_makes_source_not_ready() {
        let (sink, stream) = frame_channel();
        sink.publish(rgb_frame(2, 2, 1));
        sink.clear();
        assert!(stream.current_frame().is_none());
    }

    #[tokio::test]
    async fn test_next_frame_skips_to_latest() {
        let (sink, mut stream) = frame_channel();
        sink.publish(rgb_frame(2, 2, 1));
        sink.publish(rgb_frame(2, 2, 2));
        let frame = stream.next_frame().await.unwrap();
        assert_eq!(frame.sequence, 2);
    }

    #[tokio::test]
    async fn test_next_frame_ends_when_sink_dropped() {
        let (sink, mut stream) = frame_channel();
        drop(sink);
        assert!(stream.next_frame().await.is_none());
    }
}
