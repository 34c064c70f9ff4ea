//! V4L2 camera acquisition via the `v4l` crate.
//!
//! [`acquire`] opens a device, negotiates a format and starts a capture
//! thread that publishes every decoded frame to a [`FrameSink`]. The returned
//! [`CameraStream`] owns the device exclusively; dropping it stops capture.

use crate::frame::{self, Frame};
use crate::stream::{frame_channel, FrameSink, FrameSource, FrameStream};
use std::io;
use std::path::Path;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const MMAP_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera access denied: {0}")]
    AccessDenied(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel), converted to RGB.
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel), replicated to RGB.
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel).
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(Self::Y16)
        } else {
            None
        }
    }

    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, frame::FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
            Self::Y16 => frame::y16_to_rgb(buf, width, height),
        }
    }
}

/// An opened, format-negotiated V4L2 device that is not yet streaming.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => CameraError::AccessDenied(device_path.to_string()),
            _ if e.raw_os_error() == Some(16) => CameraError::DeviceBusy, // EBUSY
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Start streaming on a dedicated thread, publishing RGB frames.
    pub fn start(self) -> Result<CameraStream, CameraError> {
        let (sink, stream) = frame_channel();
        let cancel = CancellationToken::new();
        let thread_cancel = cancel.clone();
        let device_path = self.device_path.clone();
        let (width, height) = (self.width, self.height);

        let thread = std::thread::Builder::new()
            .name("facecap-camera".into())
            .spawn(move || self.capture_loop(&sink, &thread_cancel))
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

        Ok(CameraStream {
            stream,
            cancel,
            thread: Some(thread),
            device_path,
            width,
            height,
        })
    }

    fn capture_loop(&self, sink: &FrameSink, cancel: &CancellationToken) {
        let mut mmap = match MmapStream::with_buffers(&self.device, BufType::VideoCapture, MMAP_BUFFERS) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(device = %self.device_path, error = %e, "failed to create mmap stream");
                return;
            }
        };

        tracing::info!(device = %self.device_path, "capture thread started");
        while !cancel.is_cancelled() {
            let (buf, meta) = match mmap.next() {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(device = %self.device_path, error = %e, "failed to dequeue buffer");
                    break;
                }
            };

            match self.pixel_format.to_rgb(buf, self.width, self.height) {
                Ok(rgb) => sink.publish(Frame {
                    data: rgb,
                    width: self.width,
                    height: self.height,
                    timestamp: std::time::Instant::now(),
                    sequence: meta.sequence,
                }),
                Err(e) => tracing::debug!(seq = meta.sequence, error = %e, "dropping malformed buffer"),
            }
        }
        sink.clear();
        tracing::info!(device = %self.device_path, "capture thread exiting");
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

/// Open `device_path` and start streaming from it.
pub fn acquire(device_path: &str) -> Result<CameraStream, CameraError> {
    Camera::open(device_path)?.start()
}

/// A streaming camera. Owns the device handle until dropped.
pub struct CameraStream {
    stream: FrameStream,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
}

impl CameraStream {
    /// Stop capture and wait for the device to be released.
    pub fn release(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::warn!(device = %self.device_path, "capture thread panicked");
            }
        }
    }
}

impl FrameSource for CameraStream {
    fn stream(&self) -> Option<FrameStream> {
        Some(self.stream.clone())
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}
