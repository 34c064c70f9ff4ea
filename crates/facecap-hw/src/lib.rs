//! facecap-hw — Frame Source: camera acquisition and live frame streams.
//!
//! Provides V4L2-based camera capture normalised to RGB24 and a
//! latest-frame-wins channel that the detector, compositor and recorder read.

pub mod camera;
pub mod frame;
pub mod stream;

pub use camera::{acquire, Camera, CameraError, CameraStream, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use stream::{frame_channel, FrameSink, FrameSource, FrameStream};
