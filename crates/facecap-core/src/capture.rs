//! Capture backends: turn a live frame stream into encoded binary chunks.
//!
//! [`FfmpegCapture`] pipes raw RGB frames into an ffmpeg child process
//! encoding VP8/WebM and forwards whatever it writes to stdout as chunks.

use crate::task::{frame_ticker, period_for_fps};
use crate::types::VIDEO_MIME_TYPE;
use facecap_hw::{Frame, FrameStream};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One encoded fragment of the output container.
pub type Chunk = Vec<u8>;

const CHUNK_CHANNEL_CAPACITY: usize = 64;
const READ_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to start encoder: {0}")]
    Spawn(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// The mechanism that records a stream into chunks.
///
/// After `stop` is cancelled the backend must flush everything still buffered
/// and then close the chunk channel; closing is the finalize signal.
pub trait CaptureBackend: Send + Sync {
    fn is_type_supported(&self, mime_type: &str) -> bool;

    fn start(
        &self,
        stream: FrameStream,
        mime_type: &str,
        stop: CancellationToken,
    ) -> Result<mpsc::Receiver<Chunk>, CaptureError>;
}

/// WebM capture through an external `ffmpeg` binary with libvpx.
pub struct FfmpegCapture {
    program: PathBuf,
    fps: u32,
    vp8_available: bool,
}

impl FfmpegCapture {
    /// Probe `program` for a VP8 encoder. A missing binary simply yields a
    /// backend that reports WebM as unsupported.
    pub fn probe(program: impl Into<PathBuf>, fps: u32) -> Self {
        let program = program.into();
        let vp8_available = match std::process::Command::new(&program)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
        {
            Ok(output) if output.status.success() => has_vp8_encoder(&String::from_utf8_lossy(&output.stdout)),
            Ok(output) => {
                tracing::warn!(program = %program.display(), status = %output.status, "ffmpeg encoder probe failed");
                false
            }
            Err(e) => {
                tracing::warn!(program = %program.display(), error = %e, "ffmpeg not available");
                false
            }
        };

        tracing::info!(program = %program.display(), vp8_available, fps, "ffmpeg capture backend probed");
        Self {
            program,
            fps: fps.max(1),
            vp8_available,
        }
    }
}

impl CaptureBackend for FfmpegCapture {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.vp8_available && mime_type == VIDEO_MIME_TYPE
    }

    fn start(
        &self,
        stream: FrameStream,
        _mime_type: &str,
        stop: CancellationToken,
    ) -> Result<mpsc::Receiver<Chunk>, CaptureError> {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let program = self.program.clone();
        let fps = self.fps;

        tokio::spawn(async move {
            if let Err(e) = run_ffmpeg(program, fps, stream, stop, tx).await {
                tracing::error!(error = %e, "ffmpeg capture failed");
            }
        });
        Ok(rx)
    }
}

async fn run_ffmpeg(
    program: PathBuf,
    fps: u32,
    mut stream: FrameStream,
    stop: CancellationToken,
    tx: mpsc::Sender<Chunk>,
) -> Result<(), CaptureError> {
    // The output geometry is fixed by the first frame.
    let first = match stream.current_frame() {
        Some(frame) => frame,
        None => tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            frame = stream.next_frame() => match frame {
                Some(frame) => frame,
                None => return Ok(()),
            },
        },
    };

    let mut child = Command::new(&program)
        .args(encoder_args(first.width, first.height, fps))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CaptureError::Spawn(format!("{}: {e}", program.display())))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| CaptureError::Spawn("encoder stdin unavailable".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Spawn("encoder stdout unavailable".into()))?;

    let reader = tokio::spawn(forward_chunks(stdout, tx));
    let written = feed_frames(stdin, stream, first, fps, &stop).await;

    let status = child.wait().await?;
    let chunks = reader.await.unwrap_or(0);
    tracing::info!(frames = written, chunks, %status, "ffmpeg capture finished");
    Ok(())
}

/// Write the latest frame once per tick until stopped. Dropping stdin lets
/// ffmpeg write the container trailer and exit.
async fn feed_frames(
    mut stdin: ChildStdin,
    stream: FrameStream,
    first: Arc<Frame>,
    fps: u32,
    stop: &CancellationToken,
) -> u64 {
    let (width, height) = (first.width, first.height);
    let mut ticker = frame_ticker(period_for_fps(fps));
    let mut latest = first;
    let mut written = 0u64;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(frame) = stream.current_frame() {
            if (frame.width, frame.height) == (width, height) {
                latest = frame;
            } else {
                tracing::debug!(width = frame.width, height = frame.height, "frame size changed mid-recording; repeating last frame");
            }
        }

        if let Err(e) = stdin.write_all(&latest.data).await {
            tracing::warn!(error = %e, "encoder closed its input");
            break;
        }
        written += 1;
    }

    if let Err(e) = stdin.shutdown().await {
        tracing::debug!(error = %e, "encoder stdin shutdown");
    }
    written
}

async fn forward_chunks(mut stdout: ChildStdout, tx: mpsc::Sender<Chunk>) -> usize {
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    let mut sent = 0;
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
                sent += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read encoder output");
                break;
            }
        }
    }
    sent
}

fn encoder_args(width: u32, height: u32, fps: u32) -> Vec<String> {
    let size = format!("{width}x{height}");
    let rate = fps.to_string();
    [
        "-hide_banner", "-loglevel", "error",
        "-f", "rawvideo", "-pix_fmt", "rgb24",
        "-s", size.as_str(),
        "-r", rate.as_str(),
        "-i", "pipe:0",
        "-c:v", "libvpx", "-deadline", "realtime", "-b:v", "2M",
        "-f", "webm", "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Look for the libvpx VP8 encoder in `ffmpeg -encoders` output.
fn has_vp8_encoder(listing: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some("libvpx"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_vp8_encoder() {
        let listing = "Encoders:\n V..... = Video\n ------\n V....D libvpx               libvpx VP8 (codec vp8)\n V....D libvpx-vp9           libvpx VP9 (codec vp9)\n";
        assert!(has_vp8_encoder(listing));
    }

    #[test]
    fn test_has_vp8_encoder_vp9_only() {
        let listing = " V....D libvpx-vp9           libvpx VP9 (codec vp9)\n";
        assert!(!has_vp8_encoder(listing));
    }

    #[test]
    fn test_encoder_args_geometry_and_container() {
        let args = encoder_args(640, 480, 30).join(" ");
        assert!(args.contains("-s 640x480"));
        assert!(args.contains("-r 30"));
        assert!(args.contains("-c:v libvpx"));
        assert!(args.ends_with("-f webm pipe:1"));
    }

    #[test]
    fn test_missing_binary_reports_unsupported() {
        let backend = FfmpegCapture::probe("/nonexistent/ffmpeg-binary", 30);
        assert!(!backend.is_type_supported(VIDEO_MIME_TYPE));
    }
}
