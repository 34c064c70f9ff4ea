use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.facecap.Recorder1",
    default_service = "org.facecap.Recorder1",
    default_path = "/org/facecap/Recorder1"
)]
trait Recorder {
    fn acquire_camera(&self) -> zbus::Result<()>;
    fn start_recording(&self) -> zbus::Result<()>;
    fn stop_recording(&self) -> zbus::Result<()>;
    fn status(&self) -> zbus::Result<String>;
    fn list_recordings(&self) -> zbus::Result<String>;
    fn delete_recording(&self, key: &str) -> zbus::Result<()>;
    fn export_recording(&self, key: &str, dir: &str) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facecap", about = "Facecap face-detection recorder CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the camera and start live detection
    Acquire,
    /// Start recording
    Start,
    /// Stop recording and save
    Stop,
    /// Show daemon status
    Status,
    /// List saved recordings, newest first
    List,
    /// Delete a saved recording
    Delete {
        /// Recording key (e.g., video_1700000000000)
        key: String,
    },
    /// Export a recording as a .webm file
    Export {
        /// Recording key
        key: String,
        /// Destination directory (defaults to the daemon's export directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// List V4L2 capture devices (bypasses the daemon)
    Devices,
}

#[derive(Deserialize)]
struct Status {
    ready: bool,
    recording: bool,
    elapsed_seconds: u64,
    face_count: usize,
    #[serde(default)]
    detecting: bool,
}

#[derive(Deserialize)]
struct Recording {
    key: String,
    size: u64,
    created_at: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        let devices = facecap_hw::Camera::list_devices();
        tracing::debug!(count = devices.len(), "enumerated capture devices");
        if devices.is_empty() {
            println!("No capture devices found");
        }
        for device in devices {
            println!("{}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
        }
        return Ok(());
    }

    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let proxy = RecorderProxy::new(&conn).await?;
    tracing::debug!(service = "org.facecap.Recorder1", "connected to facecapd");

    match cli.command {
        Commands::Acquire => {
            proxy.acquire_camera().await.context("acquire failed")?;
            println!("Camera acquired");
        }
        Commands::Start => {
            proxy.start_recording().await.context("start failed")?;
            println!("Recording");
        }
        Commands::Stop => {
            proxy.stop_recording().await.context("stop failed")?;
            println!("Stopped; saving in background");
        }
        Commands::Status => {
            let status: Status = serde_json::from_str(&proxy.status().await?)?;
            println!("ready:     {}", status.ready);
            println!("recording: {}", status.recording);
            if status.recording {
                println!("elapsed:   {}", format_elapsed(status.elapsed_seconds));
            }
            println!("faces:     {}", status.face_count);
            if status.ready && !status.detecting {
                println!("detector stopped; face count is stale");
            }
        }
        Commands::List => {
            let recordings: Vec<Recording> = serde_json::from_str(&proxy.list_recordings().await?)?;
            if recordings.is_empty() {
                println!("No recordings");
            }
            for rec in recordings {
                let when = rec
                    .created_at
                    .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<24} {:>12} {}", rec.key, format_size(rec.size), when);
            }
        }
        Commands::Delete { key } => {
            proxy.delete_recording(&key).await.context("delete failed")?;
            println!("Deleted {key}");
        }
        Commands::Export { key, dir } => {
            let dir = dir.map(|d| d.to_string_lossy().into_owned()).unwrap_or_default();
            let path = proxy.export_recording(&key, &dir).await.context("export failed")?;
            println!("{path}");
        }
        Commands::Devices => {}
    }

    Ok(())
}

/// `m:ss`, with minutes unbounded.
fn format_elapsed(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

/// Bytes/KB/MB/GB, base 1024, at most two decimals with trailing zeros dropped.
fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = format!("{value:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "0:00");
        assert_eq!(format_elapsed(65), "1:05");
        assert_eq!(format_elapsed(3600), "60:00");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 Bytes");
        assert_eq!(format_size(1023), "1023 Bytes");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5000), "4.88 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3 GB");
    }

    #[test]
    fn test_list_payload_parses_foreign_keys() {
        let json = r#"[{"key":"video_1000","size":5000,"mime_type":"video/webm","created_at":"1970-01-01T00:00:01Z"},
                       {"key":"imported","size":1,"mime_type":"video/webm","created_at":null}]"#;
        let parsed: Vec<Recording> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed[0].created_at.unwrap().timestamp_millis(), 1000);
        assert!(parsed[1].created_at.is_none());
    }

    #[test]
    fn test_status_payload_reports_stopped_detector() {
        let json = r#"{"ready":true,"recording":false,"elapsed_seconds":0,"face_count":2,"detecting":false}"#;
        let status: Status = serde_json::from_str(json).unwrap();
        assert!(status.ready && !status.detecting);
        assert_eq!(status.face_count, 2);
    }
}
