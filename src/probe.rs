use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

/// One elementary stream reported by the prober.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub index: i64,
    #[serde(rename = "codec_type")]
    pub media_type: Option<String>,
    pub codec_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
}

/// Probe result. `duration_seconds == 0.0` means unknown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeResult {
    pub duration_seconds: f64,
    pub tracks: Vec<TrackInfo>,
}

/// Metadata extraction boundary. Implementations never fail: anything that
/// goes wrong degrades to a zero-value result so a resolve is never blocked
/// on metadata.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, input: &str) -> ProbeResult;
}

/// Prober backed by an external `ffprobe` binary.
pub struct FfprobeProber {
    ffprobe: String,
}

impl FfprobeProber {
    pub fn new(ffprobe: impl Into<String>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, input: &str) -> ProbeResult {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                input,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(o) => o,
            Err(e) => {
                warn!("ffprobe spawn failed: input={} err={}", input, e);
                return ProbeResult::default();
            }
        };

        if !output.status.success() {
            debug!(
                "ffprobe exited with error: input={} status={} stderr={}",
                input,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return ProbeResult::default();
        }

        match parse_ffprobe_json(&output.stdout) {
            Ok(result) => result,
            Err(e) => {
                warn!("ffprobe output unparseable: input={} err={}", input, e);
                ProbeResult::default()
            }
        }
    }
}

#[derive(Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<TrackInfo>,
}

#[derive(Deserialize, Default)]
struct FfprobeFormat {
    duration: Option<String>,
}

fn parse_ffprobe_json(raw: &[u8]) -> anyhow::Result<ProbeResult> {
    let parsed: FfprobeOutput = serde_json::from_slice(raw)?;
    let duration_seconds = parsed
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    Ok(ProbeResult {
        duration_seconds,
        tracks: parsed.streams,
    })
}
