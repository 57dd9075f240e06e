use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use sysinfo::{Pid, System};
use tokio::io::AsyncRead;
use tokio::process::{ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::metrics::{ACTIVE_TRANSCODES, FFMPEG_CPU_USAGE};
use crate::relay;

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeSettings {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
        }
    }
}

/// What the transcoder reads. URLs go straight to ffmpeg as its input;
/// file and swarm sources feed stdin through the bounded relay.
pub enum TranscodeInput {
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    Url(String),
}

/// Video track is copied when feasible (remux, no re-encoding cost), audio
/// is transcoded to AAC, and the container is fragmented MP4 so playback can
/// start without a trailing index.
fn build_args(input: &str) -> Vec<String> {
    vec![
        "-i".into(),
        input.into(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "aac".into(),
        "-movflags".into(),
        "frag_keyframe+empty_moov".into(),
        "-f".into(),
        "mp4".into(),
        "pipe:1".into(),
    ]
}

/// A transcoder process scoped to one HTTP response. Dropping the pipeline
/// (the response body going away, for any reason) sends the stop signal:
/// the relay halts, stdin closes, and the process is killed. Every exit
/// path of a response releases the process this way.
pub struct TranscodePipeline {
    stop_signal: watch::Sender<bool>,
    stream_id: String,
}

impl TranscodePipeline {
    pub fn spawn(
        settings: &TranscodeSettings,
        stream_id: String,
        input: TranscodeInput,
    ) -> anyhow::Result<(Self, ChildStdout)> {
        let (input_arg, source) = match input {
            TranscodeInput::Url(url) => (url, None),
            TranscodeInput::Reader(reader) => ("pipe:0".to_string(), Some(reader)),
        };
        let args = build_args(&input_arg);

        info!(
            "Starting ffmpeg for stream {} (input={})",
            stream_id,
            if source.is_some() { "pipe" } else { input_arg.as_str() }
        );

        let mut child = Command::new(&settings.ffmpeg)
            .args(&args)
            .stdin(if source.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", settings.ffmpeg))?;

        let stdout = child.stdout.take().context("ffmpeg stdout unavailable")?;
        let stderr = child.stderr.take().context("ffmpeg stderr unavailable")?;

        let (stop_tx, stop_rx) = watch::channel(false);
        ACTIVE_TRANSCODES.inc();

        if let Some(source) = source {
            let stdin = child.stdin.take().context("ffmpeg stdin unavailable")?;
            relay::spawn_relay(source, stdin, stop_rx.clone(), relay::DEFAULT_CAPACITY);
        }

        // Rolling buffer of stderr lines so we can print context when ffmpeg
        // exits, without spamming the console.
        let stderr_ring: Arc<Mutex<VecDeque<String>>> =
            Arc::new(Mutex::new(VecDeque::with_capacity(80)));
        let stderr_ring_for_reader = Arc::clone(&stderr_ring);
        tokio::spawn(async move {
            use tokio::io::AsyncBufReadExt;
            let mut reader = tokio::io::BufReader::new(stderr);
            let mut buffer = String::new();
            while let Ok(n) = reader.read_line(&mut buffer).await {
                if n == 0 {
                    break;
                }
                let line = buffer.trim().to_string();
                {
                    let mut ring = stderr_ring_for_reader.lock().await;
                    if ring.len() >= 50 {
                        ring.pop_front();
                    }
                    ring.push_back(line.clone());
                }
                // Run with `RUST_LOG=mediarelay::transcode=debug` to see it.
                debug!("ffmpeg: {}", line);
                buffer.clear();
            }
        });

        if let Some(pid) = child.id() {
            info!("ffmpeg spawned: pid={} stream_id={}", pid, stream_id);

            let stream_id_mon = stream_id.clone();
            let mut stop_rx_mon = stop_rx.clone();
            tokio::spawn(async move {
                let mut sys = System::new();
                let pid = Pid::from_u32(pid);
                loop {
                    tokio::select! {
                        _ = stop_rx_mon.changed() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                            let processes = sysinfo::ProcessesToUpdate::Some(&[pid]);
                            sys.refresh_processes(processes, true);
                            if let Some(process) = sys.process(pid) {
                                let usage = process.cpu_usage();
                                FFMPEG_CPU_USAGE.with_label_values(&[&stream_id_mon]).set(usage as f64);
                            } else {
                                break;
                            }
                        }
                    }
                }
            });
        }

        // Supervisor owns the child: kills it on the stop signal, reaps it,
        // and reports why it exited.
        let stream_id_sup = stream_id.clone();
        let mut stop_rx_sup = stop_rx;
        tokio::spawn(async move {
            let finished = tokio::select! {
                _ = stop_rx_sup.changed() => false,
                _ = child.wait() => true,
            };
            let stop_requested = !finished;
            if stop_requested {
                let _ = child.kill().await;
            }

            match child.wait().await {
                Ok(status) => {
                    if stop_requested {
                        info!(
                            "ffmpeg stopped (requested): stream_id={} status={}",
                            stream_id_sup, status
                        );
                    } else if status.success() {
                        info!(
                            "ffmpeg finished: stream_id={} status={}",
                            stream_id_sup, status
                        );
                    } else {
                        let ring = stderr_ring.lock().await;
                        if ring.is_empty() {
                            warn!(
                                "ffmpeg exited with error: stream_id={} status={} (no stderr captured)",
                                stream_id_sup, status
                            );
                        } else {
                            warn!(
                                "ffmpeg exited with error: stream_id={} status={} last_stderr_lines=\n{}",
                                stream_id_sup,
                                status,
                                ring.iter().cloned().collect::<Vec<_>>().join("\n")
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!("ffmpeg wait() failed: stream_id={} err={}", stream_id_sup, e);
                }
            }
            ACTIVE_TRANSCODES.dec();
        });

        Ok((
            Self {
                stop_signal: stop_tx,
                stream_id,
            },
            stdout,
        ))
    }
}

impl Drop for TranscodePipeline {
    fn drop(&mut self) {
        let _ = self.stop_signal.send(true);
        FFMPEG_CPU_USAGE
            .with_label_values(&[&self.stream_id])
            .set(0.0);
    }
}
