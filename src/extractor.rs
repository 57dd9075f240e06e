use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::{ContentEngine, SwarmHandle};
use crate::probe::{MediaProber, TrackInfo};
use crate::registry::StreamRegistry;

/// Fixed backoff table: attempts at +10s, +20s, ... +50s, then give up
/// silently. The stream stays playable via direct swarm reads either way;
/// only the metadata is absent.
pub const RETRY_DELAYS: [Duration; 5] = [
    Duration::from_secs(10),
    Duration::from_secs(20),
    Duration::from_secs(30),
    Duration::from_secs(40),
    Duration::from_secs(50),
];

/// Successful background extraction, handed to the notification collaborator.
#[derive(Debug, Clone)]
pub struct MetadataUpdate {
    pub stream_id: String,
    pub duration_seconds: f64,
    pub tracks: Vec<TrackInfo>,
}

/// Spawn the retrying metadata task for one swarm stream. One task per
/// stream id; the registry's exactly-once completion makes a second update
/// impossible even if a task were spawned twice.
pub fn spawn_extractor(
    registry: StreamRegistry,
    engine: Arc<dyn ContentEngine>,
    prober: Arc<dyn MediaProber>,
    stream_id: String,
    handle: SwarmHandle,
    updates: UnboundedSender<MetadataUpdate>,
    delays: Vec<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let attempts = delays.len();
        info!(
            "Background metadata extraction scheduled: id={} file={}",
            stream_id, handle.file.name
        );

        for (attempt, delay) in delays.into_iter().enumerate() {
            tokio::time::sleep(delay).await;
            debug!(
                "Metadata extraction attempt {}/{}: id={}",
                attempt + 1,
                attempts,
                stream_id
            );

            let Some(path) = engine
                .candidate_paths(&handle)
                .into_iter()
                .find(|p| p.exists())
            else {
                debug!(
                    "Swarm file not materialized yet: id={} attempt={}",
                    stream_id,
                    attempt + 1
                );
                continue;
            };

            let result = prober.probe(&path.to_string_lossy()).await;
            if result.duration_seconds <= 0.0 {
                // A zero-duration probe means the header isn't on disk yet.
                debug!(
                    "Probe not ready: id={} path={} attempt={}",
                    stream_id,
                    path.display(),
                    attempt + 1
                );
                continue;
            }

            if registry
                .complete_metadata(&stream_id, result.duration_seconds, result.tracks.clone())
                .await
            {
                let _ = updates.send(MetadataUpdate {
                    stream_id: stream_id.clone(),
                    duration_seconds: result.duration_seconds,
                    tracks: result.tracks,
                });
            }
            return;
        }

        // Degraded terminal state: the descriptor stays MetadataPending with
        // duration 0 and nothing is surfaced to callers.
        debug!(
            "Metadata extraction gave up after {} attempts: id={}",
            attempts, stream_id
        );
    })
}
