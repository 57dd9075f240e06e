use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::extractor::MetadataUpdate;

#[derive(Debug, Clone, Deserialize)]
pub struct SignalingConfig {
    pub url: String,
    pub room: String,
}

/// Fire-and-forget announcer for metadata updates. A failure here is logged
/// and forgotten; it must never affect stream serving.
pub struct SignalingClient {
    client: reqwest::Client,
    config: SignalingConfig,
}

impl SignalingClient {
    pub fn new(config: SignalingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub async fn run(self, mut updates: UnboundedReceiver<MetadataUpdate>) {
        info!(
            "Signaling announcer ready: url={} room={}",
            self.config.url, self.config.room
        );
        while let Some(update) = updates.recv().await {
            if let Err(e) = self.announce(&update).await {
                warn!(
                    "Metadata announce failed (ignored): stream_id={} err={}",
                    update.stream_id, e
                );
            }
        }
    }

    async fn announce(&self, update: &MetadataUpdate) -> anyhow::Result<()> {
        let payload = json!({
            "roomId": self.config.room,
            "streamId": update.stream_id,
            "duration": update.duration_seconds,
            "streams": update.tracks,
        });
        let response = self
            .client
            .post(&self.config.url)
            .json(&payload)
            .send()
            .await?;
        debug!(
            "Metadata announced: stream_id={} status={}",
            update.stream_id,
            response.status()
        );
        Ok(())
    }
}

/// Consume updates when no signaling endpoint is configured.
pub async fn drain(mut updates: UnboundedReceiver<MetadataUpdate>) {
    while let Some(update) = updates.recv().await {
        debug!(
            "Metadata update (no signaling configured): stream_id={} duration={:.1}s",
            update.stream_id, update.duration_seconds
        );
    }
}
