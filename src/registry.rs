use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::SwarmHandle;
use crate::probe::TrackInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceKind {
    LocalFile,
    RemoteUrl,
    SwarmFile,
}

/// Lifecycle of a descriptor's metadata. `MetadataPending` is specific to
/// swarm sources: it holds between creation and either a successful
/// background probe or retry exhaustion, after which the entry stays pending
/// forever with a zero duration. That is a known-degraded terminal state,
/// not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamState {
    Resolving,
    Ready,
    MetadataPending,
    MetadataComplete,
}

/// Kind-specific source reference.
#[derive(Debug, Clone)]
pub enum SourceHandle {
    LocalFile { path: PathBuf },
    RemoteUrl { url: String },
    Swarm { handle: SwarmHandle },
}

/// The unit of addressable playback state.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub id: String,
    pub kind: SourceKind,
    pub name: String,
    pub size_bytes: u64,
    pub duration_seconds: f64,
    pub tracks: Vec<TrackInfo>,
    pub handle: SourceHandle,
    pub state: StreamState,
}

fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct Entry {
    descriptor: StreamDescriptor,
    last_access: Arc<AtomicU64>,
}

/// In-memory table of active streams, the single source of truth for stream
/// existence and metadata mutation. Every lookup refreshes the entry's
/// last-access time; `spawn_eviction` removes entries idle past a timeout so
/// the table does not grow without bound. Evicting an id only stops it from
/// resolving; a response already in flight holds its own descriptor clone
/// and keeps running.
#[derive(Clone)]
pub struct StreamRegistry {
    streams: Arc<RwLock<HashMap<String, Entry>>>,
    next_id: Arc<AtomicU64>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Process-unique, monotonic stream identifier. Never reused.
    pub fn next_id(&self) -> String {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("s{seq}")
    }

    pub async fn insert(&self, descriptor: StreamDescriptor) {
        info!(
            "Registered stream: id={} kind={:?} name=\"{}\" size={} state={:?}",
            descriptor.id, descriptor.kind, descriptor.name, descriptor.size_bytes, descriptor.state
        );
        self.streams.write().await.insert(
            descriptor.id.clone(),
            Entry {
                descriptor,
                last_access: Arc::new(AtomicU64::new(now_epoch_millis())),
            },
        );
    }

    pub async fn get(&self, id: &str) -> Option<StreamDescriptor> {
        let streams = self.streams.read().await;
        let entry = streams.get(id)?;
        entry
            .last_access
            .store(now_epoch_millis(), Ordering::Relaxed);
        Some(entry.descriptor.clone())
    }

    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Apply a successful background probe: duration and track list are
    /// written together under the table lock (no partial field tears), the
    /// state flips to `MetadataComplete`, and later attempts are rejected so
    /// exactly one update lands per stream. A positive duration never
    /// decreases back to zero.
    pub async fn complete_metadata(
        &self,
        id: &str,
        duration_seconds: f64,
        tracks: Vec<TrackInfo>,
    ) -> bool {
        if duration_seconds <= 0.0 {
            return false;
        }
        let mut streams = self.streams.write().await;
        let Some(entry) = streams.get_mut(id) else {
            debug!("Metadata update for unknown stream: id={}", id);
            return false;
        };
        if entry.descriptor.state == StreamState::MetadataComplete {
            debug!("Metadata already complete, ignoring update: id={}", id);
            return false;
        }
        entry.descriptor.duration_seconds = duration_seconds;
        entry.descriptor.tracks = tracks;
        entry.descriptor.state = StreamState::MetadataComplete;
        entry
            .last_access
            .store(now_epoch_millis(), Ordering::Relaxed);
        info!(
            "Metadata complete: id={} duration={:.1}s tracks={}",
            id,
            duration_seconds,
            entry.descriptor.tracks.len()
        );
        true
    }

    /// Remove every entry that has not been looked up within `max_idle`.
    /// Returns how many were removed.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = now_epoch_millis();
        let max_idle = max_idle.as_millis() as u64;
        let mut streams = self.streams.write().await;
        let before = streams.len();
        streams.retain(|id, entry| {
            let idle = now.saturating_sub(entry.last_access.load(Ordering::Relaxed));
            if idle > max_idle {
                info!("Stream {} idle for {}ms, evicting", id, idle);
                false
            } else {
                true
            }
        });
        before - streams.len()
    }

    /// Periodic sweeper removing streams nobody has touched for `max_idle`.
    pub fn spawn_eviction(&self, max_idle: Duration, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let removed = registry.evict_idle(max_idle).await;
                if removed > 0 {
                    debug!("Eviction sweep removed {} idle streams", removed);
                }
            }
        })
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> StreamDescriptor {
        StreamDescriptor {
            id: id.to_string(),
            kind: SourceKind::SwarmFile,
            name: "movie.mp4".into(),
            size_bytes: 100,
            duration_seconds: 0.0,
            tracks: Vec::new(),
            handle: SourceHandle::LocalFile {
                path: PathBuf::from("/tmp/movie.mp4"),
            },
            state: StreamState::MetadataPending,
        }
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let registry = StreamRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        let c = registry.next_id();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a, "s1");
        assert_eq!(c, "s3");
    }

    #[tokio::test]
    async fn metadata_completes_exactly_once() {
        let registry = StreamRegistry::new();
        registry.insert(descriptor("s1")).await;

        assert!(registry.complete_metadata("s1", 120.0, Vec::new()).await);
        assert!(!registry.complete_metadata("s1", 500.0, Vec::new()).await);

        let d = registry.get("s1").await.unwrap();
        assert_eq!(d.duration_seconds, 120.0);
        assert_eq!(d.state, StreamState::MetadataComplete);
    }

    #[tokio::test]
    async fn zero_duration_is_not_accepted() {
        let registry = StreamRegistry::new();
        registry.insert(descriptor("s1")).await;

        assert!(!registry.complete_metadata("s1", 0.0, Vec::new()).await);
        let d = registry.get("s1").await.unwrap();
        assert_eq!(d.duration_seconds, 0.0);
        assert_eq!(d.state, StreamState::MetadataPending);
    }

    #[tokio::test]
    async fn unknown_id_is_rejected() {
        let registry = StreamRegistry::new();
        assert!(!registry.complete_metadata("nope", 10.0, Vec::new()).await);
        assert!(registry.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn idle_entries_are_evicted() {
        let registry = StreamRegistry::new();
        registry.insert(descriptor("s1")).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.evict_idle(Duration::from_millis(10)).await, 1);
        assert!(registry.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn lookups_keep_entries_alive() {
        let registry = StreamRegistry::new();
        registry.insert(descriptor("s1")).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.get("s1").await.is_some());
        assert_eq!(registry.evict_idle(Duration::from_millis(500)).await, 0);
        assert!(registry.get("s1").await.is_some());
    }
}
