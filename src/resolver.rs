use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::engine::{ContentEngine, SwarmHandle};
use crate::error::ResolveError;
use crate::extractor::{self, MetadataUpdate};
use crate::policy;
use crate::probe::MediaProber;
use crate::registry::{
    SourceHandle, SourceKind, StreamDescriptor, StreamRegistry, StreamState,
};

/// Kind a caller may declare alongside an input reference. Takes precedence
/// over prefix inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredKind {
    File,
    Url,
    Magnet,
}

/// Classify an input reference. An explicit declaration wins; otherwise a
/// magnet-style prefix means swarm, an HTTP-style prefix means remote, and
/// everything else is treated as a local path.
pub fn classify(input: &str, declared: Option<DeclaredKind>) -> SourceKind {
    match declared {
        Some(DeclaredKind::File) => SourceKind::LocalFile,
        Some(DeclaredKind::Url) => SourceKind::RemoteUrl,
        Some(DeclaredKind::Magnet) => SourceKind::SwarmFile,
        None => {
            if input.starts_with("magnet:?") {
                SourceKind::SwarmFile
            } else if input.starts_with("http://") || input.starts_with("https://") {
                SourceKind::RemoteUrl
            } else {
                SourceKind::LocalFile
            }
        }
    }
}

fn name_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let without_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    // The first segment is the host; only what follows it can name a file.
    match without_scheme.split_once('/') {
        Some((_, path)) => path
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("remote-stream")
            .to_string(),
        None => "remote-stream".to_string(),
    }
}

/// Turns an input reference into a registered, addressable stream.
#[derive(Clone)]
pub struct StreamResolver {
    registry: StreamRegistry,
    engine: Arc<dyn ContentEngine>,
    prober: Arc<dyn MediaProber>,
    updates: UnboundedSender<MetadataUpdate>,
    retry_delays: Vec<Duration>,
    http: reqwest::Client,
}

impl StreamResolver {
    pub fn new(
        registry: StreamRegistry,
        engine: Arc<dyn ContentEngine>,
        prober: Arc<dyn MediaProber>,
        updates: UnboundedSender<MetadataUpdate>,
    ) -> Self {
        Self::with_retry_delays(registry, engine, prober, updates, extractor::RETRY_DELAYS.to_vec())
    }

    /// Same resolver with a custom extractor backoff table (tests use
    /// millisecond delays).
    pub fn with_retry_delays(
        registry: StreamRegistry,
        engine: Arc<dyn ContentEngine>,
        prober: Arc<dyn MediaProber>,
        updates: UnboundedSender<MetadataUpdate>,
        retry_delays: Vec<Duration>,
    ) -> Self {
        Self {
            registry,
            engine,
            prober,
            updates,
            retry_delays,
            http: reqwest::Client::new(),
        }
    }

    pub async fn resolve(
        &self,
        input: &str,
        declared: Option<DeclaredKind>,
    ) -> Result<StreamDescriptor, ResolveError> {
        match classify(input, declared) {
            SourceKind::LocalFile => self.resolve_local(input).await,
            SourceKind::RemoteUrl => self.resolve_remote(input).await,
            SourceKind::SwarmFile => self.resolve_swarm(input).await,
        }
    }

    async fn resolve_local(&self, input: &str) -> Result<StreamDescriptor, ResolveError> {
        let meta = tokio::fs::metadata(input)
            .await
            .map_err(|_| ResolveError::NotFound(input.to_string()))?;
        if !meta.is_file() {
            return Err(ResolveError::NotFound(input.to_string()));
        }

        let name = Path::new(input)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.to_string());

        // Probe failures degrade to empty metadata, never fail the resolve.
        let probed = self.prober.probe(input).await;
        info!(
            "Local file resolved: path={} size={} duration={:.1}s",
            input,
            meta.len(),
            probed.duration_seconds
        );

        let descriptor = StreamDescriptor {
            id: self.registry.next_id(),
            kind: SourceKind::LocalFile,
            name,
            size_bytes: meta.len(),
            duration_seconds: probed.duration_seconds,
            tracks: probed.tracks,
            handle: SourceHandle::LocalFile {
                path: Path::new(input).to_path_buf(),
            },
            state: StreamState::Ready,
        };
        self.registry.insert(descriptor.clone()).await;
        Ok(descriptor)
    }

    async fn resolve_remote(&self, input: &str) -> Result<StreamDescriptor, ResolveError> {
        // Cheap upstream check so a dead or non-2xx URL fails at resolve
        // time instead of mid-playback.
        let response = self
            .http
            .head(input)
            .send()
            .await
            .map_err(|e| ResolveError::Engine(e.into()))?;
        if !response.status().is_success() {
            return Err(ResolveError::UpstreamRemote(response.status().as_u16()));
        }

        let probed = self.prober.probe(input).await;
        info!(
            "Remote URL resolved: url={} duration={:.1}s",
            input, probed.duration_seconds
        );

        // Remote size is not queried at resolve time; remote sources always
        // stream through the transcoder, which needs no byte-range math.
        let descriptor = StreamDescriptor {
            id: self.registry.next_id(),
            kind: SourceKind::RemoteUrl,
            name: name_from_url(input),
            size_bytes: 0,
            duration_seconds: probed.duration_seconds,
            tracks: probed.tracks,
            handle: SourceHandle::RemoteUrl {
                url: input.to_string(),
            },
            state: StreamState::Ready,
        };
        self.registry.insert(descriptor.clone()).await;
        Ok(descriptor)
    }

    async fn resolve_swarm(&self, input: &str) -> Result<StreamDescriptor, ResolveError> {
        let session = self.engine.resolve_or_create(input).await?;

        let file = session
            .files
            .iter()
            .find(|f| policy::is_playable_name(&f.name))
            .cloned()
            .ok_or(ResolveError::UnsupportedInput)?;

        let handle = SwarmHandle {
            content_id: session.content_id.clone(),
            session_name: session.name.clone(),
            file: file.clone(),
        };

        if let Err(e) = self.engine.mark_priority(&handle).await {
            warn!(
                "Priority mark failed (continuing): content_id={} err={}",
                handle.content_id, e
            );
        }

        // Return immediately with zero metadata; the caller must never block
        // on metadata for swarm sources. The background extractor fills the
        // duration and track list in as the file materializes.
        let descriptor = StreamDescriptor {
            id: self.registry.next_id(),
            kind: SourceKind::SwarmFile,
            name: file.name.clone(),
            size_bytes: file.length,
            duration_seconds: 0.0,
            tracks: Vec::new(),
            handle: SourceHandle::Swarm {
                handle: handle.clone(),
            },
            state: StreamState::MetadataPending,
        };
        self.registry.insert(descriptor.clone()).await;

        extractor::spawn_extractor(
            self.registry.clone(),
            self.engine.clone(),
            self.prober.clone(),
            descriptor.id.clone(),
            handle,
            self.updates.clone(),
            self.retry_delays.clone(),
        );

        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{SwarmFileInfo, SwarmSession};
    use crate::probe::ProbeResult;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tokio::io::AsyncRead;

    #[test]
    fn declared_kind_wins_over_prefix() {
        assert_eq!(
            classify("magnet:?xt=urn:btih:abc", Some(DeclaredKind::File)),
            SourceKind::LocalFile
        );
        assert_eq!(
            classify("/tmp/x.mp4", Some(DeclaredKind::Url)),
            SourceKind::RemoteUrl
        );
    }

    #[test]
    fn prefixes_are_inferred() {
        assert_eq!(classify("magnet:?xt=urn:btih:abc", None), SourceKind::SwarmFile);
        assert_eq!(classify("http://host/x.mp4", None), SourceKind::RemoteUrl);
        assert_eq!(classify("https://host/x.mp4", None), SourceKind::RemoteUrl);
        assert_eq!(classify("/data/movie.mkv", None), SourceKind::LocalFile);
    }

    #[test]
    fn url_names() {
        assert_eq!(name_from_url("http://host/a/b/movie.mp4?tok=1"), "movie.mp4");
        assert_eq!(name_from_url("http://host/"), "remote-stream");
        assert_eq!(name_from_url("http://host"), "remote-stream");
        assert_eq!(name_from_url("https://host:8080"), "remote-stream");
        assert_eq!(name_from_url("http://host/dir/"), "remote-stream");
    }

    struct ZeroProber;

    #[async_trait]
    impl MediaProber for ZeroProber {
        async fn probe(&self, _input: &str) -> ProbeResult {
            ProbeResult::default()
        }
    }

    struct FixedEngine {
        session: SwarmSession,
    }

    #[async_trait]
    impl ContentEngine for FixedEngine {
        async fn resolve_or_create(&self, _reference: &str) -> anyhow::Result<SwarmSession> {
            Ok(self.session.clone())
        }
        async fn mark_priority(&self, _handle: &SwarmHandle) -> anyhow::Result<()> {
            Ok(())
        }
        async fn open_sequential(
            &self,
            _handle: &SwarmHandle,
        ) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>> {
            unimplemented!("not used in resolver tests")
        }
        async fn open_range(
            &self,
            _handle: &SwarmHandle,
            _start: u64,
            _end: u64,
        ) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>> {
            unimplemented!("not used in resolver tests")
        }
        fn candidate_paths(&self, _handle: &SwarmHandle) -> Vec<PathBuf> {
            Vec::new()
        }
    }

    fn resolver_with_engine(engine: Arc<dyn ContentEngine>) -> StreamResolver {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        StreamResolver::with_retry_delays(
            StreamRegistry::new(),
            engine,
            Arc::new(ZeroProber),
            tx,
            vec![Duration::from_millis(1)],
        )
    }

    #[tokio::test]
    async fn missing_local_file_is_not_found() {
        let engine = Arc::new(FixedEngine {
            session: SwarmSession {
                content_id: "x".into(),
                name: "x".into(),
                files: Vec::new(),
            },
        });
        let resolver = resolver_with_engine(engine);
        let err = resolver
            .resolve("/no/such/file.mp4", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[tokio::test]
    async fn local_file_resolves_ready_with_degraded_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("movie.mp4");
        std::fs::write(&path, vec![0u8; 512]).unwrap();

        let engine = Arc::new(FixedEngine {
            session: SwarmSession {
                content_id: "x".into(),
                name: "x".into(),
                files: Vec::new(),
            },
        });
        let resolver = resolver_with_engine(engine);
        let d = resolver
            .resolve(&path.to_string_lossy(), None)
            .await
            .unwrap();
        assert_eq!(d.kind, SourceKind::LocalFile);
        assert_eq!(d.name, "movie.mp4");
        assert_eq!(d.size_bytes, 512);
        assert_eq!(d.duration_seconds, 0.0);
        assert_eq!(d.state, StreamState::Ready);
    }

    #[tokio::test]
    async fn swarm_without_playable_file_is_unsupported() {
        let engine = Arc::new(FixedEngine {
            session: SwarmSession {
                content_id: "abc".into(),
                name: "docs".into(),
                files: vec![SwarmFileInfo {
                    index: 0,
                    name: "readme.txt".into(),
                    relative_path: PathBuf::from("readme.txt"),
                    length: 10,
                }],
            },
        });
        let resolver = resolver_with_engine(engine);
        let err = resolver
            .resolve("magnet:?xt=urn:btih:abc", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnsupportedInput));
    }

    #[tokio::test]
    async fn swarm_resolves_immediately_with_zero_metadata() {
        let engine = Arc::new(FixedEngine {
            session: SwarmSession {
                content_id: "abc".into(),
                name: "show".into(),
                files: vec![
                    SwarmFileInfo {
                        index: 0,
                        name: "sample.txt".into(),
                        relative_path: PathBuf::from("sample.txt"),
                        length: 5,
                    },
                    SwarmFileInfo {
                        index: 1,
                        name: "ep1.mkv".into(),
                        relative_path: PathBuf::from("ep1.mkv"),
                        length: 1_000,
                    },
                ],
            },
        });
        let resolver = resolver_with_engine(engine);
        let d = resolver
            .resolve("magnet:?xt=urn:btih:abc", None)
            .await
            .unwrap();
        assert_eq!(d.kind, SourceKind::SwarmFile);
        assert_eq!(d.name, "ep1.mkv");
        assert_eq!(d.size_bytes, 1_000);
        assert_eq!(d.duration_seconds, 0.0);
        assert!(d.tracks.is_empty());
        assert_eq!(d.state, StreamState::MetadataPending);
    }
}
