use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One file inside a swarm's file set.
#[derive(Debug, Clone, PartialEq)]
pub struct SwarmFileInfo {
    pub index: usize,
    pub name: String,
    /// Path relative to the swarm's download root.
    pub relative_path: PathBuf,
    pub length: u64,
}

/// An attached swarm session: content identifier plus its file set.
#[derive(Debug, Clone)]
pub struct SwarmSession {
    pub content_id: String,
    pub name: String,
    pub files: Vec<SwarmFileInfo>,
}

/// Kind-specific reference stored in a stream descriptor for swarm sources.
#[derive(Debug, Clone)]
pub struct SwarmHandle {
    pub content_id: String,
    pub session_name: String,
    pub file: SwarmFileInfo,
}

/// Boundary to the peer-to-peer content collaborator. The wire protocol
/// itself lives outside this crate; the engine only has to resolve a swarm
/// reference into a seekable file handle and report byte availability.
#[async_trait]
pub trait ContentEngine: Send + Sync {
    /// Attach to an existing session for this reference or create one.
    async fn resolve_or_create(&self, reference: &str) -> Result<SwarmSession>;

    /// Mark a file for prioritized download.
    async fn mark_priority(&self, handle: &SwarmHandle) -> Result<()>;

    /// Forward-only read of the whole file, from byte 0. May block while
    /// bytes are still being retrieved from the swarm.
    async fn open_sequential(&self, handle: &SwarmHandle)
        -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Bounded read of bytes `[start, end]` inclusive. May block pending
    /// retrieval of the requested span; it must not time out.
    async fn open_range(
        &self,
        handle: &SwarmHandle,
        start: u64,
        end: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// On-disk locations where the downloaded file may have materialized,
    /// in preference order. Used by the background metadata extractor.
    fn candidate_paths(&self, handle: &SwarmHandle) -> Vec<PathBuf>;
}

lazy_static! {
    static ref RE_BTIH: Regex =
        Regex::new(r"xt=urn:btih:([A-Fa-f0-9]{40}|[A-Za-z2-7]{32})").unwrap();
    static ref RE_DN: Regex = Regex::new(r"[?&]dn=([^&]+)").unwrap();
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Extract (content_id, display_name) from a magnet-style reference.
pub fn parse_magnet(reference: &str) -> Result<(String, Option<String>)> {
    let content_id = RE_BTIH
        .captures(reference)
        .map(|c| c[1].to_ascii_lowercase())
        .ok_or_else(|| anyhow!("unrecognized swarm reference"))?;
    let name = RE_DN.captures(reference).map(|c| percent_decode(&c[1]));
    Ok((content_id, name))
}

/// Content engine backed by a spool directory. A separate downloader process
/// owns the wire protocol and materializes swarm content under
/// `<spool>/<display name>` (or `<spool>/<content id>`); this engine resolves
/// references against that directory and serves byte spans as they appear on
/// disk. Sessions are de-duplicated by content identifier under one lock.
pub struct SpoolEngine {
    spool_dir: PathBuf,
    attach_wait: Duration,
    sessions: Mutex<HashMap<String, SwarmSession>>,
}

impl SpoolEngine {
    pub fn new(spool_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            spool_dir: spool_dir.into(),
            attach_wait: Duration::from_secs(15),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    pub fn with_attach_wait(spool_dir: impl Into<PathBuf>, attach_wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            spool_dir: spool_dir.into(),
            attach_wait,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn session_roots(&self, content_id: &str, name: Option<&str>) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        if let Some(name) = name {
            roots.push(self.spool_dir.join(name));
        }
        roots.push(self.spool_dir.join(content_id));
        roots
    }

    /// First candidate location that exists on disk for this handle.
    fn existing_path(&self, handle: &SwarmHandle) -> Option<PathBuf> {
        self.candidate_paths(handle)
            .into_iter()
            .find(|p| p.exists())
    }

    async fn scan_session(
        &self,
        content_id: &str,
        name: Option<&str>,
    ) -> Result<SwarmSession> {
        let deadline = tokio::time::Instant::now() + self.attach_wait;
        loop {
            for root in self.session_roots(content_id, name) {
                if !root.exists() {
                    continue;
                }
                let session_name = root
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| content_id.to_string());
                let files = list_files(&root)?;
                if files.is_empty() {
                    break; // materialization has begun but nothing listed yet
                }
                return Ok(SwarmSession {
                    content_id: content_id.to_string(),
                    name: session_name,
                    files,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "swarm content {} not materialized under {}",
                    content_id,
                    self.spool_dir.display()
                ));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

/// Enumerate regular files under `root` (or `root` itself if it is a file),
/// relative to the session root, in stable name order.
fn list_files(root: &Path) -> Result<Vec<SwarmFileInfo>> {
    let meta = std::fs::metadata(root)
        .with_context(|| format!("stat {}", root.display()))?;

    let mut entries: Vec<(PathBuf, u64)> = Vec::new();
    if meta.is_file() {
        let name = root
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("file"));
        entries.push((name, meta.len()));
    } else {
        collect_files(root, root, &mut entries)?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));
    }

    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(index, (relative_path, length))| SwarmFileInfo {
            index,
            name: relative_path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            relative_path,
            length,
        })
        .collect())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, u64)>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            collect_files(root, &path, out)?;
        } else if meta.is_file() {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            out.push((relative, meta.len()));
        }
    }
    Ok(())
}

/// Reader over a file that may still be growing on disk. Reads up to
/// `end` (inclusive); on hitting the current EOF before that, waits for the
/// downloader to append more bytes instead of reporting end-of-stream.
fn spawn_growing_reader(path: PathBuf, start: u64, end: u64) -> Box<dyn AsyncRead + Send + Unpin> {
    let (reader, mut writer) = tokio::io::duplex(64 * 1024);

    tokio::spawn(async move {
        // The file itself may not exist yet.
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                warn!("swarm read open failed: path={} err={}", path.display(), e);
                return;
            }
        };
        if let Err(e) = file.seek(SeekFrom::Start(start)).await {
            warn!("swarm read seek failed: path={} err={}", path.display(), e);
            return;
        }

        let mut pos = start;
        let mut buffer = [0u8; 64 * 1024];
        while pos <= end {
            let want = ((end - pos + 1).min(buffer.len() as u64)) as usize;
            match file.read(&mut buffer[..want]).await {
                Ok(0) => {
                    // Current EOF but the span isn't complete: the swarm is
                    // still retrieving these bytes. Wait, never time out.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Ok(n) => {
                    pos += n as u64;
                    if writer.write_all(&buffer[..n]).await.is_err() {
                        debug!("swarm read consumer went away: path={}", path.display());
                        return;
                    }
                }
                Err(e) => {
                    warn!("swarm read failed: path={} err={}", path.display(), e);
                    return;
                }
            }
        }
        let _ = writer.shutdown().await;
    });

    Box::new(reader)
}

#[async_trait]
impl ContentEngine for SpoolEngine {
    async fn resolve_or_create(&self, reference: &str) -> Result<SwarmSession> {
        let (content_id, name) = parse_magnet(reference)?;

        {
            let sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get(&content_id) {
                debug!("Reusing swarm session: content_id={}", content_id);
                return Ok(session.clone());
            }
        }

        // Scan without the lock: one slow attachment must not stall
        // resolves for unrelated content ids.
        let session = self.scan_session(&content_id, name.as_deref()).await?;

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&content_id) {
            // A concurrent resolve attached first; keep its entry.
            debug!("Reusing swarm session: content_id={}", content_id);
            return Ok(existing.clone());
        }
        info!(
            "Swarm session attached: content_id={} name={} files={}",
            session.content_id,
            session.name,
            session.files.len()
        );
        sessions.insert(content_id, session.clone());
        Ok(session)
    }

    async fn mark_priority(&self, handle: &SwarmHandle) -> Result<()> {
        // Download scheduling belongs to the external downloader; recorded
        // here only for visibility.
        debug!(
            "Priority mark: content_id={} file={}",
            handle.content_id, handle.file.name
        );
        Ok(())
    }

    async fn open_sequential(
        &self,
        handle: &SwarmHandle,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let end = handle.file.length.saturating_sub(1);
        self.open_range(handle, 0, end).await
    }

    async fn open_range(
        &self,
        handle: &SwarmHandle,
        start: u64,
        end: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let path = self
            .existing_path(handle)
            .unwrap_or_else(|| self.candidate_paths(handle).remove(0));
        Ok(spawn_growing_reader(path, start, end))
    }

    fn candidate_paths(&self, handle: &SwarmHandle) -> Vec<PathBuf> {
        vec![
            self.spool_dir.join(&handle.file.relative_path),
            self.spool_dir
                .join(&handle.session_name)
                .join(&handle.file.relative_path),
            self.spool_dir.join(&handle.content_id).join(&handle.file.relative_path),
        ]
    }
}
