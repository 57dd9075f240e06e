use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use futures::stream::Stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::engine::ContentEngine;
use crate::metrics::CLIENT_BANDWIDTH;
use crate::policy;
use crate::registry::{SourceHandle, StreamDescriptor};
use crate::transcode::{TranscodeInput, TranscodePipeline, TranscodeSettings};

/// Outcome of parsing a `Range` header against a known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// No range requested, or the header was syntactically unusable (the
    /// request degrades to a full-body 200, never an error).
    Full,
    /// `bytes start-end`, both inclusive, clamped to the source size.
    Span { start: u64, end: u64 },
    /// `start >= size`: answered with 416 and no body.
    Unsatisfiable,
}

pub fn parse_range(header: Option<&str>, size: u64) -> RangeSpec {
    let Some(header) = header else {
        return RangeSpec::Full;
    };
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return RangeSpec::Full;
    };
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeSpec::Full;
    };
    let Ok(start) = start_str.trim().parse::<u64>() else {
        return RangeSpec::Full;
    };
    if start >= size {
        return RangeSpec::Unsatisfiable;
    }
    let end = if end_str.trim().is_empty() {
        size - 1
    } else {
        match end_str.trim().parse::<u64>() {
            Ok(end) => end.min(size - 1),
            Err(_) => return RangeSpec::Full,
        }
    };
    if end < start {
        return RangeSpec::Unsatisfiable;
    }
    RangeSpec::Span { start, end }
}

fn error_response(status: u16, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(message.to_string()))
        .unwrap()
}

/// Serve source bytes unmodified, with byte-range support.
pub async fn serve_direct(
    engine: Arc<dyn ContentEngine>,
    descriptor: &StreamDescriptor,
    range_header: Option<&str>,
) -> Response {
    let size = descriptor.size_bytes;
    let content_type = policy::content_type_for(&descriptor.name);

    let (start, end, status) = match parse_range(range_header, size) {
        RangeSpec::Unsatisfiable => {
            warn!(
                "Unsatisfiable range: id={} Range=\"{}\" size={}",
                descriptor.id,
                range_header.unwrap_or("<none>"),
                size
            );
            return Response::builder()
                .status(416)
                .header("Content-Range", format!("bytes */{size}"))
                .header("Access-Control-Allow-Origin", "*")
                .body(Body::empty())
                .unwrap();
        }
        RangeSpec::Full => (0, size.saturating_sub(1), 200),
        RangeSpec::Span { start, end } => (start, end, 206),
    };
    let length = if size == 0 { 0 } else { end - start + 1 };

    let body = match &descriptor.handle {
        SourceHandle::LocalFile { path } => {
            let mut file = match tokio::fs::File::open(path).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(
                        "Source file unreadable: id={} path={} err={}",
                        descriptor.id,
                        path.display(),
                        e
                    );
                    return error_response(404, "Source file unavailable");
                }
            };
            if let Err(e) = file.seek(SeekFrom::Start(start)).await {
                warn!("Seek failed: id={} err={}", descriptor.id, e);
                return error_response(500, "Seek failed");
            }
            Body::from_stream(ReaderStream::new(file.take(length)))
        }
        SourceHandle::Swarm { handle } => {
            // This read may block while the swarm retrieves the span; that
            // is expected and must not time the request out.
            match engine.open_range(handle, start, end).await {
                Ok(reader) => Body::from_stream(ReaderStream::new(reader)),
                Err(e) => {
                    warn!("Swarm read failed: id={} err={}", descriptor.id, e);
                    return error_response(500, "Swarm read failed");
                }
            }
        }
        SourceHandle::RemoteUrl { .. } => {
            // Remote sources always go through the transcode path; reaching
            // here means the policy was bypassed.
            return error_response(500, "Remote sources are not range-served");
        }
    };

    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .header("Accept-Ranges", "bytes")
        .header("Content-Length", length.to_string())
        .header("Access-Control-Allow-Origin", "*");
    if status == 206 {
        builder = builder.header("Content-Range", format!("bytes {start}-{end}/{size}"));
    }
    builder.body(body).unwrap()
}

/// Body stream that owns the transcoder pipeline for its whole lifetime.
/// When the client disconnects axum drops the body, the pipeline's Drop
/// fires the stop signal, and the source reader, relay and process are
/// torn down.
struct GuardedStream {
    _pipeline: TranscodePipeline,
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, std::io::Error>> + Send>>,
    id: String,
    last_log_time: std::time::Instant,
    bytes_since_last_log: usize,
}

impl Stream for GuardedStream {
    type Item = Result<bytes::Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let res = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(ref bytes))) = res {
            self.bytes_since_last_log += bytes.len();
            let elapsed = self.last_log_time.elapsed();
            if elapsed >= std::time::Duration::from_secs(5) {
                let bytes = self.bytes_since_last_log;
                let rate = bytes as f64 / elapsed.as_secs_f64();
                info!(
                    "Stream bandwidth: stream_id={} rate={:.2} KB/s",
                    self.id,
                    rate / 1024.0
                );
                CLIENT_BANDWIDTH.with_label_values(&[&self.id]).set(rate);
                self.last_log_time = std::time::Instant::now();
                self.bytes_since_last_log = 0;
            }
        }
        res
    }
}

impl Drop for GuardedStream {
    fn drop(&mut self) {
        CLIENT_BANDWIDTH.with_label_values(&[&self.id]).set(0.0);
    }
}

/// Serve through the transcoder: always a 200, forward-only, no seeking.
pub async fn serve_transcoded(
    settings: &TranscodeSettings,
    engine: Arc<dyn ContentEngine>,
    descriptor: &StreamDescriptor,
) -> Response {
    let input = match &descriptor.handle {
        SourceHandle::LocalFile { path } => match tokio::fs::File::open(path).await {
            Ok(file) => TranscodeInput::Reader(Box::new(file)),
            Err(e) => {
                warn!(
                    "Source file unreadable: id={} path={} err={}",
                    descriptor.id,
                    path.display(),
                    e
                );
                return error_response(404, "Source file unavailable");
            }
        },
        SourceHandle::Swarm { handle } => match engine.open_sequential(handle).await {
            Ok(reader) => TranscodeInput::Reader(reader),
            Err(e) => {
                warn!("Swarm read failed: id={} err={}", descriptor.id, e);
                return error_response(500, "Swarm read failed");
            }
        },
        SourceHandle::RemoteUrl { url } => TranscodeInput::Url(url.clone()),
    };

    let (pipeline, stdout) =
        match TranscodePipeline::spawn(settings, descriptor.id.clone(), input) {
            Ok(v) => v,
            Err(e) => {
                warn!("Transcoder spawn failed: id={} err={}", descriptor.id, e);
                return error_response(500, "Transcoder unavailable");
            }
        };

    let guarded = GuardedStream {
        _pipeline: pipeline,
        inner: Box::pin(ReaderStream::new(stdout)),
        id: descriptor.id.clone(),
        last_log_time: std::time::Instant::now(),
        bytes_since_last_log: 0,
    };

    Response::builder()
        .status(200)
        .header("Content-Type", "video/mp4")
        .header("Cache-Control", "no-store")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from_stream(guarded))
        .unwrap()
}
