use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default relay capacity: chunks of up to 64 KiB, so at most ~4 MiB
/// buffered between a fast source and a slow transcoder.
pub const DEFAULT_CAPACITY: usize = 64;

const CHUNK_SIZE: usize = 64 * 1024;

/// Bounded relay between a source reader and the transcoder's stdin.
///
/// Bytes are pumped source -> channel -> sink. When the channel is full the
/// pump's `send().await` parks until the sink drains, which pauses the
/// source read loop and keeps memory bounded when the transcoder consumes
/// slower than the source produces. Both tasks
/// also watch the stop signal so teardown halts them within one scheduling
/// step.
pub fn spawn_relay(
    mut source: Box<dyn AsyncRead + Send + Unpin>,
    mut sink: impl AsyncWrite + Send + Unpin + 'static,
    stop_rx: watch::Receiver<bool>,
    capacity: usize,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(capacity.max(1));

    let mut pump_stop = stop_rx.clone();
    let pump = tokio::spawn(async move {
        let mut buffer = [0u8; CHUNK_SIZE];
        loop {
            let read = tokio::select! {
                _ = pump_stop.changed() => break,
                read = source.read(&mut buffer) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buffer[..n]);
                    tokio::select! {
                        _ = pump_stop.changed() => break,
                        sent = tx.send(chunk) => {
                            if sent.is_err() {
                                // Sink side is gone; nothing left to feed.
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("relay source read error: {}", e);
                    break;
                }
            }
        }
        // Dropping tx ends the feed task's recv loop.
    });

    let mut feed_stop = stop_rx;
    let feed = tokio::spawn(async move {
        loop {
            let chunk = tokio::select! {
                _ = feed_stop.changed() => break,
                chunk = rx.recv() => chunk,
            };
            match chunk {
                Some(chunk) => {
                    if let Err(e) = sink.write_all(&chunk).await {
                        if e.kind() == std::io::ErrorKind::BrokenPipe {
                            debug!("relay sink closed (expected)");
                        } else {
                            warn!("relay sink write error: {}", e);
                        }
                        break;
                    }
                }
                None => {
                    // Source finished; close the sink so the transcoder sees
                    // end of input and flushes its trailer-free output.
                    let _ = sink.shutdown().await;
                    break;
                }
            }
        }
    });

    (pump, feed)
}
