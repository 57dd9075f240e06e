use crate::registry::SourceKind;

/// Container formats that browsers can't be trusted to play directly.
/// These always go through the remux pipeline.
const TRANSCODE_EXTENSIONS: [&str; 4] = ["mkv", "avi", "wmv", "flv"];

/// Extensions we consider playable media when picking a file out of a swarm.
const PLAYABLE_EXTENSIONS: [&str; 4] = ["mp4", "mkv", "webm", "avi"];

fn extension_of(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Decide whether a stream is served as raw bytes or through the transcoder.
///
/// Remote URLs always transcode: the container type behind a URL is not
/// reliably known ahead of playback, so they are treated as a remux/proxy
/// case. Files and swarm content transcode only when the extension is in
/// the non-web-playable set.
pub fn needs_transcode(kind: SourceKind, name: &str) -> bool {
    match kind {
        SourceKind::RemoteUrl => true,
        SourceKind::LocalFile | SourceKind::SwarmFile => extension_of(name)
            .map(|ext| TRANSCODE_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false),
    }
}

/// Whether a swarm file name looks like playable media.
pub fn is_playable_name(name: &str) -> bool {
    extension_of(name)
        .map(|ext| PLAYABLE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// MIME type for direct-mode responses, by extension.
pub fn content_type_for(name: &str) -> &'static str {
    match extension_of(name).as_deref() {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}
