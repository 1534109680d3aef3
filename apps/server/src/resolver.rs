//! Media resolver for the CLI.
//!
//! Turns the user's clip argument into a [`ClipConfig`]: HTTP(S) URLs become
//! remote clips (proxied by the clip server), anything else is read from
//! disk with a MIME type sniffed from the file extension.

use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;
use clipcast_core::ClipConfig;

/// MIME type guessed from a file extension.
fn mime_for_extension(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") | Some("oga") => "audio/ogg",
        Some("flac") => "audio/flac",
        Some("aac") => "audio/aac",
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("opus") => "audio/opus",
        _ => "application/octet-stream",
    }
}

/// Resolves a clip argument into a clip configuration.
pub fn resolve_clip(spec: &str, mime_override: Option<&str>) -> Result<ClipConfig> {
    if spec.starts_with("http://") || spec.starts_with("https://") {
        return Ok(ClipConfig::remote(
            spec,
            mime_override.map(str::to_string),
        ));
    }

    let path = Path::new(spec);
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read clip file: {}", path.display()))?;
    let mime = mime_override
        .map(str::to_string)
        .unwrap_or_else(|| mime_for_extension(path).to_string());
    log::info!(
        "Loaded clip {} ({} bytes, {})",
        path.display(),
        bytes.len(),
        mime
    );
    Ok(ClipConfig::local(Bytes::from(bytes), mime))
}
