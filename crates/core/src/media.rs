//! Media kinds and file-format whitelists.
//!
//! Reference assets and produced artifacts are classified as audio, image,
//! or video purely by file extension (case-insensitive).

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Extension whitelists
// ---------------------------------------------------------------------------

/// Accepted reference-audio extensions.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "flac", "aac", "ogg"];

/// Accepted reference-image extensions.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "tiff", "gif"];

/// Accepted reference-video extensions.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "flv", "webm"];

// ---------------------------------------------------------------------------
// MediaKind
// ---------------------------------------------------------------------------

/// Kind of a media file handled by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Image,
    Video,
}

impl MediaKind {
    /// Whitelisted extensions for this kind (lowercase, without dot).
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            MediaKind::Audio => AUDIO_EXTENSIONS,
            MediaKind::Image => IMAGE_EXTENSIONS,
            MediaKind::Video => VIDEO_EXTENSIONS,
        }
    }

    /// Size above which a reference file of this kind triggers a warning.
    pub fn size_warning_bytes(self) -> u64 {
        const MB: u64 = 1024 * 1024;
        match self {
            MediaKind::Audio => 50 * MB,
            MediaKind::Image => 10 * MB,
            MediaKind::Video => 100 * MB,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    /// Whether `path` carries one of this kind's whitelisted extensions.
    pub fn matches(self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| self.extensions().contains(&ext.as_str()))
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a path by its extension. Returns `None` for unknown formats.
///
/// `.gif` is classified as an image here; generated animations reported
/// by the backend are classified separately from their history key.
pub fn classify(path: &Path) -> Option<MediaKind> {
    [MediaKind::Audio, MediaKind::Image, MediaKind::Video]
        .into_iter()
        .find(|kind| kind.matches(path))
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_is_case_insensitive() {
        assert_eq!(classify(Path::new("voice.MP3")), Some(MediaKind::Audio));
        assert_eq!(classify(Path::new("face.Png")), Some(MediaKind::Image));
        assert_eq!(classify(Path::new("clip.webm")), Some(MediaKind::Video));
    }

    #[test]
    fn classify_rejects_unknown_and_missing_extensions() {
        assert_eq!(classify(Path::new("notes.txt")), None);
        assert_eq!(classify(Path::new("README")), None);
        assert_eq!(classify(Path::new(".mp3")), None);
    }

    #[test]
    fn size_thresholds() {
        assert_eq!(MediaKind::Image.size_warning_bytes(), 10 * 1024 * 1024);
        assert!(MediaKind::Video.size_warning_bytes() > MediaKind::Audio.size_warning_bytes());
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
    }
}
