//! Character folder discovery and validation.
//!
//! A character is a folder under the characters root holding one
//! reference audio file, at least one reference image or video, and an
//! optional `config.json`. [`CharacterLibrary`] validates folders, picks
//! the reference files, and caches loaded characters for a bounded time.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{read_config_file, CharacterConfig};
use crate::error::CoreError;
use crate::media::MediaKind;

/// How long a loaded character stays cached.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Name used when sanitizing leaves nothing behind.
pub const UNNAMED_CHARACTER: &str = "unnamed_character";

const UNSAFE_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

/// Replace path separators and shell-hostile characters with `_`, then
/// trim surrounding spaces and dots.
///
/// ```
/// use dhgen_core::character::sanitize_character_name;
///
/// assert_eq!(sanitize_character_name("anna/../x"), "anna_.._x");
/// assert_eq!(sanitize_character_name(" ..hidden. "), "hidden");
/// assert_eq!(sanitize_character_name("..."), "unnamed_character");
/// ```
pub fn sanitize_character_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if UNSAFE_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect();
    let trimmed = replaced.trim_matches(|c: char| c == ' ' || c == '.');
    if trimmed.is_empty() {
        UNNAMED_CHARACTER.to_string()
    } else {
        trimmed.to_string()
    }
}

// ---------------------------------------------------------------------------
// Validation report
// ---------------------------------------------------------------------------

/// Outcome of validating one character folder.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub character_name: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub audio: Vec<PathBuf>,
    pub images: Vec<PathBuf>,
    pub videos: Vec<PathBuf>,
}

impl ValidationReport {
    fn new(character_name: &str) -> Self {
        Self {
            character_name: character_name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_audio(&self) -> bool {
        !self.audio.is_empty()
    }

    pub fn has_visual(&self) -> bool {
        !self.images.is_empty() || !self.videos.is_empty()
    }

    /// One-line verdict.
    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!("Character '{}' is valid", self.character_name)
        } else {
            format!(
                "Character '{}' is invalid: {} error(s)",
                self.character_name,
                self.errors.len()
            )
        }
    }

    /// Multi-line report listing errors, warnings, and up to three files
    /// per media kind.
    pub fn detailed_summary(&self) -> String {
        let mut out = self.summary();
        if !self.errors.is_empty() {
            out.push_str("\nErrors:");
            for e in &self.errors {
                let _ = write!(out, "\n  - {e}");
            }
        }
        if !self.warnings.is_empty() {
            out.push_str("\nWarnings:");
            for w in &self.warnings {
                let _ = write!(out, "\n  - {w}");
            }
        }
        out.push_str("\nFiles found:");
        for (label, files) in [
            ("audio", &self.audio),
            ("images", &self.images),
            ("videos", &self.videos),
        ] {
            if files.is_empty() {
                continue;
            }
            let _ = write!(out, "\n  {label}: {}", files.len());
            for file in files.iter().take(3) {
                let name = file.file_name().and_then(|n| n.to_str()).unwrap_or("?");
                let _ = write!(out, "\n    - {name}");
            }
            if files.len() > 3 {
                let _ = write!(out, "\n    ... and {} more", files.len() - 3);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Character
// ---------------------------------------------------------------------------

/// A validated, ready-to-use character.
#[derive(Debug, Clone, Serialize)]
pub struct Character {
    pub name: String,
    pub dir: PathBuf,
    pub audio_path: PathBuf,
    pub visual_path: PathBuf,
    /// Either [`MediaKind::Image`] or [`MediaKind::Video`].
    pub visual_kind: MediaKind,
    pub config: CharacterConfig,
    pub report: ValidationReport,
}

// ---------------------------------------------------------------------------
// Library
// ---------------------------------------------------------------------------

struct CacheEntry {
    character: Character,
    stored_at: Instant,
}

/// Counts reported by [`CharacterLibrary::cache_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
}

/// Folder-backed character store rooted at one directory.
pub struct CharacterLibrary {
    root: PathBuf,
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl CharacterLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ttl: DEFAULT_CACHE_TTL,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the characters root if it does not exist yet.
    pub fn ensure_root(&self) -> Result<(), CoreError> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root).map_err(|e| CoreError::io(&self.root, e))?;
            tracing::info!(root = %self.root.display(), "Created characters directory");
        }
        Ok(())
    }

    /// Resolve the folder of a (sanitized) character name, refusing
    /// anything that is not a single plain path component.
    fn character_dir(&self, safe_name: &str) -> Result<PathBuf, CoreError> {
        let mut components = Path::new(safe_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(safe_name)),
            _ => Err(CoreError::Validation(format!(
                "Character name '{safe_name}' escapes the characters directory"
            ))),
        }
    }

    /// Validate a character folder without loading it.
    pub fn validate(&self, name: &str) -> Result<ValidationReport, CoreError> {
        let safe_name = sanitize_character_name(name);
        if safe_name != name {
            tracing::warn!(original = %name, sanitized = %safe_name, "Character name sanitized");
        }
        let mut report = ValidationReport::new(&safe_name);
        let dir = self.character_dir(&safe_name)?;

        if !dir.exists() {
            report.errors.push("Character folder does not exist".into());
            return Ok(report);
        }
        if !dir.is_dir() {
            report.errors.push("Character path is not a directory".into());
            return Ok(report);
        }

        report.audio = find_files(&dir, MediaKind::Audio);
        report.images = find_files(&dir, MediaKind::Image);
        report.videos = find_files(&dir, MediaKind::Video);

        if !report.has_audio() {
            report.errors.push("Missing reference audio file".into());
        }
        if !report.has_visual() {
            report
                .errors
                .push("Missing reference image or video file".into());
        }

        for (kind, files) in [
            (MediaKind::Audio, &report.audio),
            (MediaKind::Image, &report.images),
            (MediaKind::Video, &report.videos),
        ] {
            for file in files {
                let size = std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);
                if size > kind.size_warning_bytes() {
                    report.warnings.push(format!(
                        "Large {kind} file {}: {:.1}MB",
                        file.display(),
                        size as f64 / (1024.0 * 1024.0)
                    ));
                }
            }
        }

        match read_config_file(&dir) {
            Ok(Some(_)) => report.warnings.push("Found config.json, it will be used".into()),
            Ok(None) => {}
            Err(e) => report.warnings.push(format!("config.json could not be loaded: {e}")),
        }

        Ok(report)
    }

    /// Load a character, serving from the cache when fresh.
    pub fn load(&self, name: &str) -> Result<Character, CoreError> {
        let safe_name = sanitize_character_name(name);
        if let Some(cached) = self.cached(&safe_name) {
            return Ok(cached);
        }

        let report = self.validate(&safe_name)?;
        let dir = self.character_dir(&safe_name)?;
        if !dir.is_dir() {
            return Err(CoreError::NotFound {
                entity: "character",
                id: safe_name,
            });
        }
        if !report.is_valid() {
            return Err(CoreError::Validation(format!(
                "Character '{safe_name}' failed validation: {}",
                report.errors.join("; ")
            )));
        }

        let audio_path = report.audio.first().cloned().ok_or_else(|| {
            CoreError::Validation(format!("Character '{safe_name}' has no reference audio"))
        })?;
        let (visual_path, visual_kind) = match (report.images.first(), report.videos.first()) {
            (Some(image), _) => (image.clone(), MediaKind::Image),
            (None, Some(video)) => (video.clone(), MediaKind::Video),
            (None, None) => {
                return Err(CoreError::Validation(format!(
                    "Character '{safe_name}' has no reference image or video"
                )))
            }
        };

        let config = CharacterConfig::load(&dir).unwrap_or_else(|e| {
            tracing::warn!(character = %safe_name, error = %e, "Falling back to default config");
            CharacterConfig::defaults()
        });

        let character = Character {
            name: safe_name,
            dir,
            audio_path,
            visual_path,
            visual_kind,
            config,
            report,
        };
        self.store(&character);
        Ok(character)
    }

    /// Load every valid character under the root, skipping hidden folders.
    pub fn scan(&self) -> Vec<Character> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "Cannot scan characters directory");
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();

        names
            .into_iter()
            .filter_map(|name| match self.load(&name) {
                Ok(character) => {
                    tracing::debug!(character = %name, "Loaded character");
                    Some(character)
                }
                Err(e) => {
                    tracing::warn!(character = %name, error = %e, "Skipping character");
                    None
                }
            })
            .collect()
    }

    /// Names of all valid characters, sorted.
    pub fn list(&self) -> Vec<String> {
        self.scan().into_iter().map(|c| c.name).collect()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.validate(name).map(|r| r.is_valid()).unwrap_or(false)
    }

    /// Scaffold a character folder with a default `config.json`.
    ///
    /// Reference media still has to be copied in by the operator.
    pub fn create_example(&self, name: &str) -> Result<PathBuf, CoreError> {
        self.ensure_root()?;
        let safe_name = sanitize_character_name(name);
        let dir = self.character_dir(&safe_name)?;
        std::fs::create_dir_all(&dir).map_err(|e| CoreError::io(&dir, e))?;
        CharacterConfig::write_default(&dir)?;
        tracing::info!(character = %safe_name, dir = %dir.display(), "Created example character");
        Ok(dir)
    }

    // ---- cache ----

    fn cached(&self, safe_name: &str) -> Option<Character> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        match cache.get(safe_name) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => Some(entry.character.clone()),
            Some(_) => {
                cache.remove(safe_name);
                None
            }
            None => None,
        }
    }

    fn store(&self, character: &Character) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.insert(
            character.name.clone(),
            CacheEntry {
                character: character.clone(),
                stored_at: Instant::now(),
            },
        );
    }

    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = cache
            .values()
            .filter(|entry| entry.stored_at.elapsed() > self.ttl)
            .count();
        CacheStats {
            total: cache.len(),
            active: cache.len() - expired,
            expired,
        }
    }
}

/// Whitelisted files of one kind directly inside `dir`, sorted by path.
fn find_files(dir: &Path, kind: MediaKind) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to scan directory");
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && kind.matches(path))
        .collect();
    files.sort();
    files
}
