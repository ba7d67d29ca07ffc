//! Destination naming for downloaded artifacts.
//!
//! The backend-provided filename is preserved unless a file with that
//! name already exists in the destination directory, in which case a
//! numeric suffix is appended before the extension.

use std::path::{Path, PathBuf};

/// Upper bound on suffix probing before falling back to a random name.
const MAX_SUFFIX: u32 = 10_000;

/// Reduce a remote filename to a safe, single path component.
///
/// Strips any directory part (both `/` and `\` separators) so a remote
/// name can never escape the destination directory. An empty or dot-only
/// result becomes `"artifact"`.
pub fn safe_file_name(remote: &str) -> String {
    let last = remote
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if last.is_empty() || last.chars().all(|c| c == '.') {
        "artifact".to_string()
    } else {
        last.to_string()
    }
}

/// Build the `n`-th disambiguated variant of `file_name`.
///
/// ```
/// use dhgen_core::naming::suffixed_name;
///
/// assert_eq!(suffixed_name("out.mp4", 1), "out_1.mp4");
/// assert_eq!(suffixed_name("archive.tar.gz", 2), "archive.tar_2.gz");
/// assert_eq!(suffixed_name("README", 3), "README_3");
/// ```
pub fn suffixed_name(file_name: &str, n: u32) -> String {
    match file_name.rfind('.') {
        Some(dot) if dot > 0 => {
            let (stem, ext) = file_name.split_at(dot);
            format!("{stem}_{n}{ext}")
        }
        _ => format!("{file_name}_{n}"),
    }
}

/// Pick a path inside `dir` for `remote_name` that does not exist yet.
pub fn unique_destination(dir: &Path, remote_name: &str) -> PathBuf {
    let base = safe_file_name(remote_name);
    let candidate = dir.join(&base);
    if !candidate.exists() {
        return candidate;
    }

    for n in 1..=MAX_SUFFIX {
        let candidate = dir.join(suffixed_name(&base, n));
        if !candidate.exists() {
            return candidate;
        }
    }

    dir.join(suffixed_name(&base, rand_suffix()))
}

fn rand_suffix() -> u32 {
    uuid::Uuid::new_v4().as_u128() as u32
}
