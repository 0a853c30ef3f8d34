use std::path::{Path, PathBuf};

use crate::formats::TrackKind;

/// Longest file stem, in bytes, kept from a title.
const MAX_STEM_BYTES: usize = 200;

/// Turn a free-form title into a file stem.
///
/// Path separators, characters rejected by common filesystems and control
/// characters become `_`; leading and trailing dots and spaces are dropped.
/// Falls back to `fallback` when nothing is left.
pub fn sanitize_filename(title: &str, fallback: &str) -> String {
    const INVALID: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

    let replaced: String = title
        .chars()
        .map(|c| if INVALID.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    let trimmed = replaced.trim_matches(|c| c == '.' || c == ' ');

    if trimmed.is_empty() {
        return if fallback.is_empty() {
            "output".to_string()
        } else {
            sanitize_filename(fallback, "")
        };
    }

    let mut end = trimmed.len().min(MAX_STEM_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].trim_end_matches([' ', '.']).to_string()
}

/// `<output_dir>/<sanitized title>.<container>`.
pub fn output_path(output_dir: &Path, title: &str, identifier: &str, container: &str) -> PathBuf {
    output_dir.join(format!("{}.{container}", sanitize_filename(title, identifier)))
}

/// FIFO path of one track of `identifier`.
pub fn channel_path(channel_dir: &Path, kind: TrackKind, identifier: &str) -> PathBuf {
    channel_dir.join(format!("{kind}_{}", sanitize_filename(identifier, "track")))
}
