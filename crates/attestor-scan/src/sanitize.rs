//! Filename sanitizing for on-disk scan targets.

use attestor_core::defaults::SCAN_FILENAME_MAX_LEN;
use uuid::Uuid;

/// Reduce a user-supplied filename to a safe single path token.
///
/// Path components are stripped, the result is lowercased and restricted to
/// `[a-z0-9._-]`, leading dots and dashes are removed so the token can never
/// be read as a hidden file or a command-line flag, and the length is capped
/// with the extension preserved. Empty results fall back to a random name.
pub fn sanitize_filename(filename: Option<&str>) -> String {
    let name = filename
        .map(|f| f.rsplit(['/', '\\']).next().unwrap_or(f))
        .unwrap_or_default();

    let mapped: String = name
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect();

    let trimmed = mapped.trim_start_matches(['.', '-']);
    if trimmed.chars().all(|c| c == '_' || c == '.') {
        return fallback_name();
    }

    truncate_preserving_extension(trimmed, SCAN_FILENAME_MAX_LEN)
}

fn fallback_name() -> String {
    format!("artifact-{}", Uuid::new_v4().simple())
}

// All characters are ASCII here so byte slicing is safe.
fn truncate_preserving_extension(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if name.len() - dot < max / 2 => {
            let ext = &name[dot..];
            format!("{}{}", &name[..max - ext.len()], ext)
        }
        _ => name[..max].to_string(),
    }
}
