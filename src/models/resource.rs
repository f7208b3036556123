//! Token generation and filename handling for uploaded resources.

use rand::{Rng, distributions::Alphanumeric, rngs::OsRng};

/// Length of the public token grouping an upload.
pub const TOKEN_LEN: usize = 10;

/// Length of the secret required to delete a resource.
pub const DELETION_TOKEN_LEN: usize = 24;

/// Suffix reserved for metadata records stored next to content.
pub const METADATA_SUFFIX: &str = ".metadata";

const MAX_FILENAME_LEN: usize = 255;

/// Fresh unguessable upload token.
pub fn generate_token() -> String {
    random_alphanumeric(TOKEN_LEN)
}

/// Fresh deletion secret.
pub fn generate_deletion_token() -> String {
    random_alphanumeric(DELETION_TOKEN_LEN)
}

fn random_alphanumeric(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Reduce a client-supplied filename to something safe to store.
///
/// Keeps only the last path component, drops control characters and leading
/// dots, and replaces `:` (the key-value backend's separator) with `_`.
/// Returns `None` when nothing usable is left, the name contains `..`, or it
/// collides with the metadata suffix.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == ':' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').trim();

    if cleaned.is_empty()
        || cleaned.len() > MAX_FILENAME_LEN
        || cleaned.contains("..")
        || cleaned.ends_with(METADATA_SUFFIX)
    {
        return None;
    }
    Some(cleaned.to_string())
}
