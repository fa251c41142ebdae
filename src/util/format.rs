//! Display formatting helpers.

/// Converts a byte count to a human-readable string using SI decimal
/// prefixes (steps of 1000). Values under 1000 in absolute value render
/// as a plain byte count.
pub fn format_file_size(bytes: i64) -> String {
    if (-1000..1000).contains(&bytes) {
        return format!("{} B", bytes);
    }
    let mut value = bytes;
    let mut prefix = 0usize;
    const PREFIXES: [char; 6] = ['k', 'M', 'G', 'T', 'P', 'E'];
    while value <= -999_950 || value >= 999_950 {
        value /= 1000;
        prefix += 1;
    }
    format!("{:.1} {}B", value as f64 / 1000.0, PREFIXES[prefix])
}

/// Shortens a user id to its first 12 characters for log lines.
pub fn short_user_id(id: &str) -> String {
    match id.char_indices().nth(12) {
        Some((cut, _)) => id[..cut].to_string(),
        None => id.to_string(),
    }
}
