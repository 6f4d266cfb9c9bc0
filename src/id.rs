//! ID generation utilities for ralphd
//!
//! Loop and event ids are timestamp-plus-random-hex strings so they sort
//! chronologically while staying collision-safe within one process.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a unique loop ID
///
/// Format: `{timestamp_ms}-{random_hex}`
/// Example: `1738300800123-a1b2`
pub fn generate_loop_id() -> String {
    let random: u16 = rand::rng().random();
    format!("{}-{:04x}", now_ms(), random)
}

/// Generate an event ID
///
/// Format: `evt-{timestamp_ms}-{random_hex}`
pub fn generate_event_id() -> String {
    let random: u16 = rand::rng().random();
    format!("evt-{}-{:04x}", now_ms(), random)
}

/// Slugify free text into a branch-name-safe segment.
///
/// Lowercases, keeps ascii alphanumerics, collapses everything else into
/// single hyphens, and bounds the result to `max_len` without cutting a word
/// mid-hyphen. Empty input slugs to "loop".
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(text.len().min(max_len));
    let mut last_hyphen = true;
    for ch in text.chars() {
        if slug.len() >= max_len {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() { "loop".to_string() } else { slug }
}
