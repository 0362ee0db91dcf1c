//! Pure string helpers for comparing event titles across providers

/// Normalize an event title for cross-provider duplicate detection.
///
/// Providers disagree on casing, whitespace and decoration, so the
/// comparison key lowercases, drops punctuation and collapses runs of
/// whitespace.
///
/// # Examples
///
/// ```
/// use calsync_domain::utils::title::normalize_title;
///
/// assert_eq!(normalize_title("  Weekly   Sync! "), "weekly sync");
/// assert_eq!(normalize_title("Q3 - Planning"), "q3 planning");
/// ```
#[must_use]
pub fn normalize_title(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_lowercase().next().unwrap_or(c) } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Returns true when two titles refer to the same meeting after normalization.
#[must_use]
pub fn titles_match(a: &str, b: &str) -> bool {
    let left = normalize_title(a);
    !left.is_empty() && left == normalize_title(b)
}
