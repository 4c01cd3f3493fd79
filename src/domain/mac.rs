//! MAC address normalization
//!
//! Gateways and tags report MACs in any mix of case and separators, and the
//! catalog stores whatever the operator typed. Lookups therefore try a small
//! ordered set of spellings.

use smallvec::SmallVec;

/// Lookup spellings for one MAC, highest priority first
pub type MacCandidates = SmallVec<[String; 4]>;

/// Canonical key: hex digits only, upper-cased.
///
/// Returns `None` when nothing hex-like remains. Inputs that are not exactly
/// 12 hex digits are returned cleaned but otherwise as-is.
pub fn normalize(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// `AA:BB:CC:DD:EE:FF` form of a 12-digit canonical key
pub fn to_colon(canonical: &str) -> Option<String> {
    if canonical.len() != 12 || !canonical.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let pairs: Vec<&str> = (0..6).map(|i| &canonical[i * 2..i * 2 + 2]).collect();
    Some(pairs.join(":"))
}

/// Ordered, de-duplicated lookup candidates: trimmed raw, upper-cased raw,
/// canonical, colon form
pub fn candidates(raw: &str) -> MacCandidates {
    let mut out = MacCandidates::new();
    let mut push = |value: String| {
        if !value.is_empty() && !out.contains(&value) {
            out.push(value);
        }
    };

    let trimmed = raw.trim();
    push(trimmed.to_string());
    push(trimmed.to_ascii_uppercase());
    if let Some(canonical) = normalize(trimmed) {
        if let Some(colon) = to_colon(&canonical) {
            push(canonical);
            push(colon);
        } else {
            push(canonical);
        }
    }
    out
}
