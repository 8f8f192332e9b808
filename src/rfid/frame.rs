//! Extraction of structured fields from tag-tool output.
//!
//! Everything here is pure and tolerant: unrecognised text yields an empty
//! result, never an error.

use std::sync::LazyLock;

use regex::Regex;

/// Table row as printed by `hf 15 rdmulti`: `| 65 6E 7A 6F | enzo |`.
static TABLE_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\|\s+([0-9A-Fa-f]{2}(?:\s[0-9A-Fa-f]{2})*)\s+\|").expect("Invalid table row regex")
});

static HEX_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9A-Fa-f]{2}\b").expect("Invalid hex token regex"));

/// `UID.......... E0 04 01 50 ...` (older clients) or `UID: E0 04 ...`.
static UID_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"UID(?:\.{3,}|:)\s*([0-9A-Fa-f]{2}(?: ?[0-9A-Fa-f]{2})*)").expect("Invalid UID regex")
});

/// Decode the memory bytes printed in `text`.
///
/// When the output contains table rows only the row contents are decoded,
/// so block numbers and ASCII columns are not mistaken for data. Otherwise
/// every standalone two-digit hex token is taken.
pub fn extract_hex_bytes(text: &str) -> Vec<u8> {
    let rows: Vec<&str> = TABLE_ROW
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();

    if rows.is_empty() {
        return decode_tokens(text);
    }
    rows.into_iter().flat_map(decode_tokens).collect()
}

fn decode_tokens(text: &str) -> Vec<u8> {
    HEX_TOKEN
        .find_iter(text)
        .filter_map(|m| u8::from_str_radix(m.as_str(), 16).ok())
        .collect()
}

/// Tag UID as an upper-case hex string without separators.
pub fn extract_identifier(text: &str) -> Option<String> {
    let caps = UID_FIELD.captures(text)?;
    let uid: String = caps
        .get(1)?
        .as_str()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    if uid.is_empty() { None } else { Some(uid) }
}

/// Printable neighbourhood of the first occurrence of `target` in `memory`.
///
/// Returns `memory[idx - padding .. idx + target.len() + padding]`, clamped
/// to the buffer and filtered to bytes in `32..=126`. The filter can shift
/// apparent boundaries, so callers re-check containment with
/// [`contains_marker`] rather than assuming the marker survived intact.
pub fn extract_ascii_snippet(memory: &[u8], target: &[u8], padding: usize) -> Option<Vec<u8>> {
    if target.is_empty() || target.len() > memory.len() {
        return None;
    }
    let idx = memory.windows(target.len()).position(|w| w == target)?;
    let start = idx.saturating_sub(padding);
    let end = idx
        .saturating_add(target.len())
        .saturating_add(padding)
        .min(memory.len());

    Some(
        memory[start..end]
            .iter()
            .copied()
            .filter(|b| (32..=126).contains(b))
            .collect(),
    )
}

pub fn contains_marker(snippet: &[u8], target: &[u8]) -> bool {
    !target.is_empty() && snippet.windows(target.len()).any(|w| w == target)
}
