//! Utility functions for Palimpsest
//!
//! Hashing, word tokenisation, atomic file writes and display helpers
//! shared by the engines, the file-backed store and the CLI.
//!
//! ## Word tokenisation
//!
//! A "word" is a maximal run of alphanumeric characters (apostrophes inside
//! a word are kept, so "don't" is one word). Tokens are lowercased before
//! comparison. This is what the semantic analyzer's Jaccard similarity and
//! the node metadata word counts are computed over.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::trace;

/// Hash arbitrary data using SHA-256
///
/// Returns the hash as a 64-character hexadecimal string.
///
/// # Example
///
/// ```rust
/// use palimpsest::utils::hash_data;
///
/// let hash = hash_data(b"Hello, world!");
/// assert_eq!(hash.len(), 64);
/// assert_eq!(hash, hash_data(b"Hello, world!"));
/// ```
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash document text using SHA-256
pub fn hash_content(content: &str) -> String {
    hash_data(content.as_bytes())
}

/// Split text into lowercase words
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.trim_matches('\''))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Unordered set of lowercase words in a text
pub fn word_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

/// Number of words in a text
pub fn word_count(text: &str) -> usize {
    tokenize(text).len()
}

/// Jaccard similarity of two word sets
///
/// Two empty sets are considered identical.
pub fn jaccard_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Format bytes as human-readable string
///
/// # Example
///
/// ```rust
/// use palimpsest::utils::format_bytes;
///
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Shorten an id for display
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Atomic file write
///
/// Writes into a temporary file in the destination directory, syncs it,
/// then renames it over the target, so the target is never observed in a
/// partially written state.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_functions() {
        let hash1 = hash_content("Hello, World!");
        let hash2 = hash_data(b"Hello, World!");
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
        assert_ne!(hash_content(""), hash_content(" "));
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("The WIZARD's spell, don't-stop!"),
            vec!["the", "wizard's", "spell", "don't", "stop"]
        );
        assert!(tokenize("  ... ").is_empty());
        assert_eq!(word_count("naïve café résumé"), 3);
    }

    #[test]
    fn test_jaccard() {
        let a = word_set("the cat sat");
        let b = word_set("the cat ran");
        assert!((jaccard_similarity(&a, &b) - 0.5).abs() < f64::EPSILON);
        assert_eq!(jaccard_similarity(&word_set(""), &word_set("")), 1.0);
        assert_eq!(jaccard_similarity(&word_set("a"), &word_set("")), 0.0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_atomic_write() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested").join("record.json");
        atomic_write(&target, b"first").unwrap();
        atomic_write(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
    }
}
