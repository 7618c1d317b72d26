//! Guest block device letters.
//!
//! The n-th disk of a guest is `sda`, `sdb`, … `sdz`, `sdaa`, …; this module
//! converts between the zero-based index and the letter suffix. The suffix
//! is a bijective base-26 numeral: no letter stands for zero.

const ALPHABET: &[u8; 26] = b"abcdefghijklmnopqrstuvwxyz";

/// Letter suffix for a zero-based device index: 0 → "a", 26 → "aa".
pub fn index_to_devname(index: usize) -> String {
    let mut letters = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        n -= 1;
        letters.push(ALPHABET[n % 26]);
        n /= 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

/// Zero-based device index of a letter suffix: "a" → 0, "aa" → 26.
///
/// Only lowercase ASCII letters are meaningful; other characters are
/// skipped.
pub fn devname_to_index(devname: &str) -> usize {
    devname
        .bytes()
        .filter(u8::is_ascii_lowercase)
        .fold(0usize, |acc, b| acc * 26 + usize::from(b - b'a') + 1)
        .saturating_sub(1)
}
