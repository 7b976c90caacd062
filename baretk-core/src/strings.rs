//! ASCII string scanner
//!
//! A linear scan over raw file bytes, independent of the container format.
//! Runs of text characters at least `min_len` long are reported with the file
//! offset of their first byte.
//!
//! # Text characters
//! - printable ASCII `0x20..=0x7E` and `\t` always
//! - `\n` and `\r` only when `printable_only` is false

use serde::Serialize;
use std::fmt::Write;

/// One string run found in the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FoundString {
    /// File offset of the first byte
    pub offset: usize,
    pub text: String,
}

#[inline]
fn is_text(byte: u8, printable_only: bool) -> bool {
    matches!(byte, 0x20..=0x7e | b'\t') || (!printable_only && matches!(byte, b'\n' | b'\r'))
}

/// Scan `bytes` for ASCII runs of at least `min_len` characters.
///
/// A `min_len` of 0 behaves like 1.
pub fn scan_strings(bytes: &[u8], min_len: usize, printable_only: bool) -> Vec<FoundString> {
    let min_len: usize = min_len.max(1);
    let mut found: Vec<FoundString> = Vec::new();
    let mut start: Option<usize> = None;

    // A sentinel position past the end flushes a trailing run.
    for pos in 0..=bytes.len() {
        let text: bool = bytes.get(pos).is_some_and(|&b| is_text(b, printable_only));
        match (start, text) {
            (None, true) => start = Some(pos),
            (Some(s), false) => {
                if pos - s >= min_len {
                    found.push(FoundString {
                        offset: s,
                        // Every byte of the run is ASCII.
                        text: bytes[s..pos].iter().map(|&b| b as char).collect(),
                    });
                }
                start = None;
            }
            _ => {}
        }
    }

    log::debug!("string scan: {} run(s) of length >= {}", found.len(), min_len);
    found
}

/// Render found strings as `offset: text` lines, offsets in hex.
///
/// Line breaks inside a run are escaped so every string stays on one line.
pub fn render_strings(strings: &[FoundString]) -> String {
    let mut out = String::with_capacity(strings.iter().map(|s| s.text.len() + 12).sum());
    for s in strings {
        let text: String = s.text.replace('\n', "\\n").replace('\r', "\\r");
        // Writing into a String cannot fail.
        let _ = writeln!(out, "{:08x}: {}", s.offset, text);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn finds_runs_with_offsets() {
        let bytes = b"\x00\x01hello\x00ab\x00world!\xff";
        let found = scan_strings(bytes, 4, true);
        assert_eq!(
            found,
            vec![
                FoundString {
                    offset: 2,
                    text: "hello".to_string()
                },
                FoundString {
                    offset: 11,
                    text: "world!".to_string()
                },
            ]
        );
    }

    #[test]
    fn run_at_end_of_input_is_reported() {
        let found = scan_strings(b"\x00tail", 4, true);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].offset, 1);
        assert_eq!(found[0].text, "tail");
    }

    #[test]
    fn newlines_split_runs_only_when_printable() {
        let bytes = b"line one\nline two";
        assert_eq!(scan_strings(bytes, 4, false).len(), 1);

        let printable = scan_strings(bytes, 4, true);
        assert_eq!(printable.len(), 2);
        assert_eq!(printable[1].offset, 9);
    }

    #[test]
    fn tab_is_text() {
        let found = scan_strings(b"a\tb\tc", 5, true);
        assert_eq!(found[0].text, "a\tb\tc");
    }

    #[test]
    fn zero_min_len_acts_as_one() {
        let found = scan_strings(b"a\x00b", 0, true);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn render_escapes_line_breaks() {
        let found = scan_strings(b"\x00\x00\x00\x00ab\ncd", 4, false);
        assert_eq!(render_strings(&found), "00000004: ab\\ncd\n");
    }
}
