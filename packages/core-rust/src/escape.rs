//! Bijective escaping of arbitrary text into the identifier alphabet `[A-Za-z0-9_]+`.
//!
//! Type names and member names are derived from user-editable text, so they
//! may contain anything. The query surface references members directly, so
//! every generated name must be a plain identifier.
//!
//! # Format
//!
//! - Input is encoded as UTF-8 and every byte outside `[0-9A-Za-z_]` becomes
//!   `X` followed by two uppercase hex digits (space → `X20`).
//! - A literal `X` that is already followed by two uppercase hex digits is
//!   first rewritten to `X58` so decoding stays unambiguous.
//! - If the result is empty, is a [reserved word](RESERVED_WORDS), or ends
//!   in `_`, a single `_` sentinel is appended. [`unescape`] strips it.
//!
//! ```
//! use dynastore_core::escape::{escape, unescape};
//!
//! assert_eq!(escape("my field"), "myX20field");
//! assert_eq!(escape("id"), "id_");
//! assert_eq!(unescape("myX20field").unwrap(), "my field");
//! ```

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{StoreError, StoreResult};

/// Marker byte that introduces an escaped byte.
const MARKER: u8 = b'X';

/// Appended to escaped names that would otherwise be ambiguous.
const SENTINEL: char = '_';

/// Names that may never be emitted verbatim by [`escape`].
///
/// Language keywords plus names the engine uses on every record
/// (`id`, `className`). No entry may end in `_`; see
/// [`validate_reserved_words`].
pub const RESERVED_WORDS: &[&str] = &[
    // strict keywords
    "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum",
    "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
    "mut", "pub", "ref", "return", "self", "Self", "static", "struct", "super", "trait", "true",
    "type", "unsafe", "use", "where", "while",
    // reserved for future use
    "abstract", "become", "box", "do", "final", "gen", "macro", "override", "priv", "try",
    "typeof", "unsized", "virtual", "yield",
    // engine-reserved record fields
    "id", "className",
];

static LITERAL_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("X([0-9A-F]{2})").expect("static regex is valid"));

/// Escapes `raw` into a name matching `[A-Za-z0-9_]+`.
#[must_use]
pub fn escape(raw: &str) -> String {
    let protected = LITERAL_MARKER.replace_all(raw, "X58${1}");

    let mut out = String::with_capacity(protected.len());
    for &byte in protected.as_bytes() {
        if is_identifier_byte(byte) {
            out.push(char::from(byte));
        } else {
            push_escaped(byte, &mut out);
        }
    }

    if out.is_empty() || out.ends_with(SENTINEL) || RESERVED_WORDS.contains(&out.as_str()) {
        out.push(SENTINEL);
    }
    out
}

/// Reverses [`escape`].
///
/// # Errors
///
/// Returns [`StoreError::MalformedIdentifier`] if `escaped` contains bytes
/// outside the identifier alphabet or decodes to invalid UTF-8.
pub fn unescape(escaped: &str) -> StoreResult<String> {
    let malformed = || StoreError::MalformedIdentifier {
        identifier: escaped.to_string(),
    };

    let body = escaped.strip_suffix(SENTINEL).unwrap_or(escaped);
    let bytes = body.as_bytes();
    if !bytes.iter().copied().all(is_identifier_byte) {
        return Err(malformed());
    }

    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == MARKER && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                decoded.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    String::from_utf8(decoded).map_err(|_| malformed())
}

/// Checks that no reserved word ends in the sentinel character.
///
/// Run once at engine start-up; a failure is a fatal configuration error.
///
/// # Errors
///
/// Returns [`StoreError::MalformedSchema`] naming the offending word.
pub fn validate_reserved_words(words: &[&str]) -> StoreResult<()> {
    match words.iter().find(|w| w.is_empty() || w.ends_with(SENTINEL)) {
        Some(word) => Err(StoreError::MalformedSchema {
            type_name: String::new(),
            reason: format!("reserved word [{word}] must be non-empty and must not end in '_'"),
        }),
        None => Ok(()),
    }
}

/// Returns `true` if `s` is non-empty and only uses `[A-Za-z0-9_]`.
#[must_use]
pub fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_identifier_byte)
}

fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

fn push_escaped(byte: u8, out: &mut String) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    out.push(char::from(MARKER));
    out.push(char::from(HEX[usize::from(byte >> 4)]));
    out.push(char::from(HEX[usize::from(byte & 0x0F)]));
}

/// Uppercase-only hex digit value; lowercase digits are never produced.
fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn round_trip(s: &str) -> String {
        unescape(&escape(s)).unwrap()
    }

    #[test]
    fn plain_identifiers_pass_through() {
        assert_eq!(escape("title"), "title");
        assert_eq!(escape("Main"), "Main");
        assert_eq!(escape("a1b2"), "a1b2");
    }

    #[test]
    fn disallowed_bytes_become_hex() {
        assert_eq!(escape("a b"), "aX20b");
        assert_eq!(escape("a.b"), "aX2Eb");
        // U+00E9 is C3 A9 in UTF-8
        assert_eq!(escape("\u{e9}"), "XC3XA9");
    }

    #[test]
    fn literal_marker_pattern_is_protected() {
        assert_eq!(escape("X41"), "X5841");
        assert_eq!(round_trip("X41"), "X41");
        assert_eq!(round_trip("XX41"), "XX41");
        assert_eq!(round_trip("X58"), "X58");
        // lowercase hex is not a marker and needs no protection
        assert_eq!(escape("Xab"), "Xab");
        assert_eq!(escape("testX20xcode"), "testX5820xcode");
        assert_eq!(escape("testX2codeNotQuite"), "testX2codeNotQuite");
        assert_eq!(escape("testX2CisEscaped"), "testX582CisEscaped");
        assert_eq!(unescape("testX582CisEscaped").unwrap(), "testX2CisEscaped");
    }

    #[test]
    fn reserved_words_get_sentinel() {
        assert_eq!(escape("id"), "id_");
        assert_eq!(escape("className"), "className_");
        assert_eq!(escape("type"), "type_");
        assert_eq!(round_trip("id"), "id");
        assert_eq!(round_trip("className"), "className");
    }

    #[test]
    fn trailing_underscore_gets_sentinel() {
        assert_eq!(escape("name_"), "name__");
        assert_eq!(escape("_"), "__");
        assert_eq!(round_trip("name_"), "name_");
        assert_eq!(round_trip("__"), "__");
    }

    #[test]
    fn empty_string_is_a_single_sentinel() {
        assert_eq!(escape(""), "_");
        assert_eq!(round_trip(""), "");
    }

    #[test]
    fn unescape_rejects_foreign_bytes() {
        assert!(matches!(
            unescape("a b"),
            Err(StoreError::MalformedIdentifier { .. })
        ));
    }

    #[test]
    fn unescape_rejects_invalid_utf8() {
        // a lone continuation byte
        assert!(matches!(
            unescape("X80"),
            Err(StoreError::MalformedIdentifier { .. })
        ));
    }

    #[test]
    fn builtin_reserved_words_are_valid() {
        assert!(validate_reserved_words(RESERVED_WORDS).is_ok());
    }

    #[test]
    fn reserved_word_ending_in_sentinel_is_fatal() {
        let err = validate_reserved_words(&["id", "bad_"]).unwrap_err();
        assert!(err.to_string().contains("bad_"));
    }

    proptest! {
        #[test]
        fn escape_is_inverted_by_unescape(s in any::<String>()) {
            prop_assert_eq!(round_trip(&s), s);
        }

        #[test]
        fn escape_output_is_identifier(s in any::<String>()) {
            prop_assert!(is_identifier(&escape(&s)));
        }

        #[test]
        fn marker_heavy_strings_round_trip(s in "(X|[0-9A-F]|_|\\.| |id){0,16}") {
            prop_assert_eq!(round_trip(&s), s);
        }
    }
}
