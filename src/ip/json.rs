// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Minimal JSON token writing for the streaming serializer: string
//! escaping and number formatting. Parsing of request bodies is done with
//! `serde_json`; only response generation is hand-rolled, because it must
//! be resumable.

/// Appends `s` as a JSON string literal, quotes included.
pub fn push_string(out: &mut Vec<u8>, s: &str) {
    out.push(b'"');
    for byte in s.bytes() {
        match byte {
            b'"' => out.extend_from_slice(b"\\\""),
            b'\\' => out.extend_from_slice(b"\\\\"),
            0x08 => out.extend_from_slice(b"\\b"),
            0x0c => out.extend_from_slice(b"\\f"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x00..=0x1f => {
                out.extend_from_slice(format!("\\u{:04x}", byte).as_bytes());
            }
            _ => out.push(byte),
        }
    }
    out.push(b'"');
}

/// Renders a float without trailing zeros; non-finite values have no JSON
/// representation and render as null.
pub fn push_float(out: &mut Vec<u8>, value: f32) {
    if value.is_finite() {
        out.extend_from_slice(format!("{}", value).as_bytes());
    } else {
        out.extend_from_slice(b"null");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_of(s: &str) -> String {
        let mut out = Vec::new();
        push_string(&mut out, s);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn escapes_specials() {
        assert_eq!(string_of("plain"), "\"plain\"");
        assert_eq!(string_of("a\"b\\c"), "\"a\\\"b\\\\c\"");
        assert_eq!(string_of("line\nbreak\ttab"), "\"line\\nbreak\\ttab\"");
        assert_eq!(string_of("\u{1}"), "\"\\u0001\"");
        // Multi-byte UTF-8 passes through untouched.
        assert_eq!(string_of("Träger"), "\"Träger\"");
    }

    #[test]
    fn floats_have_no_trailing_zeros() {
        let mut out = Vec::new();
        push_float(&mut out, 1.5);
        assert_eq!(out, b"1.5");
        out.clear();
        push_float(&mut out, 100.0);
        assert_eq!(out, b"100");
        out.clear();
        push_float(&mut out, f32::INFINITY);
        assert_eq!(out, b"null");
    }

    #[test]
    fn escaped_output_parses_back() {
        let nasty = "quote\" backslash\\ control\u{2} ünïcode";
        let parsed: String = serde_json::from_str(&string_of(nasty)).unwrap();
        assert_eq!(parsed, nasty);
    }
}
