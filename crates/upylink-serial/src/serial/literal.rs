//! Python literal encoding and decoding.
//!
//! Outbound, file content and remote names are embedded in generated
//! command text as `b'...'` and `'...'` literals. Inbound, the REPL prints
//! `repr()` output: lists of strings from `os.listdir()` and the named tuple
//! from `os.uname()`.

use crate::serial::error::{ReplError, ReplResult};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Encoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Render `data` as a Python bytes literal, e.g. `b'ab\x00\n'`.
pub fn encode_bytes_literal(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2 + 3);
    out.push_str("b'");
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\t' => out.push_str("\\t"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('\'');
    out
}

/// Render `text` as a single-quoted Python string literal.
pub fn encode_str_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32))
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Decoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type RegexCell = OnceLock<Result<Regex, regex::Error>>;

static LIST_ITEM: RegexCell = OnceLock::new();
static UNAME_FIELD: RegexCell = OnceLock::new();

/// Compile `pattern` on first use and keep it in `cell`.
fn cached(cell: &'static RegexCell, pattern: &str) -> ReplResult<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| ReplError::decode(format!("Regex error: {}", e)))
}

/// Parse the `repr()` of a list or tuple of strings.
pub fn parse_string_list(text: &str) -> ReplResult<Vec<String>> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .or_else(|| {
            trimmed
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
        })
        .ok_or_else(|| ReplError::decode(format!("Expected a list of names, got {:?}", trimmed)))?;

    let item_re = cached(&LIST_ITEM, r#"^\s*('(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*")\s*(,|$)"#)?;
    let mut items = Vec::new();
    let mut rest = inner;
    while !rest.trim().is_empty() {
        let caps = item_re
            .captures(rest)
            .ok_or_else(|| ReplError::decode(format!("Malformed list entry near {:?}", rest)))?;
        let quoted = &caps[1];
        items.push(unescape_str(&quoted[1..quoted.len() - 1])?);
        rest = &rest[caps[0].len()..];
        if &caps[2] != "," && !rest.trim().is_empty() {
            return Err(ReplError::decode(format!("Trailing data in list: {:?}", rest)));
        }
    }
    Ok(items)
}

/// Parse `os.uname()` output into a field name → value map.
pub fn parse_uname(text: &str) -> ReplResult<BTreeMap<String, String>> {
    let field_re = cached(&UNAME_FIELD, r#"(\w+)=('(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*")"#)?;
    let mut fields = BTreeMap::new();
    for caps in field_re.captures_iter(text) {
        let quoted = &caps[2];
        fields.insert(caps[1].to_string(), unescape_str(&quoted[1..quoted.len() - 1])?);
    }
    if fields.is_empty() {
        return Err(ReplError::decode(format!(
            "Could not read device version from {:?}",
            text.trim()
        )));
    }
    Ok(fields)
}

/// Decode a Python bytes literal (`b'...'` or `b"..."`).
pub fn decode_bytes_literal(text: &str) -> ReplResult<Vec<u8>> {
    let t = text.trim();
    let body = t
        .strip_prefix("b'")
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| t.strip_prefix("b\"").and_then(|s| s.strip_suffix('"')))
        .ok_or_else(|| ReplError::decode(format!("Not a bytes literal: {:?}", t)))?;

    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'\'') => out.push(b'\''),
            Some(b'"') => out.push(b'"'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'0') => out.push(0),
            Some(b'x') => {
                let hi = bytes.next();
                let lo = bytes.next();
                out.push(hex_pair(hi, lo)?);
            }
            other => {
                return Err(ReplError::decode(format!(
                    "Unsupported escape in bytes literal: {:?}",
                    other.map(|b| b as char)
                )))
            }
        }
    }
    Ok(out)
}

/// Decode a single- or double-quoted Python string literal.
pub fn decode_str_literal(text: &str) -> ReplResult<String> {
    let t = text.trim();
    let body = t
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| t.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .ok_or_else(|| ReplError::decode(format!("Not a string literal: {:?}", t)))?;
    unescape_str(body)
}

fn hex_pair(hi: Option<u8>, lo: Option<u8>) -> ReplResult<u8> {
    let digit = |d: Option<u8>| {
        d.and_then(|d| (d as char).to_digit(16))
            .ok_or_else(|| ReplError::decode("Bad \\x escape"))
    };
    Ok((digit(hi)? * 16 + digit(lo)?) as u8)
}

/// Undo the escapes Python's `repr()` uses inside string literals.
fn unescape_str(body: &str) -> ReplResult<String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('x') => {
                let code: String = chars.by_ref().take(2).collect();
                out.push(code_point(&code)?);
            }
            Some('u') => {
                let code: String = chars.by_ref().take(4).collect();
                out.push(code_point(&code)?);
            }
            other => {
                return Err(ReplError::decode(format!(
                    "Unsupported escape in string: \\{}",
                    other.unwrap_or(' ')
                )))
            }
        }
    }
    Ok(out)
}

fn code_point(hex: &str) -> ReplResult<char> {
    u32::from_str_radix(hex, 16)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| ReplError::decode(format!("Bad escape code {:?}", hex)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::ReplErrorKind;

    #[test]
    fn test_encode_bytes_literal() {
        assert_eq!(encode_bytes_literal(b""), "b''");
        assert_eq!(encode_bytes_literal(b"print('hi')\n"), "b'print(\\'hi\\')\\n'");
        assert_eq!(encode_bytes_literal(&[0x00, 0xff, b'\\']), "b'\\x00\\xff\\\\'");
    }

    #[test]
    fn test_bytes_literal_all_values() {
        let data: Vec<u8> = (0..=255u8).collect();
        let encoded = encode_bytes_literal(&data);
        assert!(encoded.is_ascii());
        assert_eq!(decode_bytes_literal(&encoded).unwrap(), data);
    }

    #[test]
    fn test_encode_str_literal() {
        assert_eq!(encode_str_literal("main.py"), "'main.py'");
        assert_eq!(encode_str_literal("it's"), "'it\\'s'");
        assert_eq!(encode_str_literal("a\\b"), "'a\\\\b'");
        assert_eq!(encode_str_literal("café"), "'café'");
    }

    #[test]
    fn test_parse_string_list() {
        assert_eq!(
            parse_string_list("['a.py', 'b.py']\r\n").unwrap(),
            vec!["a.py".to_string(), "b.py".to_string()]
        );
        assert!(parse_string_list("[]").unwrap().is_empty());
        assert_eq!(parse_string_list("('x',)").unwrap(), vec!["x".to_string()]);
        assert_eq!(
            parse_string_list(r#"["it's", 'tab\there']"#).unwrap(),
            vec!["it's".to_string(), "tab\there".to_string()]
        );
    }

    #[test]
    fn test_parse_string_list_rejects_garbage() {
        for bad in ["not a list", "[1, 2]", "['a' 'b']", "['unterminated]", ""] {
            let err = parse_string_list(bad).unwrap_err();
            assert_eq!(err.kind, ReplErrorKind::ProtocolDecodeError, "{bad}");
        }
    }

    #[test]
    fn test_parse_uname() {
        let text = "(sysname='microbit', nodename='microbit', release='1.0', \
                    version=\"micro:bit v1.0-b'e10a5ff' on 2018-6-8\", \
                    machine='micro:bit with nRF51822')\r\n";
        let fields = parse_uname(text).unwrap();
        assert_eq!(fields["sysname"], "microbit");
        assert_eq!(fields["release"], "1.0");
        assert_eq!(fields["version"], "micro:bit v1.0-b'e10a5ff' on 2018-6-8");
        assert_eq!(fields["machine"], "micro:bit with nRF51822");
    }

    #[test]
    fn test_patterns_compile_once() {
        parse_string_list("['a']").unwrap();
        let first = LIST_ITEM.get().unwrap().as_ref().unwrap() as *const Regex;
        parse_string_list("['b', 'c']").unwrap();
        let second = LIST_ITEM.get().unwrap().as_ref().unwrap() as *const Regex;
        assert_eq!(first, second);

        parse_uname("(sysname='esp32')").unwrap();
        assert!(UNAME_FIELD.get().is_some_and(|r| r.is_ok()));
    }

    #[test]
    fn test_parse_uname_empty() {
        let err = parse_uname("Traceback").unwrap_err();
        assert_eq!(err.kind, ReplErrorKind::ProtocolDecodeError);
    }

    #[test]
    fn test_str_literal_decodes_what_it_encodes() {
        for name in ["main.py", "it's here.txt", "back\\slash", "naïve.py"] {
            assert_eq!(decode_str_literal(&encode_str_literal(name)).unwrap(), name);
        }
        assert!(decode_str_literal("unquoted").is_err());
    }

    #[test]
    fn test_decode_bytes_literal_errors() {
        assert!(decode_bytes_literal("'plain'").is_err());
        assert!(decode_bytes_literal("b'\\xZZ'").is_err());
    }
}
