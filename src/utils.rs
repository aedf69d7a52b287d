//! Utility functions.

use crate::error::AsmError;

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two.
pub fn align_up(addr: u64, align: u64) -> u64 {
    if align <= 1 {
        return addr;
    }
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

/// Parses an integer literal: optional `#`, optional sign, decimal or `0x` hex.
///
/// Hex literals up to 64 bits wrap into the signed range, so `0xffffffffffffffff`
/// reads as -1.
pub fn parse_int(token: &str) -> Option<i64> {
    let s = token.strip_prefix('#').unwrap_or(token);
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if body.is_empty() || body.starts_with(['+', '-']) {
        return None;
    }
    let magnitude = match body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => body.parse::<u64>().ok()?,
    };
    let v = magnitude as i64;
    Some(if neg { v.wrapping_neg() } else { v })
}

/// Formats a value as signed hex, e.g. `0x10` or `-0x8`.
pub fn signed_hex(v: i64) -> String {
    if v < 0 {
        format!("-{:#x}", v.unsigned_abs())
    } else {
        format!("{:#x}", v)
    }
}

/// Decodes the body of a string literal.
///
/// Supported escapes are `\n`, `\xHH`, one to three octal digits, and a backslash
/// followed by any other character standing for that character.
pub fn unescape(s: &str) -> Result<Vec<u8>, AsmError> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        i += 1;
        if c != b'\\' {
            out.push(c);
            continue;
        }
        let Some(&e) = bytes.get(i) else {
            return Err(AsmError::syntax("dangling backslash in string"));
        };
        i += 1;
        match e {
            b'n' => out.push(b'\n'),
            b'x' => {
                let hex = bytes
                    .get(i..i + 2)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| AsmError::syntax("bad \\x escape in string"))?;
                out.push(hex);
                i += 2;
            }
            b'0'..=b'7' => {
                let start = i - 1;
                let mut end = i;
                while end < bytes.len() && end - start < 3 && (b'0'..=b'7').contains(&bytes[end]) {
                    end += 1;
                }
                let digits = std::str::from_utf8(&bytes[start..end])
                    .map_err(|_| AsmError::syntax("bad octal escape in string"))?;
                let v = u8::from_str_radix(digits, 8).map_err(|_| {
                    AsmError::syntax(format!("octal escape \\{} is out of range", digits))
                })?;
                out.push(v);
                i = end;
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Decodes a string literal including its surrounding double quotes.
pub fn unquote(token: &str) -> Result<Vec<u8>, AsmError> {
    token
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .filter(|_| token.len() >= 2)
        .ok_or_else(|| AsmError::syntax(format!("expected quoted string, got {}", token)))
        .and_then(unescape)
}

/// Splits a source line into tokens.
///
/// Tokens are separated by whitespace. A double-quoted string is one token, quotes
/// included. `#` at the start of a token begins a comment unless it introduces a
/// numeric literal such as `#4` or `#-8`. Commas and semicolons are rejected.
pub fn tokenize(line: &str) -> Result<Vec<&str>, AsmError> {
    let bytes = line.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        match c {
            b'#' if !bytes
                .get(i + 1)
                .is_some_and(|n| n.is_ascii_digit() || *n == b'-' || *n == b'+') =>
            {
                break;
            }
            b',' | b';' => {
                return Err(AsmError::syntax("commas and semicolons are not allowed"));
            }
            b'"' => {
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(AsmError::syntax("unterminated string")),
                        Some(b'\\') => i += 2,
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
            }
            _ => {
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    if matches!(bytes[i], b',' | b';') {
                        return Err(AsmError::syntax("commas and semicolons are not allowed"));
                    }
                    i += 1;
                }
            }
        }
        tokens.push(&line[start..i]);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(0x401001, 0x1000), 0x402000);
        assert_eq!(align_up(7, 1), 7);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn integers() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("#-8"), Some(-8));
        assert_eq!(parse_int("0x1f"), Some(31));
        assert_eq!(parse_int("-0x10"), Some(-16));
        assert_eq!(parse_int("0xffffffffffffffff"), Some(-1));
        assert_eq!(parse_int("r1"), None);
        assert_eq!(parse_int("-"), None);
        assert_eq!(parse_int("--1"), None);
        assert_eq!(signed_hex(-8), "-0x8");
        assert_eq!(signed_hex(255), "0xff");
    }

    #[test]
    fn escapes() {
        assert_eq!(unescape(r"a\nb").unwrap(), b"a\nb");
        assert_eq!(unescape(r"\x41\x00").unwrap(), b"A\0");
        assert_eq!(unescape(r"\0").unwrap(), b"\0");
        assert_eq!(unescape(r"\101\0109").unwrap(), b"A\x089");
        assert_eq!(unescape(r#"\"\\"#).unwrap(), b"\"\\");
        assert!(unescape(r"\x4").is_err());
        assert_eq!(unescape(r"\377").unwrap(), [0xff]);
        assert!(unescape(r"\400").is_err());
        assert!(unescape(r"\777").is_err());
        assert_eq!(unquote(r#""hi\n""#).unwrap(), b"hi\n");
        assert!(unquote("hi").is_err());
        assert!(unquote("\"").is_err());
    }

    #[test]
    fn tokens() {
        assert_eq!(
            tokenize(r#".data 1 "a b\"c"  # trailing"#).unwrap(),
            vec![".data", "1", r#""a b\"c""#]
        );
        assert_eq!(
            tokenize("add_imm al r4 r4 #1").unwrap(),
            vec!["add_imm", "al", "r4", "r4", "#1"]
        );
        assert!(tokenize("# only a comment").unwrap().is_empty());
        assert!(tokenize("mov r0, r1").is_err());
        assert!(tokenize(r#".data 1 "open"#).is_err());
    }
}
