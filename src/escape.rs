//! Line normalization for command output.
//!
//! Output lines are stored as newline-terminated strings. Bytes that would
//! not survive a round trip through a UTF-8 test file are escaped with a
//! backslash and the line is tagged with [`ESC_SUFFIX`].

use std::fmt::Write as _;
use thiserror::Error;

/// Marks an expected line as a regular expression.
pub const RE_SUFFIX: &str = " (re)";
/// Marks an expected line as a glob pattern.
pub const GLOB_SUFFIX: &str = " (glob)";
/// Marks a line whose raw output had no final newline.
pub const NO_EOL_SUFFIX: &str = " (no-eol)";
/// Marks a line containing backslash escapes.
pub const ESC_SUFFIX: &str = " (esc)";

/// Error returned when an ` (esc)` line cannot be decoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EscapeError {
    /// A backslash was followed by something that is not a known escape.
    #[error("invalid escape sequence at offset {offset}")]
    InvalidSequence { offset: usize },
    /// The decoded bytes are not valid UTF-8.
    #[error("unescaped text is not valid UTF-8")]
    NotUtf8,
}

/// Remove a final end-of-line from `s`.
///
/// Both Unix (`"\n"`) and DOS (`"\r\n"`) line endings are removed.
pub fn drop_eol(s: &str) -> &str {
    &s[..s.len() - eol_len(s.as_bytes())]
}

fn eol_len(s: &[u8]) -> usize {
    match s {
        [.., b'\r', b'\n'] => 2,
        [.., b'\n'] => 1,
        _ => 0,
    }
}

/// Escape non-printable characters in `s`.
///
/// See [`escape_bytes`].
#[cfg_attr(not(test), allow(dead_code))]
pub fn escape(s: &str) -> String {
    escape_bytes(s.as_bytes())
}

/// Escape non-printable characters and invalid UTF-8 in a raw output line.
///
/// If anything had to be escaped, `" (esc)"` is appended before the final
/// newline (which is kept unescaped). `"` and `\` are printable, so a line
/// containing only those is returned unchanged. Once a line is marked,
/// backslashes are doubled so that [`unescape_bytes`] can reverse it.
pub fn escape_bytes(s: &[u8]) -> String {
    let eol = eol_len(s);
    let body = &s[..s.len() - eol];

    let mut escaped = String::with_capacity(body.len());
    let mut changed = false;
    for chunk in body.utf8_chunks() {
        for c in chunk.valid().chars() {
            match c {
                '"' => escaped.push('"'),
                '\\' => escaped.push_str("\\\\"),
                c if is_printable(c) => escaped.push(c),
                c => {
                    changed = true;
                    push_escaped_char(&mut escaped, c);
                }
            }
        }
        for byte in chunk.invalid() {
            changed = true;
            let _ = write!(escaped, "\\x{byte:02x}");
        }
    }

    if !changed && let Ok(text) = std::str::from_utf8(s) {
        return text.to_owned();
    }

    escaped.push_str(ESC_SUFFIX);
    // The line ending is ASCII, so this cannot split a character.
    escaped.push_str(&String::from_utf8_lossy(&s[s.len() - eol..]));
    escaped
}

fn push_escaped_char(out: &mut String, c: char) {
    let _ = match c {
        '\x07' => write!(out, "\\a"),
        '\x08' => write!(out, "\\b"),
        '\x0c' => write!(out, "\\f"),
        '\n' => write!(out, "\\n"),
        '\r' => write!(out, "\\r"),
        '\t' => write!(out, "\\t"),
        '\x0b' => write!(out, "\\v"),
        c if (c as u32) < 0x20 || c == '\x7f' => write!(out, "\\x{:02x}", c as u32),
        c if (c as u32) < 0x10000 => write!(out, "\\u{:04x}", c as u32),
        c => write!(out, "\\U{:08x}", c as u32),
    };
}

/// Whether `c` can appear verbatim in a test file.
fn is_printable(c: char) -> bool {
    if c == ' ' {
        return true;
    }
    if c.is_control() || c.is_whitespace() {
        return false;
    }
    !matches!(
        c as u32,
        0x00ad
            | 0x0600..=0x0605
            | 0x061c
            | 0x06dd
            | 0x070f
            | 0x0890..=0x0891
            | 0x08e2
            | 0x180e
            | 0x200b..=0x200f
            | 0x202a..=0x202e
            | 0x2060..=0x2064
            | 0x2066..=0x206f
            | 0xe000..=0xf8ff
            | 0xfdd0..=0xfdef
            | 0xfeff
            | 0xfff9..=0xfffb
            | 0xfffe..=0xffff
            | 0x110bd
            | 0x110cd
            | 0x13430..=0x1343f
            | 0x1bca0..=0x1bca3
            | 0x1d173..=0x1d17a
            | 0xe0000..=0xe007f
            | 0xf0000..=0x10ffff
    ) && (c as u32 & 0xfffe) != 0xfffe
}

/// The inverse of [`escape`].
///
/// Lines without the ` (esc)` marker are returned unchanged.
#[cfg_attr(not(test), allow(dead_code))]
pub fn unescape(s: &str) -> Result<String, EscapeError> {
    String::from_utf8(unescape_bytes(s)?).map_err(|_| EscapeError::NotUtf8)
}

/// Decode backslash escapes (`\t`, `\x01`, `\u00e9`, ...) in a line ending
/// with `" (esc)"`, dropping the marker. The final newline is kept.
pub fn unescape_bytes(s: &str) -> Result<Vec<u8>, EscapeError> {
    let trimmed = drop_eol(s);
    let Some(body) = trimmed.strip_suffix(ESC_SUFFIX) else {
        return Ok(s.as_bytes().to_vec());
    };

    let mut out = Vec::with_capacity(s.len());
    let mut chars = body.char_indices();
    while let Some((offset, c)) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        let invalid = EscapeError::InvalidSequence { offset };
        let Some((_, kind)) = chars.next() else {
            return Err(invalid);
        };
        match kind {
            'a' => out.push(0x07),
            'b' => out.push(0x08),
            'f' => out.push(0x0c),
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            'v' => out.push(0x0b),
            '\\' => out.push(b'\\'),
            'x' => {
                let value = take_digits(&mut chars, 2, 16).ok_or(invalid.clone())?;
                out.push(value as u8);
            }
            '0'..='7' => {
                let rest = take_digits(&mut chars, 2, 8).ok_or(invalid.clone())?;
                let value = (kind as u32 - '0' as u32) * 64 + rest;
                let byte = u8::try_from(value).map_err(|_| invalid.clone())?;
                out.push(byte);
            }
            'u' | 'U' => {
                let width = if kind == 'u' { 4 } else { 8 };
                let value = take_digits(&mut chars, width, 16).ok_or(invalid.clone())?;
                let c = char::from_u32(value).ok_or(invalid.clone())?;
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            _ => return Err(invalid),
        }
    }

    out.extend_from_slice(&s.as_bytes()[trimmed.len()..]);
    Ok(out)
}

fn take_digits(
    chars: &mut std::str::CharIndices<'_>,
    count: usize,
    radix: u32,
) -> Option<u32> {
    let mut value: u32 = 0;
    for _ in 0..count {
        let (_, c) = chars.next()?;
        value = value * radix + c.to_digit(radix)?;
    }
    Some(value)
}
