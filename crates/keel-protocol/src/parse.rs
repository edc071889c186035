//! Line framing and buffer validation primitives.
//!
//! Every higher-level read in the protocol goes through these helpers.
//! They operate on a single line with its terminator already removed:
//! [`find_line`] locates the terminator (`\n`, with an optional `\r`
//! before it) so the caller can slice the line out of its receive buffer.
//!
//! Arguments are positional and typed by the literal that precedes
//! them. Integers are unsigned decimal, at most `u64::MAX`.

use crate::error::{echo, ProtocolError};

/// Locates the first complete line in `buf`.
///
/// Returns `(line_len, consumed)`: the line is `buf[..line_len]` without
/// its terminator, and `consumed` bytes (line plus terminator) should be
/// dropped from the buffer afterwards. `None` means no terminator yet.
pub fn find_line(buf: &[u8]) -> Option<(usize, usize)> {
    let nl = memchr::memchr(b'\n', buf)?;
    let line_len = if nl > 0 && buf[nl - 1] == b'\r' {
        nl - 1
    } else {
        nl
    };
    Some((line_len, nl + 1))
}

/// Exact match: same length, same bytes. No prefix matches.
#[inline]
pub fn check_literal(buf: &[u8], literal: &str) -> bool {
    buf == literal.as_bytes()
}

/// Strips `literal` from the front of `buf`, or reports what was there.
pub fn strip_literal<'a>(buf: &'a [u8], literal: &str) -> Result<&'a [u8], ProtocolError> {
    buf.strip_prefix(literal.as_bytes())
        .ok_or_else(|| ProtocolError::UnexpectedLiteral {
            expected: literal.trim_end().to_owned(),
            got: echo(buf),
        })
}

/// `literal` followed by exactly one unsigned integer running to the end
/// of the line.
pub fn check_literal_with_int(buf: &[u8], literal: &str) -> Result<u64, ProtocolError> {
    let rest = strip_literal(buf, literal)?;
    parse_u64(rest)
}

/// `literal` followed by `count` space-separated unsigned integers, the
/// last one terminated by the line end.
///
/// Fewer values than `count` is a [`ProtocolError::WrongArgumentCount`];
/// anything other than a single space between values, or trailing bytes
/// after the last one, is a [`ProtocolError::InvalidSeparator`].
pub fn check_literal_with_int_list(
    buf: &[u8],
    literal: &str,
    count: usize,
) -> Result<Vec<u64>, ProtocolError> {
    let mut rest = strip_literal(buf, literal)?;
    let mut values = Vec::with_capacity(count);

    if count == 0 {
        return if rest.is_empty() {
            Ok(values)
        } else {
            Err(ProtocolError::InvalidSeparator)
        };
    }

    for i in 0..count {
        let digits = rest
            .iter()
            .position(|b| !b.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(if rest.is_empty() {
                ProtocolError::WrongArgumentCount {
                    expected: count,
                    got: i,
                }
            } else {
                ProtocolError::InvalidInteger
            });
        }
        values.push(parse_u64(&rest[..digits])?);
        rest = &rest[digits..];

        let last = i + 1 == count;
        match rest.first() {
            None if last => return Ok(values),
            None => {
                return Err(ProtocolError::WrongArgumentCount {
                    expected: count,
                    got: i + 1,
                })
            }
            Some(b' ') if !last => rest = &rest[1..],
            Some(_) => return Err(ProtocolError::InvalidSeparator),
        }
    }

    // the loop returns on the last element
    Err(ProtocolError::InvalidSeparator)
}

/// `literal` followed by exactly `N` space-separated text tokens.
pub fn check_literal_with_words<'a, const N: usize>(
    buf: &'a [u8],
    literal: &str,
) -> Result<[&'a str; N], ProtocolError> {
    let rest = strip_literal(buf, literal)?;
    let text = std::str::from_utf8(rest).map_err(|_| ProtocolError::InvalidUtf8)?;
    if text.is_empty() {
        return Err(ProtocolError::WrongArgumentCount { expected: N, got: 0 });
    }

    let mut words = [""; N];
    let mut got = 0;
    for word in text.split(' ') {
        if word.is_empty() {
            return Err(ProtocolError::InvalidSeparator);
        }
        if got == N {
            return Err(ProtocolError::WrongArgumentCount {
                expected: N,
                got: got + 1,
            });
        }
        words[got] = word;
        got += 1;
    }
    if got != N {
        return Err(ProtocolError::WrongArgumentCount { expected: N, got });
    }
    Ok(words)
}

/// `literal` followed by the rest of the line as one non-empty text value.
pub fn check_literal_with_text<'a>(buf: &'a [u8], literal: &str) -> Result<&'a str, ProtocolError> {
    let rest = strip_literal(buf, literal)?;
    if rest.is_empty() {
        return Err(ProtocolError::WrongArgumentCount {
            expected: 1,
            got: 0,
        });
    }
    std::str::from_utf8(rest).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Parses a non-empty run of ASCII digits without allocating.
pub fn parse_u64(buf: &[u8]) -> Result<u64, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }
    let mut n: u64 = 0;
    for &b in buf {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_add(u64::from(b - b'0')))
            .ok_or(ProtocolError::InvalidInteger)?;
    }
    Ok(n)
}

/// Narrows a parsed integer to `u32`.
pub fn to_u32(n: u64) -> Result<u32, ProtocolError> {
    u32::try_from(n).map_err(|_| ProtocolError::InvalidInteger)
}
