//! Lexical helpers over SQL text: placeholder discovery for client-side
//! parameter interpolation and the LOCAL INFILE file name check.

use crate::error::{Error, Result};
use crate::value::Value;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lex {
    Normal,
    Quoted(u8),
    LineComment,
    BlockComment,
}

/// Byte offsets of `?` placeholders that are outside string literals,
/// quoted identifiers and comments.
pub fn placeholder_offsets(sql: &str, no_backslash_escapes: bool) -> Vec<usize> {
    let bytes = sql.as_bytes();
    let mut offsets = Vec::new();
    let mut state = Lex::Normal;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match state {
            Lex::Normal => match b {
                b'\'' | b'"' | b'`' => state = Lex::Quoted(b),
                b'#' => state = Lex::LineComment,
                b'-' if next == Some(b'-')
                    && bytes.get(i + 2).is_none_or(u8::is_ascii_whitespace) =>
                {
                    state = Lex::LineComment;
                }
                b'/' if next == Some(b'*') => {
                    state = Lex::BlockComment;
                    i += 1;
                }
                b'?' => offsets.push(i),
                _ => {}
            },
            Lex::Quoted(quote) => {
                if b == b'\\' && quote != b'`' && !no_backslash_escapes {
                    i += 1;
                } else if b == quote {
                    state = Lex::Normal;
                }
            }
            Lex::LineComment => {
                if b == b'\n' {
                    state = Lex::Normal;
                }
            }
            Lex::BlockComment => {
                if b == b'*' && next == Some(b'/') {
                    state = Lex::Normal;
                    i += 1;
                }
            }
        }
        i += 1;
    }
    offsets
}

/// Append `sql` with every placeholder replaced by the matching parameter literal.
pub fn interpolate(
    out: &mut Vec<u8>,
    sql: &str,
    params: &[Value],
    no_backslash_escapes: bool,
) -> Result<()> {
    let offsets = placeholder_offsets(sql, no_backslash_escapes);
    if offsets.len() != params.len() {
        return Err(Error::InvalidUsage(format!(
            "statement has {} placeholders but {} parameters were given",
            offsets.len(),
            params.len()
        )));
    }
    out.reserve(sql.len() + params.iter().map(Value::approximate_len).sum::<usize>());
    let bytes = sql.as_bytes();
    let mut start = 0;
    for (offset, param) in offsets.iter().zip(params) {
        out.extend_from_slice(&bytes[start..*offset]);
        param.write_literal(out, no_backslash_escapes);
        start = offset + 1;
    }
    out.extend_from_slice(&bytes[start..]);
    Ok(())
}

/// Whether `sql` is a `LOAD DATA LOCAL INFILE '<file_name>'` statement naming
/// exactly `file_name`, so a server-initiated file request can be trusted.
pub fn names_local_file(sql: &str, file_name: &str, no_backslash_escapes: bool) -> bool {
    let bytes = sql.as_bytes();
    let mut words = Words { bytes, pos: 0 };
    while let Some(word) = words.next_word() {
        if !word.eq_ignore_ascii_case(b"LOCAL") {
            continue;
        }
        if !words.next_word().is_some_and(|w| w.eq_ignore_ascii_case(b"INFILE")) {
            continue;
        }
        return words
            .next_literal(no_backslash_escapes)
            .is_some_and(|literal| literal == file_name.as_bytes());
    }
    false
}

struct Words<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Words<'a> {
    fn skip_whitespace(&mut self) {
        while self.bytes.get(self.pos).is_some_and(u8::is_ascii_whitespace) {
            self.pos += 1;
        }
    }

    fn next_word(&mut self) -> Option<&'a [u8]> {
        self.skip_whitespace();
        let start = self.pos;
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
        {
            self.pos += 1;
        }
        if start == self.pos {
            // punctuation or a literal; step over it
            if self.pos >= self.bytes.len() {
                return None;
            }
            self.pos += 1;
            return Some(&self.bytes[start..self.pos]);
        }
        Some(&self.bytes[start..self.pos])
    }

    fn next_literal(&mut self, no_backslash_escapes: bool) -> Option<Vec<u8>> {
        self.skip_whitespace();
        let quote = *self.bytes.get(self.pos).filter(|b| **b == b'\'' || **b == b'"')?;
        self.pos += 1;
        let mut literal = Vec::new();
        while let Some(&b) = self.bytes.get(self.pos) {
            self.pos += 1;
            if b == b'\\' && !no_backslash_escapes {
                literal.push(*self.bytes.get(self.pos)?);
                self.pos += 1;
            } else if b == quote {
                if self.bytes.get(self.pos) == Some(&quote) {
                    literal.push(quote);
                    self.pos += 1;
                } else {
                    return Some(literal);
                }
            } else {
                literal.push(b);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_skip_literals_and_comments() {
        let sql = "SELECT ?, '?', \"?\", `?` -- ?\n, ? /* ? */ # ?\n, ?";
        let offsets = placeholder_offsets(sql, false);
        assert_eq!(offsets.len(), 3);
        assert!(offsets.iter().all(|&o| &sql[o..=o] == "?"));
    }

    #[test]
    fn backslash_escapes_follow_server_mode() {
        // with backslash escapes the quote is escaped and the literal never ends
        let sql = r"SELECT '\', ?";
        assert_eq!(placeholder_offsets(sql, false).len(), 0);
        // without them the literal is a lone backslash
        assert_eq!(placeholder_offsets(sql, true).len(), 1);
    }

    #[test]
    fn double_dash_needs_whitespace() {
        assert_eq!(placeholder_offsets("SELECT 1--?", false).len(), 1);
        assert_eq!(placeholder_offsets("SELECT 1-- ?", false).len(), 0);
    }

    #[test]
    fn interpolates_parameters() {
        let mut out = Vec::new();
        interpolate(
            &mut out,
            "INSERT INTO t VALUES (?, ?, '?')",
            &[Value::Int(1), Value::Text("o'k".into())],
            false,
        )
        .unwrap();
        assert_eq!(out, br"INSERT INTO t VALUES (1, 'o\'k', '?')");

        let err = interpolate(&mut Vec::new(), "SELECT ?", &[], false).unwrap_err();
        assert!(matches!(err, Error::InvalidUsage(_)));
    }

    #[test]
    fn local_infile_file_name() {
        let sql = "LOAD DATA LOCAL INFILE '/tmp/data.csv' INTO TABLE t";
        assert!(names_local_file(sql, "/tmp/data.csv", false));
        assert!(!names_local_file(sql, "/etc/passwd", false));
        assert!(names_local_file(
            "load data  local\ninfile \"a.txt\" into table t",
            "a.txt",
            false
        ));
        assert!(!names_local_file("SELECT '/tmp/data.csv'", "/tmp/data.csv", false));
    }
}
