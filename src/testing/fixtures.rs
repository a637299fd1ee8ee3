//! Source files with known content.

use std::fmt::Write as _;

/// Two rows, newline after the last one.
pub const TWO_ROWS_TRAILING_NEWLINE: &str = "1.a,1.b,1.notes\n2.a,2.b,2.notes\n";

/// Two rows, no newline after the last one.
pub const TWO_ROWS_NO_TRAILING_NEWLINE: &str = "1.a,1.b,1.notes\n2.a,2.b,2.notes";

/// A quoted field spanning two physical lines; still two rows.
pub const QUOTED_LINE_BREAK: &str = "id,note\n7,\"first line\nsecond line\"\n";

/// Rows with fields that need quoting on the way back out.
pub const NEEDS_QUOTING: &str =
    "name,comment\nalice,\"likes a, b and c\"\nbob,\"said \"\"hi\"\", then left\"\n";

/// Quotes inside unquoted fields; written back without quoting.
pub const BARE_QUOTES: &str = "ab\"c,1\nsize,12\"\n";

/// Blank lines between, before and after rows.
pub const BLANK_LINES: &str = "\na,1\n\nb,2\n\n\nc,3\n\n";

/// A single header-like row without a line break.
pub const SINGLE_ROW: &str = "only,row";

/// `rows` synthetic CSV rows. Every seventh row carries a quoted comma, so
/// the output survives a parse and re-encode byte for byte.
#[must_use]
pub fn generated_rows(rows: usize, trailing_newline: bool) -> String {
    let mut out = String::with_capacity(rows * 24);
    for i in 0..rows {
        if i % 7 == 3 {
            let _ = write!(out, "{i},\"x, {i}\",{}", i * 3);
        } else {
            let _ = write!(out, "{i},row-{i},{}", i * 3);
        }
        if i + 1 < rows || trailing_newline {
            out.push('\n');
        }
    }
    out
}

/// Same as [`generated_rows`] with `\r\n` line breaks.
#[must_use]
pub fn generated_rows_crlf(rows: usize, trailing_newline: bool) -> String {
    generated_rows(rows, trailing_newline).replace('\n', "\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_rows_respects_trailing_newline() {
        let with = generated_rows(3, true);
        let without = generated_rows(3, false);
        assert!(with.ends_with('\n'));
        assert!(!without.ends_with('\n'));
        assert_eq!(with.lines().count(), 3);
        assert!(generated_rows(4, true).contains("3,\"x, 3\",9\n"));
    }
}
