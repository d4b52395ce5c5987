//! Content-addressed identity for captured CSV payloads.
//!
//! The canonical form is: UTF-8 (lossy, BOM stripped), lines split on any of
//! `\r\n`, `\n`, `\r`, trailing whitespace removed from every line, trailing
//! empty lines dropped, header fields trimmed, lines rejoined with `\n`.

use crate::models::Fingerprint;
use sha2::{Digest, Sha256};

pub fn canonicalize(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.strip_prefix('\u{FEFF}').unwrap_or(&text);

    let mut lines: Vec<&str> = split_lines(text).map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }

    let mut out = String::with_capacity(text.len());
    for (idx, line) in lines.iter().enumerate() {
        if idx == 0 {
            let header = line
                .split(',')
                .map(str::trim)
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&header);
        } else {
            out.push('\n');
            out.push_str(line);
        }
    }
    out
}

pub fn fingerprint(bytes: &[u8]) -> Fingerprint {
    let canonical = canonicalize(bytes);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Fingerprint::from_hex(hex::encode(hasher.finalize()))
}

/// Splits on `\r\n`, `\n` or a lone `\r`.
fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(text);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.find(['\r', '\n']) {
            Some(pos) => {
                let line = &current[..pos];
                let skip = if current[pos..].starts_with("\r\n") { 2 } else { 1 };
                rest = Some(&current[pos + skip..]);
                Some(line)
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERS: &str = "Sales Record Number,Order Number,Item Number\n1,11-1,100\n2,11-2,200\n";

    #[test]
    fn line_endings_do_not_change_fingerprint() {
        let crlf = ORDERS.replace('\n', "\r\n");
        let cr = ORDERS.replace('\n', "\r");
        assert_eq!(fingerprint(ORDERS.as_bytes()), fingerprint(crlf.as_bytes()));
        assert_eq!(fingerprint(ORDERS.as_bytes()), fingerprint(cr.as_bytes()));
    }

    #[test]
    fn trailing_blank_lines_and_bom_are_ignored() {
        let padded = format!("\u{FEFF}{ORDERS}\n\n   \n");
        assert_eq!(fingerprint(ORDERS.as_bytes()), fingerprint(padded.as_bytes()));
    }

    #[test]
    fn header_fields_are_trimmed_but_rows_are_not() {
        let spaced_header = ORDERS.replacen("Order Number", "  Order Number ", 1);
        assert_eq!(
            fingerprint(ORDERS.as_bytes()),
            fingerprint(spaced_header.as_bytes())
        );

        let spaced_row = ORDERS.replacen("11-1", " 11-1", 1);
        assert_ne!(
            fingerprint(ORDERS.as_bytes()),
            fingerprint(spaced_row.as_bytes())
        );
    }

    #[test]
    fn any_row_byte_difference_changes_fingerprint() {
        let changed = ORDERS.replacen("200", "201", 1);
        assert_ne!(fingerprint(ORDERS.as_bytes()), fingerprint(changed.as_bytes()));
    }

    #[test]
    fn canonical_form_is_lf_joined() {
        let canonical = canonicalize(b"a , b\r\n1,2  \r\n\r\n");
        assert_eq!(canonical, "a,b\n1,2");
        assert_eq!(fingerprint(b"").as_str().len(), 64);
    }
}
