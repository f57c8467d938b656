// # Result Row Encoding
//
// The deterministic text encoding shared by the worker (writer) and the
// coordinator (reader) for result files. One row per line; fields are
// tab-separated; NULL is the two-byte sequence `\N`; tabs, newlines,
// carriage returns, and backslashes inside a field are backslash-escaped.
// The format must stay stable across versions because files written by one
// side are parsed by the other after an arbitrary delay.

use crate::error::{CoreError, Result};

pub const NULL_FIELD: &str = "\\N";

/// Encode one row as a single line (without the trailing newline).
pub fn encode_row(fields: &[Option<String>]) -> String {
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        match field {
            None => out.push_str(NULL_FIELD),
            Some(v) => {
                for ch in v.chars() {
                    match ch {
                        '\\' => out.push_str("\\\\"),
                        '\t' => out.push_str("\\t"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        c => out.push(c),
                    }
                }
            }
        }
    }
    out
}

/// Decode one line back into its fields.
pub fn decode_row(line: &str) -> Result<Vec<Option<String>>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    let mut escaped_null = false;
    loop {
        match chars.next() {
            None => break,
            Some('\t') => {
                fields.push(finish_field(current, escaped_null));
                current = String::new();
                escaped_null = false;
            }
            Some('\\') => match chars.next() {
                Some('\\') => current.push('\\'),
                Some('t') => current.push('\t'),
                Some('n') => current.push('\n'),
                Some('r') => current.push('\r'),
                Some('N') => {
                    if !current.is_empty() {
                        return Err(CoreError::Internal(
                            "null marker inside a field".to_string(),
                        ));
                    }
                    escaped_null = true;
                }
                other => {
                    return Err(CoreError::Internal(format!(
                        "bad escape in result row: \\{}",
                        other.map(String::from).unwrap_or_default()
                    )))
                }
            },
            Some(c) => current.push(c),
        }
    }
    fields.push(finish_field(current, escaped_null));
    Ok(fields)
}

fn finish_field(value: String, is_null: bool) -> Option<String> {
    if is_null {
        None
    } else {
        Some(value)
    }
}

/// Render a decoded field as a SQL literal for the merge INSERT.
pub fn sql_literal(field: &Option<String>) -> String {
    match field {
        None => "NULL".to_string(),
        Some(v) => {
            let mut lit = String::with_capacity(v.len() + 2);
            lit.push('\'');
            for ch in v.chars() {
                match ch {
                    '\'' => lit.push_str("''"),
                    '\\' => lit.push_str("\\\\"),
                    c => lit.push(c),
                }
            }
            lit.push('\'');
            lit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt(fields: Vec<Option<&str>>) {
        let owned: Vec<Option<String>> =
            fields.iter().map(|f| f.map(|s| s.to_string())).collect();
        let line = encode_row(&owned);
        assert!(!line.contains('\n'));
        assert_eq!(decode_row(&line).unwrap(), owned);
    }

    #[test]
    fn plain_fields_round_trip() {
        rt(vec![Some("42"), Some("a star"), Some("")]);
    }

    #[test]
    fn nulls_and_escapes_round_trip() {
        rt(vec![None, Some("tab\there"), Some("line\nbreak"), Some("back\\slash")]);
        rt(vec![Some("\r"), None, None]);
    }

    #[test]
    fn null_marker_is_distinct_from_literal_backslash_n() {
        let null_line = encode_row(&[None]);
        let text_line = encode_row(&[Some("\\N".to_string())]);
        assert_ne!(null_line, text_line);
        assert_eq!(decode_row(&null_line).unwrap(), vec![None]);
        assert_eq!(
            decode_row(&text_line).unwrap(),
            vec![Some("\\N".to_string())]
        );
    }

    #[test]
    fn bad_escape_is_rejected() {
        assert!(decode_row("a\\x").is_err());
    }

    #[test]
    fn sql_literals_quote_safely() {
        assert_eq!(sql_literal(&None), "NULL");
        assert_eq!(sql_literal(&Some("o'brien".into())), "'o''brien'");
    }
}
