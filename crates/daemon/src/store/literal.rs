//! Literal statement rendering for the failsafe journal
//!
//! Hot-path writes always bind parameters. Only when a write fails do we
//! inline its values so the statement can sit in the journal as one line.

use super::store::SqlValue;

/// Replace `$n` placeholders with escaped literals
///
/// Placeholders inside quoted regions of the template are left alone.
/// Placeholders with no matching value render as `NULL`.
pub fn render(sql: &str, params: &[SqlValue]) -> String {
    rewrite_placeholders(sql, |index| match params.get(index) {
        Some(value) => literal(value),
        None => "NULL".to_string(),
    })
}

/// Inline NULL parameters as literal `NULL` and renumber the rest
///
/// A bound NULL carries a concrete parameter type, which PostgreSQL refuses
/// to compare with or assign to columns of other types. Written into the text
/// it takes the column's type instead.
pub fn inline_nulls(sql: &str, params: &[SqlValue]) -> (String, Vec<SqlValue>) {
    if !params.iter().any(|p| matches!(p, SqlValue::Null)) {
        return (sql.to_string(), params.to_vec());
    }

    let mut kept = Vec::with_capacity(params.len());
    let mut renumbered = Vec::with_capacity(params.len());
    for value in params {
        if matches!(value, SqlValue::Null) {
            renumbered.push(None);
        } else {
            kept.push(value.clone());
            renumbered.push(Some(kept.len()));
        }
    }

    let sql = rewrite_placeholders(sql, |index| match renumbered.get(index) {
        Some(Some(n)) => format!("${n}"),
        _ => "NULL".to_string(),
    });
    (sql, kept)
}

/// Walk `sql`, replacing each unquoted `$n` with `replace(n - 1)`
fn rewrite_placeholders(sql: &str, mut replace: impl FnMut(usize) -> String) -> String {
    let mut out = String::with_capacity(sql.len() + 16);
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                out.push(c);
            }
            None if c == '$' && chars.peek().is_some_and(|d| d.is_ascii_digit()) => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(d);
                    chars.next();
                }
                let index = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .unwrap_or(usize::MAX);
                out.push_str(&replace(index));
            }
            None => out.push(c),
        }
    }

    out
}

/// Render one value as a PostgreSQL literal
pub fn literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Int(v) => v.to_string(),
        SqlValue::Float(v) if v.is_finite() => v.to_string(),
        SqlValue::Float(v) => format!("'{v}'::float8"),
        SqlValue::Bool(v) => (if *v { "TRUE" } else { "FALSE" }).to_string(),
        SqlValue::Text(v) => format!("E'{}'", escape(v)),
        SqlValue::Timestamp(v) => format!("'{}'::timestamptz", v.to_rfc3339()),
    }
}

/// Escape text for an `E'...'` literal
///
/// NUL cannot be stored in PostgreSQL text and is dropped.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => {}
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_render_positional_values() {
        let sql = "UPDATE t SET processed = $1, note = $2 WHERE id = $3";
        let rendered = render(
            sql,
            &[SqlValue::Int(1), SqlValue::Text("ok".into()), SqlValue::Int(42)],
        );
        assert_eq!(
            rendered,
            "UPDATE t SET processed = 1, note = E'ok' WHERE id = 42"
        );
    }

    #[test]
    fn test_render_multi_digit_and_repeated_placeholders() {
        let params: Vec<SqlValue> = (1..=10).map(SqlValue::Int).collect();
        assert_eq!(render("$10 $1 $1", &params), "10 1 1");
    }

    #[test]
    fn test_render_ignores_dollar_inside_quotes() {
        let rendered = render("SELECT '$1', $1", &[SqlValue::Bool(true)]);
        assert_eq!(rendered, "SELECT '$1', TRUE");
    }

    #[test]
    fn test_missing_param_renders_null() {
        assert_eq!(render("x = $2", &[SqlValue::Int(1)]), "x = NULL");
    }

    #[test]
    fn test_inline_nulls_renumbers_remaining_placeholders() {
        let params = [
            SqlValue::Null,
            SqlValue::Int(3),
            SqlValue::Null,
            SqlValue::Int(42),
        ];
        let (sql, kept) = inline_nulls(
            "UPDATE t SET processed = $1, number_of_sends = $2, next_send = $3 WHERE id = $4 AND '$1' <> ''",
            &params,
        );
        assert_eq!(
            sql,
            "UPDATE t SET processed = NULL, number_of_sends = $1, next_send = NULL WHERE id = $2 AND '$1' <> ''"
        );
        assert_eq!(kept, vec![SqlValue::Int(3), SqlValue::Int(42)]);
    }

    #[test]
    fn test_inline_nulls_without_nulls_is_unchanged() {
        let params = [SqlValue::Int(1)];
        let (sql, kept) = inline_nulls("x = $1", &params);
        assert_eq!(sql, "x = $1");
        assert_eq!(kept, params.to_vec());
    }

    #[test]
    fn test_escape_special_characters() {
        let raw = "it's a \"quote\"\\path\nline\r\0end";
        assert_eq!(
            escape(raw),
            "it\\'s a \\\"quote\\\"\\\\path\\nline\\rend"
        );
        // A rendered statement always fits on one journal line
        let rendered = render("$1", &[SqlValue::Text(raw.into())]);
        assert!(!rendered.contains('\n'));
        assert!(!rendered.contains('\r'));
    }

    #[test]
    fn test_timestamp_literal() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            literal(&SqlValue::Timestamp(ts)),
            "'2024-03-01T12:00:00+00:00'::timestamptz"
        );
    }
}
