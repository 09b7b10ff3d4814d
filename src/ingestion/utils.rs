//! Utility functions for common operations

/// Characters removed from currency values before parsing
const CURRENCY_NOISE: &[char] = &['$', '€', '£', '¥', ',', '\r', ' ', '\t'];

/// Length of each slice stored alongside a raw listing id
const RAW_ID_PART_LEN: usize = 6;

/// Most bind parameters PostgreSQL accepts in one statement
pub const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// Truncate to at most `max_chars` characters (not bytes)
pub fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &value[..byte_idx],
        None => value,
    }
}

/// Strip currency symbols, thousands separators and stray carriage returns
pub fn strip_currency(value: &str) -> String {
    value.chars().filter(|c| !CURRENCY_NOISE.contains(c)).collect()
}

/// Split a raw listing id into three 6-character slices for lookup.
/// Ids too short for a slice leave it empty.
pub fn split_raw_id(raw: &str) -> [Option<String>; 3] {
    let chars: Vec<char> = raw.chars().collect();
    let part = |idx: usize| {
        let start = idx * RAW_ID_PART_LEN;
        if start >= chars.len() {
            return None;
        }
        let end = (start + RAW_ID_PART_LEN).min(chars.len());
        Some(chars[start..end].iter().collect::<String>())
    };
    [part(0), part(1), part(2)]
}

/// Rows per multi-row INSERT: the configured size, bounded so a statement
/// never exceeds the bind parameter limit, and at least one
pub fn rows_per_statement(configured: usize, columns: usize) -> usize {
    configured.min(MAX_BIND_PARAMS / columns.max(1)).max(1)
}

/// Quote a PostgreSQL identifier
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        // multi-byte characters count once
        assert_eq!(truncate_chars("Zoë Müller", 3), "Zoë");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn test_rows_per_statement_respects_bind_limit() {
        assert_eq!(rows_per_statement(1_000, 16), 1_000);
        // 16 binds per listing row: 4095 rows fit, 4096 would not
        assert_eq!(rows_per_statement(12_000, 16), 4_095);
        assert!(rows_per_statement(usize::MAX, 6) * 6 <= MAX_BIND_PARAMS);
        assert_eq!(rows_per_statement(0, 8), 1);
        assert_eq!(rows_per_statement(10, 0), 10);
    }

    #[test]
    fn test_strip_currency() {
        assert_eq!(strip_currency("$1,200.50"), "1200.50");
        assert_eq!(strip_currency("€ 85.00\r"), "85.00");
        assert_eq!(strip_currency("abc"), "abc");
    }

    #[test]
    fn test_split_raw_id() {
        assert_eq!(
            split_raw_id("123456789012345678"),
            [
                Some("123456".to_string()),
                Some("789012".to_string()),
                Some("345678".to_string())
            ]
        );

        assert_eq!(
            split_raw_id("1234567"),
            [Some("123456".to_string()), Some("7".to_string()), None]
        );

        assert_eq!(split_raw_id(""), [None, None, None]);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("fk_calendar_listing"), "\"fk_calendar_listing\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }
}
