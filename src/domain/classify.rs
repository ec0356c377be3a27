//! Parse-light SQL analysis: operation detection, statement screening, and
//! best-effort table extraction.
//!
//! The classifier decides which pipeline a submission enters (synchronous
//! read vs. approval-gated write) and pre-screens obviously malformed input.
//! It is intentionally not a grammar; the backend has the final word.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use crate::domain::models::OperationKind;
use crate::validation::rules;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("multi-statement input is not allowed")]
    MultiStatement,
    #[error("{0}")]
    InvalidArgument(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub operation: OperationKind,
    pub referenced_tables: Vec<String>,
    pub requires_approval: bool,
}

/// Classifies a single SQL statement by its leading verb.
///
/// `SELECT`, `WITH … SELECT`, `SHOW`, and `EXPLAIN` are reads; the six write
/// verbs require approval; anything else is unsupported. More than one
/// statement is refused outright. `EXPLAIN ANALYZE` over a write is refused
/// here because running the plan would execute the statement.
pub fn classify(text: &str) -> Result<Classification, ClassifyError> {
    let statements = split_statements(text);
    let stmt = match statements.as_slice() {
        [] => return Err(ClassifyError::Syntax("statement is empty".to_string())),
        [single] => *single,
        _ => return Err(ClassifyError::MultiStatement),
    };

    rules::check_statement_structure(stmt).map_err(ClassifyError::Syntax)?;

    let operation = detect_operation(stmt)?;
    rules::check_required_clauses(operation, stmt).map_err(ClassifyError::Syntax)?;

    Ok(Classification {
        operation,
        referenced_tables: extract_tables(stmt),
        requires_approval: operation.requires_approval(),
    })
}

fn detect_operation(stmt: &str) -> Result<OperationKind, ClassifyError> {
    let body = skip_leading_noise(stmt);
    let Some(verb) = leading_word(body) else {
        return Err(ClassifyError::Syntax("statement is empty".to_string()));
    };

    match verb.to_uppercase().as_str() {
        "SELECT" | "SHOW" => Ok(OperationKind::Select),
        "WITH" => classify_with_statement(body),
        "EXPLAIN" => classify_explain_statement(body),
        "INSERT" => Ok(OperationKind::Insert),
        "UPDATE" => Ok(OperationKind::Update),
        "DELETE" => Ok(OperationKind::Delete),
        "CREATE" => Ok(OperationKind::Create),
        "DROP" => Ok(OperationKind::Drop),
        "ALTER" => Ok(OperationKind::Alter),
        other => Err(ClassifyError::UnsupportedOperation(other.to_lowercase())),
    }
}

/// Resolves the main verb of a `WITH` statement by scanning depth-zero words
/// after the CTE list. Writes wrapped in a CTE keep their write semantics.
fn classify_with_statement(stmt: &str) -> Result<OperationKind, ClassifyError> {
    for word in top_level_words(stmt).into_iter().skip(1) {
        match word.to_uppercase().as_str() {
            "SELECT" => return Ok(OperationKind::Select),
            "INSERT" => return Ok(OperationKind::Insert),
            "UPDATE" => return Ok(OperationKind::Update),
            "DELETE" => return Ok(OperationKind::Delete),
            _ => {}
        }
    }
    Err(ClassifyError::Syntax(
        "WITH statement has no main SELECT, INSERT, UPDATE, or DELETE".to_string(),
    ))
}

fn classify_explain_statement(stmt: &str) -> Result<OperationKind, ClassifyError> {
    let mut rest = skip_leading_noise(&stmt[word_len(stmt, "EXPLAIN")..]);
    let mut analyze = false;

    // PostgreSQL option-list form: EXPLAIN (ANALYZE, BUFFERS) <stmt>
    if rest.starts_with('(') {
        if let Some(close) = rest.find(')') {
            analyze = contains_word(&rest[..close], "ANALYZE");
            rest = skip_leading_noise(&rest[close + 1..]);
        }
    } else {
        // bare option words: EXPLAIN ANALYZE VERBOSE <stmt>
        while let Some(word) = leading_word(rest) {
            match word.to_uppercase().as_str() {
                "ANALYZE" => analyze = true,
                "VERBOSE" => {}
                _ => break,
            }
            rest = skip_leading_noise(&rest[word.len()..]);
        }
    }

    let inner = detect_operation(rest)?;
    if analyze && inner.requires_approval() {
        return Err(ClassifyError::InvalidArgument(
            "EXPLAIN ANALYZE over a write statement would execute it".to_string(),
        ));
    }
    Ok(OperationKind::Select)
}

/// Best-effort table references, extracted by regex over the clause keywords.
/// Advisory only; never consulted for authorization.
pub fn extract_tables(stmt: &str) -> Vec<String> {
    static TABLE_RE: OnceLock<Regex> = OnceLock::new();
    let re = TABLE_RE.get_or_init(|| {
        Regex::new(
            r#"(?i)\b(?:FROM|JOIN|INSERT\s+INTO|UPDATE|DELETE\s+FROM|CREATE\s+TABLE(?:\s+IF\s+NOT\s+EXISTS)?|DROP\s+TABLE(?:\s+IF\s+EXISTS)?|ALTER\s+TABLE)\s+("[^"]+"|`[^`]+`|[A-Za-z_][A-Za-z0-9_$]*)(\.(?:"[^"]+"|`[^`]+`|[A-Za-z_][A-Za-z0-9_$]*))?"#,
        )
        .expect("table extraction regex is valid")
    });

    let mut tables = Vec::new();
    for caps in re.captures_iter(stmt) {
        let head = strip_identifier_quotes(&caps[1]);
        if is_reserved_head(&head) {
            continue;
        }
        let name = match caps.get(2) {
            Some(tail) => format!(
                "{head}.{}",
                strip_identifier_quotes(tail.as_str().trim_start_matches('.'))
            ),
            None => head,
        };
        if !tables.contains(&name) {
            tables.push(name);
        }
    }
    tables
}

/// Keywords that the capture group can swallow when the clause is not a
/// table reference (e.g. `DELETE FROM ONLY t`, `FROM LATERAL (...)`).
fn is_reserved_head(word: &str) -> bool {
    matches!(
        word.to_uppercase().as_str(),
        "SELECT" | "ONLY" | "LATERAL" | "UNNEST" | "VALUES" | "DUAL"
    )
}

fn strip_identifier_quotes(part: &str) -> String {
    part.trim_matches('"').trim_matches('`').to_string()
}

/// Detects a top-level LIMIT clause, so the executor knows whether to append
/// one. Literals and comments are excluded from the scan.
pub fn has_limit_clause(stmt: &str) -> bool {
    top_level_words(stmt)
        .iter()
        .any(|word| word.eq_ignore_ascii_case("LIMIT"))
}

/// Rewrites `DELETE FROM t [WHERE …]` into `SELECT * FROM t [WHERE …]`,
/// preserving the predicate verbatim. Anything fancier — `USING`, multi-table
/// forms, `RETURNING`, `ORDER BY`/`LIMIT` — is refused rather than previewed
/// wrong.
pub fn rewrite_delete_for_preview(stmt: &str) -> Result<String, String> {
    static DELETE_RE: OnceLock<Regex> = OnceLock::new();
    let re = DELETE_RE.get_or_init(|| {
        Regex::new(
            r#"(?is)^\s*DELETE\s+FROM\s+("[^"]+"|`[^`]+`|[A-Za-z_][A-Za-z0-9_$]*(?:\.(?:"[^"]+"|`[^`]+`|[A-Za-z_][A-Za-z0-9_$]*))?)\s*(.*?);?\s*$"#,
        )
        .expect("delete rewrite regex is valid")
    });

    let caps = re
        .captures(stmt)
        .ok_or_else(|| "statement is not a single-table DELETE".to_string())?;
    let table = caps[1].to_string();
    let tail = caps[2].trim();

    if !tail.is_empty() {
        let tail_upper = tail.to_uppercase();
        for forbidden in ["USING", "RETURNING", "ORDER BY", "LIMIT", "JOIN"] {
            if contains_word(&tail_upper, forbidden) {
                return Err(format!("DELETE with {forbidden} cannot be previewed"));
            }
        }
        if !tail_upper.starts_with("WHERE") {
            return Err("DELETE tail is not a plain WHERE predicate".to_string());
        }
    }

    if tail.is_empty() {
        Ok(format!("SELECT * FROM {table}"))
    } else {
        Ok(format!("SELECT * FROM {table} {tail}"))
    }
}

/// Splits on top-level semicolons, returning trimmed non-empty statements.
fn split_statements(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            b';' => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if start <= text.len() {
        parts.push(&text[start..]);
    }

    parts
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty() && !is_only_comments(part))
        .collect()
}

fn is_only_comments(part: &str) -> bool {
    skip_leading_noise(part).is_empty()
}

/// Advances past whitespace and SQL comments.
fn skip_leading_noise(mut s: &str) -> &str {
    loop {
        let trimmed = s.trim_start();
        if let Some(rest) = trimmed.strip_prefix("--") {
            s = match rest.find('\n') {
                Some(pos) => &rest[pos + 1..],
                None => "",
            };
        } else if let Some(rest) = trimmed.strip_prefix("/*") {
            s = match rest.find("*/") {
                Some(pos) => &rest[pos + 2..],
                None => "",
            };
        } else {
            return trimmed;
        }
    }
}

fn leading_word(s: &str) -> Option<&str> {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == 0 {
        None
    } else {
        Some(&s[..end])
    }
}

fn word_len(s: &str, expected: &str) -> usize {
    leading_word(s)
        .filter(|word| word.eq_ignore_ascii_case(expected))
        .map(str::len)
        .unwrap_or(0)
}

/// Words appearing outside parentheses, quotes, and comments, in order.
fn top_level_words(stmt: &str) -> Vec<String> {
    let bytes = stmt.as_bytes();
    let mut words = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut i = 0;

    let mut flush = |current: &mut String, words: &mut Vec<String>| {
        if !current.is_empty() {
            words.push(std::mem::take(current));
        }
    };

    while i < bytes.len() {
        match bytes[i] {
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                flush(&mut current, &mut words);
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                flush(&mut current, &mut words);
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            quote @ (b'\'' | b'"' | b'`') => {
                flush(&mut current, &mut words);
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
            }
            b'(' => {
                flush(&mut current, &mut words);
                depth += 1;
            }
            b')' => {
                flush(&mut current, &mut words);
                depth = depth.saturating_sub(1);
            }
            b if depth == 0 && (b.is_ascii_alphanumeric() || b == b'_') => {
                current.push(b as char);
            }
            _ => flush(&mut current, &mut words),
        }
        i += 1;
    }
    flush(&mut current, &mut words);
    words
}

fn contains_word(haystack: &str, word: &str) -> bool {
    let upper = haystack.to_uppercase();
    // multi-word phrases ("ORDER BY") collapse to a plain substring check
    if word.contains(' ') {
        return upper.contains(word);
    }
    let mut start = 0;
    while let Some(pos) = upper[start..].find(word) {
        let at = start + pos;
        let end = at + word.len();
        let left_ok = at == 0 || !upper.as_bytes()[at - 1].is_ascii_alphanumeric();
        let right_ok = end == upper.len() || !upper.as_bytes()[end].is_ascii_alphanumeric();
        if left_ok && right_ok {
            return true;
        }
        start = end;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn op(text: &str) -> OperationKind {
        classify(text).expect("should classify").operation
    }

    #[test]
    fn classifies_each_leading_verb() {
        assert_eq!(op("SELECT 1"), OperationKind::Select);
        assert_eq!(op("show tables"), OperationKind::Select);
        assert_eq!(op("  WITH c AS (SELECT 1) SELECT * FROM c"), OperationKind::Select);
        assert_eq!(op("INSERT INTO t (a) VALUES (1)"), OperationKind::Insert);
        assert_eq!(op("update t set a = 1"), OperationKind::Update);
        assert_eq!(op("DELETE FROM t WHERE id = 1"), OperationKind::Delete);
        assert_eq!(op("CREATE TABLE t (id INT)"), OperationKind::Create);
        assert_eq!(op("DROP TABLE t"), OperationKind::Drop);
        assert_eq!(op("ALTER TABLE t ADD COLUMN b INT"), OperationKind::Alter);
    }

    #[test]
    fn approval_flags_follow_operation() {
        assert!(!classify("SELECT 1").unwrap().requires_approval);
        assert!(classify("DELETE FROM t WHERE id = 1").unwrap().requires_approval);
    }

    #[test]
    fn unknown_verb_is_unsupported() {
        assert!(matches!(
            classify("GRANT ALL ON t TO u"),
            Err(ClassifyError::UnsupportedOperation(verb)) if verb == "grant"
        ));
        assert!(matches!(
            classify("TRUNCATE t"),
            Err(ClassifyError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn multi_statement_is_refused() {
        assert_eq!(
            classify("SELECT 1; SELECT 2"),
            Err(ClassifyError::MultiStatement)
        );
        // trailing semicolon alone is fine
        assert!(classify("SELECT 1;").is_ok());
        // semicolon inside a literal is not a separator
        assert!(classify("SELECT 'a;b'").is_ok());
    }

    #[test]
    fn empty_and_comment_only_input_fails() {
        assert!(matches!(classify("   "), Err(ClassifyError::Syntax(_))));
        assert!(matches!(classify("-- nothing"), Err(ClassifyError::Syntax(_))));
    }

    #[test]
    fn leading_comments_are_skipped() {
        assert_eq!(op("-- preamble\nSELECT 1"), OperationKind::Select);
        assert_eq!(op("/* note */ DELETE FROM t WHERE 1=1"), OperationKind::Delete);
    }

    #[test]
    fn with_wrapping_a_write_keeps_write_semantics() {
        assert_eq!(
            op("WITH doomed AS (SELECT id FROM t) DELETE FROM t WHERE id IN (SELECT id FROM doomed)"),
            OperationKind::Delete
        );
    }

    #[test]
    fn explain_is_a_read() {
        assert_eq!(op("EXPLAIN SELECT * FROM t"), OperationKind::Select);
        assert_eq!(op("EXPLAIN DELETE FROM t WHERE id = 1"), OperationKind::Select);
        assert_eq!(op("EXPLAIN ANALYZE SELECT * FROM t"), OperationKind::Select);
    }

    #[test]
    fn explain_analyze_of_write_is_refused() {
        assert!(matches!(
            classify("EXPLAIN ANALYZE DELETE FROM t"),
            Err(ClassifyError::InvalidArgument(_))
        ));
        assert!(matches!(
            classify("EXPLAIN (ANALYZE, BUFFERS) UPDATE t SET a = 1"),
            Err(ClassifyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn structural_screens_reject_malformed_statements() {
        assert!(matches!(classify("SELECT count( FROM t"), Err(ClassifyError::Syntax(_))));
        assert!(matches!(classify("SELECT 'oops"), Err(ClassifyError::Syntax(_))));
        assert!(matches!(classify("INSERT INTO t (a)"), Err(ClassifyError::Syntax(_))));
        assert!(matches!(classify("UPDATE t WHERE a = 1"), Err(ClassifyError::Syntax(_))));
    }

    #[test]
    fn extracts_tables_from_clauses() {
        let c = classify("SELECT * FROM orders o JOIN public.customers c ON c.id = o.customer_id").unwrap();
        assert_eq!(c.referenced_tables, vec!["orders", "public.customers"]);

        let c = classify("INSERT INTO audit_log (a) VALUES (1)").unwrap();
        assert_eq!(c.referenced_tables, vec!["audit_log"]);

        let c = classify(r#"DELETE FROM "Weird Table" WHERE id = 1"#).unwrap();
        assert_eq!(c.referenced_tables, vec!["Weird Table"]);
    }

    #[test]
    fn table_list_is_deduplicated_in_order() {
        let c = classify("SELECT * FROM t JOIN u ON t.id = u.id JOIN t ON true").unwrap();
        assert_eq!(c.referenced_tables, vec!["t", "u"]);
    }

    #[test]
    fn limit_detection_ignores_literals_and_subqueries() {
        assert!(has_limit_clause("SELECT * FROM t LIMIT 5"));
        assert!(!has_limit_clause("SELECT * FROM t"));
        assert!(!has_limit_clause("SELECT 'LIMIT 5' FROM t"));
        assert!(!has_limit_clause("SELECT * FROM (SELECT a FROM t LIMIT 5) sub"));
    }

    #[test]
    fn delete_rewrite_preserves_predicate() {
        assert_eq!(
            rewrite_delete_for_preview("DELETE FROM t WHERE x < 10").unwrap(),
            "SELECT * FROM t WHERE x < 10"
        );
        assert_eq!(
            rewrite_delete_for_preview("delete from s.t;").unwrap(),
            "SELECT * FROM s.t"
        );
        assert_eq!(
            rewrite_delete_for_preview("DELETE FROM t").unwrap(),
            "SELECT * FROM t"
        );
    }

    #[test]
    fn delete_rewrite_refuses_non_trivial_forms() {
        assert!(rewrite_delete_for_preview("DELETE FROM t USING u WHERE t.id = u.id").is_err());
        assert!(rewrite_delete_for_preview("DELETE FROM t WHERE id = 1 RETURNING *").is_err());
        assert!(rewrite_delete_for_preview("DELETE FROM t ORDER BY id LIMIT 5").is_err());
        assert!(rewrite_delete_for_preview("UPDATE t SET a = 1").is_err());
    }

    proptest! {
        // classify never panics and always resolves to exactly one outcome
        #[test]
        fn classify_total_over_arbitrary_input(text in ".{0,200}") {
            let _ = classify(&text);
        }

        #[test]
        fn classified_statements_have_exactly_one_operation(verb_idx in 0usize..7, table in "[a-z_][a-z0-9_]{0,12}") {
            let verbs = [
                format!("SELECT * FROM {table}"),
                format!("INSERT INTO {table} (a) VALUES (1)"),
                format!("UPDATE {table} SET a = 1"),
                format!("DELETE FROM {table}"),
                format!("CREATE TABLE {table} (id INT)"),
                format!("DROP TABLE {table}"),
                format!("ALTER TABLE {table} ADD c INT"),
            ];
            let classification = classify(&verbs[verb_idx]).unwrap();
            prop_assert_eq!(
                classification.requires_approval,
                classification.operation != OperationKind::Select
            );
        }
    }
}
