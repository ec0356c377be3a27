//! Coarse structural screens applied to a statement before it is sent to a
//! backend. These catch obviously malformed input early; the backend remains
//! the authoritative validator.

use crate::domain::models::OperationKind;

/// Scans a statement for unbalanced parentheses and unterminated string
/// literals, honoring SQL comments and quote escaping.
pub fn check_statement_structure(stmt: &str) -> Result<(), String> {
    let bytes = stmt.as_bytes();
    let mut depth: i64 = 0;
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
                loop {
                    if i + 1 >= bytes.len() {
                        return Err("unterminated block comment".to_string());
                    }
                    if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
                continue;
            }
            quote @ (b'\'' | b'"') => {
                i += 1;
                let mut closed = false;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // doubled quote is an escape, not a terminator
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    i += 1;
                }
                if !closed {
                    let which = if quote == b'\'' { "single" } else { "double" };
                    return Err(format!("unterminated {which}-quoted literal"));
                }
            }
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced parentheses: unexpected ')'".to_string());
                }
            }
            _ => {}
        }
        i += 1;
    }

    if depth > 0 {
        return Err(format!("unbalanced parentheses: {depth} unclosed '('"));
    }
    Ok(())
}

/// Checks that the statement carries the clauses its operation cannot do
/// without. Keyword matching is case-insensitive and word-bounded; literals
/// and comments are not inspected, which is acceptable for a pre-screen.
pub fn check_required_clauses(operation: OperationKind, stmt: &str) -> Result<(), String> {
    match operation {
        OperationKind::Insert => {
            if !contains_keyword(stmt, "VALUES") && !contains_keyword(stmt, "SELECT") {
                return Err("INSERT statement is missing VALUES or SELECT".to_string());
            }
        }
        OperationKind::Update => {
            if !contains_keyword(stmt, "SET") {
                return Err("UPDATE statement is missing SET".to_string());
            }
        }
        OperationKind::Delete => {
            if !contains_keyword(stmt, "FROM") {
                return Err("DELETE statement is missing FROM".to_string());
            }
        }
        _ => {}
    }
    Ok(())
}

fn contains_keyword(stmt: &str, keyword: &str) -> bool {
    let upper = stmt.to_uppercase();
    let keyword = keyword.to_uppercase();
    let mut start = 0;
    while let Some(pos) = upper[start..].find(&keyword) {
        let at = start + pos;
        let end = at + keyword.len();
        let left_ok = at == 0 || !is_word_byte(upper.as_bytes()[at - 1]);
        let right_ok = end == upper.len() || !is_word_byte(upper.as_bytes()[end]);
        if left_ok && right_ok {
            return true;
        }
        start = end;
    }
    false
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}
