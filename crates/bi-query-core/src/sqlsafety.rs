//! SQL Parameterizer / Validator: enforces SELECT-only SQL, extracts
//! literals to parameters, and sanitizes identifiers.
//!
//! `validate_read_only` tokenizes and walks the statement rather than
//! checking `starts_with("SELECT")` — spec.md §9(c) calls out a looser,
//! prefix-only check in the source material by name and says explicitly
//! not to copy it.

use serde::{Deserialize, Serialize};

const DML_DDL_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "GRANT", "REVOKE",
];

const DANGEROUS_FUNCTIONS: &[&str] = &["SLEEP(", "PG_SLEEP(", "WAITFOR DELAY"];

const RESERVED_IDENTIFIERS: &[&str] = &[
    "select", "from", "where", "insert", "update", "delete", "drop", "table", "and", "or", "not",
    "null", "union", "join",
];

/// A single token produced by the tokenizer, tagged so keyword checks can
/// skip anything inside a string literal or comment.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    StringLiteral(String),
    NumberLiteral(String),
    Symbol(char),
    LineComment,
    BlockCommentStart,
}

fn tokenize(sql: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '\'' {
            let mut j = i + 1;
            let mut literal = String::new();
            while j < chars.len() {
                if chars[j] == '\'' {
                    if j + 1 < chars.len() && chars[j + 1] == '\'' {
                        literal.push('\'');
                        j += 2;
                        continue;
                    }
                    break;
                }
                literal.push(chars[j]);
                j += 1;
            }
            tokens.push(Token::StringLiteral(literal));
            i = j + 1;
            continue;
        }

        if c == '-' && chars.get(i + 1) == Some(&'-') {
            tokens.push(Token::LineComment);
            break; // rest of the statement is a comment
        }

        if c == '/' && chars.get(i + 1) == Some(&'*') {
            tokens.push(Token::BlockCommentStart);
            break;
        }

        if c == ';' {
            tokens.push(Token::Symbol(';'));
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let mut j = i;
            while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                j += 1;
            }
            tokens.push(Token::NumberLiteral(chars[i..j].iter().collect()));
            i = j;
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let mut j = i;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            tokens.push(Token::Word(chars[i..j].iter().collect()));
            i = j;
            continue;
        }

        tokens.push(Token::Symbol(c));
        i += 1;
    }

    tokens
}

/// Outcome of `validate_read_only`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub is_safe: bool,
    pub warnings: Vec<String>,
}

pub struct SqlValidator;

impl SqlValidator {
    /// True iff: exactly one statement; first keyword is SELECT; no
    /// DML/DDL keywords outside string literals; no stacked-statement
    /// separator outside literals; no comment introducers; no dangerous
    /// functions.
    pub fn validate_read_only(sql: &str) -> ValidationOutcome {
        let mut warnings = Vec::new();
        let tokens = tokenize(sql);

        let first_word = tokens.iter().find_map(|t| match t {
            Token::Word(w) => Some(w.to_ascii_uppercase()),
            _ => None,
        });

        if first_word.as_deref() != Some("SELECT") {
            warnings.push("statement does not begin with SELECT".to_string());
            return ValidationOutcome {
                is_safe: false,
                warnings,
            };
        }

        let statement_separators = tokens
            .iter()
            .filter(|t| matches!(t, Token::Symbol(';')))
            .count();
        if statement_separators > 0 {
            warnings.push("stacked statements are not permitted".to_string());
        }

        if tokens
            .iter()
            .any(|t| matches!(t, Token::LineComment | Token::BlockCommentStart))
        {
            warnings.push("comment introducers are not permitted".to_string());
        }

        for token in &tokens {
            if let Token::Word(word) = token {
                let upper = word.to_ascii_uppercase();
                if DML_DDL_KEYWORDS.contains(&upper.as_str()) {
                    warnings.push(format!("disallowed keyword: {upper}"));
                }
            }
        }

        let upper_sql = sql.to_ascii_uppercase();
        for func in DANGEROUS_FUNCTIONS {
            if upper_sql.contains(func) {
                warnings.push(format!("disallowed function: {func}"));
            }
        }

        if has_union_select_chain(&tokens) {
            warnings.push("UNION SELECT chains are not permitted".to_string());
        }

        if has_always_true_predicate(&upper_sql) {
            warnings.push("always-true predicate detected".to_string());
        }

        ValidationOutcome {
            is_safe: warnings.is_empty(),
            warnings,
        }
    }

    /// Extracts literals (strings and numbers) to positional placeholders,
    /// returning the rewritten SQL and a parallel parameter list that
    /// preserves source type.
    pub fn parameterize(sql: &str) -> ParameterizedSql {
        let tokens = tokenize(sql);
        let mut out = String::new();
        let mut parameters = Vec::new();
        let mut placeholder_index = 1;
        let mut last_was_word_or_literal = false;

        for token in &tokens {
            if last_was_word_or_literal {
                out.push(' ');
            }
            match token {
                Token::Word(w) => {
                    out.push_str(w);
                    last_was_word_or_literal = true;
                }
                Token::StringLiteral(s) => {
                    out.push_str(&format!("${placeholder_index}"));
                    parameters.push(serde_json::Value::String(s.clone()));
                    placeholder_index += 1;
                    last_was_word_or_literal = true;
                }
                Token::NumberLiteral(n) => {
                    out.push_str(&format!("${placeholder_index}"));
                    let value = if n.contains('.') {
                        n.parse::<f64>()
                            .map(|f| serde_json::json!(f))
                            .unwrap_or(serde_json::Value::Null)
                    } else {
                        n.parse::<i64>()
                            .map(|i| serde_json::json!(i))
                            .unwrap_or(serde_json::Value::Null)
                    };
                    parameters.push(value);
                    placeholder_index += 1;
                    last_was_word_or_literal = true;
                }
                Token::Symbol(c) => {
                    out.push(*c);
                    last_was_word_or_literal = false;
                }
                Token::LineComment | Token::BlockCommentStart => {
                    last_was_word_or_literal = false;
                }
            }
        }

        let validation = Self::validate_read_only(sql);

        ParameterizedSql {
            text_with_placeholders: out.trim().to_string(),
            parameters,
            is_safe: validation.is_safe,
            warnings: validation.warnings,
        }
    }

    /// Accepts only `[A-Za-z_][A-Za-z0-9_]*` and rejects reserved keywords.
    pub fn sanitize_identifier(s: &str) -> Result<String, String> {
        let mut chars = s.chars();
        let first_ok = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

        if !first_ok || !rest_ok || s.is_empty() {
            return Err(format!("'{s}' is not a valid identifier"));
        }

        if RESERVED_IDENTIFIERS.contains(&s.to_ascii_lowercase().as_str()) {
            return Err(format!("'{s}' is a reserved keyword"));
        }

        Ok(s.to_string())
    }
}

fn has_union_select_chain(tokens: &[Token]) -> bool {
    for window in tokens.windows(2) {
        if let [Token::Word(a), Token::Word(b)] = window {
            if a.eq_ignore_ascii_case("union") && b.eq_ignore_ascii_case("select") {
                return true;
            }
        }
    }
    false
}

fn has_always_true_predicate(upper_sql: &str) -> bool {
    let normalized: String = upper_sql.chars().filter(|c| !c.is_whitespace()).collect();
    normalized.contains("OR1=1") || normalized.contains("OR'1'='1'") || normalized.contains("ORTRUE")
}

/// Parameterized SQL ready for execution against the warehouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterizedSql {
    pub text_with_placeholders: String,
    pub parameters: Vec<serde_json::Value>,
    pub is_safe: bool,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_select() {
        let outcome = SqlValidator::validate_read_only("SELECT id, name FROM patients");
        assert!(outcome.is_safe);
    }

    #[test]
    fn rejects_non_select_start() {
        let outcome = SqlValidator::validate_read_only("DELETE FROM patients");
        assert!(!outcome.is_safe);
    }

    #[test]
    fn rejects_stacked_statement_injection() {
        let outcome =
            SqlValidator::validate_read_only("SELECT * FROM patients; DROP TABLE patients");
        assert!(!outcome.is_safe);
        assert!(outcome.warnings.iter().any(|w| w.contains("stacked")));
    }

    #[test]
    fn rejects_union_select_chain() {
        let outcome = SqlValidator::validate_read_only(
            "SELECT id FROM patients UNION SELECT password FROM users",
        );
        assert!(!outcome.is_safe);
    }

    #[test]
    fn rejects_always_true_predicate() {
        let outcome =
            SqlValidator::validate_read_only("SELECT * FROM patients WHERE 1=1 OR 1=1");
        assert!(!outcome.is_safe);
    }

    #[test]
    fn rejects_sleep_function() {
        let outcome =
            SqlValidator::validate_read_only("SELECT * FROM patients WHERE sleep(5) = 0");
        assert!(!outcome.is_safe);
    }

    #[test]
    fn parameterize_extracts_literals() {
        let result = SqlValidator::parameterize(
            "SELECT * FROM invoices WHERE status = 'paid' AND amount > 100",
        );
        assert_eq!(result.parameters.len(), 2);
        assert_eq!(result.parameters[0], serde_json::json!("paid"));
        assert_eq!(result.parameters[1], serde_json::json!(100));
        assert!(result.text_with_placeholders.contains("$1"));
        assert!(result.text_with_placeholders.contains("$2"));
    }

    #[test]
    fn sanitize_identifier_rejects_reserved_and_invalid() {
        assert!(SqlValidator::sanitize_identifier("patient_id").is_ok());
        assert!(SqlValidator::sanitize_identifier("select").is_err());
        assert!(SqlValidator::sanitize_identifier("1bad").is_err());
        assert!(SqlValidator::sanitize_identifier("bad-name").is_err());
    }
}
