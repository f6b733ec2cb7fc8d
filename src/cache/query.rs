//! A small filter-query language over cached target columns.
//!
//! Queries look like `name % 'prod' and (address % '10.' or id = 't_abc')`.
//! Supported operators: `=`, `!=` and `%` (contains). Only the target's own
//! columns are addressable; the owning user and the serialized item are not.
//! Compilation produces a parameterized condition, never interpolated text.

use crate::errors::{Error, Result};

const COLUMNS: &[&str] = &["id", "name", "description", "address"];

pub(crate) struct CompiledQuery {
    pub condition: String,
    pub args: Vec<String>,
}

pub(crate) fn compile_query(op: &'static str, input: &str) -> Result<CompiledQuery> {
    let tokens = tokenize(op, input)?;
    let mut parser = Parser { op, tokens, pos: 0, condition: String::new(), args: Vec::new() };
    parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(Error::invalid_parameter(op, format!("unexpected trailing input in query {input:?}")));
    }
    Ok(CompiledQuery { condition: parser.condition, args: parser.args })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Value(String),
    Eq,
    NotEq,
    Contains,
    And,
    Or,
    Open,
    Close,
}

fn tokenize(op: &'static str, input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Contains);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(Error::invalid_parameter(op, "expected != in query"));
                }
                tokens.push(Token::NotEq);
            }
            '\'' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            // Doubled quotes escape a literal quote.
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                value.push('\'');
                                continue;
                            }
                            break;
                        }
                        Some(c) => value.push(c),
                        None => return Err(Error::invalid_parameter(op, "unterminated string in query")),
                    }
                }
                tokens.push(Token::Value(value));
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(Error::invalid_parameter(op, format!("unexpected character {other:?} in query")));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    op: &'static str,
    tokens: Vec<Token>,
    pos: usize,
    condition: String,
    args: Vec<String>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    // expr := and_chain ('or' and_chain)*
    fn expr(&mut self) -> Result<()> {
        self.and_chain()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            self.condition.push_str(" or ");
            self.and_chain()?;
        }
        Ok(())
    }

    // and_chain := primary ('and' primary)*
    fn and_chain(&mut self) -> Result<()> {
        self.primary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            self.condition.push_str(" and ");
            self.primary()?;
        }
        Ok(())
    }

    // primary := '(' expr ')' | column op value
    fn primary(&mut self) -> Result<()> {
        match self.next() {
            Some(Token::Open) => {
                self.condition.push('(');
                self.expr()?;
                if self.next() != Some(Token::Close) {
                    return Err(Error::invalid_parameter(self.op, "missing closing parenthesis in query"));
                }
                self.condition.push(')');
                Ok(())
            }
            Some(Token::Ident(column)) => self.comparison(column),
            other => Err(Error::invalid_parameter(self.op, format!("expected a column or group, got {other:?}"))),
        }
    }

    fn comparison(&mut self, column: String) -> Result<()> {
        if !COLUMNS.contains(&column.as_str()) {
            return Err(Error::invalid_parameter(
                self.op,
                format!("unknown or unqueryable column {column:?}"),
            ));
        }
        let op_token = self.next();
        let value = match self.next() {
            Some(Token::Value(v)) => v,
            other => {
                return Err(Error::invalid_parameter(self.op, format!("expected a quoted value, got {other:?}")))
            }
        };
        match op_token {
            Some(Token::Eq) => {
                self.condition.push_str(&format!("{column} = ?"));
                self.args.push(value);
            }
            Some(Token::NotEq) => {
                self.condition.push_str(&format!("{column} != ?"));
                self.args.push(value);
            }
            Some(Token::Contains) => {
                self.condition.push_str(&format!("{column} like ?"));
                self.args.push(format!("%{value}%"));
            }
            other => {
                return Err(Error::invalid_parameter(self.op, format!("expected =, != or %, got {other:?}")))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_equality() {
        let q = compile_query("test", "name = 'db'").unwrap();
        assert_eq!(q.condition, "name = ?");
        assert_eq!(q.args, vec!["db"]);
    }

    #[test]
    fn contains_becomes_like() {
        let q = compile_query("test", "address % '10.'").unwrap();
        assert_eq!(q.condition, "address like ?");
        assert_eq!(q.args, vec!["%10.%"]);
    }

    #[test]
    fn boolean_combinations_and_groups() {
        let q = compile_query("test", "name % 'prod' and (id = 't_a' or id = 't_b')").unwrap();
        assert_eq!(q.condition, "name like ? and (id = ? or id = ?)");
        assert_eq!(q.args, vec!["%prod%", "t_a", "t_b"]);
    }

    #[test]
    fn escaped_quotes() {
        let q = compile_query("test", "description = 'it''s fine'").unwrap();
        assert_eq!(q.args, vec!["it's fine"]);
    }

    #[test]
    fn rejects_unknown_columns() {
        // The owning user's columns are deliberately unqueryable.
        for query in ["boundary_addr = 'x'", "user_id = 'x'", "item % 'x'", "drop = 'table'"] {
            assert!(compile_query("test", query).is_err(), "query {query:?} should fail");
        }
    }

    #[test]
    fn rejects_malformed_input() {
        for query in ["name =", "name = db", "(name = 'a'", "name = 'a' and", "name <> 'a'"] {
            assert!(compile_query("test", query).is_err(), "query {query:?} should fail");
        }
    }
}
