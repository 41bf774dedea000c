//! `where` filter expressions.
//!
//! User-supplied filters narrow a query further; they are always combined
//! with the engine's own constraint by conjunction. Grammar:
//!
//! ```text
//! expr       = and ("OR" and)*
//! and        = unary ("AND" unary)*
//! unary      = "NOT" unary | primary
//! primary    = "(" expr ")" | comparison
//! comparison = ident op literal | ident "IN" "(" literal ("," literal)* ")"
//! op         = "=" | "!=" | "<>" | "<" | "<=" | ">" | ">="
//! literal    = integer | 'string' | "string"
//! ```
//!
//! Keywords are case-insensitive. Identifiers may be dotted
//! (`exposure.observation_type`).

use std::fmt;

use crate::error::FilterError;
use crate::types::DataValue;

/// Anything a filter can be evaluated against.
pub trait FieldSource {
    fn field(&self, name: &str) -> Option<DataValue>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// A parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
    Compare {
        field: String,
        op: CompareOp,
        value: DataValue,
    },
    In {
        field: String,
        values: Vec<DataValue>,
    },
}

impl Filter {
    /// Parse an expression; blank input means "no filter".
    pub fn parse(input: &str) -> Result<Option<Filter>, FilterError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Ok(None);
        }
        let mut pos = 0;
        let filter = parse_or(&tokens, &mut pos)?;
        if let Some(extra) = tokens.get(pos) {
            return Err(FilterError::UnexpectedToken {
                found: extra.to_string(),
                expected: "end of expression".into(),
            });
        }
        Ok(Some(filter))
    }

    pub fn matches(&self, source: &dyn FieldSource) -> bool {
        match self {
            Filter::And(a, b) => a.matches(source) && b.matches(source),
            Filter::Or(a, b) => a.matches(source) || b.matches(source),
            Filter::Not(inner) => !inner.matches(source),
            Filter::Compare { field, op, value } => source
                .field(field)
                .is_some_and(|actual| compare(&actual, *op, value)),
            Filter::In { field, values } => source
                .field(field)
                .is_some_and(|actual| values.contains(&actual)),
        }
    }
}

/// Whether an optional filter admits the source; `None` admits everything.
pub fn admits(filter: Option<&Filter>, source: &dyn FieldSource) -> bool {
    filter.is_none_or(|f| f.matches(source))
}

fn compare(actual: &DataValue, op: CompareOp, expected: &DataValue) -> bool {
    // Values of different kinds only ever compare unequal.
    let same_kind = matches!(
        (actual, expected),
        (DataValue::Int(_), DataValue::Int(_)) | (DataValue::Str(_), DataValue::Str(_))
    );
    if !same_kind {
        return op == CompareOp::Ne;
    }
    match op {
        CompareOp::Eq => actual == expected,
        CompareOp::Ne => actual != expected,
        CompareOp::Lt => actual < expected,
        CompareOp::Le => actual <= expected,
        CompareOp::Gt => actual > expected,
        CompareOp::Ge => actual >= expected,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Op(CompareOp),
    And,
    Or,
    Not,
    In,
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier '{s}'"),
            Token::Int(v) => write!(f, "number {v}"),
            Token::Str(s) => write!(f, "string '{s}'"),
            Token::Op(op) => write!(f, "'{op}'"),
            Token::And => write!(f, "AND"),
            Token::Or => write!(f, "OR"),
            Token::Not => write!(f, "NOT"),
            Token::In => write!(f, "IN"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::Comma => write!(f, "','"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(offset, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            ',' => {
                tokens.push(Token::Comma);
                chars.next();
            }
            '=' => {
                chars.next();
                // Accept `==` as a synonym.
                if chars.peek().is_some_and(|&(_, c)| c == '=') {
                    chars.next();
                }
                tokens.push(Token::Op(CompareOp::Eq));
            }
            '!' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => tokens.push(Token::Op(CompareOp::Ne)),
                    _ => return Err(FilterError::UnexpectedChar { ch: '!', offset }),
                }
            }
            '<' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '=')) => {
                        chars.next();
                        tokens.push(Token::Op(CompareOp::Le));
                    }
                    Some(&(_, '>')) => {
                        chars.next();
                        tokens.push(Token::Op(CompareOp::Ne));
                    }
                    _ => tokens.push(Token::Op(CompareOp::Lt)),
                }
            }
            '>' => {
                chars.next();
                if chars.peek().is_some_and(|&(_, c)| c == '=') {
                    chars.next();
                    tokens.push(Token::Op(CompareOp::Ge));
                } else {
                    tokens.push(Token::Op(CompareOp::Gt));
                }
            }
            '\'' | '"' => {
                let quote = ch;
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == quote {
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(FilterError::UnterminatedString { offset });
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut number = String::new();
                number.push(c);
                chars.next();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() {
                        number.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = number
                    .parse()
                    .map_err(|_| FilterError::UnexpectedChar { ch: c, offset })?;
                tokens.push(Token::Int(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '.' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IN" => Token::In,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => return Err(FilterError::UnexpectedChar { ch: other, offset }),
        }
    }

    Ok(tokens)
}

fn expect(tokens: &[Token], pos: &mut usize, wanted: Token) -> Result<(), FilterError> {
    match tokens.get(*pos) {
        Some(t) if *t == wanted => {
            *pos += 1;
            Ok(())
        }
        Some(t) => Err(FilterError::UnexpectedToken {
            found: t.to_string(),
            expected: wanted.to_string(),
        }),
        None => Err(FilterError::UnexpectedEnd {
            expected: wanted.to_string(),
        }),
    }
}

// expr = and ("OR" and)*
fn parse_or(tokens: &[Token], pos: &mut usize) -> Result<Filter, FilterError> {
    let mut left = parse_and(tokens, pos)?;
    while tokens.get(*pos) == Some(&Token::Or) {
        *pos += 1;
        let right = parse_and(tokens, pos)?;
        left = Filter::Or(Box::new(left), Box::new(right));
    }
    Ok(left)
}

// and = unary ("AND" unary)*
fn parse_and(tokens: &[Token], pos: &mut usize) -> Result<Filter, FilterError> {
    let mut left = parse_unary(tokens, pos)?;
    while tokens.get(*pos) == Some(&Token::And) {
        *pos += 1;
        let right = parse_unary(tokens, pos)?;
        left = Filter::And(Box::new(left), Box::new(right));
    }
    Ok(left)
}

fn parse_unary(tokens: &[Token], pos: &mut usize) -> Result<Filter, FilterError> {
    if tokens.get(*pos) == Some(&Token::Not) {
        *pos += 1;
        let inner = parse_unary(tokens, pos)?;
        return Ok(Filter::Not(Box::new(inner)));
    }
    parse_primary(tokens, pos)
}

fn parse_primary(tokens: &[Token], pos: &mut usize) -> Result<Filter, FilterError> {
    match tokens.get(*pos) {
        Some(Token::LParen) => {
            *pos += 1;
            let inner = parse_or(tokens, pos)?;
            expect(tokens, pos, Token::RParen)?;
            Ok(inner)
        }
        Some(Token::Ident(field)) => {
            let field = field.clone();
            *pos += 1;
            match tokens.get(*pos) {
                Some(Token::Op(op)) => {
                    let op = *op;
                    *pos += 1;
                    let value = parse_literal(tokens, pos)?;
                    Ok(Filter::Compare { field, op, value })
                }
                Some(Token::In) => {
                    *pos += 1;
                    expect(tokens, pos, Token::LParen)?;
                    let mut values = vec![parse_literal(tokens, pos)?];
                    while tokens.get(*pos) == Some(&Token::Comma) {
                        *pos += 1;
                        values.push(parse_literal(tokens, pos)?);
                    }
                    expect(tokens, pos, Token::RParen)?;
                    Ok(Filter::In { field, values })
                }
                Some(t) => Err(FilterError::UnexpectedToken {
                    found: t.to_string(),
                    expected: "comparison operator or IN".into(),
                }),
                None => Err(FilterError::UnexpectedEnd {
                    expected: "comparison operator or IN".into(),
                }),
            }
        }
        Some(t) => Err(FilterError::UnexpectedToken {
            found: t.to_string(),
            expected: "identifier or '('".into(),
        }),
        None => Err(FilterError::UnexpectedEnd {
            expected: "identifier or '('".into(),
        }),
    }
}

fn parse_literal(tokens: &[Token], pos: &mut usize) -> Result<DataValue, FilterError> {
    let value = match tokens.get(*pos) {
        Some(Token::Int(v)) => DataValue::Int(*v),
        Some(Token::Str(s)) => DataValue::Str(s.clone()),
        Some(t) => {
            return Err(FilterError::UnexpectedToken {
                found: t.to_string(),
                expected: "literal".into(),
            });
        }
        None => {
            return Err(FilterError::UnexpectedEnd {
                expected: "literal".into(),
            });
        }
    };
    *pos += 1;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Fields(HashMap<&'static str, DataValue>);

    impl FieldSource for Fields {
        fn field(&self, name: &str) -> Option<DataValue> {
            self.0.get(name).cloned()
        }
    }

    fn exposure() -> Fields {
        Fields(HashMap::from([
            ("exposure", DataValue::Int(2020011700002)),
            ("band", DataValue::Str("g".into())),
            ("exposure.observation_type", DataValue::Str("science".into())),
            ("day_obs", DataValue::Int(20200117)),
        ]))
    }

    fn matches(expr: &str) -> bool {
        Filter::parse(expr).unwrap().unwrap().matches(&exposure())
    }

    #[test]
    fn test_blank_is_no_filter() {
        assert_eq!(Filter::parse("").unwrap(), None);
        assert_eq!(Filter::parse("   ").unwrap(), None);
        assert!(admits(None, &exposure()));
    }

    #[test]
    fn test_comparisons() {
        assert!(matches("band = 'g'"));
        assert!(matches("band == \"g\""));
        assert!(!matches("band != 'g'"));
        assert!(matches("band <> 'r'"));
        assert!(matches("day_obs >= 20200117"));
        assert!(!matches("day_obs > 20200117"));
        assert!(matches("day_obs < 20200118 and day_obs <= 20200117"));
    }

    #[test]
    fn test_in_list() {
        assert!(matches("exposure IN (2020011700002, 2020011700003)"));
        assert!(!matches("exposure in (1, 2)"));
        assert!(matches("band IN ('g')"));
    }

    #[test]
    fn test_boolean_structure_and_precedence() {
        // AND binds tighter than OR.
        assert!(matches("band = 'r' AND day_obs = 1 OR exposure.observation_type = 'science'"));
        assert!(!matches("band = 'r' AND (day_obs = 1 OR exposure.observation_type = 'science')"));
        assert!(matches("NOT band = 'r'"));
        assert!(!matches("NOT (band = 'g')"));
    }

    #[test]
    fn test_missing_field_and_mixed_kinds() {
        assert!(!matches("detector = 5"));
        assert!(matches("NOT detector = 5"));
        assert!(!matches("band = 5"));
        assert!(matches("band != 5"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Filter::parse("band = 'g"),
            Err(FilterError::UnterminatedString { .. })
        ));
        assert!(matches!(
            Filter::parse("band ="),
            Err(FilterError::UnexpectedEnd { .. })
        ));
        assert!(matches!(
            Filter::parse("band 'g'"),
            Err(FilterError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            Filter::parse("band = 'g' )"),
            Err(FilterError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            Filter::parse("band ; 'g'"),
            Err(FilterError::UnexpectedChar { ch: ';', .. })
        ));
    }
}
