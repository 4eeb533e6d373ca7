//! Hand-rolled lexer for the native `.sans` dialect: a single pass over
//! `char_indices` producing a flat token stream with byte-span locations.
//!
//! No combinator or grammar crate is pulled in for this — the token set is
//! small and fixed, and a direct state machine keeps every refusal's source
//! span exact, the same tradeoff the SAS statement splitter in
//! [`crate::sas::split_statements`] makes.

use sans_core::Loc;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Decimal(String),
    Str(String),
    // Punctuation / operators
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Semi,
    Arrow,   // ->
    Assign,  // =
    Bang,    // update!
    Eq,      // ==
    Ne,      // !=
    Le,      // <=
    Ge,      // >=
    Lt,
    Gt,
    Plus,
    Minus,
    Star,
    Slash,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(s) => write!(f, "identifier '{s}'"),
            TokenKind::Int(n) => write!(f, "integer {n}"),
            TokenKind::Decimal(s) => write!(f, "decimal {s}"),
            TokenKind::Str(s) => write!(f, "string {s:?}"),
            TokenKind::LParen => write!(f, "'('"),
            TokenKind::RParen => write!(f, "')'"),
            TokenKind::LBrace => write!(f, "'{{'"),
            TokenKind::RBrace => write!(f, "'}}'"),
            TokenKind::Comma => write!(f, "','"),
            TokenKind::Dot => write!(f, "'.'"),
            TokenKind::Semi => write!(f, "';'"),
            TokenKind::Arrow => write!(f, "'->'"),
            TokenKind::Assign => write!(f, "'='"),
            TokenKind::Bang => write!(f, "'!'"),
            TokenKind::Eq => write!(f, "'=='"),
            TokenKind::Ne => write!(f, "'!='"),
            TokenKind::Le => write!(f, "'<='"),
            TokenKind::Ge => write!(f, "'>='"),
            TokenKind::Lt => write!(f, "'<'"),
            TokenKind::Gt => write!(f, "'>'"),
            TokenKind::Plus => write!(f, "'+'"),
            TokenKind::Minus => write!(f, "'-'"),
            TokenKind::Star => write!(f, "'*'"),
            TokenKind::Slash => write!(f, "'/'"),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

pub struct LexError {
    pub message: String,
    pub line: u32,
}

/// The closed keyword set. An identifier that matches one of these is
/// still returned as `Ident` — the parser decides where keywords are
/// expected, so `let`, `name`, etc. all lex uniformly.
pub const KEYWORDS: &[&str] = &[
    "let", "const", "datasource", "table", "save", "assert", "to", "as", "from", "do", "end",
    "select", "filter", "derive", "update", "rename", "drop", "cast", "sort", "aggregate", "by",
    "on_error", "trim", "true", "false", "null", "csv", "inline_csv", "columns", "and", "or",
    "not", "if", "coalesce", "put", "input", "row_count",
];

pub fn lex(source: &str, file: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();
    let bytes = source.as_bytes();
    let mut line: u32 = 1;
    let _ = file;

    while let Some(&(i, c)) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while let Some(&(_, c2)) = chars.peek() {
                    if c2 == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, 'n')) => s.push('\n'),
                            Some((_, 't')) => s.push('\t'),
                            Some((_, '"')) => s.push('"'),
                            Some((_, '\\')) => s.push('\\'),
                            Some((_, other)) => s.push(other),
                            None => return Err(LexError { message: "unterminated string".to_string(), line }),
                        },
                        Some((_, c2)) => {
                            if c2 == '\n' {
                                line += 1;
                            }
                            s.push(c2);
                        }
                        None => return Err(LexError { message: "unterminated string".to_string(), line }),
                    }
                }
                tokens.push(Token { kind: TokenKind::Str(s), line });
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let mut end = i;
                let mut is_decimal = false;
                while let Some(&(j, c2)) = chars.peek() {
                    if c2.is_ascii_digit() {
                        end = j + c2.len_utf8();
                        chars.next();
                    } else if c2 == '.' && !is_decimal {
                        is_decimal = true;
                        end = j + c2.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &source[start..end];
                if is_decimal {
                    tokens.push(Token { kind: TokenKind::Decimal(text.to_string()), line });
                } else {
                    let n: i64 = text.parse().map_err(|_| LexError {
                        message: format!("invalid integer literal '{text}'"),
                        line,
                    })?;
                    tokens.push(Token { kind: TokenKind::Int(n), line });
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                let mut end = i;
                while let Some(&(j, c2)) = chars.peek() {
                    if c2.is_alphanumeric() || c2 == '_' {
                        end = j + c2.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(source[start..end].to_string()),
                    line,
                });
            }
            '-' => {
                chars.next();
                if let Some(&(_, '>')) = chars.peek() {
                    chars.next();
                    tokens.push(Token { kind: TokenKind::Arrow, line });
                } else {
                    tokens.push(Token { kind: TokenKind::Minus, line });
                }
            }
            '=' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    tokens.push(Token { kind: TokenKind::Eq, line });
                } else {
                    tokens.push(Token { kind: TokenKind::Assign, line });
                }
            }
            '!' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    tokens.push(Token { kind: TokenKind::Ne, line });
                } else {
                    tokens.push(Token { kind: TokenKind::Bang, line });
                }
            }
            '<' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    tokens.push(Token { kind: TokenKind::Le, line });
                } else {
                    tokens.push(Token { kind: TokenKind::Lt, line });
                }
            }
            '>' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    tokens.push(Token { kind: TokenKind::Ge, line });
                } else {
                    tokens.push(Token { kind: TokenKind::Gt, line });
                }
            }
            '(' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::LParen, line });
            }
            ')' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::RParen, line });
            }
            '{' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::LBrace, line });
            }
            '}' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::RBrace, line });
            }
            ',' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::Comma, line });
            }
            '.' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::Dot, line });
            }
            ';' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::Semi, line });
            }
            '+' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::Plus, line });
            }
            '*' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::Star, line });
            }
            '/' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::Slash, line });
            }
            other => {
                return Err(LexError {
                    message: format!("unexpected character '{other}'"),
                    line,
                });
            }
        }
        let _ = bytes;
    }
    tokens.push(Token { kind: TokenKind::Eof, line });
    Ok(tokens)
}

pub fn loc(file: &str, line: u32) -> Loc {
    Loc::new(file, line, line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_datasource_declaration() {
        let toks = lex(r#"datasource x = csv("x.csv")"#, "t.sans").unwrap();
        assert!(matches!(toks[0].kind, TokenKind::Ident(ref s) if s == "datasource"));
        assert!(matches!(toks[3].kind, TokenKind::Ident(ref s) if s == "csv"));
        assert!(matches!(toks[5].kind, TokenKind::Str(ref s) if s == "x.csv"));
    }

    #[test]
    fn lexes_arrow_vs_minus() {
        let toks = lex("a -> b - 1", "t.sans").unwrap();
        assert_eq!(toks[1].kind, TokenKind::Arrow);
        assert_eq!(toks[3].kind, TokenKind::Minus);
    }

    #[test]
    fn lexes_decimal_literal() {
        let toks = lex("3.14", "t.sans").unwrap();
        assert_eq!(toks[0].kind, TokenKind::Decimal("3.14".to_string()));
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(lex(r#""unterminated"#, "t.sans").is_err());
    }

    #[test]
    fn skips_hash_comments() {
        let toks = lex("let a = 1 # trailing comment\nlet b = 2", "t.sans").unwrap();
        assert!(toks.iter().any(|t| matches!(&t.kind, TokenKind::Ident(s) if s == "b")));
    }
}
