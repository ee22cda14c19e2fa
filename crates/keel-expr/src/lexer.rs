//! Tokenizer.

use crate::error::{ExprError, Result};

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Signed integer literal.
    Int(i64),
    /// Unsigned integer literal (`42u`).
    Uint(u64),
    /// Floating point literal.
    Double(f64),
    /// String literal.
    Str(String),
    /// Identifier.
    Ident(String),
    /// `true`.
    True,
    /// `false`.
    False,
    /// `null`.
    Null,
    /// `in`.
    In,
    /// `(`.
    LParen,
    /// `)`.
    RParen,
    /// `[`.
    LBracket,
    /// `]`.
    RBracket,
    /// `{`.
    LBrace,
    /// `}`.
    RBrace,
    /// `.`.
    Dot,
    /// `,`.
    Comma,
    /// `:`.
    Colon,
    /// `?`.
    Question,
    /// `+`.
    Plus,
    /// `-`.
    Minus,
    /// `*`.
    Star,
    /// `/`.
    Slash,
    /// `%`.
    Percent,
    /// `!`.
    Bang,
    /// `&&`.
    And,
    /// `||`.
    Or,
    /// `==`.
    Eq,
    /// `!=`.
    Ne,
    /// `<`.
    Lt,
    /// `<=`.
    Le,
    /// `>`.
    Gt,
    /// `>=`.
    Ge,
}

/// A token with its byte offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    /// The token.
    pub token: Token,
    /// Byte offset of the token start.
    pub offset: usize,
}

fn syntax(offset: usize, message: impl Into<String>) -> ExprError {
    ExprError::Syntax {
        offset,
        message: message.into(),
    }
}

/// Splits the source into tokens.
pub fn tokenize(src: &str) -> Result<Vec<Spanned>> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let next = bytes.get(i + 1).copied();

        let token = match c {
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'[' => Token::LBracket,
            b']' => Token::RBracket,
            b'{' => Token::LBrace,
            b'}' => Token::RBrace,
            b',' => Token::Comma,
            b':' => Token::Colon,
            b'?' => Token::Question,
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' => Token::Star,
            b'/' => Token::Slash,
            b'%' => Token::Percent,
            b'.' if !next.is_some_and(|n| n.is_ascii_digit()) => Token::Dot,
            b'&' if next == Some(b'&') => {
                i += 1;
                Token::And
            }
            b'|' if next == Some(b'|') => {
                i += 1;
                Token::Or
            }
            b'=' if next == Some(b'=') => {
                i += 1;
                Token::Eq
            }
            b'!' if next == Some(b'=') => {
                i += 1;
                Token::Ne
            }
            b'!' => Token::Bang,
            b'<' if next == Some(b'=') => {
                i += 1;
                Token::Le
            }
            b'<' => Token::Lt,
            b'>' if next == Some(b'=') => {
                i += 1;
                Token::Ge
            }
            b'>' => Token::Gt,
            b'"' | b'\'' => {
                let (s, end) = lex_string(src, i)?;
                tokens.push(Spanned {
                    token: Token::Str(s),
                    offset: start,
                });
                i = end;
                continue;
            }
            b'0'..=b'9' | b'.' => {
                let (token, end) = lex_number(src, i)?;
                tokens.push(Spanned { token, offset: start });
                i = end;
                continue;
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                let mut end = i;
                while end < bytes.len() && (bytes[end] == b'_' || bytes[end].is_ascii_alphanumeric()) {
                    end += 1;
                }
                let word = &src[i..end];
                let token = match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "in" => Token::In,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push(Spanned { token, offset: start });
                i = end;
                continue;
            }
            _ => return Err(syntax(i, format!("unexpected character '{}'", c as char))),
        };

        tokens.push(Spanned { token, offset: start });
        i += 1;
    }

    Ok(tokens)
}

fn lex_string(src: &str, start: usize) -> Result<(String, usize)> {
    let bytes = src.as_bytes();
    let quote = bytes[start];
    let mut out = String::new();
    let mut chars = src[start + 1..].char_indices();

    while let Some((idx, ch)) = chars.next() {
        let pos = start + 1 + idx;
        match ch {
            c if c as u32 == quote as u32 => return Ok((out, pos + 1)),
            '\\' => {
                let (_, esc) = chars.next().ok_or_else(|| syntax(pos, "unterminated escape"))?;
                out.push(match esc {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '\\' => '\\',
                    '"' => '"',
                    '\'' => '\'',
                    other => return Err(syntax(pos, format!("unsupported escape '\\{other}'"))),
                });
            }
            c => out.push(c),
        }
    }

    Err(syntax(start, "unterminated string literal"))
}

fn lex_number(src: &str, start: usize) -> Result<(Token, usize)> {
    let bytes = src.as_bytes();
    let mut end = start;

    if bytes[start] == b'0' && matches!(bytes.get(start + 1), Some(b'x') | Some(b'X')) {
        end = start + 2;
        while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
            end += 1;
        }
        let v = u64::from_str_radix(&src[start + 2..end], 16).map_err(|e| syntax(start, e.to_string()))?;
        if bytes.get(end) == Some(&b'u') || bytes.get(end) == Some(&b'U') {
            return Ok((Token::Uint(v), end + 1));
        }
        let v = i64::try_from(v).map_err(|_| syntax(start, "integer literal overflows int"))?;
        return Ok((Token::Int(v), end));
    }

    let mut is_double = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => end += 1,
            b'.' if !is_double && bytes.get(end + 1).is_some_and(u8::is_ascii_digit) => {
                is_double = true;
                end += 1;
            }
            b'e' | b'E' => {
                is_double = true;
                end += 1;
                if matches!(bytes.get(end), Some(b'+') | Some(b'-')) {
                    end += 1;
                }
            }
            _ => break,
        }
    }

    let text = &src[start..end];

    if is_double {
        let v: f64 = text.parse().map_err(|_| syntax(start, format!("invalid double literal '{text}'")))?;
        return Ok((Token::Double(v), end));
    }

    if matches!(bytes.get(end), Some(b'u') | Some(b'U')) {
        let v: u64 = text.parse().map_err(|_| syntax(start, format!("invalid uint literal '{text}'")))?;
        return Ok((Token::Uint(v), end + 1));
    }

    let v: i64 = text.parse().map_err(|_| syntax(start, format!("invalid int literal '{text}'")))?;
    Ok((Token::Int(v), end))
}
