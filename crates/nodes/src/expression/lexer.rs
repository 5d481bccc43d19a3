//! Tokenizer for the expression language.

use super::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Dot,
    /// `?.`: member access that tolerates a null receiver.
    OptionalDot,
    Comma,
    Colon,
    Question,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Nullish,
    Eof,
}

/// A token and the byte offset it started at.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub fn tokenize(src: &str) -> Result<Vec<Spanned>, ExpressionError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && peek_digit(&chars, i + 1)) {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            // Exponent part.
            if i < chars.len() && (chars[i].1 == 'e' || chars[i].1 == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j].1 == '+' || chars[j].1 == '-') {
                    j += 1;
                }
                if peek_digit(&chars, j) {
                    i = j;
                    while i < chars.len() && chars[i].1.is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let value = text.parse::<f64>().map_err(|_| ExpressionError::Syntax {
                position: pos,
                message: format!("invalid number '{text}'"),
            })?;
            tokens.push(Spanned { token: Token::Number(value), pos });
            continue;
        }

        if c == '"' || c == '\'' || c == '`' {
            let (text, next) = read_string(&chars, i, c)?;
            tokens.push(Spanned { token: Token::Str(text), pos });
            i = next;
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '$') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            tokens.push(Spanned { token: Token::Ident(text), pos });
            continue;
        }

        let next = chars.get(i + 1).map(|(_, c)| *c);
        let next2 = chars.get(i + 2).map(|(_, c)| *c);
        let (token, width) = match (c, next, next2) {
            ('=', Some('='), Some('=')) => (Token::StrictEq, 3),
            ('!', Some('='), Some('=')) => (Token::StrictNotEq, 3),
            ('=', Some('='), _) => (Token::EqEq, 2),
            ('!', Some('='), _) => (Token::NotEq, 2),
            ('<', Some('='), _) => (Token::Le, 2),
            ('>', Some('='), _) => (Token::Ge, 2),
            ('&', Some('&'), _) => (Token::AndAnd, 2),
            ('|', Some('|'), _) => (Token::OrOr, 2),
            ('?', Some('?'), _) => (Token::Nullish, 2),
            ('?', Some('.'), n) if !n.is_some_and(|n| n.is_ascii_digit()) => (Token::OptionalDot, 2),
            ('(', ..) => (Token::LParen, 1),
            (')', ..) => (Token::RParen, 1),
            ('[', ..) => (Token::LBracket, 1),
            (']', ..) => (Token::RBracket, 1),
            ('{', ..) => (Token::LBrace, 1),
            ('}', ..) => (Token::RBrace, 1),
            ('.', ..) => (Token::Dot, 1),
            (',', ..) => (Token::Comma, 1),
            (':', ..) => (Token::Colon, 1),
            ('?', ..) => (Token::Question, 1),
            ('+', ..) => (Token::Plus, 1),
            ('-', ..) => (Token::Minus, 1),
            ('*', ..) => (Token::Star, 1),
            ('/', ..) => (Token::Slash, 1),
            ('%', ..) => (Token::Percent, 1),
            ('!', ..) => (Token::Bang, 1),
            ('<', ..) => (Token::Lt, 1),
            ('>', ..) => (Token::Gt, 1),
            _ => {
                return Err(ExpressionError::Syntax {
                    position: pos,
                    message: format!("unexpected character '{c}'"),
                })
            }
        };
        tokens.push(Spanned { token, pos });
        i += width;
    }

    tokens.push(Spanned { token: Token::Eof, pos: src.len() });
    Ok(tokens)
}

fn peek_digit(chars: &[(usize, char)], i: usize) -> bool {
    chars.get(i).is_some_and(|(_, c)| c.is_ascii_digit())
}

/// Reads a quoted string starting at `start` (the opening quote). Returns the
/// unescaped text and the index just past the closing quote.
fn read_string(chars: &[(usize, char)], start: usize, quote: char) -> Result<(String, usize), ExpressionError> {
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' {
            i += 1;
            let Some(&(_, esc)) = chars.get(i) else { break };
            out.push(match esc {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                other => other,
            });
        } else {
            out.push(c);
        }
        i += 1;
    }
    Err(ExpressionError::Syntax {
        position: chars[start].0,
        message: "unterminated string literal".into(),
    })
}
