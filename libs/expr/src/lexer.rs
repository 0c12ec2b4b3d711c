//! Tokenizer for the partition expression language.

use crate::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),

    If,
    Else,
    Return,
    True,
    False,
    Null,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Bang,
    Question,
    Colon,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Dot,
    Semi,
}

/// Tokenize a source string; each token keeps its byte offset for error
/// reporting.
pub fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let b = bytes[pos];
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => pos += 1,
            b'(' => {
                tokens.push((pos, Token::LParen));
                pos += 1;
            }
            b')' => {
                tokens.push((pos, Token::RParen));
                pos += 1;
            }
            b'{' => {
                tokens.push((pos, Token::LBrace));
                pos += 1;
            }
            b'}' => {
                tokens.push((pos, Token::RBrace));
                pos += 1;
            }
            b'[' => {
                tokens.push((pos, Token::LBracket));
                pos += 1;
            }
            b']' => {
                tokens.push((pos, Token::RBracket));
                pos += 1;
            }
            b'?' => {
                tokens.push((pos, Token::Question));
                pos += 1;
            }
            b':' => {
                tokens.push((pos, Token::Colon));
                pos += 1;
            }
            b';' => {
                tokens.push((pos, Token::Semi));
                pos += 1;
            }
            b'.' => {
                tokens.push((pos, Token::Dot));
                pos += 1;
            }
            b'+' => {
                tokens.push((pos, Token::Plus));
                pos += 1;
            }
            b'-' => {
                tokens.push((pos, Token::Minus));
                pos += 1;
            }
            b'*' => {
                tokens.push((pos, Token::Star));
                pos += 1;
            }
            b'/' => {
                tokens.push((pos, Token::Slash));
                pos += 1;
            }
            b'%' => {
                tokens.push((pos, Token::Percent));
                pos += 1;
            }
            b'=' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push((pos, Token::EqEq));
                    pos += 2;
                } else {
                    return Err(syntax(pos, "'=' is not an operator; use '=='"));
                }
            }
            b'!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push((pos, Token::NotEq));
                    pos += 2;
                } else {
                    tokens.push((pos, Token::Bang));
                    pos += 1;
                }
            }
            b'<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push((pos, Token::LtEq));
                    pos += 2;
                } else {
                    tokens.push((pos, Token::Lt));
                    pos += 1;
                }
            }
            b'>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push((pos, Token::GtEq));
                    pos += 2;
                } else {
                    tokens.push((pos, Token::Gt));
                    pos += 1;
                }
            }
            b'&' => {
                if bytes.get(pos + 1) == Some(&b'&') {
                    tokens.push((pos, Token::AndAnd));
                    pos += 2;
                } else {
                    return Err(syntax(pos, "expected '&&'"));
                }
            }
            b'|' => {
                if bytes.get(pos + 1) == Some(&b'|') {
                    tokens.push((pos, Token::OrOr));
                    pos += 2;
                } else {
                    return Err(syntax(pos, "expected '||'"));
                }
            }
            b'\'' | b'"' => {
                let (token, next) = lex_string(source, pos)?;
                tokens.push((pos, token));
                pos = next;
            }
            b'0'..=b'9' => {
                let (token, next) = lex_number(source, pos)?;
                tokens.push((pos, token));
                pos = next;
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                let start = pos;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_')
                {
                    pos += 1;
                }
                let word = &source[start..pos];
                tokens.push((start, keyword_or_ident(word)));
            }
            other => {
                return Err(syntax(pos, &format!("unexpected character '{}'", other as char)));
            }
        }
    }

    Ok(tokens)
}

fn keyword_or_ident(word: &str) -> Token {
    match word {
        "if" => Token::If,
        "else" => Token::Else,
        "return" => Token::Return,
        "true" => Token::True,
        "false" => Token::False,
        "null" => Token::Null,
        _ => Token::Ident(word.to_string()),
    }
}

fn lex_string(source: &str, start: usize) -> Result<(Token, usize), ExprError> {
    let bytes = source.as_bytes();
    let quote = bytes[start];
    let mut out = String::new();
    let mut pos = start + 1;

    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => {
                let escaped = bytes
                    .get(pos + 1)
                    .ok_or_else(|| syntax(pos, "unterminated escape"))?;
                let ch = match escaped {
                    b'\\' => '\\',
                    b'\'' => '\'',
                    b'"' => '"',
                    b'n' => '\n',
                    b't' => '\t',
                    b'r' => '\r',
                    other => {
                        return Err(syntax(
                            pos,
                            &format!("unknown escape '\\{}'", *other as char),
                        ))
                    }
                };
                out.push(ch);
                pos += 2;
            }
            b if b == quote => return Ok((Token::Str(out), pos + 1)),
            _ => {
                // Multi-byte characters pass through untouched.
                let ch = source[pos..]
                    .chars()
                    .next()
                    .ok_or_else(|| syntax(pos, "invalid character"))?;
                out.push(ch);
                pos += ch.len_utf8();
            }
        }
    }

    Err(syntax(start, "unterminated string literal"))
}

fn lex_number(source: &str, start: usize) -> Result<(Token, usize), ExprError> {
    let bytes = source.as_bytes();
    let mut pos = start;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }

    let mut is_float = false;
    if pos < bytes.len()
        && bytes[pos] == b'.'
        && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)
    {
        is_float = true;
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
    }

    let text = &source[start..pos];
    let token = if is_float {
        Token::Float(
            text.parse()
                .map_err(|_| syntax(start, "invalid decimal literal"))?,
        )
    } else {
        Token::Int(
            text.parse()
                .map_err(|_| syntax(start, "integer literal out of range"))?,
        )
    };
    Ok((token, pos))
}

fn syntax(offset: usize, message: &str) -> ExprError {
    ExprError::Syntax {
        offset,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|(_, t)| t).collect()
    }

    #[test]
    fn lexes_operators_and_literals() {
        assert_eq!(
            kinds("msgType == 'D' ? 1 : 0"),
            vec![
                Token::Ident("msgType".into()),
                Token::EqEq,
                Token::Str("D".into()),
                Token::Question,
                Token::Int(1),
                Token::Colon,
                Token::Int(0),
            ]
        );
    }

    #[test]
    fn lexes_decimals_and_member_access() {
        assert_eq!(
            kinds("a.b + 1.5"),
            vec![
                Token::Ident("a".into()),
                Token::Dot,
                Token::Ident("b".into()),
                Token::Plus,
                Token::Float(1.5),
            ]
        );
    }

    #[test]
    fn lexes_keywords() {
        assert_eq!(
            kinds("if (true) { return null; } else { return false; }"),
            vec![
                Token::If,
                Token::LParen,
                Token::True,
                Token::RParen,
                Token::LBrace,
                Token::Return,
                Token::Null,
                Token::Semi,
                Token::RBrace,
                Token::Else,
                Token::LBrace,
                Token::Return,
                Token::False,
                Token::Semi,
                Token::RBrace,
            ]
        );
    }

    #[test]
    fn double_quoted_strings_and_escapes() {
        assert_eq!(
            kinds(r#""a\"b" + '\n'"#),
            vec![Token::Str("a\"b".into()), Token::Plus, Token::Str("\n".into())]
        );
    }

    #[test]
    fn single_equals_is_rejected() {
        assert!(matches!(tokenize("a = 1"), Err(ExprError::Syntax { .. })));
    }

    #[test]
    fn unterminated_string_is_rejected() {
        assert!(matches!(tokenize("'abc"), Err(ExprError::Syntax { .. })));
    }
}
