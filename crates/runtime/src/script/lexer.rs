//! Tokenizer for fragment source text.

use super::SyntaxError;

/// Kinds of tokens produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),

    // Keywords
    Fn,
    Let,
    If,
    Else,
    For,
    In,
    Return,
    Throw,
    Break,
    Continue,
    True,
    False,
    Null,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Colon,
    Dot,

    // Operators
    Assign,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,
    Coalesce,

    Eof,
}

impl TokenKind {
    /// Human-readable description used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier '{name}'"),
            TokenKind::Int(n) => format!("number {n}"),
            TokenKind::Float(n) => format!("number {n}"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Eof => "end of input".to_string(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::Fn => "fn",
            TokenKind::Let => "let",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::For => "for",
            TokenKind::In => "in",
            TokenKind::Return => "return",
            TokenKind::Throw => "throw",
            TokenKind::Break => "break",
            TokenKind::Continue => "continue",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Null => "null",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::Comma => ",",
            TokenKind::Semi => ";",
            TokenKind::Colon => ":",
            TokenKind::Dot => ".",
            TokenKind::Assign => "=",
            TokenKind::Eq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::LtEq => "<=",
            TokenKind::Gt => ">",
            TokenKind::GtEq => ">=",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Bang => "!",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::Coalesce => "??",
            TokenKind::Ident(_)
            | TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::Str(_)
            | TokenKind::Eof => "",
        }
    }
}

/// A token with its source position (1-based).
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub col: usize,
}

/// Split source text into tokens. The final token is always `Eof`.
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    col: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            col: 1,
            tokens: Vec::new(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn push(&mut self, kind: TokenKind, line: usize, col: usize) {
        self.tokens.push(Token { kind, line, col });
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        while let Some(c) = self.peek() {
            let (line, col) = (self.line, self.col);

            if c.is_whitespace() {
                self.bump();
                continue;
            }

            if c == '/' {
                self.bump();
                match self.peek() {
                    Some('/') => {
                        while let Some(c) = self.peek() {
                            if c == '\n' {
                                break;
                            }
                            self.bump();
                        }
                    }
                    Some('*') => {
                        self.bump();
                        self.block_comment(line, col)?;
                    }
                    _ => self.push(TokenKind::Slash, line, col),
                }
                continue;
            }

            if c.is_ascii_digit() {
                let kind = self.number(line, col)?;
                self.push(kind, line, col);
                continue;
            }

            if c == '_' || c.is_alphabetic() {
                let word = self.word();
                self.push(keyword_or_ident(word), line, col);
                continue;
            }

            if c == '"' || c == '\'' {
                let s = self.string(c, line, col)?;
                self.push(TokenKind::Str(s), line, col);
                continue;
            }

            self.bump();
            let kind = match c {
                '(' => TokenKind::LParen,
                ')' => TokenKind::RParen,
                '{' => TokenKind::LBrace,
                '}' => TokenKind::RBrace,
                '[' => TokenKind::LBracket,
                ']' => TokenKind::RBracket,
                ',' => TokenKind::Comma,
                ';' => TokenKind::Semi,
                ':' => TokenKind::Colon,
                '.' => TokenKind::Dot,
                '+' => TokenKind::Plus,
                '-' => TokenKind::Minus,
                '*' => TokenKind::Star,
                '%' => TokenKind::Percent,
                '=' => self.pick('=', TokenKind::Eq, TokenKind::Assign),
                '!' => self.pick('=', TokenKind::NotEq, TokenKind::Bang),
                '<' => self.pick('=', TokenKind::LtEq, TokenKind::Lt),
                '>' => self.pick('=', TokenKind::GtEq, TokenKind::Gt),
                '&' if self.peek() == Some('&') => {
                    self.bump();
                    TokenKind::AndAnd
                }
                '|' if self.peek() == Some('|') => {
                    self.bump();
                    TokenKind::OrOr
                }
                '?' if self.peek() == Some('?') => {
                    self.bump();
                    TokenKind::Coalesce
                }
                other => {
                    return Err(SyntaxError::new(
                        line,
                        col,
                        format!("unexpected character '{other}'"),
                    ));
                }
            };
            self.push(kind, line, col);
        }

        let (line, col) = (self.line, self.col);
        self.push(TokenKind::Eof, line, col);
        Ok(self.tokens)
    }

    fn pick(&mut self, next: char, matched: TokenKind, otherwise: TokenKind) -> TokenKind {
        if self.peek() == Some(next) {
            self.bump();
            matched
        } else {
            otherwise
        }
    }

    fn block_comment(&mut self, line: usize, col: usize) -> Result<(), SyntaxError> {
        while let Some(c) = self.bump() {
            if c == '*' && self.peek() == Some('/') {
                self.bump();
                return Ok(());
            }
        }
        Err(SyntaxError::new(line, col, "unterminated block comment"))
    }

    fn word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c == '_' || c.is_alphanumeric() {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        word
    }

    fn number(&mut self, line: usize, col: usize) -> Result<TokenKind, SyntaxError> {
        let mut text = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    text.push(c);
                }
                self.bump();
            } else if c == '.' && !is_float {
                // `1.foo` is not a float; only take the dot when a digit follows.
                let mut lookahead = self.chars.clone();
                lookahead.next();
                if !lookahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                    break;
                }
                is_float = true;
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }

        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| SyntaxError::new(line, col, format!("invalid number '{text}'")))
        } else {
            text.parse::<i64>()
                .map(TokenKind::Int)
                .map_err(|_| SyntaxError::new(line, col, format!("number '{text}' out of range")))
        }
    }

    fn string(&mut self, quote: char, line: usize, col: usize) -> Result<String, SyntaxError> {
        self.bump();
        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(SyntaxError::new(line, col, "unterminated string literal"));
            };
            match c {
                c if c == quote => return Ok(out),
                '\n' => {
                    return Err(SyntaxError::new(line, col, "unterminated string literal"));
                }
                '\\' => {
                    let Some(esc) = self.bump() else {
                        return Err(SyntaxError::new(line, col, "unterminated string literal"));
                    };
                    match esc {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        '\\' => out.push('\\'),
                        '"' => out.push('"'),
                        '\'' => out.push('\''),
                        other => {
                            return Err(SyntaxError::new(
                                self.line,
                                self.col,
                                format!("unknown escape sequence '\\{other}'"),
                            ));
                        }
                    }
                }
                other => out.push(other),
            }
        }
    }
}

fn keyword_or_ident(word: String) -> TokenKind {
    match word.as_str() {
        "fn" => TokenKind::Fn,
        "let" => TokenKind::Let,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "return" => TokenKind::Return,
        "throw" => TokenKind::Throw,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "null" => TokenKind::Null,
        _ => TokenKind::Ident(word),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn tokenizes_function_header() {
        assert_eq!(
            kinds("fn(a, b) {}"),
            vec![
                TokenKind::Fn,
                TokenKind::LParen,
                TokenKind::Ident("a".into()),
                TokenKind::Comma,
                TokenKind::Ident("b".into()),
                TokenKind::RParen,
                TokenKind::LBrace,
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numbers_and_member_access() {
        assert_eq!(
            kinds("1.5 + 2 x.y"),
            vec![
                TokenKind::Float(1.5),
                TokenKind::Plus,
                TokenKind::Int(2),
                TokenKind::Ident("x".into()),
                TokenKind::Dot,
                TokenKind::Ident("y".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            kinds(r#""a\"b\n" 'c'"#),
            vec![
                TokenKind::Str("a\"b\n".into()),
                TokenKind::Str("c".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("// line\n/* block */ null"),
            vec![TokenKind::Null, TokenKind::Eof]
        );
    }

    #[test]
    fn positions_track_lines() {
        let tokens = tokenize("fn()\n  {").unwrap();
        let brace = &tokens[3];
        assert_eq!(brace.kind, TokenKind::LBrace);
        assert_eq!((brace.line, brace.col), (2, 3));
    }

    #[test]
    fn unterminated_string_reports_position() {
        let err = tokenize("fn() { \"oops }").unwrap_err();
        assert_eq!((err.line, err.col), (1, 8));
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn stray_character_is_rejected() {
        let err = tokenize("fn() { # }").unwrap_err();
        assert!(err.message.contains('#'));
    }
}
