use crate::token::{Span, SpannedToken, Token};
use lunac_core::string::StringInterner;
use std::fmt;

/// Tokenization error.
#[derive(Clone, Debug, PartialEq)]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for LexError {}

/// The complete token stream for one chunk, terminated by `Eof`.
///
/// Owns the interner that token `Str`/`Name` ids point into; later stages
/// take it over.
#[derive(Debug)]
pub struct Tokens {
    pub tokens: Vec<SpannedToken>,
    pub strings: StringInterner,
}

/// Tokenize a whole chunk up front.
pub fn tokenize(source: &[u8]) -> Result<Tokens, LexError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let st = lexer.advance()?;
        let done = st.token == Token::Eof;
        tokens.push(st);
        if done {
            break;
        }
    }
    Ok(Tokens {
        tokens,
        strings: lexer.strings,
    })
}

/// Pull-based lexer for Lua 5.1.
pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    current: Option<Result<SpannedToken, LexError>>,
    pub strings: StringInterner,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer from source bytes.
    pub fn new(source: &'a [u8]) -> Self {
        let mut lexer = Lexer {
            source,
            pos: 0,
            line: 1,
            column: 1,
            current: None,
            strings: StringInterner::new(),
        };
        // Prime the first token
        lexer.current = Some(lexer.scan_token());
        lexer
    }

    /// Peek at the current token without consuming.
    pub fn current(&self) -> Result<&SpannedToken, &LexError> {
        match &self.current {
            Some(Ok(tok)) => Ok(tok),
            Some(Err(e)) => Err(e),
            None => unreachable!("lexer should always have a current token"),
        }
    }

    /// Consume the current token and advance to the next one.
    pub fn advance(&mut self) -> Result<SpannedToken, LexError> {
        let prev = self.current.take().unwrap();
        self.current = Some(self.scan_token());
        prev
    }

    /// Get current line number.
    pub fn line(&self) -> u32 {
        self.line
    }

    // ---- Internal scanning ----

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn advance_char(&mut self) -> Option<u8> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        if ch == b'\n' {
            // \n\r counts as one newline
            if self.peek() == Some(b'\r') {
                self.pos += 1;
            }
            self.line += 1;
            self.column = 1;
        } else if ch == b'\r' {
            // \r\n counts as one newline
            if self.peek() == Some(b'\n') {
                self.pos += 1;
            }
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn error(&self, line: u32, column: u32, msg: impl Into<String>) -> LexError {
        LexError {
            message: msg.into(),
            line,
            column,
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            while let Some(ch) = self.peek() {
                if matches!(ch, b' ' | b'\t' | b'\n' | b'\r' | b'\x0C' | b'\x0B') {
                    self.advance_char();
                } else {
                    break;
                }
            }

            if self.peek() == Some(b'-') && self.peek_at(1) == Some(b'-') {
                let start_line = self.line;
                let start_col = self.column;
                self.advance_char(); // -
                self.advance_char(); // -
                if self.peek() == Some(b'[') {
                    if let Some(level) = self.check_long_bracket() {
                        // Long comment: body is discarded
                        self.scan_long_bracket_body(level, start_line, start_col, "comment")?;
                        continue;
                    }
                }
                // Short comment: skip to end of line
                while let Some(ch) = self.peek() {
                    if ch == b'\n' || ch == b'\r' {
                        break;
                    }
                    self.advance_char();
                }
                continue;
            }

            return Ok(());
        }
    }

    /// Check if the current position starts a long bracket `[=*[`.
    /// Returns the level (number of `=`) if so.
    fn check_long_bracket(&self) -> Option<usize> {
        if self.peek() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        let mut offset = 1;
        while self.peek_at(offset) == Some(b'=') {
            level += 1;
            offset += 1;
        }
        if self.peek_at(offset) == Some(b'[') {
            Some(level)
        } else {
            None
        }
    }

    /// Consume a long-bracket body `[=*[ ... ]=*]` of the given level,
    /// returning the content. The opener has not been consumed yet.
    fn scan_long_bracket_body(
        &mut self,
        level: usize,
        start_line: u32,
        start_col: u32,
        what: &str,
    ) -> Result<Vec<u8>, LexError> {
        // Consume `[=*[`
        self.advance_char();
        for _ in 0..level {
            self.advance_char();
        }
        self.advance_char();

        // A newline right after the opener is dropped
        if matches!(self.peek(), Some(b'\n') | Some(b'\r')) {
            self.advance_char();
        }

        let mut buf = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(self.error(
                        start_line,
                        start_col,
                        format!("unfinished long {what} (starting at line {start_line})"),
                    ));
                }
                Some(b']') => {
                    // Possible closer `]=*]`
                    let mut offset = 1;
                    let mut eq = 0;
                    while self.peek_at(offset) == Some(b'=') {
                        eq += 1;
                        offset += 1;
                    }
                    if eq == level && self.peek_at(offset) == Some(b']') {
                        for _ in 0..offset + 1 {
                            self.advance_char();
                        }
                        return Ok(buf);
                    }
                    self.advance_char();
                    buf.push(b']');
                }
                Some(b'\n') | Some(b'\r') => {
                    // Normalize line ends to a single '\n'
                    self.advance_char();
                    buf.push(b'\n');
                }
                Some(ch) => {
                    self.advance_char();
                    buf.push(ch);
                }
            }
        }
    }

    fn scan_token(&mut self) -> Result<SpannedToken, LexError> {
        self.skip_whitespace_and_comments()?;

        let span = Span {
            line: self.line,
            column: self.column,
        };
        let tok = |token| SpannedToken { token, span };

        let ch = match self.peek() {
            Some(ch) => ch,
            None => return Ok(tok(Token::Eof)),
        };

        match ch {
            b'+' => {
                self.advance_char();
                Ok(tok(Token::Plus))
            }
            b'-' => {
                self.advance_char();
                Ok(tok(Token::Minus))
            }
            b'*' => {
                self.advance_char();
                Ok(tok(Token::Star))
            }
            b'/' => {
                self.advance_char();
                Ok(tok(Token::Slash))
            }
            b'%' => {
                self.advance_char();
                Ok(tok(Token::Percent))
            }
            b'^' => {
                self.advance_char();
                Ok(tok(Token::Caret))
            }
            b'#' => {
                self.advance_char();
                Ok(tok(Token::Hash))
            }
            b'(' => {
                self.advance_char();
                Ok(tok(Token::LParen))
            }
            b')' => {
                self.advance_char();
                Ok(tok(Token::RParen))
            }
            b'{' => {
                self.advance_char();
                Ok(tok(Token::LBrace))
            }
            b'}' => {
                self.advance_char();
                Ok(tok(Token::RBrace))
            }
            b']' => {
                self.advance_char();
                Ok(tok(Token::RBracket))
            }
            b';' => {
                self.advance_char();
                Ok(tok(Token::Semi))
            }
            b':' => {
                self.advance_char();
                Ok(tok(Token::Colon))
            }
            b',' => {
                self.advance_char();
                Ok(tok(Token::Comma))
            }
            b'=' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    Ok(tok(Token::Equal))
                } else {
                    Ok(tok(Token::Assign))
                }
            }
            b'<' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    Ok(tok(Token::LessEq))
                } else {
                    Ok(tok(Token::Less))
                }
            }
            b'>' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    Ok(tok(Token::GreaterEq))
                } else {
                    Ok(tok(Token::Greater))
                }
            }
            b'~' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    Ok(tok(Token::NotEqual))
                } else {
                    Err(self.error(span.line, span.column, "unexpected symbol near '~'"))
                }
            }
            b'[' => {
                if let Some(level) = self.check_long_bracket() {
                    let content =
                        self.scan_long_bracket_body(level, span.line, span.column, "string")?;
                    let id = self.strings.intern(&content);
                    Ok(tok(Token::Str(id)))
                } else if self.peek_at(1) == Some(b'=') {
                    Err(self.error(span.line, span.column, "invalid long string delimiter"))
                } else {
                    self.advance_char();
                    Ok(tok(Token::LBracket))
                }
            }
            b'.' => {
                self.advance_char();
                if self.peek() == Some(b'.') {
                    self.advance_char();
                    if self.peek() == Some(b'.') {
                        self.advance_char();
                        Ok(tok(Token::DotDotDot))
                    } else {
                        Ok(tok(Token::DotDot))
                    }
                } else if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.scan_number(self.pos - 1, span)
                } else {
                    Ok(tok(Token::Dot))
                }
            }
            b'"' | b'\'' => self.scan_short_string(span),
            b'0'..=b'9' => self.scan_number(self.pos, span),
            ch if ch == b'_' || ch.is_ascii_alphabetic() => {
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == b'_' || c.is_ascii_alphanumeric() {
                        self.advance_char();
                    } else {
                        break;
                    }
                }
                let word = &self.source[start..self.pos];
                match Token::keyword_from_str(word) {
                    Some(kw) => Ok(tok(kw)),
                    None => {
                        let id = self.strings.intern(word);
                        Ok(tok(Token::Name(id)))
                    }
                }
            }
            ch => Err(self.error(
                span.line,
                span.column,
                format!("unexpected symbol near '{}'", ch as char),
            )),
        }
    }

    /// Scan a number. `start` points at the first digit (or the leading dot,
    /// which has already been consumed).
    fn scan_number(&mut self, start: usize, span: Span) -> Result<SpannedToken, LexError> {
        // Hexadecimal: 0x / 0X followed by hex digits, integer only.
        if self.peek() == Some(b'0')
            && matches!(self.peek_at(1), Some(b'x') | Some(b'X'))
            && self.pos == start
        {
            self.advance_char();
            self.advance_char();
            let digits_start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.advance_char();
            }
            if self.pos == digits_start {
                return Err(self.error(span.line, span.column, "malformed number near '0x'"));
            }
            self.reject_number_suffix(start, span)?;
            let mut value: f64 = 0.0;
            for &d in &self.source[digits_start..self.pos] {
                value = value * 16.0 + hex_value(d) as f64;
            }
            return Ok(SpannedToken {
                token: Token::Number(value),
                span,
            });
        }

        // Decimal: digits [. digits] [eE [+-] digits]
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance_char();
        }
        if self.peek() == Some(b'.') {
            self.advance_char();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance_char();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            self.advance_char();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.advance_char();
            }
            let exp_start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance_char();
            }
            if self.pos == exp_start {
                let text = String::from_utf8_lossy(&self.source[start..self.pos]);
                return Err(self.error(
                    span.line,
                    span.column,
                    format!("malformed number near '{text}'"),
                ));
            }
        }
        self.reject_number_suffix(start, span)?;

        let text = std::str::from_utf8(&self.source[start..self.pos])
            .expect("number lexeme is ASCII");
        match text.parse::<f64>() {
            Ok(value) => Ok(SpannedToken {
                token: Token::Number(value),
                span,
            }),
            Err(_) => Err(self.error(
                span.line,
                span.column,
                format!("malformed number near '{text}'"),
            )),
        }
    }

    /// A number immediately followed by an identifier character is malformed.
    fn reject_number_suffix(&mut self, start: usize, span: Span) -> Result<(), LexError> {
        if self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'.')
        {
            while self
                .peek()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'.')
            {
                self.advance_char();
            }
            let text = String::from_utf8_lossy(&self.source[start..self.pos]);
            return Err(self.error(
                span.line,
                span.column,
                format!("malformed number near '{text}'"),
            ));
        }
        Ok(())
    }

    fn scan_short_string(&mut self, span: Span) -> Result<SpannedToken, LexError> {
        let quote = self.advance_char().unwrap();
        let mut buf = Vec::new();

        loop {
            match self.peek() {
                None => {
                    return Err(self.error(span.line, span.column, "unfinished string near <eof>"));
                }
                Some(b'\n') | Some(b'\r') => {
                    return Err(self.error(span.line, span.column, "unfinished string"));
                }
                Some(ch) if ch == quote => {
                    self.advance_char();
                    break;
                }
                Some(b'\\') => {
                    self.advance_char(); // consume backslash
                    match self.peek() {
                        Some(b'a') => {
                            self.advance_char();
                            buf.push(0x07);
                        }
                        Some(b'b') => {
                            self.advance_char();
                            buf.push(0x08);
                        }
                        Some(b'f') => {
                            self.advance_char();
                            buf.push(0x0C);
                        }
                        Some(b'n') => {
                            self.advance_char();
                            buf.push(b'\n');
                        }
                        Some(b'r') => {
                            self.advance_char();
                            buf.push(b'\r');
                        }
                        Some(b't') => {
                            self.advance_char();
                            buf.push(b'\t');
                        }
                        Some(b'v') => {
                            self.advance_char();
                            buf.push(0x0B);
                        }
                        Some(b'\\') => {
                            self.advance_char();
                            buf.push(b'\\');
                        }
                        Some(b'"') => {
                            self.advance_char();
                            buf.push(b'"');
                        }
                        Some(b'\'') => {
                            self.advance_char();
                            buf.push(b'\'');
                        }
                        Some(b'\n') | Some(b'\r') => {
                            // Escaped line break becomes '\n'
                            self.advance_char();
                            buf.push(b'\n');
                        }
                        Some(d) if d.is_ascii_digit() => {
                            // \ddd: up to three decimal digits, value <= 255
                            let mut value: u32 = 0;
                            let mut digits = 0;
                            while digits < 3 {
                                match self.peek() {
                                    Some(c) if c.is_ascii_digit() => {
                                        self.advance_char();
                                        value = value * 10 + (c - b'0') as u32;
                                        digits += 1;
                                    }
                                    _ => break,
                                }
                            }
                            if value > 255 {
                                return Err(self.error(
                                    span.line,
                                    span.column,
                                    format!("escape sequence too large near '\\{value}'"),
                                ));
                            }
                            buf.push(value as u8);
                        }
                        Some(other) => {
                            return Err(self.error(
                                span.line,
                                span.column,
                                format!("invalid escape sequence '\\{}'", other as char),
                            ));
                        }
                        None => {
                            return Err(self.error(
                                span.line,
                                span.column,
                                "unfinished string near <eof>",
                            ));
                        }
                    }
                }
                Some(ch) => {
                    self.advance_char();
                    buf.push(ch);
                }
            }
        }

        let id = self.strings.intern(&buf);
        Ok(SpannedToken {
            token: Token::Str(id),
            span,
        })
    }
}

fn hex_value(ch: u8) -> u8 {
    match ch {
        b'0'..=b'9' => ch - b'0',
        b'a'..=b'f' => ch - b'a' + 10,
        b'A'..=b'F' => ch - b'A' + 10,
        _ => 0,
    }
}
