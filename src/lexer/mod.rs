// Hand-written lexer for the definition language

pub mod token;

use crate::error::Error;
use crate::span::Span;
use token::{Token, TokenKind};
use tracing::warn;

/// Lexer that converts definition text into tokens
pub struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
        }
    }

    /// Tokenize the entire source
    pub fn tokenize(mut self) -> Result<Vec<Token>, Error> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments()?;
            if self.pos >= self.bytes.len() {
                tokens.push(Token::new(
                    TokenKind::Eof,
                    Span::new(self.pos as u32, self.pos as u32),
                ));
                break;
            }
            if self.bytes[self.pos] == b'#' && self.at_line_start() {
                if let Some(tok) = self.lex_directive()? {
                    tokens.push(tok);
                }
                continue;
            }
            let tok = self.next_token()?;
            tokens.push(tok);
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.bytes.get(self.pos).copied();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    fn err(&self, start: usize, message: impl Into<String>) -> Error {
        Error::parse_at(
            self.source,
            Span::new(start as u32, self.pos as u32),
            message,
        )
    }

    /// True when only spaces/tabs precede the current position on its line
    fn at_line_start(&self) -> bool {
        let mut i = self.pos;
        while i > 0 {
            match self.bytes[i - 1] {
                b' ' | b'\t' | b'\r' => i -= 1,
                b'\n' => return true,
                _ => return false,
            }
        }
        true
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), Error> {
        loop {
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }

            if self.pos + 1 < self.bytes.len()
                && self.bytes[self.pos] == b'/'
                && self.bytes[self.pos + 1] == b'/'
            {
                self.pos += 2;
                while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }

            if self.pos + 1 < self.bytes.len()
                && self.bytes[self.pos] == b'/'
                && self.bytes[self.pos + 1] == b'*'
            {
                self.skip_block_comment()?;
                continue;
            }

            return Ok(());
        }
    }

    /// Skip spaces, tabs and comments but stop at a newline.
    /// Returns true if a newline (or EOF) terminated the scan.
    fn skip_inline_whitespace(&mut self) -> Result<bool, Error> {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.pos += 1;
                }
                Some(b'\n') | None => return Ok(true),
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                    return Ok(true);
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.skip_block_comment()?;
                }
                // Line continuation
                Some(b'\\') if matches!(self.peek_at(1), Some(b'\n')) => {
                    self.pos += 2;
                }
                _ => return Ok(false),
            }
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), Error> {
        let start = self.pos;
        self.pos += 2;
        let mut depth = 1;
        while self.pos + 1 < self.bytes.len() && depth > 0 {
            if self.bytes[self.pos] == b'/' && self.bytes[self.pos + 1] == b'*' {
                depth += 1;
                self.pos += 2;
            } else if self.bytes[self.pos] == b'*' && self.bytes[self.pos + 1] == b'/' {
                depth -= 1;
                self.pos += 2;
            } else {
                self.pos += 1;
            }
        }
        if depth > 0 {
            self.pos = self.bytes.len();
            return Err(self.err(start, "unterminated block comment"));
        }
        Ok(())
    }

    /// Lex a `#...` directive at the start of a line.
    /// `#define` produces a token; everything else is skipped.
    fn lex_directive(&mut self) -> Result<Option<Token>, Error> {
        let start = self.pos;
        self.pos += 1; // '#'
        self.skip_inline_whitespace()?;
        let word_start = self.pos;
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        let word = &self.source[word_start..self.pos];

        match word {
            "define" => {
                self.skip_inline_whitespace()?;
                let name_start = self.pos;
                let name_tok = self.next_token()?;
                let name = match name_tok.kind {
                    TokenKind::Ident(name) => name,
                    _ => return Err(self.err(name_start, "expected name after '#define'")),
                };

                let mut body = Vec::new();
                loop {
                    if self.skip_inline_whitespace()? {
                        break;
                    }
                    body.push(self.next_token()?);
                }
                Ok(Some(Token::new(
                    TokenKind::Define { name, body },
                    Span::new(start as u32, self.pos as u32),
                )))
            }
            "include" => {
                let line_start = self.pos;
                self.skip_line();
                warn!(
                    path = self.source[line_start..self.pos].trim(),
                    "ignoring #include directive"
                );
                Ok(None)
            }
            _ => {
                // #pragma and friends are tolerated and ignored
                self.skip_line();
                Ok(None)
            }
        }
    }

    fn skip_line(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
            self.pos += 1;
        }
    }

    fn next_token(&mut self) -> Result<Token, Error> {
        let start = self.pos;
        let b = match self.peek() {
            Some(b) => b,
            None => {
                return Ok(Token::new(
                    TokenKind::Eof,
                    Span::new(start as u32, start as u32),
                ))
            }
        };

        if b.is_ascii_digit() {
            return self.lex_number(start);
        }
        if b == b'"' {
            return self.lex_string(start);
        }
        if b == b'\'' {
            return self.lex_char(start);
        }
        if b.is_ascii_alphabetic() || b == b'_' {
            return Ok(self.lex_ident(start));
        }
        self.lex_operator(start)
    }

    fn lex_number(&mut self, start: usize) -> Result<Token, Error> {
        if self.bytes[self.pos] == b'0' && self.pos + 1 < self.bytes.len() {
            match self.bytes[self.pos + 1] {
                b'x' | b'X' => return self.lex_radix_number(start, 16, 2),
                b'o' | b'O' => return self.lex_radix_number(start, 8, 2),
                b'b' | b'B' => {
                    if matches!(self.peek_at(2), Some(b'0') | Some(b'1')) {
                        return self.lex_radix_number(start, 2, 2);
                    }
                }
                // C-style octal: 0 followed by digits
                b'0'..=b'7' => return self.lex_radix_number(start, 8, 1),
                _ => {}
            }
        }
        self.lex_radix_number(start, 10, 0)
    }

    /// Lex an integer literal with a given radix, skipping `prefix_len`
    /// bytes of prefix (`0x`, `0o`, `0b` or the leading `0` of C octal).
    fn lex_radix_number(
        &mut self,
        start: usize,
        radix: u32,
        prefix_len: usize,
    ) -> Result<Token, Error> {
        self.pos += prefix_len;
        let digit_start = self.pos;
        let is_digit = |b: u8| -> bool {
            match radix {
                16 => b.is_ascii_hexdigit(),
                10 => b.is_ascii_digit(),
                8 => (b'0'..=b'7').contains(&b),
                _ => b == b'0' || b == b'1',
            }
        };
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            if is_digit(b) || b == b'_' {
                self.pos += 1;
            } else if b == b'\'' && self.peek_at(1).is_some_and(is_digit) {
                // C++ style digit separator
                self.pos += 1;
            } else {
                break;
            }
        }
        let digits: String = self.source[digit_start..self.pos]
            .chars()
            .filter(|&c| c != '_' && c != '\'')
            .collect();
        // Integer suffixes (u, l and combinations) are accepted and ignored
        while matches!(
            self.peek(),
            Some(b'u') | Some(b'U') | Some(b'l') | Some(b'L')
        ) {
            self.pos += 1;
        }
        if digits.is_empty() {
            return Err(self.err(start, "expected digits in integer literal"));
        }
        let val = u128::from_str_radix(&digits, radix)
            .map_err(|_| self.err(start, "integer literal overflow"))?;
        Ok(Token::new(
            TokenKind::IntLiteral(val),
            Span::new(start as u32, self.pos as u32),
        ))
    }

    /// Process an escape sequence at self.pos (the byte after '\\').
    fn lex_escape_byte(&mut self, start: usize) -> Result<u8, Error> {
        let b = self
            .advance()
            .ok_or_else(|| self.err(start, "unterminated escape sequence"))?;
        Ok(match b {
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'\\' => b'\\',
            b'"' => b'"',
            b'\'' => b'\'',
            b'0' => 0,
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0C,
            b'v' => 0x0B,
            b'x' => {
                let hex_start = self.pos;
                while self.pos < self.bytes.len()
                    && self.bytes[self.pos].is_ascii_hexdigit()
                    && self.pos - hex_start < 2
                {
                    self.pos += 1;
                }
                u8::from_str_radix(&self.source[hex_start..self.pos], 16)
                    .map_err(|_| self.err(start, "invalid hex escape"))?
            }
            other => {
                return Err(self.err(
                    start,
                    format!("unknown escape sequence '\\{}'", other as char),
                ))
            }
        })
    }

    fn lex_string(&mut self, start: usize) -> Result<Token, Error> {
        self.pos += 1; // opening quote
        let mut value = String::new();
        loop {
            match self.advance() {
                None | Some(b'\n') => {
                    return Err(self.err(start, "unterminated string literal"));
                }
                Some(b'"') => break,
                Some(b'\\') => {
                    value.push(self.lex_escape_byte(start)? as char);
                }
                Some(b) if b < 0x80 => value.push(b as char),
                Some(_) => {
                    // Multi-byte UTF-8
                    self.pos -= 1;
                    let ch = self.source[self.pos..].chars().next().unwrap_or('\u{FFFD}');
                    value.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        }
        Ok(Token::new(
            TokenKind::StringLiteral(value),
            Span::new(start as u32, self.pos as u32),
        ))
    }

    fn lex_char(&mut self, start: usize) -> Result<Token, Error> {
        self.pos += 1; // opening quote
        let value = match self.peek() {
            Some(b'\\') => {
                self.pos += 1;
                self.lex_escape_byte(start)?
            }
            Some(b'\'') | None => {
                return Err(self.err(start, "empty character literal"));
            }
            Some(b) => {
                self.pos += 1;
                b
            }
        };
        if self.peek() == Some(b'\'') {
            self.pos += 1;
        } else {
            return Err(self.err(start, "unterminated character literal"));
        }
        Ok(Token::new(
            TokenKind::CharLiteral(value),
            Span::new(start as u32, self.pos as u32),
        ))
    }

    fn lex_ident(&mut self, start: usize) -> Token {
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        let text = &self.source[start..self.pos];
        let kind = TokenKind::keyword_from_str(text)
            .unwrap_or_else(|| TokenKind::Ident(text.to_string()));
        Token::new(kind, Span::new(start as u32, self.pos as u32))
    }

    fn lex_operator(&mut self, start: usize) -> Result<Token, Error> {
        let b = self
            .advance()
            .ok_or_else(|| self.err(start, "unexpected end of input"))?;
        let kind = match b {
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'%' => TokenKind::Percent,
            b'~' => TokenKind::Tilde,
            b'^' => TokenKind::Caret,
            b'?' => TokenKind::Question,
            b';' => TokenKind::Semicolon,
            b',' => TokenKind::Comma,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'&' => {
                if self.peek() == Some(b'&') {
                    self.advance();
                    TokenKind::AmpAmp
                } else {
                    TokenKind::Ampersand
                }
            }
            b'|' => {
                if self.peek() == Some(b'|') {
                    self.advance();
                    TokenKind::PipePipe
                } else {
                    TokenKind::Pipe
                }
            }
            b'<' => {
                if self.peek() == Some(b'<') {
                    self.advance();
                    TokenKind::LShift
                } else if self.peek() == Some(b'=') {
                    self.advance();
                    TokenKind::LessEq
                } else {
                    TokenKind::Less
                }
            }
            b'>' => {
                if self.peek() == Some(b'>') {
                    self.advance();
                    TokenKind::RShift
                } else if self.peek() == Some(b'=') {
                    self.advance();
                    TokenKind::GreaterEq
                } else {
                    TokenKind::Greater
                }
            }
            b'=' => {
                if self.peek() == Some(b'=') {
                    self.advance();
                    TokenKind::EqEq
                } else {
                    TokenKind::Eq
                }
            }
            b'!' => {
                if self.peek() == Some(b'=') {
                    self.advance();
                    TokenKind::BangEq
                } else {
                    TokenKind::Bang
                }
            }
            b':' => {
                if self.peek() == Some(b':') {
                    self.advance();
                    TokenKind::ColonColon
                } else {
                    TokenKind::Colon
                }
            }
            other => {
                return Err(self.err(
                    start,
                    format!("unexpected character '{}'", other as char),
                ));
            }
        };
        Ok(Token::new(kind, Span::new(start as u32, self.pos as u32)))
    }
}
