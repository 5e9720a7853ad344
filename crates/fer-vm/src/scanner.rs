//! The scanner: a lazy token producer over a UTF-8 source buffer.
//!
//! Tokens are scanned on demand, one per call, and borrow their lexeme
//! from the source. Keywords are recognized by a hand-written trie that
//! switches on the first character before comparing the tail.

use crate::token::{Token, TokenKind};

pub struct Scanner<'src> {
    source: &'src str,
    /// Byte offset of the first character of the token being scanned.
    start: usize,
    /// Byte offset of the next character to consume.
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Scanner {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();
        if is_alpha(c) {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number();
        }

        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b'[' => self.make_token(TokenKind::LeftBracket),
            b']' => self.make_token(TokenKind::RightBracket),
            b';' => self.make_token(TokenKind::Semicolon),
            b':' => self.make_token(TokenKind::Colon),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'!' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.make_token(kind)
            }
            b'<' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.make_token(kind)
            }
            b'>' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.make_token(kind)
            }
            b'"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let byte = self.source.as_bytes()[self.current];
        self.current += 1;
        byte
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() {
            0
        } else {
            self.source.as_bytes()[self.current]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            0
        } else {
            self.source.as_bytes()[self.current + 1]
        }
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.peek() != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.current += 1;
                }
                b'\n' => {
                    self.line += 1;
                    self.current += 1;
                }
                b'/' => {
                    if self.peek_next() == b'/' {
                        while self.peek() != b'\n' && !self.is_at_end() {
                            self.current += 1;
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn identifier(&mut self) -> Token<'src> {
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() {
            self.current += 1;
        }
        self.make_token(self.identifier_kind())
    }

    /// The keyword trie. The first character narrows the candidates;
    /// `check_keyword` verifies the length and the remaining bytes.
    fn identifier_kind(&self) -> TokenKind {
        let bytes = self.source.as_bytes();
        match bytes[self.start] {
            b'a' => self.check_keyword(1, "nd", TokenKind::And),
            b'b' => self.check_keyword(1, "reak", TokenKind::Break),
            b'c' => {
                if self.current - self.start > 1 {
                    match bytes[self.start + 1] {
                        b'l' => self.check_keyword(2, "ass", TokenKind::Class),
                        b'o' => self.check_keyword(2, "ntinue", TokenKind::Continue),
                        _ => TokenKind::Identifier,
                    }
                } else {
                    TokenKind::Identifier
                }
            }
            b'e' => self.check_keyword(1, "lse", TokenKind::Else),
            b'f' => {
                if self.current - self.start > 1 {
                    match bytes[self.start + 1] {
                        b'a' => self.check_keyword(2, "lse", TokenKind::False),
                        b'o' => self.check_keyword(2, "r", TokenKind::For),
                        b'u' => self.check_keyword(2, "n", TokenKind::Fun),
                        _ => TokenKind::Identifier,
                    }
                } else {
                    TokenKind::Identifier
                }
            }
            b'i' => self.check_keyword(1, "f", TokenKind::If),
            b'n' => self.check_keyword(1, "il", TokenKind::Nil),
            b'o' => self.check_keyword(1, "r", TokenKind::Or),
            b'p' => {
                if self.current - self.start > 1 {
                    match bytes[self.start + 1] {
                        b'e' => self.check_keyword(2, "rm", TokenKind::Perm),
                        b'r' => self.check_keyword(2, "int", TokenKind::Print),
                        _ => TokenKind::Identifier,
                    }
                } else {
                    TokenKind::Identifier
                }
            }
            b'r' => self.check_keyword(1, "eturn", TokenKind::Return),
            b's' => self.check_keyword(1, "uper", TokenKind::Super),
            b't' => {
                if self.current - self.start > 1 {
                    match bytes[self.start + 1] {
                        b'h' => self.check_keyword(2, "is", TokenKind::This),
                        b'r' => self.check_keyword(2, "ue", TokenKind::True),
                        _ => TokenKind::Identifier,
                    }
                } else {
                    TokenKind::Identifier
                }
            }
            b'v' => self.check_keyword(1, "ar", TokenKind::Var),
            b'w' => self.check_keyword(1, "hile", TokenKind::While),
            _ => TokenKind::Identifier,
        }
    }

    fn check_keyword(&self, offset: usize, rest: &str, kind: TokenKind) -> TokenKind {
        let begin = self.start + offset;
        if self.current - self.start == offset + rest.len()
            && &self.source[begin..self.current] == rest
        {
            kind
        } else {
            TokenKind::Identifier
        }
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.current += 1;
        }
        // A fractional part needs a digit after the dot.
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.current += 1;
            while self.peek().is_ascii_digit() {
                self.current += 1;
            }
        }
        self.make_token(TokenKind::Number)
    }

    fn string(&mut self) -> Token<'src> {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            // A backslash escapes the next byte, so a quote after one
            // does not terminate the string.
            if self.peek() == b'\\' {
                self.current += 1;
            }
            if !self.is_at_end() {
                self.current += 1;
            }
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }

        self.current += 1; // closing quote
        self.make_token(TokenKind::String)
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut kinds = Vec::new();
        loop {
            let token = scanner.scan_token();
            let done = token.kind == TokenKind::Eof;
            kinds.push(token.kind);
            if done {
                break;
            }
        }
        kinds
    }

    #[test]
    fn punctuation_and_operators() {
        use TokenKind::*;
        assert_eq!(
            kinds("( ) { } [ ] , . - + ; : / * ! != = == > >= < <="),
            vec![
                LeftParen, RightParen, LeftBrace, RightBrace, LeftBracket, RightBracket, Comma,
                Dot, Minus, Plus, Semicolon, Colon, Slash, Star, Bang, BangEqual, Equal,
                EqualEqual, Greater, GreaterEqual, Less, LessEqual, Eof
            ]
        );
    }

    #[test]
    fn keywords_and_near_misses() {
        use TokenKind::*;
        assert_eq!(
            kinds("and break class continue else false for fun if nil or perm print return super this true var while"),
            vec![
                And, Break, Class, Continue, Else, False, For, Fun, If, Nil, Or, Perm, Print,
                Return, Super, This, True, Var, While, Eof
            ]
        );
        // Prefixes, extensions, and tails that diverge are identifiers.
        assert_eq!(
            kinds("an ands cl clse celse pe preturn peturn superb f fa"),
            vec![
                Identifier, Identifier, Identifier, Identifier, Identifier, Identifier,
                Identifier, Identifier, Identifier, Identifier, Identifier, Eof
            ]
        );
    }

    #[test]
    fn numbers() {
        let mut scanner = Scanner::new("123 4.5 6.");
        let t = scanner.scan_token();
        assert_eq!((t.kind, t.lexeme), (TokenKind::Number, "123"));
        let t = scanner.scan_token();
        assert_eq!((t.kind, t.lexeme), (TokenKind::Number, "4.5"));
        // "6." is a number then a dot: no fractional digit follows.
        let t = scanner.scan_token();
        assert_eq!((t.kind, t.lexeme), (TokenKind::Number, "6"));
        assert_eq!(scanner.scan_token().kind, TokenKind::Dot);
    }

    #[test]
    fn strings_span_lines_and_escape() {
        let mut scanner = Scanner::new("\"a\nb\" \"q\\\"q\"");
        let t = scanner.scan_token();
        assert_eq!(t.kind, TokenKind::String);
        assert_eq!(t.lexeme, "\"a\nb\"");
        // The token carries the line the string ends on.
        assert_eq!(t.line, 2);
        let t = scanner.scan_token();
        assert_eq!(t.kind, TokenKind::String);
        assert_eq!(t.lexeme, "\"q\\\"q\"");
    }

    #[test]
    fn unterminated_string() {
        let mut scanner = Scanner::new("\"oops");
        let t = scanner.scan_token();
        assert_eq!(t.kind, TokenKind::Error);
        assert_eq!(t.lexeme, "Unterminated string.");
    }

    #[test]
    fn comments_and_lines() {
        let mut scanner = Scanner::new("1 // comment\n2");
        assert_eq!(scanner.scan_token().line, 1);
        let t = scanner.scan_token();
        assert_eq!((t.kind, t.line), (TokenKind::Number, 2));
    }

    #[test]
    fn unexpected_character() {
        let mut scanner = Scanner::new("@");
        let t = scanner.scan_token();
        assert_eq!(t.kind, TokenKind::Error);
        assert_eq!(t.lexeme, "Unexpected character.");
    }
}
