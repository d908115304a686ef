//! Streaming recognizer for IMAP server responses: a response is a
//! sequence of atoms, parenthesized lists and size-prefixed string
//! literals, with an optional sub-response in square brackets. Input
//! arrives line by line, possibly split anywhere inside a literal, and
//! the parser is restartable across those reads.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("response grammar violation at offset {offset}: {reason}")]
pub struct ResponseError {
    pub offset: usize,
    pub reason: &'static str,
}

/// One node of the parsed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Atom(String),
    Literal { size: usize, bytes: Vec<u8> },
    List(Vec<Token>),
}

impl Token {
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Self::Atom(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Token]> {
        match self {
            Self::List(tokens) => Some(tokens),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&[u8]> {
        match self {
            Self::Literal { bytes, .. } => Some(bytes),
            _ => None,
        }
    }
}

/// Progress through a `{size}` literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiteralState {
    #[default]
    None,
    /// Reading the digits between the braces.
    Size,
    /// The closing brace was seen; the CRLF ending the line follows.
    AwaitingCrlf,
    /// Consuming raw octets until the declared size is reached.
    Reading,
    /// The literal is complete.
    Done,
}

/// Recognizer state. New tokens land in the deepest trailing list at
/// the current parenthesis depth, in the optional tree while inside
/// `[ ]`, in the mandatory tree otherwise.
#[derive(Debug, Default)]
pub struct ResponseParser {
    optional: Vec<Token>,
    mandatory: Vec<Token>,
    optional_flag: bool,
    atom_open: bool,
    paren_depth: usize,
    literal_state: LiteralState,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all state between complete responses.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn mandatory(&self) -> &[Token] {
        &self.mandatory
    }

    pub fn optional(&self) -> &[Token] {
        &self.optional
    }

    pub fn literal_state(&self) -> LiteralState {
        self.literal_state
    }

    pub fn paren_depth(&self) -> usize {
        self.paren_depth
    }

    /// Feed one line. Outside of a literal the line must arrive without
    /// its CRLF; while a literal is being read (`LiteralState::Reading`)
    /// the raw line including its terminator must be passed, since the
    /// terminator octets count against the declared literal size.
    pub fn feed_line(&mut self, line: &str) -> Result<(), ResponseError> {
        if self.literal_state == LiteralState::Reading {
            self.feed_literal(line)
        } else {
            self.feed_chars(line)
        }
    }

    fn feed_literal(&mut self, line: &str) -> Result<(), ResponseError> {
        let raw = line.as_bytes();
        let depth = self.paren_depth;
        let need = {
            let sink = Self::sink_of(self.root(), depth);
            let Some(Token::Literal { size, bytes }) = sink.last_mut() else {
                return Err(ResponseError {
                    offset: 0,
                    reason: "literal bytes with no literal token open",
                });
            };
            let need = *size - bytes.len();
            let take = need.min(raw.len());
            bytes.extend_from_slice(&raw[..take]);
            need
        };
        if raw.len() < need {
            return Ok(());
        }
        self.literal_state = LiteralState::Done;
        if raw.len() == need {
            return Ok(());
        }

        // the remainder of this network line continues the response
        let tail = &raw[need..];
        let tail = match tail.strip_suffix(b"\r\n") {
            Some(t) => t,
            None => tail.strip_suffix(b"\n").unwrap_or(tail),
        };
        if tail.is_empty() {
            return Ok(());
        }
        let tail = std::str::from_utf8(tail).map_err(|_| ResponseError {
            offset: need,
            reason: "literal tail is not text",
        })?;
        self.feed_chars(tail)
    }

    fn feed_chars(&mut self, line: &str) -> Result<(), ResponseError> {
        for (offset, ch) in line.char_indices() {
            match self.literal_state {
                LiteralState::Size => match ch {
                    '0'..='9' => {
                        let digit = ch as usize - '0' as usize;
                        let depth = self.paren_depth;
                        let sink = Self::sink_of(self.root(), depth);
                        if let Some(Token::Literal { size, .. }) = sink.last_mut() {
                            *size = *size * 10 + digit;
                        }
                        continue;
                    }
                    '}' => {
                        self.literal_state = LiteralState::AwaitingCrlf;
                        continue;
                    }
                    _ => {
                        return Err(ResponseError {
                            offset,
                            reason: "literal size must be decimal digits",
                        })
                    }
                },
                LiteralState::AwaitingCrlf => {
                    // nothing but the line terminator may follow `}`
                    return Err(ResponseError {
                        offset,
                        reason: "content after literal size",
                    });
                }
                _ => {}
            }

            match ch {
                '[' => {
                    if self.optional_flag {
                        return Err(ResponseError {
                            offset,
                            reason: "nested optional part",
                        });
                    }
                    self.optional_flag = true;
                    self.atom_open = false;
                }
                ']' => {
                    if !self.optional_flag {
                        return Err(ResponseError {
                            offset,
                            reason: "']' without '['",
                        });
                    }
                    self.optional_flag = false;
                    self.atom_open = false;
                }
                '(' => {
                    let depth = self.paren_depth;
                    let sink = Self::sink_of(self.root(), depth);
                    sink.push(Token::List(vec![]));
                    self.paren_depth += 1;
                    self.atom_open = false;
                }
                ')' => {
                    if self.paren_depth == 0 {
                        return Err(ResponseError {
                            offset,
                            reason: "')' without '('",
                        });
                    }
                    self.paren_depth -= 1;
                    self.atom_open = false;
                }
                '{' => {
                    let depth = self.paren_depth;
                    let sink = Self::sink_of(self.root(), depth);
                    sink.push(Token::Literal {
                        size: 0,
                        bytes: vec![],
                    });
                    self.literal_state = LiteralState::Size;
                    self.atom_open = false;
                }
                '}' => {
                    return Err(ResponseError {
                        offset,
                        reason: "'}' without '{'",
                    });
                }
                ' ' => {
                    self.atom_open = false;
                }
                _ => {
                    let open = self.atom_open;
                    let depth = self.paren_depth;
                    let sink = Self::sink_of(self.root(), depth);
                    if !open || !matches!(sink.last(), Some(Token::Atom(_))) {
                        sink.push(Token::Atom(String::new()));
                    }
                    if let Some(Token::Atom(text)) = sink.last_mut() {
                        text.push(ch);
                    }
                    self.atom_open = true;
                }
            }
        }

        // the line's CRLF is the separator the literal size announced
        if self.literal_state == LiteralState::AwaitingCrlf {
            self.literal_state = LiteralState::Reading;
        }
        self.atom_open = false;
        Ok(())
    }

    fn root(&mut self) -> &mut Vec<Token> {
        if self.optional_flag {
            &mut self.optional
        } else {
            &mut self.mandatory
        }
    }

    /// Descend along trailing lists, at most `depth` levels: new tokens
    /// are appended to the innermost open parenthesized list.
    fn sink_of(list: &mut Vec<Token>, depth: usize) -> &mut Vec<Token> {
        let mut steps = 0;
        {
            let mut cur: &Vec<Token> = list;
            while steps < depth {
                match cur.last() {
                    Some(Token::List(inner)) => {
                        cur = inner;
                        steps += 1;
                    }
                    _ => break,
                }
            }
        }
        let mut cur = list;
        for _ in 0..steps {
            cur = match cur.last_mut() {
                Some(Token::List(inner)) => inner,
                _ => unreachable!("descent path verified above"),
            };
        }
        cur
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn atoms_and_list() {
        let mut parser = ResponseParser::new();
        parser.feed_line("1 FETCH (FLAGS (\\Seen))").unwrap();
        k9::assert_equal!(
            parser.mandatory(),
            &[
                Token::Atom("1".to_string()),
                Token::Atom("FETCH".to_string()),
                Token::List(vec![
                    Token::Atom("FLAGS".to_string()),
                    Token::List(vec![Token::Atom("\\Seen".to_string())]),
                ]),
            ][..]
        );
    }

    #[test]
    fn optional_part() {
        let mut parser = ResponseParser::new();
        parser.feed_line("OK [UIDVALIDITY 3857529045] UIDs valid").unwrap();
        k9::assert_equal!(
            parser.optional(),
            &[
                Token::Atom("UIDVALIDITY".to_string()),
                Token::Atom("3857529045".to_string()),
            ][..]
        );
        k9::assert_equal!(
            parser.mandatory(),
            &[
                Token::Atom("OK".to_string()),
                Token::Atom("UIDs".to_string()),
                Token::Atom("valid".to_string()),
            ][..]
        );
    }

    #[test]
    fn fetch_literal_in_one_read() {
        let mut parser = ResponseParser::new();
        parser.feed_line("1 FETCH (RFC822 {12}").unwrap();
        k9::assert_equal!(parser.literal_state(), LiteralState::Reading);
        parser.feed_line("Hello World!)\r\n").unwrap();
        k9::assert_equal!(parser.literal_state(), LiteralState::Done);
        k9::assert_equal!(parser.paren_depth(), 0);

        let expected = vec![
            Token::Atom("1".to_string()),
            Token::Atom("FETCH".to_string()),
            Token::List(vec![
                Token::Atom("RFC822".to_string()),
                Token::Literal {
                    size: 12,
                    bytes: b"Hello World!".to_vec(),
                },
            ]),
        ];
        k9::assert_equal!(parser.mandatory(), &expected[..]);
    }

    #[test]
    fn literal_split_across_reads() {
        // any partition of the literal must produce the same tree
        let full: &[&str] = &["1 FETCH (RFC822 {26}", "Hello World!\r\n", "second line!)\r\n"];
        let mut parser = ResponseParser::new();
        for chunk in full {
            parser.feed_line(chunk).unwrap();
        }
        let expected_bytes = b"Hello World!\r\nsecond line!".to_vec();
        match &parser.mandatory()[2] {
            Token::List(tokens) => {
                k9::assert_equal!(
                    tokens[1],
                    Token::Literal {
                        size: 26,
                        bytes: expected_bytes,
                    }
                );
            }
            other => panic!("unexpected token {other:?}"),
        }
        k9::assert_equal!(parser.literal_state(), LiteralState::Done);
        k9::assert_equal!(parser.paren_depth(), 0);
    }

    #[test]
    fn literal_terminator_octets_count() {
        // the CRLF inside the literal counts toward the declared size
        let mut parser = ResponseParser::new();
        parser.feed_line("1 FETCH (RFC822 {14}").unwrap();
        parser.feed_line("Hello World!\r\n").unwrap();
        k9::assert_equal!(parser.literal_state(), LiteralState::Done);
        // the closing paren arrives on the next line
        k9::assert_equal!(parser.paren_depth(), 1);
        parser.feed_line(")").unwrap();
        k9::assert_equal!(parser.paren_depth(), 0);
    }

    #[test]
    fn lf_only_terminator_counts_one_octet() {
        let mut parser = ResponseParser::new();
        parser.feed_line("1 FETCH (RFC822 {13}").unwrap();
        parser.feed_line("Hello World!\n").unwrap();
        k9::assert_equal!(parser.literal_state(), LiteralState::Done);
    }

    #[test]
    fn grammar_violations() {
        let mut parser = ResponseParser::new();
        let err = parser.feed_line("OK )").unwrap_err();
        k9::assert_equal!(err.reason, "')' without '('");
        k9::assert_equal!(err.offset, 3);

        let mut parser = ResponseParser::new();
        assert!(parser.feed_line("FETCH {12x}").is_err());

        let mut parser = ResponseParser::new();
        assert!(parser.feed_line("A ] B").is_err());
    }

    #[test]
    fn reset_clears_everything() {
        let mut parser = ResponseParser::new();
        parser.feed_line("STATUS inbox (MESSAGES 5)").unwrap();
        parser.reset();
        assert!(parser.mandatory().is_empty());
        assert!(parser.optional().is_empty());
        k9::assert_equal!(parser.literal_state(), LiteralState::None);
    }

    #[test]
    fn status_reply_shape() {
        let mut parser = ResponseParser::new();
        parser.feed_line("STATUS inbox (MESSAGES 231)").unwrap();
        let list = parser.mandatory()[2].as_list().unwrap();
        k9::assert_equal!(list[0].as_atom().unwrap(), "MESSAGES");
        k9::assert_equal!(list[1].as_atom().unwrap(), "231");
    }
}
