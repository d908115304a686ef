use super::{Base64, LinePolicy, QuotedPrintable};
use crate::{CharString, CodecHint, MimeError, Result, CHARSET_ASCII, CHARSET_UTF8};

/// Octets consumed by the `=?`, `?`, `?`, `?=` delimiters plus the
/// one-letter encoding tag and a short charset label.
const FRAME_OCTETS: usize = 12;

/// Payload encoding selector inside an encoded word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordEncoding {
    B,
    Q,
}

impl WordEncoding {
    fn tag(self) -> char {
        match self {
            Self::B => 'B',
            Self::Q => 'Q',
        }
    }
}

/// RFC 2047 encoded words: `=?CHARSET?B|Q?payload?=`. `encode` emits one
/// or more words sized to the line budgets; `decode` unwraps a single
/// word; `check_decode` scans a whole header value for words mixed with
/// plain text.
#[derive(Debug, Clone)]
pub struct QCodec {
    line1: usize,
    lines: usize,
}

impl QCodec {
    pub fn new(policy: LinePolicy) -> Self {
        Self::with_limits(policy.octets(), policy.octets())
    }

    pub fn with_limits(line1: usize, lines: usize) -> Self {
        Self { line1, lines }
    }

    pub fn encode(
        &self,
        data: &[u8],
        charset: &str,
        method: WordEncoding,
    ) -> Result<Vec<String>> {
        let line1 = self.line1.saturating_sub(FRAME_OCTETS).max(4);
        let lines = self.lines.saturating_sub(FRAME_OCTETS).max(4);
        let chunks = match method {
            WordEncoding::B => Base64::with_limits(line1, lines).encode(data),
            WordEncoding::Q => {
                let mut qp = QuotedPrintable::with_limits(line1, lines);
                qp.set_q_mode(true);
                qp.encode(data)?
            }
        };
        let charset = charset.to_ascii_uppercase();
        Ok(chunks
            .into_iter()
            .map(|chunk| format!("=?{}?{}?{}?=", charset, method.tag(), chunk))
            .collect())
    }

    /// Unwrap one complete encoded word, returning the decoded bytes,
    /// the charset label (upper-cased) and the codec that was used.
    pub fn decode(&self, word: &str) -> Result<(Vec<u8>, String, CodecHint)> {
        let inner = word
            .strip_prefix("=?")
            .and_then(|w| w.strip_suffix("?="))
            .ok_or_else(|| MimeError::BadEncodedWord(word.to_string()))?;

        let mut fields = inner.splitn(3, '?');
        let charset = fields.next().unwrap_or("");
        let method = fields.next();
        let payload = fields.next();
        if charset.is_empty() {
            return Err(MimeError::BadEncodedWord(word.to_string()));
        }
        let (method, payload) = match (method, payload) {
            (Some(m), Some(p)) => (m, p),
            _ => return Err(MimeError::BadEncodedWord(word.to_string())),
        };

        let (bytes, hint) = if method.eq_ignore_ascii_case("B") {
            let b64 = Base64::with_limits(self.line1, self.lines);
            (b64.decode_str(payload)?, CodecHint::Base64)
        } else if method.eq_ignore_ascii_case("Q") {
            let mut qp = QuotedPrintable::with_limits(self.line1, self.lines);
            qp.set_q_mode(true);
            (qp.decode_str(payload)?, CodecHint::QuotedPrintable)
        } else {
            return Err(MimeError::BadEncodedWord(word.to_string()));
        };

        Ok((bytes, charset.to_ascii_uppercase(), hint))
    }

    /// Scan a header value that may interleave encoded words with plain
    /// text. Whitespace between two adjacent encoded words is discarded
    /// (RFC 2047 §6.2); whitespace between a word and plain text stays.
    pub fn check_decode(&self, text: &str) -> Result<CharString> {
        let mut result = CharString::new(Vec::new(), CHARSET_ASCII, CodecHint::Ascii);
        let mut pos = 0;
        let mut last_was_word = false;

        while let Some(rel) = text[pos..].find("=?") {
            let start = pos + rel;
            let word_end = Self::word_end(&text[start..])
                .ok_or_else(|| MimeError::BadEncodedWord(text[start..].to_string()))?;
            let literal = &text[pos..start];
            if !literal.is_empty()
                && !(last_was_word && literal.chars().all(|c| c.is_ascii_whitespace()))
            {
                result.append(&Self::plain(literal));
            }

            let word = &text[start..start + word_end];
            let (bytes, charset, hint) = self.decode(word)?;
            result.append(&CharString::new(bytes, &charset, hint));
            pos = start + word_end;
            last_was_word = true;
        }

        if pos < text.len() {
            result.append(&Self::plain(&text[pos..]));
        }
        Ok(result)
    }

    fn plain(text: &str) -> CharString {
        if text.bytes().all(|b| b.is_ascii()) {
            CharString::new(text.as_bytes().to_vec(), CHARSET_ASCII, CodecHint::Ascii)
        } else {
            CharString::new(text.as_bytes().to_vec(), CHARSET_UTF8, CodecHint::Utf8)
        }
    }

    /// Length of the encoded word starting at the beginning of `text`,
    /// including the closing `?=`.
    fn word_end(text: &str) -> Option<usize> {
        let inner = text.strip_prefix("=?")?;
        let q1 = inner.find('?')?;
        let q2 = inner[q1 + 1..].find('?')? + q1 + 1;
        let close = inner[q2 + 1..].find("?=")? + q2 + 1;
        Some(2 + close + 2)
    }
}
