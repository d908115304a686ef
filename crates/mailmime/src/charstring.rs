pub const CHARSET_ASCII: &str = "ASCII";
pub const CHARSET_UTF8: &str = "UTF-8";
pub const CHARSET_UNKNOWN: &str = "unknown";

/// Transform hint recorded alongside a header value: how the value was
/// encoded on the wire, or how it should be encoded when formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecHint {
    #[default]
    Ascii,
    Utf8,
    QuotedPrintable,
    Base64,
    Percent,
}

/// Returns true for octets permitted in 7-bit header text,
/// per RFC 5322: `[0x01,0x7e]` excluding CR and LF.
pub fn is_seven_bit(b: u8) -> bool {
    (0x01..=0x7e).contains(&b) && b != b'\r' && b != b'\n'
}

/// A byte string carrying its declared charset and the codec it was
/// (or should be) subjected to. Everywhere a header value may hold
/// non-ASCII content, this type is used instead of a bare `String`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharString {
    bytes: Vec<u8>,
    charset: String,
    hint: CodecHint,
}

impl Default for CharString {
    fn default() -> Self {
        Self {
            bytes: vec![],
            charset: CHARSET_ASCII.to_string(),
            hint: CodecHint::Ascii,
        }
    }
}

impl CharString {
    pub fn new<B: Into<Vec<u8>>>(bytes: B, charset: &str, hint: CodecHint) -> Self {
        let bytes = bytes.into();
        let charset = if bytes.iter().copied().all(is_seven_bit) {
            CHARSET_ASCII.to_string()
        } else if charset.eq_ignore_ascii_case(CHARSET_ASCII) {
            // declared ascii but carries 8-bit content
            CHARSET_UNKNOWN.to_string()
        } else {
            charset.to_ascii_uppercase()
        };
        Self {
            bytes,
            charset,
            hint,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn codec_hint(&self) -> CodecHint {
        self.hint
    }

    pub fn set_codec_hint(&mut self, hint: CodecHint) {
        self.hint = hint;
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_ascii(&self) -> bool {
        self.charset == CHARSET_ASCII
    }

    /// Append another value. The charset of the left operand is kept
    /// when both sides agree, otherwise the result is tagged "unknown".
    /// Appending to an empty value adopts the right operand's tags.
    pub fn append(&mut self, other: &CharString) {
        if self.bytes.is_empty() {
            self.charset = other.charset.clone();
            self.hint = other.hint;
        } else if !other.bytes.is_empty() && self.charset != other.charset {
            self.charset = CHARSET_UNKNOWN.to_string();
        }
        self.bytes.extend_from_slice(&other.bytes);
    }

    /// Lossy UTF-8 view of the raw bytes.
    pub fn to_lossy_string(&self) -> String {
        String::from_utf8_lossy(&self.bytes).to_string()
    }
}

impl std::fmt::Display for CharString {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&String::from_utf8_lossy(&self.bytes))
    }
}

impl From<&str> for CharString {
    fn from(s: &str) -> Self {
        let (charset, hint) = if s.bytes().all(is_seven_bit) {
            (CHARSET_ASCII, CodecHint::Ascii)
        } else {
            (CHARSET_UTF8, CodecHint::Utf8)
        };
        Self::new(s.as_bytes().to_vec(), charset, hint)
    }
}

impl From<String> for CharString {
    fn from(s: String) -> Self {
        CharString::from(s.as_str())
    }
}

impl PartialEq<&str> for CharString {
    fn eq(&self, other: &&str) -> bool {
        self.bytes == other.as_bytes()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ascii_detection() {
        let s = CharString::from("hello");
        assert_eq!(s.charset(), CHARSET_ASCII);

        let s = CharString::from("здраво");
        assert_eq!(s.charset(), CHARSET_UTF8);
        assert_eq!(s.codec_hint(), CodecHint::Utf8);

        // CR/LF are excluded from the ascii range on purpose
        let s = CharString::new(b"a\r\nb".to_vec(), CHARSET_UTF8, CodecHint::Utf8);
        assert_eq!(s.charset(), "UTF-8");
    }

    #[test]
    fn append_keeps_left_charset() {
        let mut a = CharString::new("каб".as_bytes().to_vec(), "utf-8", CodecHint::Utf8);
        let b = CharString::new("лими".as_bytes().to_vec(), "utf-8", CodecHint::Utf8);
        a.append(&b);
        assert_eq!(a.charset(), "UTF-8");

        // any charset mismatch tags the result unknown, ascii included
        let mut a = CharString::new("ab".as_bytes().to_vec(), "ascii", CodecHint::Ascii);
        let b = CharString::new("д".as_bytes().to_vec(), "utf-8", CodecHint::Utf8);
        a.append(&b);
        assert_eq!(a.charset(), CHARSET_UNKNOWN);

        let mut a = CharString::new("д".as_bytes().to_vec(), "utf-8", CodecHint::Utf8);
        let b = CharString::new(vec![0xa4], "iso-8859-2", CodecHint::QuotedPrintable);
        a.append(&b);
        assert_eq!(a.charset(), CHARSET_UNKNOWN);
    }

    #[test]
    fn append_to_empty_adopts_right_operand() {
        let mut a = CharString::default();
        let b = CharString::new("д".as_bytes().to_vec(), "utf-8", CodecHint::Base64);
        a.append(&b);
        assert_eq!(a.charset(), "UTF-8");
        assert_eq!(a.codec_hint(), CodecHint::Base64);
    }
}
