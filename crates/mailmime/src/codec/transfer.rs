use super::LinePolicy;
use crate::{MimeError, Result};

const FOLD_DELIMITERS: &[u8] = b" ,;";

fn wrap_identity(
    data: &[u8],
    line1: usize,
    lines: usize,
    fold: bool,
    allowed: impl Fn(u8) -> bool,
) -> Result<Vec<String>> {
    let mut out: Vec<String> = vec![];
    let mut line = String::new();
    let mut delim_pos = 0usize;
    let mut policy = line1;
    let is_folding = fold && line1 != lines;

    let complete_line =
        |line: &mut String, delim_pos: &mut usize, policy: &mut usize, out: &mut Vec<String>| {
            if is_folding && *delim_pos > 0 {
                let rest = line.split_off(*delim_pos);
                out.push(std::mem::replace(line, rest));
                *delim_pos = 0;
            } else {
                out.push(std::mem::take(line));
            }
            *policy = lines;
        };

    let mut iter = data.iter().copied().peekable();
    while let Some(b) = iter.next() {
        if b == b'\r' && iter.peek() == Some(&b'\n') {
            iter.next();
            complete_line(&mut line, &mut delim_pos, &mut policy, &mut out);
            continue;
        }
        if !allowed(b) {
            return Err(MimeError::BadCharacter(b));
        }
        line.push(b as char);
        if FOLD_DELIMITERS.contains(&b) {
            delim_pos = line.len();
        }
        if line.len() == policy {
            complete_line(&mut line, &mut delim_pos, &mut policy, &mut out);
        }
    }
    if !line.is_empty() {
        out.push(line);
    }
    while out.last().map(|l| l.is_empty()).unwrap_or(false) {
        out.pop();
    }
    Ok(out)
}

fn join_checked<S: AsRef<str>>(
    lines: &[S],
    limit: usize,
    strict: bool,
    allowed: impl Fn(u8) -> bool,
) -> Result<Vec<u8>> {
    let mut out: Vec<u8> = vec![];
    for line in lines {
        let line = line.as_ref().as_bytes();
        if strict && line.len() > limit {
            return Err(MimeError::LineTooLong { limit });
        }
        for &b in line {
            if !allowed(b) {
                return Err(MimeError::BadCharacter(b));
            }
            out.push(b);
        }
        out.extend_from_slice(b"\r\n");
    }
    while out
        .last()
        .map(|b| b.is_ascii_whitespace())
        .unwrap_or(false)
    {
        out.pop();
    }
    Ok(out)
}

/// RFC 2045 §2.7 7bit data. When the first-line and subsequent-line
/// budgets differ, wrapping folds at the last space, comma or semicolon
/// before the limit, which is the behavior header folding needs.
#[derive(Debug, Clone)]
pub struct SevenBit {
    line1: usize,
    lines: usize,
    strict: bool,
}

impl SevenBit {
    pub fn new(policy: LinePolicy) -> Self {
        Self::with_limits(policy.octets(), policy.octets())
    }

    pub fn with_limits(line1: usize, lines: usize) -> Self {
        Self {
            line1,
            lines,
            strict: false,
        }
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    fn is_allowed(&self, b: u8) -> bool {
        if self.strict {
            (0x01..=0x7e).contains(&b) && b != b'\r' && b != b'\n'
        } else {
            b != 0 && b != b'\r' && b != b'\n'
        }
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<String>> {
        wrap_identity(data, self.line1, self.lines, true, |b| self.is_allowed(b))
    }

    pub fn decode<S: AsRef<str>>(&self, lines: &[S]) -> Result<Vec<u8>> {
        join_checked(lines, self.lines, self.strict, |b| self.is_allowed(b))
    }
}

/// RFC 2045 §2.8 8bit data: any octet except NUL, CR and LF.
#[derive(Debug, Clone)]
pub struct EightBit {
    line1: usize,
    lines: usize,
    strict: bool,
}

impl EightBit {
    pub fn new(policy: LinePolicy) -> Self {
        Self::with_limits(policy.octets(), policy.octets())
    }

    pub fn with_limits(line1: usize, lines: usize) -> Self {
        Self {
            line1,
            lines,
            strict: false,
        }
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    fn is_allowed(b: u8) -> bool {
        b != 0 && b != b'\r' && b != b'\n'
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<String>> {
        wrap_identity(data, self.line1, self.lines, false, Self::is_allowed)
    }

    pub fn decode<S: AsRef<str>>(&self, lines: &[S]) -> Result<Vec<u8>> {
        join_checked(lines, self.lines, self.strict, Self::is_allowed)
    }
}

/// Binary data: the identity transform. Lines are re-joined with CRLF
/// on decode and nothing is trimmed.
#[derive(Debug, Clone)]
pub struct Binary {
    line1: usize,
    lines: usize,
}

impl Binary {
    pub fn new(policy: LinePolicy) -> Self {
        Self::with_limits(policy.octets(), policy.octets())
    }

    pub fn with_limits(line1: usize, lines: usize) -> Self {
        Self { line1, lines }
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<String>> {
        wrap_identity(data, self.line1, self.lines, false, |b| {
            b != b'\r' && b != b'\n'
        })
    }

    pub fn decode<S: AsRef<str>>(&self, lines: &[S]) -> Result<Vec<u8>> {
        let mut out: Vec<u8> = vec![];
        for (idx, line) in lines.iter().enumerate() {
            if idx > 0 {
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(line.as_ref().as_bytes());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seven_bit_round_trip() {
        let c = SevenBit::new(LinePolicy::Recommended);
        let lines = c.encode(b"plain text\r\nwith two lines").unwrap();
        k9::assert_equal!(
            lines,
            vec!["plain text".to_string(), "with two lines".to_string()]
        );
        k9::assert_equal!(
            c.decode(&lines).unwrap(),
            b"plain text\r\nwith two lines".to_vec()
        );
    }

    #[test]
    fn seven_bit_strict_rejects_high_bytes() {
        let mut c = SevenBit::new(LinePolicy::Recommended);
        c.set_strict(true);
        k9::assert_equal!(
            c.encode("caf\u{e9}".as_bytes()).unwrap_err(),
            MimeError::BadCharacter(0xc3)
        );

        // lenient mode passes them along
        let mut c = SevenBit::new(LinePolicy::Recommended);
        c.set_strict(false);
        assert!(c.encode("caf\u{e9}".as_bytes()).is_ok());
    }

    #[test]
    fn seven_bit_folds_on_delimiters() {
        let c = SevenBit::with_limits(20, 40);
        let lines = c
            .encode(b"one two three four five six seven eight nine ten eleven")
            .unwrap();
        assert!(lines[0].len() <= 20, "{:?}", lines);
        for line in &lines {
            assert!(line.len() <= 40, "{:?}", lines);
        }
        // folding prefers a delimiter boundary
        assert!(lines[0].ends_with(' '), "{:?}", lines);
    }

    #[test]
    fn eight_bit_allows_high_bytes() {
        let c = EightBit::new(LinePolicy::Recommended);
        let input = "zdravo свете".as_bytes();
        let lines = c.encode(input).unwrap();
        k9::assert_equal!(c.decode(&lines).unwrap(), input.to_vec());
        k9::assert_equal!(c.encode(b"a\0b").unwrap_err(), MimeError::BadCharacter(0));
    }

    #[test]
    fn binary_preserves_everything() {
        let c = Binary::new(LinePolicy::Relaxed);
        let lines = vec!["alpha".to_string(), "".to_string(), "omega".to_string()];
        k9::assert_equal!(c.decode(&lines).unwrap(), b"alpha\r\n\r\nomega".to_vec());
    }

    #[test]
    fn trailing_blank_lines_dropped() {
        let c = SevenBit::new(LinePolicy::Recommended);
        let lines = c.encode(b"body\r\n\r\n\r\n").unwrap();
        k9::assert_equal!(lines, vec!["body".to_string()]);
    }
}
