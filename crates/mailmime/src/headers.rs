use crate::codec::{Percent, QCodec};
use crate::{CharString, CodecHint, MimeError, Result, CHARSET_ASCII};
use nom::branch::alt;
use nom::bytes::complete::{take_while, take_while1};
use nom::character::complete::char;
use nom::combinator::{all_consuming, map, opt};
use nom::multi::many0;
use nom::sequence::{preceded, terminated, tuple};

type NomResult<'a, T> = nom::IResult<&'a str, T>;

/// Top-level media type of a part. `None` means no Content-Type header
/// was present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaType {
    #[default]
    None,
    Text,
    Image,
    Audio,
    Video,
    Application,
    Multipart,
    Message,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Application => "application",
            Self::Multipart => "multipart",
            Self::Message => "message",
        }
    }

    pub fn parse(s: &str, strict: bool) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "application" => Ok(Self::Application),
            "multipart" => Ok(Self::Multipart),
            "message" => Ok(Self::Message),
            _ if strict => Err(MimeError::UnknownMediaType(s.to_string())),
            // conservative fallback for unrecognized types
            _ => Ok(Self::Application),
        }
    }
}

/// Content transfer encoding; `None` behaves as 7bit but is not emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    #[default]
    None,
    SevenBit,
    EightBit,
    Binary,
    Base64,
    QuotedPrintable,
}

impl TransferEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::SevenBit => "7bit",
            Self::EightBit => "8bit",
            Self::Binary => "binary",
            Self::Base64 => "base64",
            Self::QuotedPrintable => "quoted-printable",
        }
    }

    pub fn is_identity(self) -> bool {
        matches!(
            self,
            Self::None | Self::SevenBit | Self::EightBit | Self::Binary
        )
    }

    pub fn parse(s: &str, strict: bool) -> Result<Self> {
        if s.eq_ignore_ascii_case("7bit") {
            Ok(Self::SevenBit)
        } else if s.eq_ignore_ascii_case("8bit") {
            Ok(Self::EightBit)
        } else if s.eq_ignore_ascii_case("binary") {
            Ok(Self::Binary)
        } else if s.eq_ignore_ascii_case("base64") {
            Ok(Self::Base64)
        } else if s.eq_ignore_ascii_case("quoted-printable") {
            Ok(Self::QuotedPrintable)
        } else if strict {
            Err(MimeError::UnknownTransferEncoding(s.to_string()))
        } else {
            Ok(Self::SevenBit)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    None,
    Inline,
    Attachment,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Inline => "inline",
            Self::Attachment => "attachment",
        }
    }

    pub fn parse(s: &str, strict: bool) -> Result<Self> {
        if s.eq_ignore_ascii_case("inline") {
            Ok(Self::Inline)
        } else if s.eq_ignore_ascii_case("attachment") {
            Ok(Self::Attachment)
        } else if strict {
            Err(MimeError::UnknownDisposition(s.to_string()))
        } else {
            Ok(Self::Attachment)
        }
    }
}

/// Parsed `Content-Type` value: media type, subtype, the `charset`
/// attribute pulled out, and the remaining attributes in order of first
/// appearance. `boundary` and `name` are extracted by the part that owns
/// this header.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContentType {
    pub media_type: MediaType,
    pub subtype: String,
    pub charset: String,
    params: Vec<(String, CharString)>,
}

impl ContentType {
    pub fn new(media_type: MediaType, subtype: &str) -> Self {
        Self {
            media_type,
            subtype: subtype.to_ascii_lowercase(),
            charset: String::new(),
            params: vec![],
        }
    }

    pub fn is_none(&self) -> bool {
        self.media_type == MediaType::None
    }

    pub fn param(&self, name: &str) -> Option<&CharString> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn set_param(&mut self, name: &str, value: CharString) {
        self.remove_param(name);
        self.params.push((name.to_ascii_lowercase(), value));
    }

    pub fn remove_param(&mut self, name: &str) -> Option<CharString> {
        let idx = self
            .params
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.params.remove(idx).1)
    }

    pub fn params(&self) -> &[(String, CharString)] {
        &self.params
    }
}

// tspecials per RFC 2045 §5.1
fn is_tspecial(c: char) -> bool {
    matches!(
        c,
        '(' | ')' | '<' | '>' | '@' | ',' | ';' | ':' | '\\' | '"' | '/' | '[' | ']' | '?' | '='
    )
}

fn is_mime_token_char(c: char) -> bool {
    ('\u{21}'..='\u{7e}').contains(&c) && !is_tspecial(c)
}

fn is_attribute_char(c: char) -> bool {
    is_mime_token_char(c) && c != '*' && c != '\'' && c != '%'
}

/// Header field names are printable US-ASCII excluding colon, comma and
/// the double quote.
pub fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| ('\u{21}'..='\u{7e}').contains(&c) && c != ':' && c != '"' && c != ',')
}

/// Header values are printable-plus-space US-ASCII or verbatim UTF-8.
pub fn is_valid_header_value(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b == b'\t' || (0x20..=0x7e).contains(&b) || b >= 0x80)
}

fn ows(input: &str) -> NomResult<&str> {
    take_while(|c| c == ' ' || c == '\t')(input)
}

fn mime_token(input: &str) -> NomResult<&str> {
    take_while1(is_mime_token_char)(input)
}

fn attribute(input: &str) -> NomResult<&str> {
    take_while1(is_attribute_char)(input)
}

fn quoted_value(input: &str) -> NomResult<String> {
    let (mut rest, _) = char('"')(input)?;
    let mut value = String::new();
    let mut chars = rest.char_indices();
    loop {
        match chars.next() {
            Some((idx, '"')) => {
                rest = &rest[idx + 1..];
                break;
            }
            Some((_, '\\')) => match chars.next() {
                Some((_, escaped)) => value.push(escaped),
                None => {
                    return Err(nom::Err::Error(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::Char,
                    )))
                }
            },
            Some((_, c)) => value.push(c),
            None => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Char,
                )))
            }
        }
    }
    Ok((rest, value))
}

#[derive(Debug, Clone, PartialEq)]
struct RawParam {
    name: String,
    section: Option<u32>,
    extended: bool,
    value: String,
}

fn section(input: &str) -> NomResult<u32> {
    preceded(char('*'), nom::character::complete::u32)(input)
}

fn raw_value(input: &str) -> NomResult<String> {
    map(
        take_while(|c| is_mime_token_char(c) || c == '%' || c == '\''),
        |s: &str| s.to_string(),
    )(input)
}

fn parameter(input: &str) -> NomResult<RawParam> {
    map(
        tuple((
            attribute,
            opt(section),
            opt(char('*')),
            ows,
            char('='),
            ows,
            alt((quoted_value, raw_value)),
        )),
        |(name, section, star, _, _, _, value)| RawParam {
            name: name.to_ascii_lowercase(),
            section,
            extended: star.is_some(),
            value,
        },
    )(input)
}

fn parameter_list(input: &str) -> NomResult<Vec<RawParam>> {
    terminated(
        many0(preceded(
            tuple((opt(char(';')), ows)),
            terminated(parameter, ows),
        )),
        tuple((opt(char(';')), ows)),
    )(input)
}

fn content_type_value(input: &str) -> NomResult<(&str, &str, Vec<RawParam>)> {
    map(
        tuple((
            ows,
            mime_token,
            ows,
            char('/'),
            ows,
            mime_token,
            ows,
            parameter_list,
        )),
        |(_, mime_type, _, _, _, subtype, _, params)| (mime_type, subtype, params),
    )(input)
}

fn simple_value(input: &str) -> NomResult<(&str, Vec<RawParam>)> {
    map(
        tuple((ows, mime_token, ows, parameter_list)),
        |(_, value, _, params)| (value, params),
    )(input)
}

fn offset_of(full: &str, rest: &str) -> usize {
    full.len() - rest.len()
}

fn explain<'a>(header: &str, full: &'a str, err: nom::Err<nom::error::Error<&'a str>>) -> MimeError {
    let (offset, reason) = match &err {
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            (offset_of(full, e.input), format!("{:?}", e.code))
        }
        nom::Err::Incomplete(_) => (full.len(), "incomplete input".to_string()),
    };
    MimeError::HeaderParse {
        name: header.to_string(),
        offset,
        reason,
    }
}

/// Merge RFC 2231 attribute continuations: group raw parameters by base
/// name, order by section number and concatenate. When any element used
/// the extended (`*`) form, the charset from the first element applies
/// and the payload is percent-decoded; otherwise embedded encoded words
/// are resolved.
fn merge_parameters(raws: Vec<RawParam>, qc: &QCodec) -> Result<Vec<(String, CharString)>> {
    let mut order: Vec<String> = vec![];
    for raw in &raws {
        if !order.iter().any(|n| *n == raw.name) {
            order.push(raw.name.clone());
        }
    }

    let mut out = vec![];
    for name in order {
        let mut elements: Vec<&RawParam> = raws.iter().filter(|r| r.name == name).collect();
        elements.sort_by_key(|r| r.section);

        let any_extended = elements.iter().any(|r| r.extended);
        let value = if any_extended {
            let mut charset = String::new();
            let mut payload = String::new();
            for (idx, ele) in elements.iter().enumerate() {
                let mut chunk = ele.value.as_str();
                if idx == 0 && ele.extended {
                    // charset'language' prefix on the first part
                    if let Some((cs, rest)) = chunk.split_once('\'') {
                        if let Some((_lang, rest)) = rest.split_once('\'') {
                            charset = cs.to_string();
                            chunk = rest;
                        }
                    }
                }
                payload.push_str(chunk);
            }
            let bytes = Percent::default().decode(&payload)?;
            let charset = if charset.is_empty() {
                CHARSET_ASCII.to_string()
            } else {
                charset
            };
            CharString::new(bytes, &charset, CodecHint::Percent)
        } else {
            let mut payload = String::new();
            for ele in &elements {
                payload.push_str(&ele.value);
            }
            qc.check_decode(&payload)?
        };
        out.push((name, value));
    }
    Ok(out)
}

pub(crate) fn parse_content_type(value: &str, strict: bool, qc: &QCodec) -> Result<ContentType> {
    let (_, (mime_type, subtype, raws)) = all_consuming(content_type_value)(value)
        .map_err(|err| explain("Content-Type", value, err))?;

    let media_type = MediaType::parse(mime_type, strict)?;
    let mut params = merge_parameters(raws, qc)?;

    let mut charset = String::new();
    if let Some(idx) = params.iter().position(|(n, _)| n == "charset") {
        charset = params.remove(idx).1.to_lossy_string().to_ascii_lowercase();
    }

    Ok(ContentType {
        media_type,
        subtype: subtype.to_ascii_lowercase(),
        charset,
        params,
    })
}

pub(crate) fn parse_transfer_encoding(value: &str, strict: bool) -> Result<TransferEncoding> {
    let (_, (token, _)) = all_consuming(simple_value)(value)
        .map_err(|err| explain("Content-Transfer-Encoding", value, err))?;
    TransferEncoding::parse(token, strict)
}

pub(crate) fn parse_disposition(
    value: &str,
    strict: bool,
    qc: &QCodec,
) -> Result<(Disposition, Vec<(String, CharString)>)> {
    let (_, (token, raws)) = all_consuming(simple_value)(value)
        .map_err(|err| explain("Content-Disposition", value, err))?;
    let disposition = Disposition::parse(token, strict)?;
    let params = merge_parameters(raws, qc)?;
    Ok((disposition, params))
}

pub(crate) fn parse_content_id(value: &str) -> Result<String> {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix('<')
        .and_then(|v| v.strip_suffix('>'))
        .unwrap_or(trimmed);
    if inner.contains(|c: char| c.is_ascii_whitespace()) || !inner.is_ascii() {
        return Err(MimeError::HeaderValue("Content-ID".to_string()));
    }
    Ok(inner.to_string())
}

/// Append one attribute to a header value under construction, applying
/// RFC 2231 continuations when the value is non-ASCII or does not fit
/// the line policy. Each produced segment lands on its own folded line.
pub(crate) fn emit_parameter(out: &mut String, name: &str, value: &CharString, policy: usize) {
    let limit = policy.saturating_sub(name.len() + 10).max(16);

    if value.is_ascii() {
        let text = value.to_lossy_string();
        if text.len() <= limit {
            out.push_str(";\r\n\t");
            out.push_str(name);
            out.push_str("=\"");
            for c in text.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
            return;
        }
        // plain continuations, quoted per segment
        let chunks: Vec<&[u8]> = text.as_bytes().chunks(limit).collect();
        for (idx, chunk) in chunks.iter().enumerate() {
            out.push_str(";\r\n\t");
            out.push_str(&format!("{name}*{idx}=\""));
            for &b in *chunk {
                if b == b'"' || b == b'\\' {
                    out.push('\\');
                }
                out.push(b as char);
            }
            out.push('"');
        }
        return;
    }

    let charset = crate::mailboxes::wire_charset(value);
    // leave room for the `*N*=` marker and the charset prefix
    let limit = policy
        .saturating_sub(name.len() + charset.len() + 14)
        .max(16);
    let encoded = Percent::default().encode(value.as_bytes());
    let mut segments: Vec<String> = vec![];
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        // never split a %HH escape across segments
        let mut take = limit.min(rest.len());
        while take < rest.len() && !rest.is_char_boundary(take) {
            take -= 1;
        }
        if let Some(pct) = rest[..take].rfind('%') {
            if pct + 3 > take {
                take = pct;
            }
        }
        if take == 0 {
            take = rest.len().min(3);
        }
        let (seg, tail) = rest.split_at(take);
        segments.push(seg.to_string());
        rest = tail;
    }
    if segments.len() == 1 {
        out.push_str(";\r\n\t");
        out.push_str(&format!("{name}*={charset}''{}", segments[0]));
    } else {
        for (idx, seg) in segments.iter().enumerate() {
            out.push_str(";\r\n\t");
            if idx == 0 {
                out.push_str(&format!("{name}*0*={charset}''{seg}"));
            } else {
                out.push_str(&format!("{name}*{idx}*={seg}"));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::LinePolicy;

    fn qc() -> QCodec {
        QCodec::new(LinePolicy::Recommended)
    }

    #[test]
    fn basic_content_type() {
        let ct = parse_content_type("text/plain; charset=utf-8", false, &qc()).unwrap();
        k9::assert_equal!(ct.media_type, MediaType::Text);
        k9::assert_equal!(ct.subtype, "plain");
        k9::assert_equal!(ct.charset, "utf-8");
    }

    #[test]
    fn quoted_boundary() {
        let ct = parse_content_type(
            "multipart/mixed; boundary=\"my bound=ary\"",
            false,
            &qc(),
        )
        .unwrap();
        k9::assert_equal!(ct.media_type, MediaType::Multipart);
        k9::assert_equal!(
            ct.param("boundary").unwrap().to_lossy_string(),
            "my bound=ary"
        );
    }

    #[test]
    fn unknown_media_type() {
        assert!(parse_content_type("wat/ever", true, &qc()).is_err());
        let ct = parse_content_type("wat/ever", false, &qc()).unwrap();
        k9::assert_equal!(ct.media_type, MediaType::Application);
    }

    #[test]
    fn attribute_continuations() {
        let value = "attachment;\
            filename*0*=UTF-8''%D0%A7%D0%B0%D1%81%D1%82%D0%B8%D0%BD%D0%B0%20%D0%B2;\
            filename*1*=%D0%BA%D0%BB%D0%B0%D0%B4%D0%B5%D0%BD%D0%BE%D0%B3%D0%BE%20;\
            filename*2*=%D0%BF%D0%BE%D0%B2%D1%96%D0%B4%D0%BE%D0%BC%D0%BB%D0%B5%D0%BD;\
            filename*3*=%D0%BD%D1%8F";
        let (disposition, params) = parse_disposition(value, false, &qc()).unwrap();
        k9::assert_equal!(disposition, Disposition::Attachment);
        let filename = params.iter().find(|(n, _)| n == "filename").unwrap();
        k9::assert_equal!(
            filename.1.to_lossy_string(),
            "Частина вкладеного повідомлення"
        );
        k9::assert_equal!(filename.1.charset(), "UTF-8");
    }

    #[test]
    fn encoded_word_in_parameter() {
        let ct = parse_content_type(
            "text/plain; name=\"=?UTF-8?Q?Andr=C3=A9.txt?=\"",
            false,
            &qc(),
        )
        .unwrap();
        k9::assert_equal!(ct.param("name").unwrap().to_lossy_string(), "André.txt");
    }

    #[test]
    fn transfer_encoding_tokens() {
        k9::assert_equal!(
            parse_transfer_encoding("Base64", false).unwrap(),
            TransferEncoding::Base64
        );
        k9::assert_equal!(
            parse_transfer_encoding("x-zip", false).unwrap(),
            TransferEncoding::SevenBit
        );
        assert!(parse_transfer_encoding("x-zip", true).is_err());
    }

    #[test]
    fn disposition_default() {
        let (d, _) = parse_disposition("bogus", false, &qc()).unwrap();
        k9::assert_equal!(d, Disposition::Attachment);
        assert!(parse_disposition("bogus", true, &qc()).is_err());
    }

    #[test]
    fn parse_error_carries_offset() {
        let err = parse_content_type("text plain", false, &qc()).unwrap_err();
        match err {
            MimeError::HeaderParse { name, offset, .. } => {
                k9::assert_equal!(name, "Content-Type");
                k9::assert_equal!(offset, 5);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn emit_ascii_parameter() {
        let mut out = String::new();
        emit_parameter(
            &mut out,
            "boundary",
            &CharString::from("simple"),
            LinePolicy::Recommended.octets(),
        );
        k9::assert_equal!(out, ";\r\n\tboundary=\"simple\"");
    }

    #[test]
    fn emit_extended_parameter_round_trip() {
        let mut out = String::new();
        let name = CharString::from("Частина вкладеного повідомлення довгог имена.txt");
        emit_parameter(
            &mut out,
            "filename",
            &name,
            LinePolicy::Recommended.octets(),
        );
        assert!(out.contains("filename*0*=UTF-8''"));

        // feed the emitted form back through the parser
        let header = format!("attachment{out}");
        let (_, params) = parse_disposition(&header, false, &qc()).unwrap();
        let filename = params.iter().find(|(n, _)| n == "filename").unwrap();
        k9::assert_equal!(filename.1.to_lossy_string(), name.to_lossy_string());
    }

    #[test]
    fn header_name_validation() {
        assert!(is_valid_header_name("X-Custom-Header"));
        assert!(!is_valid_header_name("Bad Header"));
        assert!(!is_valid_header_name("Bad:Header"));
        assert!(!is_valid_header_name(""));
    }
}
