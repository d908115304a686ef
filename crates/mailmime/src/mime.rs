use crate::codec::{
    Base64, Binary, EightBit, LinePolicy, QCodec, QuotedPrintable, SevenBit, WordEncoding,
};
use crate::headers::{
    emit_parameter, is_valid_header_name, is_valid_header_value, parse_content_id,
    parse_content_type, parse_disposition, parse_transfer_encoding,
};
use crate::{CharString, ContentType, Disposition, MediaType, MimeError, Result, TransferEncoding};

/// Source of unique ASCII boundary tokens. Injected so that tests can
/// pin a deterministic value.
pub type BoundaryGenerator = fn() -> String;

pub fn random_boundary() -> String {
    let uuid = uuid::Uuid::new_v4();
    data_encoding::BASE64_NOPAD.encode(uuid.as_bytes())
}

const BOUNDARY_DELIMITER: &str = "--";
/// Feeding this exact line tells the parser that the part is complete.
pub const END_OF_LINE: &str = "\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyStatus {
    /// No child part has been seen yet.
    None,
    /// A child part is consuming body lines.
    Child,
    /// The closing boundary or the terminal sentinel was reached.
    End,
}

/// One node of the MIME tree: headers, decoded body bytes, and child
/// parts. Formatting and parsing are driven line by line so that the
/// retrieval protocols can stream a message through it.
#[derive(Debug, Clone)]
pub struct MimePart {
    content_type: ContentType,
    name: CharString,
    encoding: TransferEncoding,
    disposition: Disposition,
    content_id: String,
    boundary: String,
    version: String,
    body: Vec<u8>,
    parts: Vec<MimePart>,
    other_headers: Vec<(String, String)>,
    line_policy: LinePolicy,
    strict_mode: bool,
    strict_codec_mode: bool,
    boundary_generator: BoundaryGenerator,

    parsing_header: bool,
    header_lines: Vec<String>,
    body_lines: Vec<String>,
    body_status: BodyStatus,
}

impl Default for MimePart {
    fn default() -> Self {
        Self {
            content_type: ContentType::default(),
            name: CharString::default(),
            encoding: TransferEncoding::None,
            disposition: Disposition::None,
            content_id: String::new(),
            boundary: String::new(),
            version: "1.0".to_string(),
            body: vec![],
            parts: vec![],
            other_headers: vec![],
            line_policy: LinePolicy::Mandatory,
            strict_mode: false,
            strict_codec_mode: false,
            boundary_generator: random_boundary,
            parsing_header: true,
            header_lines: vec![],
            body_lines: vec![],
            body_status: BodyStatus::None,
        }
    }
}

impl MimePart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    pub fn set_content_type(&mut self, content_type: ContentType) -> Result<()> {
        if content_type.media_type != MediaType::None && content_type.subtype.is_empty() {
            return Err(MimeError::HeaderValue("Content-Type".to_string()));
        }
        self.content_type = content_type;
        Ok(())
    }

    pub fn name(&self) -> &CharString {
        &self.name
    }

    pub fn set_name<N: Into<CharString>>(&mut self, name: N) {
        self.name = name.into();
    }

    pub fn encoding(&self) -> TransferEncoding {
        self.encoding
    }

    pub fn set_encoding(&mut self, encoding: TransferEncoding) {
        self.encoding = encoding;
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn set_disposition(&mut self, disposition: Disposition) {
        self.disposition = disposition;
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    pub fn set_content_id(&mut self, id: &str) -> Result<()> {
        self.content_id = parse_content_id(id)?;
        Ok(())
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn set_boundary(&mut self, boundary: &str) {
        self.boundary = boundary.to_string();
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn content(&self) -> &[u8] {
        &self.body
    }

    pub fn set_content<B: Into<Vec<u8>>>(&mut self, content: B) {
        self.body = content.into();
    }

    pub fn parts(&self) -> &[MimePart] {
        &self.parts
    }

    pub fn parts_mut(&mut self) -> &mut Vec<MimePart> {
        &mut self.parts
    }

    pub fn add_part(&mut self, part: MimePart) {
        self.parts.push(part);
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.other_headers
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> Result<()> {
        if !is_valid_header_name(name) {
            return Err(MimeError::HeaderName(name.to_string()));
        }
        if !is_valid_header_value(value) {
            return Err(MimeError::HeaderValue(name.to_string()));
        }
        self.other_headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    pub fn line_policy(&self) -> LinePolicy {
        self.line_policy
    }

    pub fn set_line_policy(&mut self, policy: LinePolicy) {
        self.line_policy = policy;
    }

    pub fn set_strict_mode(&mut self, strict: bool) {
        self.strict_mode = strict;
    }

    pub fn strict_mode(&self) -> bool {
        self.strict_mode
    }

    pub fn set_strict_codec_mode(&mut self, strict: bool) {
        self.strict_codec_mode = strict;
    }

    pub fn set_boundary_generator(&mut self, generator: BoundaryGenerator) {
        self.boundary_generator = generator;
    }

    pub(crate) fn boundary_generator(&self) -> BoundaryGenerator {
        self.boundary_generator
    }

    pub(crate) fn is_parsing_header(&self) -> bool {
        self.parsing_header
    }

    pub(crate) fn take_header(&mut self, name: &str) -> Option<String> {
        let idx = self
            .other_headers
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.other_headers.remove(idx).1)
    }

    pub(crate) fn qcodec(&self) -> QCodec {
        QCodec::new(self.line_policy)
    }

    /// Serialize the part: header block, blank separator line, encoded
    /// content, then each child framed by the boundary. With
    /// `dot_escape`, body lines beginning with a dot are stuffed for the
    /// SMTP DATA phase.
    pub fn format(&mut self, dot_escape: bool) -> Result<String> {
        let mut out = String::new();
        self.format_into(&mut out, dot_escape, None)?;
        Ok(out)
    }

    pub(crate) fn format_into(
        &mut self,
        out: &mut String,
        dot_escape: bool,
        prefix: Option<&str>,
    ) -> Result<()> {
        if !self.boundary.is_empty() && self.content_type.media_type != MediaType::Multipart {
            return Err(MimeError::BoundaryOnSinglePart);
        }
        if !self.parts.is_empty() {
            if self.content_type.media_type == MediaType::None {
                self.content_type = ContentType::new(MediaType::Multipart, "mixed");
            }
            if !self.encoding.is_identity() {
                return Err(MimeError::MultipartEncoding);
            }
            if self.boundary.is_empty() {
                self.boundary = (self.boundary_generator)();
            }
        }

        if let Some(prefix) = prefix {
            out.push_str(prefix);
        }
        self.format_header_block(out)?;
        out.push_str(END_OF_LINE);

        let content = self.format_content(dot_escape)?;
        out.push_str(&content);

        if !self.parts.is_empty() {
            if !content.is_empty() {
                out.push_str(END_OF_LINE);
            }
            let boundary = self.boundary.clone();
            for part in &mut self.parts {
                out.push_str(BOUNDARY_DELIMITER);
                out.push_str(&boundary);
                out.push_str(END_OF_LINE);
                part.format_into(out, dot_escape, None)?;
                out.push_str(END_OF_LINE);
            }
            out.push_str(BOUNDARY_DELIMITER);
            out.push_str(&boundary);
            out.push_str(BOUNDARY_DELIMITER);
            out.push_str(END_OF_LINE);
        }
        Ok(())
    }

    fn format_header_block(&self, out: &mut String) -> Result<()> {
        for (name, value) in &self.other_headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str(END_OF_LINE);
        }

        if self.content_type.media_type != MediaType::None {
            out.push_str("Content-Type: ");
            out.push_str(self.content_type.media_type.as_str());
            out.push('/');
            out.push_str(&self.content_type.subtype);
            let policy = self.line_policy.octets();
            if !self.content_type.charset.is_empty() {
                emit_parameter(
                    out,
                    "charset",
                    &CharString::from(self.content_type.charset.as_str()),
                    policy,
                );
            }
            for (name, value) in self.content_type.params() {
                emit_parameter(out, name, value, policy);
            }
            if !self.name.is_empty() {
                let name = self.encode_attribute_name()?;
                emit_parameter(out, "name", &name, policy);
            }
            if !self.boundary.is_empty() {
                emit_parameter(
                    out,
                    "boundary",
                    &CharString::from(self.boundary.as_str()),
                    policy,
                );
            }
            out.push_str(END_OF_LINE);
        }

        if self.encoding != TransferEncoding::None {
            out.push_str("Content-Transfer-Encoding: ");
            out.push_str(self.encoding.as_str());
            out.push_str(END_OF_LINE);
        }

        if self.disposition != Disposition::None {
            out.push_str("Content-Disposition: ");
            out.push_str(self.disposition.as_str());
            if !self.name.is_empty() {
                emit_parameter(out, "filename", &self.name, self.line_policy.octets());
            }
            out.push_str(END_OF_LINE);
        }

        if !self.content_id.is_empty() {
            out.push_str("Content-ID: <");
            out.push_str(&self.content_id);
            out.push('>');
            out.push_str(END_OF_LINE);
        }
        Ok(())
    }

    /// The `name` attribute travels as an encoded word when non-ASCII.
    fn encode_attribute_name(&self) -> Result<CharString> {
        if self.name.is_ascii() {
            return Ok(self.name.clone());
        }
        let words = self.qcodec().encode(
            self.name.as_bytes(),
            crate::mailboxes::wire_charset(&self.name),
            WordEncoding::Q,
        )?;
        Ok(CharString::from(words.join(" ")))
    }

    fn format_content(&self, dot_escape: bool) -> Result<String> {
        if self.body.is_empty() {
            return Ok(String::new());
        }
        let policy = self.line_policy.octets();
        let lines = match self.encoding {
            TransferEncoding::None | TransferEncoding::SevenBit => {
                let mut codec = SevenBit::with_limits(policy, policy);
                codec.set_strict(self.strict_codec_mode);
                codec.encode(&self.body)?
            }
            TransferEncoding::EightBit => {
                let mut codec = EightBit::with_limits(policy, policy);
                codec.set_strict(self.strict_codec_mode);
                codec.encode(&self.body)?
            }
            TransferEncoding::Binary => Binary::with_limits(policy, policy).encode(&self.body)?,
            TransferEncoding::Base64 => {
                Base64::with_limits(policy, policy).encode(&self.body)
            }
            TransferEncoding::QuotedPrintable => {
                let mut codec = QuotedPrintable::with_limits(policy, policy);
                codec.set_strict(self.strict_codec_mode);
                codec.encode(&self.body)?
            }
        };
        let mut out = String::new();
        for line in lines {
            if dot_escape && line.starts_with('.') {
                out.push('.');
            }
            out.push_str(&line);
            out.push_str(END_OF_LINE);
        }
        Ok(out)
    }

    /// Parse a whole serialized part by splitting it into lines and
    /// feeding them through `parse_by_line`, ending with the terminal
    /// sentinel.
    pub fn parse(&mut self, input: &str, dot_escape: bool) -> Result<()> {
        let mut rest = input;
        while let Some(pos) = rest.find('\n') {
            let line = rest[..pos].strip_suffix('\r').unwrap_or(&rest[..pos]);
            self.parse_by_line(line, dot_escape)?;
            rest = &rest[pos + 1..];
        }
        if !rest.is_empty() {
            self.parse_by_line(rest, dot_escape)?;
        }
        self.parse_by_line(END_OF_LINE, dot_escape)?;
        Ok(())
    }

    /// Feed one line, without its CRLF. The exact string `"\r\n"` is the
    /// terminal sentinel that completes the part and decodes its body.
    pub fn parse_by_line(&mut self, line: &str, dot_escape: bool) -> Result<()> {
        if line.len() > self.line_policy.octets() {
            return Err(MimeError::LineTooLong {
                limit: self.line_policy.octets(),
            });
        }

        if self.parsing_header {
            if line.is_empty() {
                self.parsing_header = false;
                self.parse_header_block()?;
            } else {
                self.header_lines.push(line.to_string());
            }
            return Ok(());
        }

        if line == END_OF_LINE {
            if self.body_status == BodyStatus::Child {
                if let Some(child) = self.parts.last_mut() {
                    child.parse_by_line(END_OF_LINE, dot_escape)?;
                }
            }
            self.parse_content()?;
            self.body_status = BodyStatus::End;
            return Ok(());
        }

        if !self.boundary.is_empty() {
            let middle = format!("{BOUNDARY_DELIMITER}{}", self.boundary);
            if line == middle {
                // a new child begins; the active one, if any, is complete
                if self.body_status == BodyStatus::Child {
                    if let Some(child) = self.parts.last_mut() {
                        child.parse_by_line(END_OF_LINE, dot_escape)?;
                    }
                }
                let mut child = MimePart::new();
                child.line_policy = self.line_policy;
                child.strict_mode = self.strict_mode;
                child.strict_codec_mode = self.strict_codec_mode;
                child.boundary_generator = self.boundary_generator;
                self.parts.push(child);
                self.body_status = BodyStatus::Child;
                return Ok(());
            }
            if line == format!("{middle}{BOUNDARY_DELIMITER}") {
                if let Some(child) = self.parts.last_mut() {
                    child.parse_by_line(END_OF_LINE, dot_escape)?;
                }
                self.body_status = BodyStatus::End;
                return Ok(());
            }
        }

        if self.body_status == BodyStatus::Child {
            if let Some(child) = self.parts.last_mut() {
                child.parse_by_line(line, dot_escape)?;
            }
            return Ok(());
        }

        if dot_escape && line.starts_with('.') {
            self.body_lines.push(line[1..].to_string());
        } else {
            self.body_lines.push(line.to_string());
        }
        Ok(())
    }

    fn parse_header_block(&mut self) -> Result<()> {
        let mut logical: Vec<String> = vec![];
        for line in self.header_lines.drain(..) {
            if line.starts_with(' ') || line.starts_with('\t') {
                match logical.last_mut() {
                    Some(last) => {
                        last.push(' ');
                        last.push_str(line.trim_start());
                    }
                    None => {
                        return Err(MimeError::HeaderName(line));
                    }
                }
            } else {
                logical.push(line);
            }
        }
        for line in logical {
            self.parse_header_line(&line)?;
        }
        Ok(())
    }

    fn parse_header_line(&mut self, line: &str) -> Result<()> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| MimeError::HeaderName(line.to_string()))?;
        let name = name.trim();
        let value = value.trim();
        if !is_valid_header_name(name) {
            return Err(MimeError::HeaderName(name.to_string()));
        }
        if !is_valid_header_value(value) {
            return Err(MimeError::HeaderValue(name.to_string()));
        }

        let qc = self.qcodec();
        if name.eq_ignore_ascii_case("Content-Type") {
            let mut content_type = parse_content_type(value, self.strict_mode, &qc)?;
            if let Some(boundary) = content_type.remove_param("boundary") {
                self.boundary = boundary.to_lossy_string();
            }
            if let Some(name) = content_type.remove_param("name") {
                if self.name.is_empty() {
                    self.name = name;
                }
            }
            self.content_type = content_type;
        } else if name.eq_ignore_ascii_case("Content-Transfer-Encoding") {
            self.encoding = parse_transfer_encoding(value, self.strict_mode)?;
        } else if name.eq_ignore_ascii_case("Content-Disposition") {
            let (disposition, params) = parse_disposition(value, self.strict_mode, &qc)?;
            self.disposition = disposition;
            if let Some((_, filename)) = params.into_iter().find(|(n, _)| n == "filename") {
                self.name = filename;
            }
        } else if name.eq_ignore_ascii_case("Content-ID") {
            self.content_id = parse_content_id(value)?;
        } else if name.eq_ignore_ascii_case("MIME-Version") {
            self.version = value.to_string();
        } else {
            self.other_headers.push((name.to_string(), value.to_string()));
        }
        Ok(())
    }

    fn parse_content(&mut self) -> Result<()> {
        let lines = std::mem::take(&mut self.body_lines);
        if lines.is_empty() {
            return Ok(());
        }
        let policy = self.line_policy.octets();
        let strict = self.strict_codec_mode;
        self.body = match self.encoding {
            TransferEncoding::None | TransferEncoding::SevenBit => {
                let mut codec = SevenBit::with_limits(policy, policy);
                codec.set_strict(strict);
                codec.decode(&lines)?
            }
            TransferEncoding::EightBit => {
                let mut codec = EightBit::with_limits(policy, policy);
                codec.set_strict(strict);
                codec.decode(&lines)?
            }
            TransferEncoding::Binary => Binary::with_limits(policy, policy).decode(&lines)?,
            TransferEncoding::Base64 => {
                let mut codec = Base64::with_limits(policy, policy);
                codec.set_strict(strict);
                codec.decode(&lines)?
            }
            TransferEncoding::QuotedPrintable => {
                let mut codec = QuotedPrintable::with_limits(policy, policy);
                codec.set_strict(strict);
                codec.decode(&lines)?
            }
        };
        Ok(())
    }
}
