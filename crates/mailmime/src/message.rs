use crate::codec::WordEncoding;
use crate::headers::parse_content_id;
use crate::mailboxes::parse_address_list;
use crate::{
    Address, CharString, CodecHint, ContentType, Disposition, Mailboxes, MediaType, MimeError,
    MimePart, Result, TransferEncoding,
};
use chrono::{DateTime, FixedOffset};

/// Codec applied to non-ASCII header content on format: raw UTF-8, or
/// RFC 2047 words with a Base64 or Quoted-Printable payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderCodec {
    #[default]
    Utf8,
    Base64,
    QuotedPrintable,
}

impl HeaderCodec {
    fn word_encoding(self) -> Option<WordEncoding> {
        match self {
            Self::Utf8 => None,
            Self::Base64 => Some(WordEncoding::B),
            Self::QuotedPrintable => Some(WordEncoding::Q),
        }
    }
}

/// A mail message: a MIME part plus the RFC 5322 envelope headers.
/// Derefs to the root [`MimePart`] for content and custom headers.
#[derive(Debug, Clone, Default)]
pub struct Message {
    mime: MimePart,
    from: Mailboxes,
    sender: Address,
    reply_to: Address,
    to: Mailboxes,
    cc: Mailboxes,
    bcc: Mailboxes,
    message_id: String,
    subject: CharString,
    date: Option<DateTime<FixedOffset>>,
    header_codec: HeaderCodec,
    envelope_done: bool,
}

impl std::ops::Deref for Message {
    type Target = MimePart;
    fn deref(&self) -> &MimePart {
        &self.mime
    }
}

impl std::ops::DerefMut for Message {
    fn deref_mut(&mut self) -> &mut MimePart {
        &mut self.mime
    }
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(&self) -> &Mailboxes {
        &self.from
    }

    /// Replace the whole `From` mailbox list.
    pub fn set_from(&mut self, mailboxes: Mailboxes) {
        self.from = mailboxes;
    }

    /// Append one author to the `From` list.
    pub fn add_from(&mut self, address: Address) {
        self.from.addresses.push(address);
    }

    pub fn sender(&self) -> &Address {
        &self.sender
    }

    pub fn set_sender(&mut self, address: Address) {
        self.sender = address;
    }

    pub fn reply_to(&self) -> &Address {
        &self.reply_to
    }

    pub fn set_reply_to(&mut self, address: Address) {
        self.reply_to = address;
    }

    pub fn to(&self) -> &Mailboxes {
        &self.to
    }

    pub fn set_to(&mut self, mailboxes: Mailboxes) {
        self.to = mailboxes;
    }

    pub fn add_to(&mut self, address: Address) {
        self.to.addresses.push(address);
    }

    pub fn cc(&self) -> &Mailboxes {
        &self.cc
    }

    pub fn set_cc(&mut self, mailboxes: Mailboxes) {
        self.cc = mailboxes;
    }

    pub fn add_cc(&mut self, address: Address) {
        self.cc.addresses.push(address);
    }

    pub fn bcc(&self) -> &Mailboxes {
        &self.bcc
    }

    pub fn set_bcc(&mut self, mailboxes: Mailboxes) {
        self.bcc = mailboxes;
    }

    pub fn add_bcc(&mut self, address: Address) {
        self.bcc.addresses.push(address);
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn set_message_id(&mut self, id: &str) -> Result<()> {
        self.message_id = parse_content_id(id)?;
        Ok(())
    }

    pub fn subject(&self) -> &CharString {
        &self.subject
    }

    pub fn set_subject<S: Into<CharString>>(&mut self, subject: S) {
        self.subject = subject.into();
    }

    pub fn date(&self) -> Option<&DateTime<FixedOffset>> {
        self.date.as_ref()
    }

    pub fn set_date(&mut self, date: DateTime<FixedOffset>) {
        self.date = Some(date);
    }

    pub fn header_codec(&self) -> HeaderCodec {
        self.header_codec
    }

    pub fn set_header_codec(&mut self, codec: HeaderCodec) {
        self.header_codec = codec;
    }

    /// Add an attachment, converting the message into `multipart/mixed`
    /// if it is not multipart already. Existing textual content moves
    /// into the first child part.
    pub fn attach<N: Into<CharString>>(
        &mut self,
        content_type: ContentType,
        name: N,
        data: &[u8],
    ) -> Result<()> {
        if self.mime.content_type().media_type != MediaType::Multipart {
            if !self.mime.content().is_empty() {
                let mut text = MimePart::new();
                text.set_line_policy(self.mime.line_policy());
                let ct = if self.mime.content_type().media_type == MediaType::None {
                    ContentType::new(MediaType::Text, "plain")
                } else {
                    self.mime.content_type().clone()
                };
                text.set_content_type(ct)?;
                text.set_encoding(self.mime.encoding());
                let body = self.mime.content().to_vec();
                text.set_content(body);
                self.mime.set_content(Vec::<u8>::new());
                self.mime.add_part(text);
            }
            self.mime
                .set_content_type(ContentType::new(MediaType::Multipart, "mixed"))?;
            self.mime.set_encoding(TransferEncoding::None);
        }

        let mut part = MimePart::new();
        part.set_line_policy(self.mime.line_policy());
        part.set_boundary_generator(self.mime.boundary_generator());
        part.set_content_type(content_type)?;
        part.set_encoding(TransferEncoding::Base64);
        part.set_disposition(Disposition::Attachment);
        part.set_name(name);
        part.set_content(data.to_vec());
        self.mime.add_part(part);
        Ok(())
    }

    pub fn attachments(&self) -> impl Iterator<Item = &MimePart> {
        self.mime
            .parts()
            .iter()
            .filter(|p| p.disposition() == Disposition::Attachment)
    }

    pub fn attachment(&self, index: usize) -> Option<&MimePart> {
        self.attachments().nth(index)
    }

    /// Serialize the message: envelope headers, then the MIME tree.
    pub fn format(&mut self, dot_escape: bool) -> Result<String> {
        let prefix = self.format_envelope()?;
        let mut out = String::new();
        self.mime.format_into(&mut out, dot_escape, Some(&prefix))?;
        Ok(out)
    }

    fn format_envelope(&self) -> Result<String> {
        if self.from.is_empty() {
            return Err(MimeError::MissingSender);
        }
        let qc = self.mime.qcodec();
        let method = self.header_codec.word_encoding();
        let mut out = String::new();

        out.push_str("From: ");
        out.push_str(&self.from.encode(&qc, method)?);
        out.push_str("\r\n");

        if !self.sender.is_empty() {
            out.push_str("Sender: ");
            out.push_str(&self.sender.encode(&qc, method)?);
            out.push_str("\r\n");
        }
        if !self.reply_to.is_empty() {
            out.push_str("Reply-To: ");
            out.push_str(&self.reply_to.encode(&qc, method)?);
            out.push_str("\r\n");
        }
        for (name, list) in [("To", &self.to), ("Cc", &self.cc), ("Bcc", &self.bcc)] {
            if !list.is_empty() {
                out.push_str(name);
                out.push_str(": ");
                out.push_str(&list.encode(&qc, method)?);
                out.push_str("\r\n");
            }
        }
        if !self.message_id.is_empty() {
            out.push_str("Message-ID: <");
            out.push_str(&self.message_id);
            out.push_str(">\r\n");
        }
        out.push_str("MIME-Version: ");
        out.push_str(self.mime.version());
        out.push_str("\r\n");
        if let Some(date) = &self.date {
            out.push_str("Date: ");
            out.push_str(&date.format("%a, %d %b %Y %H:%M:%S %z").to_string());
            out.push_str("\r\n");
        }
        out.push_str(&self.format_subject()?);
        Ok(out)
    }

    fn format_subject(&self) -> Result<String> {
        if self.subject.is_empty() {
            return Ok(String::new());
        }
        if self.subject.is_ascii() {
            let policy = self.mime.line_policy().octets();
            let text = self.subject.to_lossy_string();
            if "Subject: ".len() + text.len() <= policy {
                return Ok(format!("Subject: {text}\r\n"));
            }
            // fold a long subject at word boundaries
            let codec = crate::codec::SevenBit::with_limits(
                policy.saturating_sub("Subject: ".len()),
                policy.saturating_sub(1),
            );
            let lines = codec.encode(text.as_bytes())?;
            let folded: Vec<&str> = lines.iter().map(|l| l.trim_end()).collect();
            return Ok(format!("Subject: {}\r\n", folded.join("\r\n ")));
        }
        // the hint on the value itself wins over the message-level codec
        let method = match self.subject.codec_hint() {
            CodecHint::Base64 => Some(WordEncoding::B),
            CodecHint::QuotedPrintable => Some(WordEncoding::Q),
            _ => self.header_codec.word_encoding(),
        };
        match method {
            Some(method) => {
                let words = self.mime.qcodec().encode(
                    self.subject.as_bytes(),
                    crate::mailboxes::wire_charset(&self.subject),
                    method,
                )?;
                Ok(format!("Subject: {}\r\n", words.join("\r\n ")))
            }
            None => Ok(format!("Subject: {}\r\n", self.subject)),
        }
    }

    /// Parse a whole serialized message.
    pub fn parse(&mut self, input: &str) -> Result<()> {
        self.mime.parse(input, false)?;
        self.sync_envelope()
    }

    /// Feed one line of a message being streamed from the network.
    pub fn parse_by_line(&mut self, line: &str, dot_escape: bool) -> Result<()> {
        self.mime.parse_by_line(line, dot_escape)?;
        self.sync_envelope()
    }

    fn sync_envelope(&mut self) -> Result<()> {
        if self.envelope_done || self.mime.is_parsing_header() {
            return Ok(());
        }
        self.envelope_done = true;
        let qc = self.mime.qcodec();

        if let Some(value) = self.mime.take_header("From") {
            self.from = parse_address_list(&value, &qc)?;
        }
        if let Some(value) = self.mime.take_header("Sender") {
            let list = parse_address_list(&value, &qc)?;
            if let Some(first) = list.addresses.into_iter().next() {
                self.sender = first;
            }
        }
        if let Some(value) = self.mime.take_header("Reply-To") {
            let list = parse_address_list(&value, &qc)?;
            if let Some(first) = list.addresses.into_iter().next() {
                self.reply_to = first;
            }
        }
        if let Some(value) = self.mime.take_header("To") {
            self.to = parse_address_list(&value, &qc)?;
        }
        if let Some(value) = self.mime.take_header("Cc") {
            self.cc = parse_address_list(&value, &qc)?;
        }
        if let Some(value) = self.mime.take_header("Bcc") {
            self.bcc = parse_address_list(&value, &qc)?;
        }
        if let Some(value) = self.mime.take_header("Message-ID") {
            self.message_id = parse_content_id(&value)?;
        }
        if let Some(value) = self.mime.take_header("Subject") {
            self.subject = qc.check_decode(&value)?;
        }
        if let Some(value) = self.mime.take_header("Date") {
            self.date = Some(parse_date(&value)?);
        }
        Ok(())
    }
}

/// Parse an RFC 5322 date, tolerating the obsolete trailing zone
/// comment such as `(PDT)`.
fn parse_date(value: &str) -> Result<DateTime<FixedOffset>> {
    let mut v = value.trim();
    if v.ends_with(')') {
        if let Some(idx) = v.rfind('(') {
            v = v[..idx].trim_end();
        }
    }
    Ok(DateTime::parse_from_rfc2822(v)?)
}
