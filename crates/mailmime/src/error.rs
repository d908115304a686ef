use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MimeError {
    #[error("byte {0:#04x} is not valid for this codec")]
    BadCharacter(u8),
    #[error("line exceeds the {limit} octet line policy")]
    LineTooLong { limit: usize },
    #[error("malformed hex escape {0:?}")]
    BadHexEscape(String),
    #[error("bad encoded-word: {0}")]
    BadEncodedWord(String),
    #[error("invalid header name {0:?}")]
    HeaderName(String),
    #[error("invalid value for header {0:?}")]
    HeaderValue(String),
    #[error("parsing header {name:?} at offset {offset}: {reason}")]
    HeaderParse {
        name: String,
        offset: usize,
        reason: String,
    },
    #[error("unknown media type {0:?}")]
    UnknownMediaType(String),
    #[error("unknown Content-Transfer-Encoding {0:?}")]
    UnknownTransferEncoding(String),
    #[error("unknown Content-Disposition {0:?}")]
    UnknownDisposition(String),
    #[error("boundary set on a part that is not multipart")]
    BoundaryOnSinglePart,
    #[error("multipart content requires an identity transfer encoding")]
    MultipartEncoding,
    #[error("parsing address list at offset {offset}: {reason}")]
    AddressParse { offset: usize, reason: String },
    #[error("address {0:?} is missing the '@'")]
    MissingAtSign(String),
    #[error("message has no sender or from address")]
    MissingSender,
    #[error("parsing Date header: {0}")]
    DateParse(#[from] chrono::format::ParseError),
    #[error("parsing body: {0}")]
    BodyParse(String),
}
