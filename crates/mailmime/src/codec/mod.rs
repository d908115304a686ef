//! Transfer codecs: each one maps between raw content bytes and the
//! CRLF-delimited line form used on the wire. Every codec is constructed
//! with a first-line and a subsequent-line octet budget (CRLF excluded)
//! and a strict-mode flag controlling whether recoverable violations are
//! rejected or papered over.

mod base64;
mod percent;
mod qcodec;
mod quoted_printable;
mod transfer;

pub use base64::Base64;
pub use percent::Percent;
pub use qcodec::{QCodec, WordEncoding};
pub use quoted_printable::QuotedPrintable;
pub use transfer::{Binary, EightBit, SevenBit};

/// The admissible maximum line lengths, in octets excluding CRLF.
/// `Mandatory` is the RFC 5322 §2.1.1 hard limit; `Recommended` its
/// soft limit; the two larger values are relaxations for protocols
/// and peers known to tolerate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinePolicy {
    Recommended,
    Mandatory,
    Relaxed,
    VeryLarge,
}

impl LinePolicy {
    pub fn octets(self) -> usize {
        match self {
            Self::Recommended => 78,
            Self::Mandatory => 998,
            Self::Relaxed => 2048,
            Self::VeryLarge => 16384,
        }
    }
}

pub(crate) const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

pub(crate) fn hex_digit_to_int(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        _ => None,
    }
}
