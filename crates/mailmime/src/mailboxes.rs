use crate::codec::{QCodec, WordEncoding};
use crate::{CharString, MimeError, Result};
use nom::bytes::complete::{take_while, take_while1};
use nom::character::complete::char;
use nom::sequence::delimited;

type NomResult<'a, T> = nom::IResult<&'a str, T>;

/// One mailbox: an optional display name plus the addr-spec.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Address {
    pub name: CharString,
    pub addr: String,
}

impl Address {
    pub fn new<N: Into<CharString>>(name: N, addr: &str) -> Self {
        Self {
            name: name.into(),
            addr: addr.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.addr.is_empty()
    }

    pub(crate) fn encode(&self, qc: &QCodec, method: Option<WordEncoding>) -> Result<String> {
        if self.addr.is_empty() && self.name.is_empty() {
            return Ok(String::new());
        }
        if self.name.is_empty() {
            return Ok(format!("<{}>", self.addr));
        }
        let name = if self.name.is_ascii() {
            quote_display_name(&self.name.to_lossy_string())
        } else {
            match method {
                Some(method) => qc
                    .encode(self.name.as_bytes(), wire_charset(&self.name), method)?
                    .join("\r\n\t"),
                None => self.name.to_lossy_string(),
            }
        };
        if self.addr.is_empty() {
            return Ok(name);
        }
        Ok(format!("{} <{}>", name, self.addr))
    }
}

/// A named group of mailboxes, RFC 5322 §3.4.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Group {
    pub name: String,
    pub members: Vec<Address>,
}

/// The value of an address-list header: top level addresses plus groups.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mailboxes {
    pub addresses: Vec<Address>,
    pub groups: Vec<Group>,
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(address: Address) -> Self {
        Self {
            addresses: vec![address],
            groups: vec![],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.groups.is_empty()
    }

    pub(crate) fn encode(&self, qc: &QCodec, method: Option<WordEncoding>) -> Result<String> {
        let mut entries = vec![];
        for address in &self.addresses {
            entries.push(address.encode(qc, method)?);
        }
        for group in &self.groups {
            let mut members = vec![];
            for member in &group.members {
                members.push(member.encode(qc, method)?);
            }
            entries.push(format!("{}: {};", group.name, members.join(", ")));
        }
        Ok(entries.join(",\r\n\t"))
    }
}

/// Charset label to put on the wire for a value; "unknown" has no
/// registered name, so such values travel as UTF-8.
pub(crate) fn wire_charset(value: &CharString) -> &str {
    if value.charset() == crate::CHARSET_UNKNOWN {
        crate::CHARSET_UTF8
    } else {
        value.charset()
    }
}

fn quote_display_name(name: &str) -> String {
    let needs_quote = name.chars().any(|c| ",;:<>@\"\\".contains(c));
    if !needs_quote {
        return name.to_string();
    }
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn is_name_word_char(c: char) -> bool {
    !c.is_ascii_whitespace() && !"<>,;:\"".contains(c)
}

fn name_word(input: &str) -> NomResult<&str> {
    take_while1(is_name_word_char)(input)
}

fn ws(input: &str) -> NomResult<&str> {
    take_while(|c: char| c == ' ' || c == '\t')(input)
}

fn quoted_name(input: &str) -> NomResult<String> {
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

fn angle_addr(input: &str) -> NomResult<&str> {
    delimited(char('<'), take_while(|c| c != '>'), char('>'))(input)
}

fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-/=?^_`{|}~".contains(c)
}

fn dot_atom(input: &str) -> bool {
    !input.is_empty()
        && input.split('.').all(|seg| {
            !seg.is_empty() && seg.chars().all(is_atext)
        })
}

/// Validate an addr-spec: dot-atom or quoted-string local part, `@`,
/// dot-atom or bracketed literal domain.
pub fn is_valid_addr_spec(addr: &str) -> bool {
    let Some(at) = addr.rfind('@') else {
        return false;
    };
    let (local, domain) = (&addr[..at], &addr[at + 1..]);
    let local_ok = dot_atom(local)
        || (local.len() >= 2 && local.starts_with('"') && local.ends_with('"'));
    let domain_ok = dot_atom(domain)
        || (domain.len() >= 2 && domain.starts_with('[') && domain.ends_with(']'));
    local_ok && domain_ok
}

#[derive(Debug)]
enum NamePiece {
    Word(String),
    Quoted(String),
}

/// Parse an address-list header value into addresses and groups.
///
/// Disambiguation: a bare token containing `@` is an address; a quoted
/// string is always a display name; an angle-bracketed run is always an
/// address; `display-name ":" mailbox-list ";"` introduces a group at
/// the top level only.
pub fn parse_address_list(text: &str, qc: &QCodec) -> Result<Mailboxes> {
    let mut result = Mailboxes::new();
    let mut group: Option<Group> = None;
    let mut rest = text;

    let fail = |rest: &str, reason: &str| MimeError::AddressParse {
        offset: text.len() - rest.len(),
        reason: reason.to_string(),
    };

    loop {
        // skip separators between entries
        loop {
            let (r, _) = ws(rest).map_err(|_: nom::Err<nom::error::Error<&str>>| {
                fail(rest, "whitespace")
            })?;
            rest = r;
            if let Some(r) = rest.strip_prefix(',') {
                rest = r;
            } else {
                break;
            }
        }
        if rest.is_empty() {
            break;
        }
        if let Some(r) = rest.strip_prefix(';') {
            match group.take() {
                Some(done) => result.groups.push(done),
                None => return Err(fail(rest, "';' outside of a group")),
            }
            rest = r;
            continue;
        }

        // accumulate display-name pieces until the entry is decided
        let mut pieces: Vec<NamePiece> = vec![];
        let entry_start = rest;
        loop {
            let (r, _) = ws(rest).map_err(|_: nom::Err<nom::error::Error<&str>>| {
                fail(rest, "whitespace")
            })?;
            rest = r;

            if rest.starts_with('"') {
                let (r, name) = quoted_name(rest).map_err(|_| fail(rest, "unterminated quoted string"))?;
                pieces.push(NamePiece::Quoted(name));
                rest = r;
                continue;
            }
            if rest.starts_with('<') {
                let (r, addr) = angle_addr(rest).map_err(|_| fail(rest, "unterminated '<'"))?;
                let addr = addr.trim();
                if !addr.contains('@') {
                    return Err(MimeError::MissingAtSign(addr.to_string()));
                }
                if !is_valid_addr_spec(addr) {
                    return Err(fail(rest, "invalid addr-spec"));
                }
                let name = decode_name(&pieces, qc)?;
                push_address(
                    &mut result,
                    &mut group,
                    Address {
                        name,
                        addr: addr.to_string(),
                    },
                );
                rest = r;
                break;
            }
            if let Some(r) = rest.strip_prefix(':') {
                if group.is_some() {
                    return Err(fail(rest, "nested group"));
                }
                if pieces.is_empty() {
                    return Err(fail(rest, "group without a name"));
                }
                let name = decode_name(&pieces, qc)?.to_lossy_string();
                group = Some(Group {
                    name,
                    members: vec![],
                });
                rest = r;
                break;
            }
            if rest.is_empty() || rest.starts_with(',') || rest.starts_with(';') {
                // a bare entry: a single token carrying '@' is an address
                match pieces.as_slice() {
                    [NamePiece::Word(word)] if word.contains('@') => {
                        if !is_valid_addr_spec(word) {
                            return Err(fail(entry_start, "invalid addr-spec"));
                        }
                        let addr = word.clone();
                        push_address(
                            &mut result,
                            &mut group,
                            Address {
                                name: CharString::default(),
                                addr,
                            },
                        );
                    }
                    [] => {}
                    _ => return Err(fail(entry_start, "display name without an address")),
                }
                break;
            }

            let (r, word) = name_word(rest).map_err(|_| fail(rest, "expected a word"))?;
            pieces.push(NamePiece::Word(word.to_string()));
            rest = r;
        }
    }

    if group.is_some() {
        return Err(MimeError::AddressParse {
            offset: text.len(),
            reason: "unterminated group".to_string(),
        });
    }
    Ok(result)
}

fn push_address(result: &mut Mailboxes, group: &mut Option<Group>, address: Address) {
    match group {
        Some(g) => g.members.push(address),
        None => result.addresses.push(address),
    }
}

fn decode_name(pieces: &[NamePiece], qc: &QCodec) -> Result<CharString> {
    let mut joined = String::new();
    for piece in pieces {
        if !joined.is_empty() {
            joined.push(' ');
        }
        match piece {
            NamePiece::Word(w) => joined.push_str(w),
            NamePiece::Quoted(q) => joined.push_str(q),
        }
    }
    if joined.contains("=?") {
        qc.check_decode(&joined)
    } else {
        Ok(CharString::from(joined))
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
    fn single_name_addr() {
        let mboxes = parse_address_list("\"mailio\" <adresa@mailio.dev>", &qc()).unwrap();
        k9::assert_equal!(mboxes.addresses.len(), 1);
        k9::assert_equal!(mboxes.addresses[0].name.to_lossy_string(), "mailio");
        k9::assert_equal!(mboxes.addresses[0].addr, "adresa@mailio.dev");
    }

    #[test]
    fn bare_address() {
        let mboxes = parse_address_list("karas@mailio.dev", &qc()).unwrap();
        k9::assert_equal!(mboxes.addresses[0].addr, "karas@mailio.dev");
        assert!(mboxes.addresses[0].name.is_empty());
    }

    #[test]
    fn multi_word_display_name() {
        let mboxes =
            parse_address_list("Tomislav  Karastojkovic <kontakt@mailio.dev>", &qc()).unwrap();
        k9::assert_equal!(
            mboxes.addresses[0].name.to_lossy_string(),
            "Tomislav Karastojkovic"
        );
    }

    #[test]
    fn group_with_trailing_address() {
        let mboxes = parse_address_list(
            "mailio: <karas@mailio.dev>, Tomislav Karastojkovic <kontakt@mailio.dev>; \
             \"kontakt\" <kontakt@mailio.dev>",
            &qc(),
        )
        .unwrap();
        k9::assert_equal!(mboxes.groups.len(), 1);
        k9::assert_equal!(mboxes.groups[0].name, "mailio");
        k9::assert_equal!(mboxes.groups[0].members.len(), 2);
        k9::assert_equal!(mboxes.groups[0].members[0].addr, "karas@mailio.dev");
        k9::assert_equal!(
            mboxes.groups[0].members[1].name.to_lossy_string(),
            "Tomislav Karastojkovic"
        );
        k9::assert_equal!(mboxes.addresses.len(), 1);
        k9::assert_equal!(mboxes.addresses[0].name.to_lossy_string(), "kontakt");
    }

    #[test]
    fn bracketed_address_requires_at() {
        let err = parse_address_list("<karas>", &qc()).unwrap_err();
        k9::assert_equal!(err, MimeError::MissingAtSign("karas".to_string()));
    }

    #[test]
    fn name_with_encoded_word() {
        let mboxes =
            parse_address_list("=?UTF-8?Q?Andr=C3=A9?= <andre@example.com>", &qc()).unwrap();
        k9::assert_equal!(mboxes.addresses[0].name.to_lossy_string(), "André");
    }

    #[test]
    fn comma_separated_list() {
        let mboxes = parse_address_list(
            "one@example.com, Two <two@example.com>,three@example.com",
            &qc(),
        )
        .unwrap();
        k9::assert_equal!(mboxes.addresses.len(), 3);
        k9::assert_equal!(mboxes.addresses[1].name.to_lossy_string(), "Two");
    }

    #[test]
    fn display_name_without_address_fails() {
        assert!(parse_address_list("Just A Name", &qc()).is_err());
    }

    #[test]
    fn addr_spec_validation() {
        assert!(is_valid_addr_spec("a.b@c.d"));
        assert!(is_valid_addr_spec("\"john smith\"@example.com"));
        assert!(is_valid_addr_spec("a@[127.0.0.1]"));
        assert!(!is_valid_addr_spec("a..b@c.d"));
        assert!(!is_valid_addr_spec("a@"));
        assert!(!is_valid_addr_spec("nope"));
    }

    #[test]
    fn encode_round_trip() {
        let mut mboxes = Mailboxes::new();
        mboxes.addresses.push(Address::new("mailio", "adresa@mailio.dev"));
        mboxes.groups.push(Group {
            name: "team".to_string(),
            members: vec![
                Address::new("", "a@example.com"),
                Address::new("Bee", "b@example.com"),
            ],
        });
        let encoded = mboxes.encode(&qc(), Some(WordEncoding::Q)).unwrap();
        k9::assert_equal!(
            encoded,
            "mailio <adresa@mailio.dev>,\r\n\tteam: <a@example.com>, Bee <b@example.com>;"
        );

        // unfold the way a header parser would, then parse back
        let unfolded = encoded.replace("\r\n\t", " ");
        let parsed = parse_address_list(&unfolded, &qc()).unwrap();
        k9::assert_equal!(parsed.addresses[0].addr, "adresa@mailio.dev");
        k9::assert_equal!(parsed.groups[0].members.len(), 2);
    }

    #[test]
    fn encode_non_ascii_name() {
        let address = Address::new(
            CharString::from("Тома"),
            "toma@mailio.dev",
        );
        let encoded = address.encode(&qc(), Some(WordEncoding::B)).unwrap();
        assert!(encoded.starts_with("=?UTF-8?B?"));
        assert!(encoded.ends_with(" <toma@mailio.dev>"));

        let parsed = parse_address_list(&encoded.replace("\r\n\t", " "), &qc()).unwrap();
        k9::assert_equal!(parsed.addresses[0].name.to_lossy_string(), "Тома");
    }
}
