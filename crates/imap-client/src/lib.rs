//! IMAP4rev1 retrieval client over the subset used for fetching and
//! removing messages: LOGIN, SELECT, FETCH RFC822, STATUS, STORE
//! +FLAGS (\Deleted) with CLOSE, STARTTLS and LOGOUT. Every command is
//! framed with an incrementing decimal tag; untagged lines are parsed
//! by the streaming [`parser::ResponseParser`].

mod parser;

pub use parser::{LiteralState, ResponseError, ResponseParser, Token};

use dialog::{Dialog, DialogError, TlsOptions};
use mailmime::{Message, MimeError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImapError {
    #[error(transparent)]
    Dialog(#[from] DialogError),
    #[error(transparent)]
    Mime(#[from] MimeError),
    #[error(transparent)]
    Response(#[from] ResponseError),
    #[error("server rejected the command: {status} {text}")]
    Rejected { status: String, text: String },
    #[error("unparseable server line {0:?}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ImapError>;

/// Result of `STATUS (MESSAGES)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStat {
    pub messages: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// LOGIN in the clear (or over implicit TLS).
    Login,
    /// STARTTLS upgrade first, then LOGIN.
    StartTls,
}

/// Split a server line into its tag and the remainder.
fn split_tag(line: &str) -> Result<(&str, &str)> {
    line.split_once(' ')
        .ok_or_else(|| ImapError::Parse(line.to_string()))
}

/// Split the remainder of a tagged line into the result word and text.
fn split_result(rest: &str) -> (&str, &str) {
    match rest.split_once(' ') {
        Some((result, text)) => (result, text),
        None => (rest, ""),
    }
}

/// IMAP state machine over a [`Dialog`].
#[derive(Debug)]
pub struct ImapClient {
    dialog: Dialog,
    tag: u32,
    tls_options: TlsOptions,
}

impl ImapClient {
    pub async fn connect(
        hostname: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let dialog = Dialog::connect(hostname, port, timeout).await?;
        Ok(Self::with_dialog(dialog))
    }

    /// Connect with implicit TLS before the greeting.
    pub async fn connect_tls(
        hostname: &str,
        port: u16,
        timeout: Option<Duration>,
        tls_options: TlsOptions,
    ) -> Result<Self> {
        let mut dialog = Dialog::connect(hostname, port, timeout).await?;
        dialog.upgrade_tls(&tls_options).await?;
        let mut client = Self::with_dialog(dialog);
        client.tls_options = tls_options;
        Ok(client)
    }

    pub fn with_dialog(dialog: Dialog) -> Self {
        Self {
            dialog,
            tag: 0,
            tls_options: TlsOptions::default(),
        }
    }

    pub fn set_tls_options(&mut self, options: TlsOptions) {
        self.tls_options = options;
    }

    /// Read the greeting and log in. Returns the greeting text.
    pub async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
        method: AuthMethod,
    ) -> Result<String> {
        let greeting = self.read_greeting().await?;
        if method == AuthMethod::StartTls {
            self.starttls().await?;
        }
        self.login(username, password).await?;
        Ok(greeting)
    }

    /// RFC 2595 STARTTLS: must be issued before LOGIN.
    pub async fn starttls(&mut self) -> Result<()> {
        let tag = self.send_command("STARTTLS").await?;
        let line = self.dialog.receive().await?;
        let (line_tag, rest) = split_tag(&line)?;
        if line_tag == "*" {
            return Err(ImapError::Parse(line.to_string()));
        }
        if line_tag != tag {
            return Err(ImapError::Parse(line.to_string()));
        }
        let (result, text) = split_result(rest);
        if !result.eq_ignore_ascii_case("OK") {
            return Err(ImapError::Rejected {
                status: result.to_string(),
                text: text.to_string(),
            });
        }
        let tls_options = self.tls_options.clone();
        self.dialog.upgrade_tls(&tls_options).await?;
        Ok(())
    }

    /// `FETCH n RFC822`: retrieve one complete message from a mailbox.
    pub async fn fetch(&mut self, mailbox: &str, message_no: u32) -> Result<Message> {
        tracing::debug!("fetching message {message_no} from {mailbox}");
        self.select(mailbox).await?;
        let tag = self.send_command(&format!("FETCH {message_no} RFC822")).await?;

        let mut parser = ResponseParser::new();
        let mut fetched: Option<Message> = None;
        loop {
            let line = self.dialog.receive().await?;
            let (line_tag, rest) = split_tag(&line)?;
            if line_tag == "*" {
                parser.feed_line(rest)?;
                // a literal announced at the end of the line is read
                // raw, CR preserved, until its declared size is reached
                while parser.literal_state() == LiteralState::Reading {
                    let raw = self.dialog.receive_raw().await?;
                    parser.feed_line(&raw)?;
                }
                if parser.literal_state() == LiteralState::Done && parser.paren_depth() > 0 {
                    let closing = self.dialog.receive().await?;
                    parser.feed_line(&closing)?;
                }
                if let Some(bytes) = find_rfc822_literal(parser.mandatory()) {
                    let text = String::from_utf8(bytes.to_vec())
                        .map_err(|_| ImapError::Parse("literal is not UTF-8".to_string()))?;
                    let mut message = Message::new();
                    message.parse(&text)?;
                    fetched = Some(message);
                }
                parser.reset();
            } else if line_tag == tag {
                let (result, text) = split_result(rest);
                if !result.eq_ignore_ascii_case("OK") {
                    return Err(ImapError::Rejected {
                        status: result.to_string(),
                        text: text.to_string(),
                    });
                }
                break;
            } else {
                return Err(ImapError::Parse(line.to_string()));
            }
        }
        fetched.ok_or_else(|| ImapError::Parse("no RFC822 literal in FETCH reply".to_string()))
    }

    /// `STATUS mailbox (messages)`: message count without selecting.
    pub async fn statistics(&mut self, mailbox: &str) -> Result<MailboxStat> {
        let tag = self
            .send_command(&format!("STATUS {mailbox} (messages)"))
            .await?;

        let mut parser = ResponseParser::new();
        let mut stat: Option<MailboxStat> = None;
        loop {
            let line = self.dialog.receive().await?;
            let (line_tag, rest) = split_tag(&line)?;
            if line_tag == "*" {
                parser.feed_line(rest)?;
                if let Some(messages) = find_message_count(parser.mandatory()) {
                    stat = Some(MailboxStat { messages });
                }
                parser.reset();
            } else if line_tag == tag {
                let (result, text) = split_result(rest);
                if !result.eq_ignore_ascii_case("OK") {
                    return Err(ImapError::Rejected {
                        status: result.to_string(),
                        text: text.to_string(),
                    });
                }
                break;
            } else {
                return Err(ImapError::Parse(line.to_string()));
            }
        }
        stat.ok_or_else(|| ImapError::Parse("no MESSAGES count in STATUS reply".to_string()))
    }

    /// Mark one message deleted and expunge it via CLOSE.
    pub async fn remove(&mut self, mailbox: &str, message_no: u32) -> Result<()> {
        self.select(mailbox).await?;
        self.simple_command(&format!("STORE {message_no} +FLAGS (\\Deleted)"))
            .await?;
        self.simple_command("CLOSE").await
    }

    /// Say goodbye. Dropping the client just closes the socket.
    pub async fn logout(&mut self) -> Result<()> {
        self.simple_command("LOGOUT").await?;
        self.dialog.close();
        Ok(())
    }

    async fn read_greeting(&mut self) -> Result<String> {
        let line = self.dialog.receive().await?;
        let (tag, rest) = split_tag(&line)?;
        if tag != "*" {
            return Err(ImapError::Parse(line.to_string()));
        }
        let (result, text) = split_result(rest);
        if !result.eq_ignore_ascii_case("OK") {
            return Err(ImapError::Rejected {
                status: result.to_string(),
                text: text.to_string(),
            });
        }
        Ok(text.to_string())
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.simple_command(&format!("LOGIN {username} {password}"))
            .await
    }

    async fn select(&mut self, mailbox: &str) -> Result<()> {
        self.simple_command(&format!("SELECT {mailbox}")).await
    }

    /// Issue a command, drain untagged lines, and require a tagged OK.
    async fn simple_command(&mut self, command: &str) -> Result<()> {
        let tag = self.send_command(command).await?;
        loop {
            let line = self.dialog.receive().await?;
            let (line_tag, rest) = split_tag(&line)?;
            if line_tag == "*" {
                continue;
            }
            if line_tag != tag {
                return Err(ImapError::Parse(line.to_string()));
            }
            let (result, text) = split_result(rest);
            if !result.eq_ignore_ascii_case("OK") {
                return Err(ImapError::Rejected {
                    status: result.to_string(),
                    text: text.to_string(),
                });
            }
            return Ok(());
        }
    }

    async fn send_command(&mut self, command: &str) -> Result<String> {
        self.tag += 1;
        let tag = self.tag.to_string();
        self.dialog.send(&format!("{tag} {command}")).await?;
        Ok(tag)
    }
}

/// Locate the literal that follows an `RFC822` atom inside any list of
/// the mandatory part.
fn find_rfc822_literal(tokens: &[Token]) -> Option<&[u8]> {
    for token in tokens {
        if let Token::List(items) = token {
            let mut rfc_found = false;
            for item in items {
                match item {
                    Token::Atom(atom) if atom.eq_ignore_ascii_case("RFC822") => {
                        rfc_found = true;
                    }
                    Token::Literal { bytes, .. } if rfc_found => {
                        return Some(bytes);
                    }
                    _ => {}
                }
            }
        }
    }
    None
}

/// Walk the mandatory part of a STATUS reply for `(MESSAGES n)`.
fn find_message_count(tokens: &[Token]) -> Option<u32> {
    for token in tokens {
        if let Token::List(items) = token {
            if items.len() >= 2 {
                if let (Some(key), Some(value)) = (items[0].as_atom(), items[items.len() - 1].as_atom())
                {
                    if key.eq_ignore_ascii_case("MESSAGES") {
                        return value.parse().ok();
                    }
                }
            }
        }
    }
    None
}
