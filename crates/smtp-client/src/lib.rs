//! SMTP submission client, RFC 5321: banner, EHLO with HELO fallback,
//! AUTH LOGIN, STARTTLS, and the MAIL FROM / RCPT TO / DATA sequence
//! with dot-stuffed payload framing.

use data_encoding::BASE64;
use dialog::{Dialog, DialogError, TlsOptions};
use mailmime::{Message, MimeError};
use std::time::Duration;
use thiserror::Error;

/// Reply class derived from the first digit of the status code,
/// RFC 5321 §4.2.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCategory {
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

impl ReplyCategory {
    pub fn of(code: u16) -> Self {
        match code / 100 {
            2 => Self::PositiveCompletion,
            3 => Self::PositiveIntermediate,
            4 => Self::TransientNegative,
            _ => Self::PermanentNegative,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::PositiveCompletion => "positive completion",
            Self::PositiveIntermediate => "positive intermediate",
            Self::TransientNegative => "transient negative",
            Self::PermanentNegative => "permanent negative",
        }
    }
}

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error(transparent)]
    Dialog(#[from] DialogError),
    #[error(transparent)]
    Mime(#[from] MimeError),
    #[error("malformed reply line {0:?}")]
    MalformedReply(String),
    #[error("{} ({code}): {text}", .category.as_str())]
    Rejected {
        code: u16,
        category: ReplyCategory,
        text: String,
    },
    #[error("message has no sender address")]
    MissingSender,
}

pub type Result<T> = std::result::Result<T, SmtpError>;

/// One complete (possibly multi-line) server reply. `text` is the
/// content of the final line; `lines` keeps every line for callers
/// interested in the full greeting or capability list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn text(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }

    pub fn category(&self) -> ReplyCategory {
        ReplyCategory::of(self.code)
    }

    fn rejected(&self) -> SmtpError {
        SmtpError::Rejected {
            code: self.code,
            category: self.category(),
            text: self.text().to_string(),
        }
    }
}

/// Split one reply line into (code, is_final, content). The fourth
/// octet is a space on the final line and a dash on continuations.
fn parse_reply_line(line: &str) -> Result<(u16, bool, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 {
        return Err(SmtpError::MalformedReply(line.to_string()));
    }
    let code: u16 = line[0..3]
        .parse()
        .map_err(|_| SmtpError::MalformedReply(line.to_string()))?;
    match bytes.get(3) {
        None => Ok((code, true, "")),
        Some(b' ') => Ok((code, true, &line[4..])),
        Some(b'-') => Ok((code, false, &line[4..])),
        Some(_) => Err(SmtpError::MalformedReply(line.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication; just the greeting and EHLO.
    None,
    /// AUTH LOGIN with Base64 username and password.
    Login,
    /// STARTTLS upgrade after EHLO, then AUTH LOGIN.
    StartTls,
}

/// One extension advertised in the EHLO reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpCapability {
    pub name: String,
    pub param: Option<String>,
}

/// SMTP submission state machine over a [`Dialog`].
#[derive(Debug)]
pub struct SmtpClient {
    dialog: Dialog,
    source_host: String,
    tls_options: TlsOptions,
    capabilities: Vec<EsmtpCapability>,
}

impl SmtpClient {
    /// Connect over plain TCP. The local hostname is captured for the
    /// EHLO greeting.
    pub async fn connect(
        hostname: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let dialog = Dialog::connect(hostname, port, timeout).await?;
        Ok(Self::with_dialog(dialog))
    }

    /// Connect with implicit TLS: the handshake happens before the
    /// server banner is read.
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
        let source_host = gethostname::gethostname().to_string_lossy().into_owned();
        Self {
            dialog,
            source_host,
            tls_options: TlsOptions::default(),
            capabilities: vec![],
        }
    }

    /// Extensions the server advertised in its last EHLO reply. Empty
    /// after a HELO fallback.
    pub fn capabilities(&self) -> &[EsmtpCapability] {
        &self.capabilities
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities
            .iter()
            .any(|cap| cap.name.eq_ignore_ascii_case(name))
    }

    pub fn set_source_hostname(&mut self, hostname: &str) {
        self.source_host = hostname.to_string();
    }

    pub fn source_hostname(&self) -> &str {
        &self.source_host
    }

    pub fn set_tls_options(&mut self, options: TlsOptions) {
        self.tls_options = options;
    }

    /// Read the banner and introduce ourselves; authenticate when the
    /// method calls for it. Returns the server greeting text.
    pub async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
        method: AuthMethod,
    ) -> Result<String> {
        let greeting = self.read_greeting().await?;
        match method {
            AuthMethod::None => {
                self.ehlo().await?;
            }
            AuthMethod::Login => {
                self.ehlo().await?;
                self.auth_login(username, password).await?;
            }
            AuthMethod::StartTls => {
                self.ehlo().await?;
                self.starttls().await?;
                self.auth_login(username, password).await?;
            }
        }
        Ok(greeting)
    }

    /// Submit a message. The envelope sender is the `Sender` header if
    /// set, otherwise the first `From` address; the envelope recipients
    /// are all To/Cc/Bcc addresses and group names. Returns the text of
    /// the final server reply.
    pub async fn submit(&mut self, message: &mut Message) -> Result<String> {
        let sender = if !message.sender().addr.is_empty() {
            message.sender().addr.clone()
        } else {
            message
                .from()
                .addresses
                .first()
                .map(|a| a.addr.clone())
                .ok_or(SmtpError::MissingSender)?
        };

        let reply = self.command(&format!("MAIL FROM: <{sender}>")).await?;
        if reply.category() != ReplyCategory::PositiveCompletion {
            return Err(reply.rejected());
        }

        let mut recipients: Vec<String> = vec![];
        for list in [message.to(), message.cc(), message.bcc()] {
            for address in &list.addresses {
                recipients.push(address.addr.clone());
            }
            for group in &list.groups {
                recipients.push(group.name.clone());
            }
        }
        for recipient in recipients {
            let reply = self.command(&format!("RCPT TO: <{recipient}>")).await?;
            if reply.category() != ReplyCategory::PositiveCompletion {
                return Err(reply.rejected());
            }
        }

        let reply = self.command("DATA").await?;
        if reply.category() != ReplyCategory::PositiveIntermediate {
            return Err(reply.rejected());
        }

        let payload = message.format(true)?;
        self.dialog.send_raw(payload.as_bytes()).await?;
        let reply = self.command(".").await?;
        if reply.category() != ReplyCategory::PositiveCompletion {
            return Err(reply.rejected());
        }
        Ok(reply.text().to_string())
    }

    /// Negotiate TLS on the open connection: `STARTTLS`, handshake,
    /// then EHLO again since the session state was reset.
    pub async fn starttls(&mut self) -> Result<()> {
        let reply = self.command("STARTTLS").await?;
        if reply.code != 220 {
            return Err(reply.rejected());
        }
        let tls_options = self.tls_options.clone();
        self.dialog.upgrade_tls(&tls_options).await?;
        self.ehlo().await
    }

    /// Say goodbye. Errors matter to callers that want to observe a
    /// failed farewell; dropping the client just closes the socket.
    pub async fn quit(&mut self) -> Result<()> {
        self.command("QUIT").await?;
        self.dialog.close();
        Ok(())
    }

    async fn read_greeting(&mut self) -> Result<String> {
        let reply = self.read_reply().await?;
        if reply.code != 220 {
            return Err(reply.rejected());
        }
        Ok(reply.lines.join("\r\n"))
    }

    async fn ehlo(&mut self) -> Result<()> {
        let reply = self.command(&format!("EHLO {}", self.source_host)).await?;
        if reply.category() == ReplyCategory::PositiveCompletion {
            self.capabilities = reply
                .lines
                .iter()
                .skip(1)
                .map(|line| {
                    let mut fields = line.splitn(2, ' ');
                    EsmtpCapability {
                        name: fields.next().unwrap_or("").to_ascii_uppercase(),
                        param: fields.next().map(|s| s.to_string()),
                    }
                })
                .collect();
            return Ok(());
        }
        tracing::debug!("EHLO rejected with {}, trying HELO", reply.code);
        let reply = self.command(&format!("HELO {}", self.source_host)).await?;
        if reply.category() != ReplyCategory::PositiveCompletion {
            return Err(reply.rejected());
        }
        self.capabilities.clear();
        Ok(())
    }

    async fn auth_login(&mut self, username: &str, password: &str) -> Result<()> {
        let reply = self.command("AUTH LOGIN").await?;
        if reply.category() != ReplyCategory::PositiveIntermediate {
            return Err(reply.rejected());
        }
        let reply = self.command(&BASE64.encode(username.as_bytes())).await?;
        if reply.category() != ReplyCategory::PositiveIntermediate {
            return Err(reply.rejected());
        }
        let reply = self.command(&BASE64.encode(password.as_bytes())).await?;
        if reply.category() != ReplyCategory::PositiveCompletion {
            return Err(reply.rejected());
        }
        Ok(())
    }

    async fn command(&mut self, line: &str) -> Result<Reply> {
        self.dialog.send(line).await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = vec![];
        loop {
            let line = self.dialog.receive().await?;
            let (code, is_final, content) = parse_reply_line(&line)?;
            lines.push(content.to_string());
            if is_final {
                return Ok(Reply { code, lines });
            }
        }
    }
}
