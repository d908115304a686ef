//! POP3 retrieval client, RFC 1939: USER/PASS authentication, STAT,
//! LIST, UIDL, RETR/TOP with streaming message parsing, DELE, and the
//! STLS upgrade from RFC 2595.

use dialog::{Dialog, DialogError, TlsOptions};
use mailmime::{Message, MimeError, END_OF_LINE};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// A line consisting of a single dot terminates multi-line replies.
const END_OF_MESSAGE: &str = ".";

#[derive(Error, Debug)]
pub enum Pop3Error {
    #[error(transparent)]
    Dialog(#[from] DialogError),
    #[error(transparent)]
    Mime(#[from] MimeError),
    #[error("unknown status word in {0:?}")]
    UnknownStatus(String),
    #[error("server rejected the command: {0}")]
    Rejected(String),
    #[error("unparseable reply {0:?}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, Pop3Error>;

/// Result of `STAT`: message count and total maildrop size in octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStat {
    pub messages: u32,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// USER and PASS in the clear (or over implicit TLS).
    Login,
    /// STLS upgrade first, then USER and PASS.
    StartTls,
}

/// Split a reply into its status word and the remaining text. The
/// status word must be exactly `+OK` or `-ERR`.
fn parse_status(line: &str) -> Result<(bool, String)> {
    let (status, text) = match line.split_once(' ') {
        Some((status, text)) => (status, text.to_string()),
        None => (line, String::new()),
    };
    match status {
        "+OK" => Ok((true, text)),
        "-ERR" => Ok((false, text)),
        _ => Err(Pop3Error::UnknownStatus(line.to_string())),
    }
}

/// POP3 state machine over a [`Dialog`].
#[derive(Debug)]
pub struct Pop3Client {
    dialog: Dialog,
    tls_options: TlsOptions,
}

impl Pop3Client {
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
            self.stls().await?;
        }
        self.auth_login(username, password).await?;
        Ok(greeting)
    }

    /// `LIST` or `LIST n`: message number to size in octets.
    pub async fn list(&mut self, message_no: Option<u32>) -> Result<BTreeMap<u32, u64>> {
        let mut results = BTreeMap::new();
        match message_no {
            Some(n) => {
                let text = self.command(&format!("LIST {n}")).await?;
                let (msg_no, size) = parse_scan_listing(&text)?;
                results.insert(msg_no, size);
            }
            None => {
                self.command("LIST").await?;
                loop {
                    let line = self.dialog.receive().await?;
                    if line == END_OF_MESSAGE {
                        break;
                    }
                    let (msg_no, size) = parse_scan_listing(&line)?;
                    results.insert(msg_no, size);
                }
            }
        }
        Ok(results)
    }

    /// `UIDL` or `UIDL n`: message number to unique-id string.
    pub async fn uidl(&mut self, message_no: Option<u32>) -> Result<BTreeMap<u32, String>> {
        let mut results = BTreeMap::new();
        match message_no {
            Some(n) => {
                let text = self.command(&format!("UIDL {n}")).await?;
                let (msg_no, uid) = parse_uid_listing(&text)?;
                results.insert(msg_no, uid);
            }
            None => {
                self.command("UIDL").await?;
                loop {
                    let line = self.dialog.receive().await?;
                    if line == END_OF_MESSAGE {
                        break;
                    }
                    let (msg_no, uid) = parse_uid_listing(&line)?;
                    results.insert(msg_no, uid);
                }
            }
        }
        Ok(results)
    }

    /// `STAT`: maildrop statistics.
    pub async fn statistics(&mut self) -> Result<MailboxStat> {
        let text = self.command("STAT").await?;
        let (messages, size) = text
            .split_once(' ')
            .ok_or_else(|| Pop3Error::Parse(text.clone()))?;
        Ok(MailboxStat {
            messages: messages
                .parse()
                .map_err(|_| Pop3Error::Parse(text.clone()))?,
            size: size
                .trim()
                .parse()
                .map_err(|_| Pop3Error::Parse(text.clone()))?,
        })
    }

    /// `RETR n`: fetch one complete message.
    pub async fn fetch(&mut self, message_no: u32) -> Result<Message> {
        tracing::debug!("retrieving message {message_no}");
        self.command(&format!("RETR {message_no}")).await?;
        self.read_message(false).await
    }

    /// `TOP n 0`: fetch only the headers of one message.
    pub async fn fetch_headers(&mut self, message_no: u32) -> Result<Message> {
        self.command(&format!("TOP {message_no} 0")).await?;
        self.read_message(true).await
    }

    /// `DELE n`: mark one message as deleted.
    pub async fn remove(&mut self, message_no: u32) -> Result<()> {
        self.command(&format!("DELE {message_no}")).await?;
        Ok(())
    }

    /// RFC 2595 `STLS`: negotiate TLS on the open connection.
    pub async fn stls(&mut self) -> Result<()> {
        self.command("STLS").await?;
        let tls_options = self.tls_options.clone();
        self.dialog.upgrade_tls(&tls_options).await?;
        Ok(())
    }

    /// Say goodbye; the server commits pending deletions on QUIT.
    pub async fn quit(&mut self) -> Result<()> {
        self.command("QUIT").await?;
        self.dialog.close();
        Ok(())
    }

    async fn read_greeting(&mut self) -> Result<String> {
        let line = self.dialog.receive().await?;
        let (ok, text) = parse_status(&line)?;
        if !ok {
            return Err(Pop3Error::Rejected(text));
        }
        Ok(text)
    }

    async fn auth_login(&mut self, username: &str, password: &str) -> Result<()> {
        self.command(&format!("USER {username}")).await?;
        self.command(&format!("PASS {password}")).await?;
        Ok(())
    }

    /// Stream a dot-terminated message body into the line parser.
    /// Runs of blank lines inside the message are preserved; the blank
    /// line preceding the terminating dot belongs to the framing and is
    /// dropped.
    async fn read_message(&mut self, header_only: bool) -> Result<Message> {
        let mut message = Message::new();
        let mut pending_empty = false;
        loop {
            let line = self.dialog.receive().await?;
            if line == END_OF_MESSAGE {
                if header_only {
                    message.parse_by_line("", false)?;
                }
                message.parse_by_line(END_OF_LINE, false)?;
                break;
            } else if line.is_empty() {
                if pending_empty {
                    message.parse_by_line("", false)?;
                } else {
                    pending_empty = true;
                }
            } else {
                if pending_empty {
                    message.parse_by_line("", false)?;
                    pending_empty = false;
                }
                message.parse_by_line(&line, true)?;
            }
        }
        Ok(message)
    }

    async fn command(&mut self, line: &str) -> Result<String> {
        self.dialog.send(line).await?;
        let reply = self.dialog.receive().await?;
        let (ok, text) = parse_status(&reply)?;
        if !ok {
            return Err(Pop3Error::Rejected(text));
        }
        Ok(text)
    }
}

fn parse_scan_listing(line: &str) -> Result<(u32, u64)> {
    let (msg_no, size) = line
        .split_once(' ')
        .ok_or_else(|| Pop3Error::Parse(line.to_string()))?;
    Ok((
        msg_no.parse().map_err(|_| Pop3Error::Parse(line.to_string()))?,
        size.trim()
            .parse()
            .map_err(|_| Pop3Error::Parse(line.to_string()))?,
    ))
}

fn parse_uid_listing(line: &str) -> Result<(u32, String)> {
    let (msg_no, uid) = line
        .split_once(' ')
        .ok_or_else(|| Pop3Error::Parse(line.to_string()))?;
    Ok((
        msg_no.parse().map_err(|_| Pop3Error::Parse(line.to_string()))?,
        uid.trim().to_string(),
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[test]
    fn status_words() {
        k9::assert_equal!(
            parse_status("+OK 2 messages").unwrap(),
            (true, "2 messages".to_string())
        );
        k9::assert_equal!(
            parse_status("-ERR no such message").unwrap(),
            (false, "no such message".to_string())
        );
        k9::assert_equal!(parse_status("+OK").unwrap(), (true, String::new()));
        assert!(parse_status("+ok lowercase").is_err());
        assert!(parse_status("250 nope").is_err());
    }

    async fn read_line(server: &mut DuplexStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            server.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            if byte[0] != b'\r' {
                line.push(byte[0]);
            }
        }
        String::from_utf8(line).unwrap()
    }

    fn test_client(stream: DuplexStream) -> Pop3Client {
        Pop3Client::with_dialog(Dialog::with_stream(stream, "test", None))
    }

    #[tokio::test]
    async fn authenticate_user_pass() {
        let (stream, mut server) = tokio::io::duplex(4096);
        let mut client = test_client(stream);

        let script = tokio::spawn(async move {
            server.write_all(b"+OK pop3.test ready\r\n").await.unwrap();
            k9::assert_equal!(read_line(&mut server).await, "USER user");
            server.write_all(b"+OK\r\n").await.unwrap();
            k9::assert_equal!(read_line(&mut server).await, "PASS pass");
            server.write_all(b"+OK logged in\r\n").await.unwrap();
            server
        });

        let greeting = client
            .authenticate("user", "pass", AuthMethod::Login)
            .await
            .unwrap();
        k9::assert_equal!(greeting, "pop3.test ready");
        script.await.unwrap();
    }

    #[tokio::test]
    async fn bad_password_is_rejected() {
        let (stream, mut server) = tokio::io::duplex(4096);
        let mut client = test_client(stream);

        let script = tokio::spawn(async move {
            server.write_all(b"+OK ready\r\n").await.unwrap();
            k9::assert_equal!(read_line(&mut server).await, "USER user");
            server.write_all(b"+OK\r\n").await.unwrap();
            k9::assert_equal!(read_line(&mut server).await, "PASS wrong");
            server.write_all(b"-ERR invalid password\r\n").await.unwrap();
            server
        });

        let err = client
            .authenticate("user", "wrong", AuthMethod::Login)
            .await
            .unwrap_err();
        match err {
            Pop3Error::Rejected(text) => { k9::assert_equal!(text, "invalid password"); }
            other => panic!("unexpected error {other:?}"),
        }
        script.await.unwrap();
    }

    #[tokio::test]
    async fn list_all_messages() {
        let (stream, mut server) = tokio::io::duplex(4096);
        let mut client = test_client(stream);

        let script = tokio::spawn(async move {
            k9::assert_equal!(read_line(&mut server).await, "LIST");
            server
                .write_all(b"+OK 3 messages\r\n1 120\r\n2 4500\r\n3 77\r\n.\r\n")
                .await
                .unwrap();
            server
        });

        let listing = client.list(None).await.unwrap();
        k9::assert_equal!(listing.len(), 3);
        k9::assert_equal!(listing[&1], 120);
        k9::assert_equal!(listing[&2], 4500);
        k9::assert_equal!(listing[&3], 77);
        script.await.unwrap();
    }

    #[tokio::test]
    async fn list_single_message() {
        let (stream, mut server) = tokio::io::duplex(4096);
        let mut client = test_client(stream);

        let script = tokio::spawn(async move {
            k9::assert_equal!(read_line(&mut server).await, "LIST 2");
            server.write_all(b"+OK 2 4500\r\n").await.unwrap();
            server
        });

        let listing = client.list(Some(2)).await.unwrap();
        k9::assert_equal!(listing.len(), 1);
        k9::assert_equal!(listing[&2], 4500);
        script.await.unwrap();
    }

    #[tokio::test]
    async fn uidl_listing() {
        let (stream, mut server) = tokio::io::duplex(4096);
        let mut client = test_client(stream);

        let script = tokio::spawn(async move {
            k9::assert_equal!(read_line(&mut server).await, "UIDL");
            server
                .write_all(b"+OK\r\n1 whqtswO00WBw418f9t5JxYwZ\r\n2 QhdPYR:00WBw1Ph7x7\r\n.\r\n")
                .await
                .unwrap();
            server
        });

        let listing = client.uidl(None).await.unwrap();
        k9::assert_equal!(listing[&1], "whqtswO00WBw418f9t5JxYwZ");
        k9::assert_equal!(listing[&2], "QhdPYR:00WBw1Ph7x7");
        script.await.unwrap();
    }

    #[tokio::test]
    async fn statistics() {
        let (stream, mut server) = tokio::io::duplex(4096);
        let mut client = test_client(stream);

        let script = tokio::spawn(async move {
            k9::assert_equal!(read_line(&mut server).await, "STAT");
            server.write_all(b"+OK 2 320\r\n").await.unwrap();
            server
        });

        let stat = client.statistics().await.unwrap();
        k9::assert_equal!(stat, MailboxStat { messages: 2, size: 320 });
        script.await.unwrap();
    }

    #[tokio::test]
    async fn fetch_parses_streamed_message() {
        let (stream, mut server) = tokio::io::duplex(8192);
        let mut client = test_client(stream);

        let script = tokio::spawn(async move {
            k9::assert_equal!(read_line(&mut server).await, "RETR 1");
            server.write_all(b"+OK message follows\r\n").await.unwrap();
            server
                .write_all(
                    b"From: sender@mailio.dev\r\n\
                      Subject: fetched\r\n\
                      \r\n\
                      first line\r\n\
                      \r\n\
                      ..dot stuffed\r\n\
                      last line\r\n\
                      .\r\n",
                )
                .await
                .unwrap();
            server
        });

        let message = client.fetch(1).await.unwrap();
        k9::assert_equal!(message.subject().to_lossy_string(), "fetched");
        k9::assert_equal!(message.from().addresses[0].addr, "sender@mailio.dev");
        k9::assert_equal!(
            message.content(),
            b"first line\r\n\r\n.dot stuffed\r\nlast line"
        );
        script.await.unwrap();
    }

    #[tokio::test]
    async fn fetch_headers_only() {
        let (stream, mut server) = tokio::io::duplex(8192);
        let mut client = test_client(stream);

        let script = tokio::spawn(async move {
            k9::assert_equal!(read_line(&mut server).await, "TOP 3 0");
            server.write_all(b"+OK headers follow\r\n").await.unwrap();
            server
                .write_all(b"From: sender@mailio.dev\r\nSubject: just headers\r\n.\r\n")
                .await
                .unwrap();
            server
        });

        let message = client.fetch_headers(3).await.unwrap();
        k9::assert_equal!(message.subject().to_lossy_string(), "just headers");
        k9::assert_equal!(message.content(), b"");
        script.await.unwrap();
    }

    #[tokio::test]
    async fn remove_message() {
        let (stream, mut server) = tokio::io::duplex(4096);
        let mut client = test_client(stream);

        let script = tokio::spawn(async move {
            k9::assert_equal!(read_line(&mut server).await, "DELE 4");
            server.write_all(b"+OK marked\r\n").await.unwrap();
            k9::assert_equal!(read_line(&mut server).await, "QUIT");
            server.write_all(b"+OK bye\r\n").await.unwrap();
            server
        });

        client.remove(4).await.unwrap();
        client.quit().await.unwrap();
        script.await.unwrap();
    }
}
