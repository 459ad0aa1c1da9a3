//! SMTP session handler

use anyhow::Result;
use icemail_common::config::SmtpConfig;
use icemail_common::types::{EmailAddress, Envelope};
use icemail_common::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

use super::MessageHandler;

/// SMTP session state
#[derive(Debug, Clone, PartialEq)]
enum SessionState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

/// Outcome of reading a DATA section
enum DataOutcome {
    Complete(Vec<u8>),
    TooLarge,
}

/// SMTP session handler
pub struct SmtpHandler {
    config: Arc<SmtpConfig>,
    handler: Arc<dyn MessageHandler>,
    peer: String,
}

impl SmtpHandler {
    /// Create a new handler
    pub fn new(config: Arc<SmtpConfig>, handler: Arc<dyn MessageHandler>, peer: String) -> Self {
        Self {
            config,
            handler,
            peer,
        }
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connection_timeout_secs)
    }

    /// Handle an SMTP session over any byte stream
    pub async fn handle<S: AsyncRead + AsyncWrite + Unpin>(self, stream: S) -> Result<()> {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let mut state = SessionState::Connected;
        let mut envelope = self.new_envelope();

        self.send_response(&mut writer, 220, &format!("{} ESMTP icemail", self.config.hostname))
            .await?;

        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = tokio::time::timeout(self.idle_timeout(), reader.read_until(b'\n', &mut buf)).await;
            let bytes_read = match read {
                Ok(result) => result?,
                Err(_) => {
                    info!("Client {} idle, closing", self.peer);
                    self.send_response(&mut writer, 421, "4.4.2 Idle timeout, closing connection")
                        .await?;
                    break;
                }
            };

            if bytes_read == 0 {
                debug!("Client {} disconnected", self.peer);
                break;
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            debug!("SMTP from {}: {}", self.peer, line);

            let (command, args) = parse_command(line);

            match command.to_uppercase().as_str() {
                "HELO" => {
                    envelope = self.new_envelope();
                    envelope.helo = Some(args.to_string());
                    state = SessionState::Greeted;
                    self.send_response(&mut writer, 250, &format!("{} Hello {}", self.config.hostname, args))
                        .await?;
                }

                "EHLO" => {
                    envelope = self.new_envelope();
                    envelope.helo = Some(args.to_string());
                    state = SessionState::Greeted;

                    let responses = [
                        format!("{} Hello {}", self.config.hostname, args),
                        format!("SIZE {}", self.config.max_message_size),
                        "8BITMIME".to_string(),
                        "PIPELINING".to_string(),
                        "ENHANCEDSTATUSCODES".to_string(),
                    ];
                    for (i, resp) in responses.iter().enumerate() {
                        if i == responses.len() - 1 {
                            self.send_response(&mut writer, 250, resp).await?;
                        } else {
                            self.send_response_continue(&mut writer, 250, resp).await?;
                        }
                    }
                }

                "MAIL" => {
                    if state != SessionState::Greeted {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    match parse_mail_from(args) {
                        Some(from) => {
                            envelope.from = from;
                            envelope.to.clear();
                            state = SessionState::MailFrom;
                            self.send_response(&mut writer, 250, "2.1.0 OK").await?;
                        }
                        None => {
                            self.send_response(&mut writer, 501, "5.1.7 Bad sender address syntax")
                                .await?;
                        }
                    }
                }

                "RCPT" => {
                    if state != SessionState::MailFrom && state != SessionState::RcptTo {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    if envelope.to.len() >= self.config.max_recipients {
                        self.send_response(&mut writer, 452, "4.5.3 Too many recipients")
                            .await?;
                        continue;
                    }

                    match parse_rcpt_to(args) {
                        Some(to) => {
                            envelope.to.push(to);
                            state = SessionState::RcptTo;
                            self.send_response(&mut writer, 250, "2.1.5 OK").await?;
                        }
                        None => {
                            self.send_response(&mut writer, 501, "5.1.3 Bad recipient address syntax")
                                .await?;
                        }
                    }
                }

                "DATA" => {
                    if state != SessionState::RcptTo || envelope.to.is_empty() {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    self.send_response(&mut writer, 354, "Start mail input; end with <CRLF>.<CRLF>")
                        .await?;

                    match self.read_data(&mut reader).await? {
                        DataOutcome::Complete(data) => {
                            self.deliver(&mut writer, &envelope, &data).await?;
                        }
                        DataOutcome::TooLarge => {
                            warn!("Message from {} exceeds {} bytes", self.peer, self.config.max_message_size);
                            self.send_response(&mut writer, 552, "5.3.4 Message too big")
                                .await?;
                        }
                    }

                    // Reset state for next message
                    state = SessionState::Greeted;
                    envelope.from = None;
                    envelope.to.clear();
                }

                "RSET" => {
                    envelope.from = None;
                    envelope.to.clear();
                    if state != SessionState::Connected {
                        state = SessionState::Greeted;
                    }
                    self.send_response(&mut writer, 250, "2.0.0 OK").await?;
                }

                "NOOP" => {
                    self.send_response(&mut writer, 250, "2.0.0 OK").await?;
                }

                "QUIT" => {
                    self.send_response(&mut writer, 221, "2.0.0 Bye").await?;
                    break;
                }

                "VRFY" => {
                    self.send_response(&mut writer, 252, "2.5.2 Cannot VRFY user")
                        .await?;
                }

                _ => {
                    self.send_response(&mut writer, 500, "5.5.2 Command not recognized")
                        .await?;
                }
            }
        }

        Ok(())
    }

    fn new_envelope(&self) -> Envelope {
        Envelope {
            client_ip: Some(self.peer.clone()),
            ..Default::default()
        }
    }

    /// Pass a complete message on and reply with the outcome
    async fn deliver<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        envelope: &Envelope,
        data: &[u8],
    ) -> Result<()> {
        match self.handler.handle_message(envelope, data).await {
            Ok(id) => {
                self.send_response(writer, 250, &format!("2.0.0 OK: queued as {}", id))
                    .await
            }
            Err(Error::Parse(e)) => {
                warn!("Rejected unparseable message from {}: {}", self.peer, e);
                self.send_response(writer, 554, "5.6.0 Message could not be parsed")
                    .await
            }
            Err(e) => {
                warn!("Failed to process message from {}: {}", self.peer, e);
                self.send_response(writer, 451, "4.3.0 Temporary error").await
            }
        }
    }

    /// Read message data until <CRLF>.<CRLF>, undoing dot-stuffing.
    ///
    /// Oversized messages are read to the end and discarded.
    async fn read_data<R: AsyncBufRead + Unpin>(&self, reader: &mut R) -> Result<DataOutcome> {
        let mut data = Vec::new();
        let mut line = Vec::new();
        let mut too_large = false;

        loop {
            line.clear();
            let bytes_read = tokio::time::timeout(self.idle_timeout(), reader.read_until(b'\n', &mut line))
                .await
                .map_err(|_| anyhow::anyhow!("Idle timeout during DATA"))??;

            if bytes_read == 0 {
                return Err(anyhow::anyhow!("Connection closed during DATA"));
            }

            if line == b".\r\n" || line == b".\n" || line == b"." {
                break;
            }

            if too_large {
                continue;
            }

            let content = if line.starts_with(b"..") {
                &line[1..]
            } else {
                &line[..]
            };
            data.extend_from_slice(content);

            if data.len() > self.config.max_message_size {
                too_large = true;
                data = Vec::new();
            }
        }

        if too_large {
            Ok(DataOutcome::TooLarge)
        } else {
            Ok(DataOutcome::Complete(data))
        }
    }

    /// Send an SMTP response
    async fn send_response<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{} {}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!("SMTP to {}: {}", self.peer, response.trim());
        Ok(())
    }

    /// Send a multi-line response (intermediate line)
    async fn send_response_continue<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{}-{}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        debug!("SMTP to {}: {}", self.peer, response.trim());
        Ok(())
    }
}

/// Parse an SMTP command line into command and arguments
fn parse_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    }
}

/// Address inside `<...>`, or the first bare token
fn extract_path(addr_part: &str) -> Option<&str> {
    let addr_part = addr_part.trim();
    if addr_part.starts_with('<') {
        let end = addr_part.find('>')?;
        Some(&addr_part[1..end])
    } else {
        addr_part.split_whitespace().next()
    }
}

/// Parse MAIL FROM:<address>; `Some(None)` is the null sender
fn parse_mail_from(args: &str) -> Option<Option<EmailAddress>> {
    let args = args.trim();
    if !args.get(..5)?.eq_ignore_ascii_case("FROM:") {
        return None;
    }

    let email = extract_path(&args[5..]).unwrap_or("");
    if email.is_empty() {
        Some(None)
    } else {
        EmailAddress::parse(email).map(Some)
    }
}

/// Parse RCPT TO:<address>
fn parse_rcpt_to(args: &str) -> Option<EmailAddress> {
    let args = args.trim();
    if !args.get(..3)?.eq_ignore_ascii_case("TO:") {
        return None;
    }

    EmailAddress::parse(extract_path(&args[3..])?)
}
