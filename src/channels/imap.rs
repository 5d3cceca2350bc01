//! IMAP email source: raw IMAP over rustls, read-only.
//!
//! The mailbox is opened with EXAMINE so fetching never changes flags;
//! deduplication is the ledger's job, not the mail server's. Works against
//! Gmail (`imap.gmail.com`, app password) and any IMAP4rev1 server.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::channels::EmailSource;
use crate::config::{env_string, parse_env};
use crate::error::{ConfigError, SourceError};
use crate::pipeline::types::RawEmail;

// ── Configuration ───────────────────────────────────────────────────

/// IMAP source configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    /// Newest messages kept per fetch.
    pub max_messages: usize,
}

impl ImapConfig {
    /// Build config from environment variables.
    /// Returns `Ok(None)` if `EMAIL_IMAP_HOST` is not set (source disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(host) = env_string("EMAIL_IMAP_HOST") else {
            return Ok(None);
        };
        let username = env_string("EMAIL_USERNAME")
            .ok_or_else(|| ConfigError::MissingEnvVar("EMAIL_USERNAME".into()))?;
        let password = env_string("EMAIL_PASSWORD")
            .ok_or_else(|| ConfigError::MissingEnvVar("EMAIL_PASSWORD".into()))?;

        Ok(Some(Self {
            host,
            port: parse_env("EMAIL_IMAP_PORT", 993)?,
            username,
            password: SecretString::from(password),
            mailbox: env_string("EMAIL_MAILBOX").unwrap_or_else(|| "INBOX".into()),
            max_messages: parse_env("EMAIL_MAX_MESSAGES", 50)?,
        }))
    }
}

// ── Source ──────────────────────────────────────────────────────────

/// Email source that reads a mailbox over IMAPS.
pub struct ImapSource {
    config: ImapConfig,
    timeout: Duration,
}

impl ImapSource {
    pub fn new(config: ImapConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }
}

#[async_trait]
impl EmailSource for ImapSource {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch(&self, since: DateTime<Utc>) -> Result<Vec<RawEmail>, SourceError> {
        let cfg = self.config.clone();
        let timeout = self.timeout;
        let emails = tokio::task::spawn_blocking(move || fetch_since(&cfg, since, timeout))
            .await
            .map_err(|e| SourceError::Protocol(format!("IMAP task failed: {e}")))??;

        info!(
            host = %self.config.host,
            mailbox = %self.config.mailbox,
            count = emails.len(),
            "Fetched emails"
        );
        Ok(emails)
    }
}

// ── IMAP session ────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Tagged response lines plus any literals (`{n}` payloads) received with them.
#[derive(Debug, Default)]
struct Reply {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// One authenticated-or-not IMAP connection. Blocking; run in `spawn_blocking`.
struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
    timeout: Duration,
}

impl ImapSession {
    fn connect(config: &ImapConfig, timeout: Duration) -> Result<Self, SourceError> {
        let connect_err = |reason: String| SourceError::Connect {
            host: config.host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| connect_err(format!("invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(format!("TLS setup failed: {e}")))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
            timeout,
        };
        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(connect_err(format!("unexpected greeting: {}", greeting.trim())));
        }
        Ok(session)
    }

    fn io_error(&self, e: std::io::Error) -> SourceError {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                SourceError::Timeout(self.timeout)
            }
            _ => SourceError::Io(e),
        }
    }

    fn read_line(&mut self) -> Result<String, SourceError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(SourceError::Protocol("IMAP connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).into_owned());
                    }
                }
                Err(e) => return Err(self.io_error(e)),
            }
        }
    }

    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, SourceError> {
        let mut buf = vec![0u8; len];
        self.tls.read_exact(&mut buf).map_err(|e| self.io_error(e))?;
        Ok(buf)
    }

    /// Send a command and collect everything up to its tagged completion.
    /// A tagged `NO` or `BAD` becomes a protocol error.
    fn command(&mut self, cmd: &str) -> Result<Reply, SourceError> {
        let tag = format!("S{}", self.next_tag);
        self.next_tag += 1;

        let line = format!("{tag} {cmd}\r\n");
        self.tls
            .write_all(line.as_bytes())
            .and_then(|()| self.tls.flush())
            .map_err(|e| self.io_error(e))?;

        let mut reply = Reply::default();
        loop {
            let line = self.read_line()?;
            if let Some(len) = literal_len(&line) {
                let literal = self.read_exact(len)?;
                reply.literals.push(literal);
            }
            if let Some(status) = line.strip_prefix(&tag) {
                let status = status.trim();
                if !status.starts_with("OK") {
                    let verb = cmd.split_whitespace().next().unwrap_or(cmd);
                    return Err(SourceError::Protocol(format!("{verb} failed: {status}")));
                }
                reply.lines.push(line);
                return Ok(reply);
            }
            reply.lines.push(line);
        }
    }
}

/// Byte count of a literal announced at the end of a response line.
fn literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches("\r\n");
    let open = trimmed.rfind('{')?;
    let inner = trimmed[open + 1..].strip_suffix('}')?;
    inner.trim_end_matches('+').parse().ok()
}

/// Quote a string for use as an IMAP quoted argument.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// IMAP `SEARCH SINCE` takes a date in `d-Mon-yyyy` form.
fn imap_date(dt: DateTime<Utc>) -> String {
    dt.format("%-d-%b-%Y").to_string()
}

/// UIDs from the untagged `* SEARCH` lines of a reply.
fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// Fetch messages received at or after `since` (blocking).
fn fetch_since(
    config: &ImapConfig,
    since: DateTime<Utc>,
    timeout: Duration,
) -> Result<Vec<RawEmail>, SourceError> {
    let mut session = ImapSession::connect(config, timeout)?;

    session
        .command(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))
        .map_err(|e| SourceError::Connect {
            host: config.host.clone(),
            reason: format!("login rejected: {e}"),
        })?;
    session.command(&format!("EXAMINE {}", quote(&config.mailbox)))?;

    let search = session.command(&format!("UID SEARCH SINCE {}", imap_date(since)))?;
    let mut uids = parse_search(&search.lines);
    uids.sort_unstable();
    if uids.len() > config.max_messages {
        uids.drain(..uids.len() - config.max_messages);
    }
    debug!(candidates = uids.len(), since = %since, "IMAP search complete");

    let mut emails = Vec::with_capacity(uids.len());
    for uid in uids {
        let reply = session.command(&format!("UID FETCH {uid} (RFC822)"))?;
        let Some(raw) = reply.literals.first() else {
            warn!(uid, "FETCH returned no message body");
            continue;
        };
        match parse_message(raw, uid) {
            Some(email) if email.received_at >= since => emails.push(email),
            Some(email) => debug!(uid, email_id = %email.id, "Skipping message older than window"),
            None => warn!(uid, "Could not parse message"),
        }
    }

    // Best effort; the data is already read.
    let _ = session.command("LOGOUT");
    Ok(emails)
}

// ── Message parsing ─────────────────────────────────────────────────

/// Turn an RFC 822 message into a `RawEmail`.
///
/// The Message-ID header is the stable id; messages without one fall back to
/// the mailbox UID.
fn parse_message(raw: &[u8], uid: u32) -> Option<RawEmail> {
    let parsed = MessageParser::default().parse(raw)?;

    let id = parsed
        .message_id()
        .map(str::to_string)
        .unwrap_or_else(|| format!("imap-{uid}"));
    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".into());
    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(RawEmail {
        id,
        sender,
        subject: parsed.subject().unwrap_or_default().trim().to_string(),
        body: extract_text(&parsed),
        received_at,
    })
}

/// Readable text from a parsed email: plain part first, then stripped HTML.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.trim().to_string();
        }
    }
    String::new()
}

/// Strip HTML tags and collapse whitespace.
fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
