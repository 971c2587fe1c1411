//! Email channel: IMAP polling for inbound mail, SMTP via lettre for
//! approved replies.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::pipeline::collaborators::{MailFetcher, ReplyDispatcher};
use crate::pipeline::types::FetchedMail;

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub poll_interval_secs: u64,
    /// Sender allowlist. `*` accepts everyone (the default).
    pub allowed_senders: Vec<String>,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (mailbox disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        let poll_interval_secs: u64 = std::env::var("EMAIL_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let allowed_senders: Vec<String> = std::env::var("EMAIL_ALLOWED_SENDERS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            poll_interval_secs,
            allowed_senders,
        })
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

/// [`MailFetcher`] over IMAP.
///
/// Messages are fetched with `BODY.PEEK[]`, which leaves them unseen. They
/// are flagged `\Seen` only through [`MailFetcher::acknowledge`], after the
/// store has accepted them. Deduplication by `Message-ID` happens in the
/// store.
pub struct ImapFetcher {
    config: EmailConfig,
    /// UIDs of fetched but not yet acknowledged messages, by external id.
    unacknowledged: Mutex<HashMap<String, String>>,
}

impl ImapFetcher {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            unacknowledged: Mutex::new(HashMap::new()),
        }
    }
}

/// Drop self-sent mail and senders outside the allowlist.
fn accept(config: &EmailConfig, mail: &FetchedMail) -> bool {
    if mail.sender.eq_ignore_ascii_case(&config.from_address) {
        debug!(sender = %mail.sender, "Skipping self-sent email");
        return false;
    }
    if !is_sender_allowed(&config.allowed_senders, &mail.sender) {
        warn!(sender = %mail.sender, "Blocked email from sender outside allowlist");
        return false;
    }
    true
}

#[async_trait]
impl MailFetcher for ImapFetcher {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch_new(&self) -> Result<Vec<FetchedMail>, ChannelError> {
        let cfg = self.config.clone();
        let fetched = tokio::task::spawn_blocking(move || fetch_unseen_imap(&cfg))
            .await
            .map_err(|e| ChannelError::FetchFailed {
                name: "imap".into(),
                reason: format!("fetch task panicked: {e}"),
            })?
            .map_err(|e| ChannelError::FetchFailed {
                name: "imap".into(),
                reason: e.to_string(),
            })?;

        let mut pending = self
            .unacknowledged
            .lock()
            .map_err(|_| ChannelError::FetchFailed {
                name: "imap".into(),
                reason: "acknowledgement map poisoned".into(),
            })?;
        let accepted: Vec<FetchedMail> = fetched
            .into_iter()
            .map(|(uid, mail)| {
                pending.insert(mail.external_id.clone(), uid);
                mail
            })
            .collect();
        debug!(count = accepted.len(), host = %self.config.imap_host, "IMAP fetch complete");
        Ok(accepted)
    }

    async fn acknowledge(&self, external_ids: &[String]) -> Result<(), ChannelError> {
        let uids: Vec<String> = {
            let mut pending = self
                .unacknowledged
                .lock()
                .map_err(|_| ChannelError::FetchFailed {
                    name: "imap".into(),
                    reason: "acknowledgement map poisoned".into(),
                })?;
            external_ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        if uids.is_empty() {
            return Ok(());
        }

        let cfg = self.config.clone();
        let count = uids.len();
        tokio::task::spawn_blocking(move || mark_seen_imap(&cfg, &uids))
            .await
            .map_err(|e| ChannelError::FetchFailed {
                name: "imap".into(),
                reason: format!("acknowledge task panicked: {e}"),
            })?
            .map_err(|e| ChannelError::FetchFailed {
                name: "imap".into(),
                reason: format!("failed to flag messages seen: {e}"),
            })?;
        debug!(count, "IMAP messages flagged seen");
        Ok(())
    }
}

// ── Outbound ────────────────────────────────────────────────────────

/// [`ReplyDispatcher`] over SMTP.
pub struct SmtpDispatcher {
    config: Arc<EmailConfig>,
}

impl SmtpDispatcher {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl ReplyDispatcher for SmtpDispatcher {
    async fn send_reply(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        let config = Arc::clone(&self.config);
        let (to, subject, body) = (to.to_string(), subject.to_string(), body.to_string());
        tokio::task::spawn_blocking(move || send_email(&config, &to, &subject, &body))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "email".into(),
                reason: format!("send task panicked: {e}"),
            })?
    }
}

/// Send an email via SMTP (blocking).
fn send_email(config: &EmailConfig, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.smtp_host)
        .map_err(|e| ChannelError::SendFailed {
            name: "email".into(),
            reason: format!("SMTP relay error: {e}"),
        })?
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    let email = build_message(&config.from_address, to, subject, body)?;

    transport.send(&email).map_err(|e| ChannelError::SendFailed {
        name: "email".into(),
        reason: format!("SMTP send failed: {e}"),
    })?;

    info!(to = %to, "Reply sent");
    Ok(())
}

fn build_message(from: &str, to: &str, subject: &str, body: &str) -> Result<Message, ChannelError> {
    Message::builder()
        .from(from.parse().map_err(|e| ChannelError::SendFailed {
            name: "email".into(),
            reason: format!("Invalid from address: {e}"),
        })?)
        .to(to.parse().map_err(|e| ChannelError::SendFailed {
            name: "email".into(),
            reason: format!("Invalid to address: {e}"),
        })?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| ChannelError::SendFailed {
            name: "email".into(),
            reason: format!("Failed to build email: {e}"),
        })
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Check if a sender email is in the allowlist.
///
/// - Empty list → deny all
/// - `*` in list → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact email match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a raw RFC 822 message into a [`FetchedMail`].
///
/// The external id is the `Message-ID` header. Messages without one get a
/// deterministic id from sender, date and subject so a re-fetch still
/// deduplicates.
pub fn parse_message(raw: &[u8]) -> Option<FetchedMail> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender = extract_sender(&parsed);
    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let body = extract_text(&parsed);
    let received_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);
    let external_id = match parsed.message_id() {
        Some(id) => id.to_string(),
        None => format!(
            "{sender}:{}:{subject}",
            parsed.date().map(|d| d.to_timestamp()).unwrap_or_default()
        ),
    };

    Some(FetchedMail {
        external_id,
        sender,
        subject,
        body,
        received_at,
    })
}

fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.trim().to_string();
        }
    }
    String::new()
}

type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// An authenticated IMAP session with the INBOX selected.
struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    /// Connect, log in and select the INBOX (blocking).
    fn open(config: &EmailConfig) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(config.imap_host.clone())?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)?;
        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
        };

        let _greeting = read_line(&mut session.tls)?;

        let login_resp = session.command(&format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ))?;
        if !tagged_ok(&login_resp) {
            return Err("IMAP login failed".into());
        }

        let select_resp = session.command("SELECT \"INBOX\"")?;
        if !tagged_ok(&select_resp) {
            return Err("IMAP SELECT INBOX failed".into());
        }
        Ok(session)
    }

    fn command(&mut self, cmd: &str) -> Result<Vec<String>, ImapError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;
        send_cmd(&mut self.tls, &tag, cmd)
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Fetch unseen emails via raw IMAP over TLS (blocking, run in spawn_blocking).
///
/// Returns accepted messages with their UIDs. Nothing accepted is flagged;
/// unparseable and filtered messages are flagged `\Seen` here since they
/// will never be stored.
fn fetch_unseen_imap(config: &EmailConfig) -> Result<Vec<(String, FetchedMail)>, ImapError> {
    let mut session = ImapSession::open(config)?;

    let search_resp = session.command("UID SEARCH UNSEEN")?;
    let uids = parse_search_response(&search_resp);

    let mut results = Vec::new();
    let mut discarded = Vec::new();

    for uid in uids {
        let fetch_resp = session.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        if !tagged_ok(&fetch_resp) {
            warn!(uid = %uid, "IMAP fetch refused, will retry next pass");
            continue;
        }

        let raw: String = fetch_resp
            .iter()
            .skip(1)
            .take(fetch_resp.len().saturating_sub(2))
            .cloned()
            .collect();

        match parse_message(raw.as_bytes()) {
            Some(mail) if accept(config, &mail) => results.push((uid, mail)),
            Some(_) => discarded.push(uid),
            None => {
                warn!(uid = %uid, "Unparseable message skipped");
                discarded.push(uid);
            }
        }
    }

    if !discarded.is_empty() {
        let resp = session.command(&store_seen_command(&discarded))?;
        if !tagged_ok(&resp) {
            warn!(count = discarded.len(), "Failed to flag discarded messages seen");
        }
    }

    session.logout();
    Ok(results)
}

/// Flag the given UIDs `\Seen` (blocking, run in spawn_blocking).
fn mark_seen_imap(config: &EmailConfig, uids: &[String]) -> Result<(), ImapError> {
    let mut session = ImapSession::open(config)?;
    let resp = session.command(&store_seen_command(uids))?;
    session.logout();
    if !tagged_ok(&resp) {
        return Err(format!(
            "UID STORE rejected: {}",
            resp.last().map(|l| l.trim()).unwrap_or("no response")
        )
        .into());
    }
    Ok(())
}

fn store_seen_command(uids: &[String]) -> String {
    format!("UID STORE {} +FLAGS (\\Seen)", uids.join(","))
}

/// Whether the tagged completion line (the last one) reports `OK`.
fn tagged_ok(lines: &[String]) -> bool {
    lines
        .last()
        .and_then(|l| l.split_whitespace().nth(1))
        .is_some_and(|status| status.eq_ignore_ascii_case("OK"))
}

fn read_line(tls: &mut TlsStream) -> Result<String, ImapError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err("IMAP connection closed".into()),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn send_cmd(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, ImapError> {
    let full = format!("{tag} {cmd}\r\n");
    IoWrite::write_all(tls, full.as_bytes())?;
    IoWrite::flush(tls)?;
    let mut lines = Vec::new();
    loop {
        let line = read_line(tls)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            break;
        }
    }
    Ok(lines)
}

/// Message numbers (sequence numbers or UIDs) from `* SEARCH ...` lines.
fn parse_search_response(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2))
        .map(str::to_string)
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────
