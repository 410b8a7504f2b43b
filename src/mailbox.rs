//! Mailbox gateway — IMAP polling for inbound, SMTP via lettre for outbound.
//!
//! The pipeline consumes the `MailboxGateway` trait; `ImapMailbox` is the
//! production implementation (raw IMAP over rustls, blocking work pushed to
//! `spawn_blocking`). Tests supply in-memory gateways.
//!
//! Note on exactly-once: the gateway itself is stateless about processing.
//! Marking a message `\Seen` is best-effort hygiene; the durable cursor and
//! the unique processing record are what prevent reprocessing.

use std::collections::HashMap;
use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use uuid::Uuid;

use crate::error::MailboxError;
use crate::pipeline::types::{CursorMarker, InboundEmail};

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

impl MailboxConfig {
    /// Build config from environment variables.
    /// Returns `None` if `SUPPORT_IMAP_HOST` is not set (mailbox disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("SUPPORT_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("SUPPORT_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host = std::env::var("SUPPORT_SMTP_HOST")
            .unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("SUPPORT_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("SUPPORT_EMAIL_USERNAME").unwrap_or_default();
        let password = std::env::var("SUPPORT_EMAIL_PASSWORD").unwrap_or_default();
        let from_address =
            std::env::var("SUPPORT_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
        })
    }
}

// ── Gateway trait ───────────────────────────────────────────────────

/// External mailbox collaborator — pure I/O, no pipeline logic.
#[async_trait]
pub trait MailboxGateway: Send + Sync {
    /// Fetch unseen messages, oldest-first (received_at, then id).
    ///
    /// `since` is an optimization hint; redelivery of already-processed
    /// messages is tolerated, the caller absorbs them idempotently.
    async fn fetch_unseen(
        &self,
        since: Option<&CursorMarker>,
    ) -> Result<Vec<InboundEmail>, MailboxError>;

    /// Send a reply. `in_reply_to` carries the original message id when the
    /// transport supports threading.
    async fn send_reply(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        in_reply_to: Option<&str>,
    ) -> Result<(), MailboxError>;

    /// Best-effort: mark a message read in the mailbox after it has been
    /// durably recorded. Failures are logged upstream, never fatal.
    async fn mark_processed(&self, message_id: &str) -> Result<(), MailboxError>;
}

// ── IMAP/SMTP implementation ────────────────────────────────────────

/// Production mailbox: IMAP fetch + SMTP send.
pub struct ImapMailbox {
    config: MailboxConfig,
    /// message-id → IMAP uid from the most recent fetch, for mark_processed.
    uid_map: Mutex<HashMap<String, String>>,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config,
            uid_map: Mutex::new(HashMap::new()),
        }
    }

    fn send_email(
        config: &MailboxConfig,
        to: &str,
        subject: &str,
        body: &str,
        in_reply_to: Option<&str>,
    ) -> Result<(), MailboxError> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| MailboxError::SendFailed {
                to: to.into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        let mut builder = Message::builder()
            .from(config.from_address.parse().map_err(|e| MailboxError::SendFailed {
                to: to.into(),
                reason: format!("Invalid from address: {e}"),
            })?)
            .to(to.parse().map_err(|e| MailboxError::SendFailed {
                to: to.into(),
                reason: format!("Invalid to address: {e}"),
            })?)
            .subject(subject);

        if let Some(orig_id) = in_reply_to {
            builder = builder.in_reply_to(orig_id.to_string());
        }

        let email = builder
            .body(body.to_string())
            .map_err(|e| MailboxError::SendFailed {
                to: to.into(),
                reason: format!("Failed to build email: {e}"),
            })?;

        transport.send(&email).map_err(|e| MailboxError::SendFailed {
            to: to.into(),
            reason: format!("SMTP send failed: {e}"),
        })?;

        tracing::info!(to, "Reply sent");
        Ok(())
    }
}

#[async_trait]
impl MailboxGateway for ImapMailbox {
    async fn fetch_unseen(
        &self,
        since: Option<&CursorMarker>,
    ) -> Result<Vec<InboundEmail>, MailboxError> {
        let cfg = self.config.clone();
        let fetched = tokio::task::spawn_blocking(move || fetch_unseen_imap(&cfg))
            .await
            .map_err(|e| MailboxError::Fetch(format!("fetch task panicked: {e}")))?
            .map_err(|e| MailboxError::Fetch(e.to_string()))?;

        {
            let mut map = self.uid_map.lock().unwrap();
            for (uid, msg, _raw) in &fetched {
                map.insert(msg.id.clone(), uid.clone());
            }
        }

        let mut messages: Vec<InboundEmail> = fetched
            .into_iter()
            .map(|(_, msg, _)| msg)
            .filter(|m| since.is_none_or(|marker| marker.is_before(m)))
            .collect();
        messages.sort_by(|a, b| (a.received_at, &a.id).cmp(&(b.received_at, &b.id)));
        Ok(messages)
    }

    async fn send_reply(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        in_reply_to: Option<&str>,
    ) -> Result<(), MailboxError> {
        let cfg = self.config.clone();
        let (to, subject, body) = (to.to_string(), subject.to_string(), body.to_string());
        let in_reply_to = in_reply_to.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            Self::send_email(&cfg, &to, &subject, &body, in_reply_to.as_deref())
        })
        .await
        .map_err(|e| MailboxError::SendFailed {
            to: "unknown".into(),
            reason: format!("send task panicked: {e}"),
        })?
    }

    async fn mark_processed(&self, message_id: &str) -> Result<(), MailboxError> {
        let uid = {
            let map = self.uid_map.lock().unwrap();
            map.get(message_id).cloned()
        };
        let Some(uid) = uid else {
            // Not from the last fetch — nothing to mark.
            return Ok(());
        };

        let cfg = self.config.clone();
        tokio::task::spawn_blocking(move || mark_seen_imap(&cfg, &uid))
            .await
            .map_err(|e| MailboxError::Fetch(format!("mark task panicked: {e}")))?
            .map_err(|e| MailboxError::Fetch(e.to_string()))
    }
}

// ── Parsing helpers (public for testing) ────────────────────────────

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

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part) {
            if ct.ctype() == "text" {
                if let Ok(text) = std::str::from_utf8(part.contents()) {
                    return text.to_string();
                }
            }
        }
    }
    "(no readable content)".to_string()
}

/// Error type for blocking IMAP operations.
type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn connect_tls(config: &MailboxConfig) -> Result<TlsStream, ImapError> {
    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = std::sync::Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name: rustls::pki_types::ServerName<'_> =
        rustls::pki_types::ServerName::try_from(config.imap_host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    Ok(rustls::StreamOwned::new(conn, tcp))
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

fn login_and_select(tls: &mut TlsStream, config: &MailboxConfig) -> Result<(), ImapError> {
    let _greeting = read_line(tls)?;

    let login_resp = send_cmd(
        tls,
        "A1",
        &format!("LOGIN \"{}\" \"{}\"", config.username, config.password),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err("IMAP login failed".into());
    }

    let _select = send_cmd(tls, "A2", "SELECT \"INBOX\"")?;
    Ok(())
}

/// A fetched email: (imap uid, parsed message, raw size).
type FetchedEmail = (String, InboundEmail, usize);

/// Fetch unseen emails via raw IMAP over TLS (blocking — run in
/// spawn_blocking). Does NOT mark anything `\Seen`.
fn fetch_unseen_imap(config: &MailboxConfig) -> Result<Vec<FetchedEmail>, ImapError> {
    let mut tls = connect_tls(config)?;
    login_and_select(&mut tls, config)?;

    let search_resp = send_cmd(&mut tls, "A3", "SEARCH UNSEEN")?;
    let mut uids: Vec<String> = Vec::new();
    for line in &search_resp {
        if line.starts_with("* SEARCH") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() > 2 {
                uids.extend(parts[2..].iter().map(|s| s.to_string()));
            }
        }
    }

    let mut results = Vec::new();
    let mut tag_counter = 4_u32;

    for uid in &uids {
        let fetch_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch_resp = send_cmd(&mut tls, &fetch_tag, &format!("FETCH {uid} RFC822"))?;

        let raw: String = fetch_resp
            .iter()
            .skip(1)
            .take(fetch_resp.len().saturating_sub(2))
            .cloned()
            .collect();

        if let Some(parsed) = MessageParser::default().parse(raw.as_bytes()) {
            let sender = extract_sender(&parsed);
            let subject = parsed.subject().unwrap_or("(no subject)").to_string();
            let body = extract_text(&parsed);
            let id = parsed
                .message_id()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

            let received_at = parsed
                .date()
                .and_then(|d| {
                    chrono::NaiveDate::from_ymd_opt(
                        d.year as i32,
                        u32::from(d.month),
                        u32::from(d.day),
                    )
                    .and_then(|date| {
                        date.and_hms_opt(
                            u32::from(d.hour),
                            u32::from(d.minute),
                            u32::from(d.second),
                        )
                    })
                    .map(|n| n.and_utc())
                })
                .unwrap_or_else(chrono::Utc::now);

            results.push((
                uid.clone(),
                InboundEmail {
                    id,
                    sender,
                    subject,
                    body,
                    received_at,
                },
                raw.len(),
            ));
        }
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    Ok(results)
}

/// Mark one message `\Seen` (blocking).
fn mark_seen_imap(config: &MailboxConfig, uid: &str) -> Result<(), ImapError> {
    let mut tls = connect_tls(config)?;
    login_and_select(&mut tls, config)?;
    let _ = send_cmd(&mut tls, "A3", &format!("STORE {uid} +FLAGS (\\Seen)"))?;
    let _ = send_cmd(&mut tls, "A4", "LOGOUT");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
    }

    #[test]
    fn strip_html_normalizes_whitespace() {
        assert_eq!(
            strip_html("<div>Hello</div>\n\n  <span>world</span>"),
            "Hello world"
        );
    }

    #[test]
    fn strip_html_plain_text_untouched() {
        assert_eq!(strip_html("no tags here"), "no tags here");
    }

    #[test]
    fn config_from_env_disabled_without_host() {
        // SUPPORT_IMAP_HOST unset in the test environment.
        if std::env::var("SUPPORT_IMAP_HOST").is_err() {
            assert!(MailboxConfig::from_env().is_none());
        }
    }
}
