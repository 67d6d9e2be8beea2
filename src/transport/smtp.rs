//! Real SMTP/IMAP transport.
//!
//! Outbound mail goes through lettre's SMTP transport; inbound polling is
//! raw IMAP over rustls. Both are blocking protocols, so every network
//! operation runs inside `spawn_blocking` under a timeout.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{HeaderValue, MessageParser};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::model::Inbox;
use crate::transport::{normalize_message_id, InboundEmail, MailTransport, OutboundEmail};

/// SMTP/IMAP transport against an inbox's configured endpoints.
pub struct SmtpImapTransport {
    timeout: Duration,
}

impl SmtpImapTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Generate a tracking id for an outgoing message, scoped to the
    /// sending inbox's domain.
    fn tracking_id(inbox: &Inbox) -> String {
        let domain = inbox
            .email
            .split_once('@')
            .map(|(_, d)| d)
            .unwrap_or("mail.invalid");
        format!("{}@{}", Uuid::new_v4(), domain)
    }
}

#[async_trait]
impl MailTransport for SmtpImapTransport {
    async fn send(&self, inbox: &Inbox, mail: &OutboundEmail) -> Result<String, TransportError> {
        let tracking_id = Self::tracking_id(inbox);

        let from = inbox
            .email
            .parse()
            .map_err(|e| TransportError::InvalidAddress {
                address: inbox.email.clone(),
                reason: format!("{e}"),
            })?;
        let to = mail
            .to
            .parse()
            .map_err(|e| TransportError::InvalidAddress {
                address: mail.to.clone(),
                reason: format!("{e}"),
            })?;

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(mail.subject.clone())
            .message_id(Some(format!("<{tracking_id}>")));
        if let Some(parent) = &mail.in_reply_to {
            let parent = format!("<{}>", normalize_message_id(parent));
            builder = builder.in_reply_to(parent.clone()).references(parent);
        }
        let message = builder
            .body(mail.body.clone())
            .map_err(|e| TransportError::Send(format!("Failed to build message: {e}")))?;

        let creds = Credentials::new(
            inbox.username.clone(),
            inbox.password.expose_secret().to_string(),
        );
        let smtp_host = inbox.smtp_host.clone();
        let smtp_port = inbox.smtp_port;
        let inbox_email = inbox.email.clone();
        let smtp_timeout = self.timeout;

        let send = tokio::task::spawn_blocking(move || {
            let transport = SmtpTransport::relay(&smtp_host)
                .map_err(|e| TransportError::Connect {
                    host: smtp_host.clone(),
                    reason: format!("SMTP relay error: {e}"),
                })?
                .port(smtp_port)
                .credentials(creds)
                .timeout(Some(smtp_timeout))
                .build();

            transport.send(&message).map_err(|e| {
                if e.to_string().contains("authentication") {
                    TransportError::Auth { inbox: inbox_email }
                } else {
                    TransportError::Send(format!("SMTP send failed: {e}"))
                }
            })
        });

        match tokio::time::timeout(self.timeout + Duration::from_secs(5), send).await {
            Ok(Ok(Ok(_response))) => {
                info!(to = %mail.to, tracking_id = %tracking_id, "Email sent");
                Ok(tracking_id)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join_err)) => Err(TransportError::Send(format!("Send task failed: {join_err}"))),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }

    async fn poll(
        &self,
        inbox: &Inbox,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InboundEmail>, TransportError> {
        let endpoint = ImapEndpoint {
            host: inbox.imap_host.clone(),
            port: inbox.imap_port,
            username: inbox.username.clone(),
            password: inbox.password.expose_secret().to_string(),
            timeout: self.timeout,
        };

        let poll = tokio::task::spawn_blocking(move || fetch_imap(&endpoint, since));
        match tokio::time::timeout(self.timeout + Duration::from_secs(5), poll).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(TransportError::Poll(format!("Poll task failed: {join_err}"))),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

// ── IMAP ────────────────────────────────────────────────────────────

struct ImapEndpoint {
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn connect_tls(endpoint: &ImapEndpoint) -> Result<TlsStream, TransportError> {
    let tcp = TcpStream::connect((&*endpoint.host, endpoint.port)).map_err(|e| {
        TransportError::Connect {
            host: endpoint.host.clone(),
            reason: e.to_string(),
        }
    })?;
    tcp.set_read_timeout(Some(endpoint.timeout))
        .map_err(|e| TransportError::Connect {
            host: endpoint.host.clone(),
            reason: e.to_string(),
        })?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls::pki_types::ServerName::try_from(endpoint.host.clone()).map_err(
        |e| TransportError::Connect {
            host: endpoint.host.clone(),
            reason: format!("Invalid server name: {e}"),
        },
    )?;
    let conn =
        rustls::ClientConnection::new(tls_config, server_name).map_err(|e| {
            TransportError::Connect {
                host: endpoint.host.clone(),
                reason: format!("TLS handshake failed: {e}"),
            }
        })?;
    Ok(rustls::StreamOwned::new(conn, tcp))
}

fn read_line(tls: &mut TlsStream) -> Result<String, TransportError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err(TransportError::Poll("IMAP connection closed".into())),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(TransportError::Poll(e.to_string())),
        }
    }
}

fn send_cmd(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, TransportError> {
    let full = format!("{tag} {cmd}\r\n");
    IoWrite::write_all(tls, full.as_bytes()).map_err(|e| TransportError::Poll(e.to_string()))?;
    IoWrite::flush(tls).map_err(|e| TransportError::Poll(e.to_string()))?;
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

/// Fetch messages via raw IMAP over TLS. Blocking; callers run this inside
/// `spawn_blocking`.
fn fetch_imap(
    endpoint: &ImapEndpoint,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<InboundEmail>, TransportError> {
    let mut tls = connect_tls(endpoint)?;

    let _greeting = read_line(&mut tls)?;

    let login_resp = send_cmd(
        &mut tls,
        "A1",
        &format!("LOGIN \"{}\" \"{}\"", endpoint.username, endpoint.password),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err(TransportError::Auth {
            inbox: endpoint.username.clone(),
        });
    }

    let _select = send_cmd(&mut tls, "A2", "SELECT \"INBOX\"")?;

    // SINCE is date-granularity; overlap is fine because callers dedup by
    // message id and filter by the precise checkpoint.
    let search = match since {
        Some(ts) => format!("SEARCH SINCE {}", ts.format("%d-%b-%Y")),
        None => "SEARCH UNSEEN".to_string(),
    };
    let search_resp = send_cmd(&mut tls, "A3", &search)?;
    let mut uids: Vec<String> = Vec::new();
    for line in &search_resp {
        if line.starts_with("* SEARCH") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() > 2 {
                uids.extend(parts[2..].iter().map(|s| s.to_string()));
            }
        }
    }
    debug!(count = uids.len(), "IMAP search matched messages");

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

        match parse_inbound(raw.as_bytes()) {
            Some(mail) => results.push(mail),
            None => warn!(uid = %uid, "Skipping unparseable message"),
        }

        let store_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let _ = send_cmd(&mut tls, &store_tag, &format!("STORE {uid} +FLAGS (\\Seen)"));
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    Ok(results)
}

// ── Message parsing ─────────────────────────────────────────────────

/// Parse a raw RFC 822 message into an `InboundEmail`. Returns None when
/// the bytes are not a parseable message.
pub fn parse_inbound(raw: &[u8]) -> Option<InboundEmail> {
    let parsed = MessageParser::default().parse(raw)?;

    let message_id = parsed
        .message_id()
        .map(normalize_message_id)
        .unwrap_or_else(|| format!("missing-{}", Uuid::new_v4()));

    let from = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());

    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let body = extract_text(&parsed);

    let received_at = parsed
        .date()
        .and_then(|d| {
            chrono::NaiveDate::from_ymd_opt(d.year as i32, u32::from(d.month), u32::from(d.day))
                .and_then(|date| {
                    date.and_hms_opt(
                        u32::from(d.hour),
                        u32::from(d.minute),
                        u32::from(d.second),
                    )
                })
        })
        .map(|naive| naive.and_utc())
        .unwrap_or_else(Utc::now);

    Some(InboundEmail {
        message_id,
        in_reply_to: header_ids(parsed.header("In-Reply-To")),
        references: header_ids(parsed.header("References")),
        from,
        subject,
        body,
        received_at,
    })
}

fn header_ids(value: Option<&HeaderValue>) -> Vec<String> {
    match value {
        Some(HeaderValue::Text(t)) => vec![normalize_message_id(t.as_ref())],
        Some(HeaderValue::TextList(list)) => list
            .iter()
            .map(|t| normalize_message_id(t.as_ref()))
            .collect(),
        _ => Vec::new(),
    }
}

fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
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
