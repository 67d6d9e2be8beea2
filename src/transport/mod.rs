//! Mail transport — SMTP for outbound, IMAP polling for inbound.
//!
//! The `MailTransport` trait is the seam between the scheduling logic and
//! real mail infrastructure; tests substitute an in-memory implementation.

pub mod smtp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::TransportError;
use crate::model::Inbox;

pub use smtp::SmtpImapTransport;

/// An email ready to go out through an inbox.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Message id of the mail being replied to, for threading. None for
    /// sequence sends.
    pub in_reply_to: Option<String>,
}

/// An email pulled from an inbox.
#[derive(Debug, Clone)]
pub struct InboundEmail {
    /// Message-ID header, normalized (no angle brackets).
    pub message_id: String,
    /// In-Reply-To header ids, normalized.
    pub in_reply_to: Vec<String>,
    /// References header ids, normalized.
    pub references: Vec<String>,
    pub from: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Sending and polling against one inbox's SMTP/IMAP endpoints.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Send a message through the inbox. Returns the tracking id embedded
    /// as the outgoing Message-ID, which inbound replies echo back.
    async fn send(&self, inbox: &Inbox, mail: &OutboundEmail) -> Result<String, TransportError>;

    /// Fetch messages that arrived since the checkpoint. `None` means fetch
    /// whatever the mailbox still flags as unseen. Callers dedup by message
    /// id, so overlap with previous polls is harmless.
    async fn poll(
        &self,
        inbox: &Inbox,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InboundEmail>, TransportError>;
}

/// Strip angle brackets and surrounding whitespace from a message id so the
/// same id compares equal whether it came from our own send path or a remote
/// mail client's reply headers.
pub fn normalize_message_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_brackets_and_whitespace() {
        assert_eq!(normalize_message_id(" <abc@x.com> "), "abc@x.com");
        assert_eq!(normalize_message_id("abc@x.com"), "abc@x.com");
        assert_eq!(normalize_message_id("<>"), "");
    }
}
