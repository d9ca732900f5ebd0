//! Types shared across the SMTP server, delivery client and queue, plus the
//! storage collaborator contract.

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailDirection {
    Inbound = 0,
    Outbound = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailStatus {
    Sent = 0,
    Delivered = 1,
    Seen = 2,
}

/// STARTTLS policy for outbound delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsMode {
    Never,
    BestEffort,
    Always,
}

/// A mailbox account as the storage collaborator knows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailUser {
    pub user_id: u64,
    pub email: String,
    pub used_space: u64,
    pub quota: u64,
}

/// One side of an envelope after address parsing.
#[derive(Clone, Debug)]
pub struct ParsedUser {
    /// The address exactly as the peer wrote it.
    pub original_email: String,
    /// Host part of the canonical mailbox.
    pub original_email_server: String,
    /// Canonical mailbox, folder encodings stripped.
    pub email: String,
    /// Target folder encoded into the address, if any.
    pub folder: String,
    /// `SIZE=` parameter from the envelope.
    pub requested_size: u64,
    pub direction: MailDirection,
    /// Whether the mailbox host is one of the configured local domains.
    pub local: bool,
    pub authenticated: bool,
    pub user: Option<MailUser>,
}

impl PartialEq for ParsedUser {
    fn eq(&self, other: &ParsedUser) -> bool {
        self.original_email == other.original_email
    }
}

impl Eq for ParsedUser {}

impl PartialOrd for ParsedUser {
    fn partial_cmp(&self, other: &ParsedUser) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParsedUser {
    fn cmp(&self, other: &ParsedUser) -> Ordering {
        self.original_email.cmp(&other.original_email)
    }
}

/// Everything an SMTP session has learned so far. Mutated command by
/// command, reset by RSET/STARTTLS/delivery with hello/tls/client kept.
#[derive(Clone, Debug)]
pub struct MailKnowledge {
    pub hello: bool,
    pub tls: bool,
    pub created_at: DateTime<Utc>,
    pub client_name: String,
    pub client_address: String,
    pub from: Option<ParsedUser>,
    pub to: std::collections::BTreeSet<ParsedUser>,
    pub data: Vec<u8>,
}

impl Default for MailKnowledge {
    fn default() -> MailKnowledge {
        MailKnowledge {
            hello: false,
            tls: false,
            created_at: Utc::now(),
            client_name: String::new(),
            client_address: String::new(),
            from: None,
            to: std::collections::BTreeSet::new(),
            data: Vec::new(),
        }
    }
}

impl MailKnowledge {
    pub fn new() -> MailKnowledge {
        MailKnowledge::default()
    }

    /// Fresh envelope, connection-level facts retained.
    pub fn reset_keeping_session(&self) -> MailKnowledge {
        MailKnowledge {
            hello: self.hello,
            tls: self.tls,
            client_name: self.client_name.clone(),
            client_address: self.client_address.clone(),
            ..MailKnowledge::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreResult {
    pub message_id: String,
}

/// The storage collaborator. Disk layout, indexing and account persistence
/// live outside this crate; the protocol layers only need these three
/// calls.
#[async_trait(?Send)]
pub trait MailStorage {
    async fn get_user_by_email(&self, email: &str) -> Option<MailUser>;

    /// Persist a complete message; `outbounding` marks submissions from an
    /// authenticated local sender.
    async fn store_mail(
        &self,
        mail: &MailKnowledge,
        outbounding: bool,
    ) -> Result<StoreResult, String>;

    /// Raw stored bytes for redelivery.
    async fn load_message(&self, user_id: u64, message_id: &str) -> Result<Vec<u8>, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(addr: &str) -> ParsedUser {
        ParsedUser {
            original_email: addr.to_owned(),
            original_email_server: String::new(),
            email: addr.to_owned(),
            folder: String::new(),
            requested_size: 0,
            direction: MailDirection::Inbound,
            local: false,
            authenticated: false,
            user: None,
        }
    }

    #[test]
    fn recipients_deduplicate_by_original_address() {
        let mut to = std::collections::BTreeSet::new();
        to.insert(user("a@example.org"));
        to.insert(user("a@example.org"));
        to.insert(user("b@example.org"));
        assert_eq!(to.len(), 2);
    }

    #[test]
    fn reset_keeps_connection_facts_only() {
        let mut knowledge = MailKnowledge::new();
        knowledge.hello = true;
        knowledge.tls = true;
        knowledge.client_name = "relay".into();
        knowledge.from = Some(user("a@example.org"));
        knowledge.data = b"payload".to_vec();

        let fresh = knowledge.reset_keeping_session();
        assert!(fresh.hello);
        assert!(fresh.tls);
        assert_eq!(fresh.client_name, "relay");
        assert!(fresh.from.is_none());
        assert!(fresh.to.is_empty());
        assert!(fresh.data.is_empty());
    }
}
