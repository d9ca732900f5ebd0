//! Outgoing delivery queue over the SQL store.
//!
//! Accepted messages leave one row per non-local recipient in
//! `mail_outgoing_queue`; `deliver_message` loads the stored bytes, runs
//! the SMTP client with best-effort TLS and books the outcome back:
//! successful rows are deleted, failed ones get `retries`,
//! `last_retried_at` and `reason` updated.

use std::{collections::HashMap, rc::Rc};

use chrono::Utc;
use tracing::{debug, warn};

use strand_mysql::{FromRow, Mysql, Row, SqlValue};

use crate::{
    client::SmtpClient,
    shared::{MailKnowledge, MailStorage, TlsMode},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingRecord {
    pub user_id: u64,
    pub message_id: String,
    pub target_email: String,
    pub target_server: String,
    pub source_email: String,
    pub status: i32,
    pub retries: i32,
    pub reason: String,
}

impl FromRow for OutgoingRecord {
    fn from_row(row: &Row) -> Option<OutgoingRecord> {
        Some(OutgoingRecord {
            user_id: row.get_parsed("user_id")?,
            message_id: row.get("message_id")?.to_owned(),
            target_email: row.get("target_email")?.to_owned(),
            target_server: row.get("target_server")?.to_owned(),
            source_email: row.get("source_email").unwrap_or("").to_owned(),
            status: row.get_parsed("status").unwrap_or(0),
            retries: row.get_parsed("retries").unwrap_or(0),
            reason: row.get("reason").unwrap_or("").to_owned(),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub delivered: usize,
    pub failures: HashMap<String, String>,
}

pub struct OutgoingQueue {
    db: Rc<Mysql>,
    storage: Rc<dyn MailStorage>,
}

impl OutgoingQueue {
    pub fn new(db: Rc<Mysql>, storage: Rc<dyn MailStorage>) -> Rc<OutgoingQueue> {
        Rc::new(OutgoingQueue { db, storage })
    }

    /// One queue row per non-local recipient of a freshly stored message.
    pub async fn enqueue(
        &self,
        mail: &MailKnowledge,
        user_id: u64,
        message_id: &str,
    ) -> Result<usize, String> {
        let source = mail
            .from
            .as_ref()
            .map(|from| from.original_email.clone())
            .unwrap_or_default();
        let mut queued = 0;
        for recipient in mail.to.iter().filter(|recipient| !recipient.local) {
            self.db
                .exec(
                    "INSERT INTO mail_outgoing_queue(\
                     user_id, message_id, target_email, target_server, source_email, \
                     status, retries, reason) \
                     VALUES({}, {}, {}, {}, {}, {}, {}, {})",
                    &[
                        SqlValue::UInt(user_id),
                        message_id.into(),
                        recipient.original_email.clone().into(),
                        recipient.original_email_server.clone().into(),
                        source.clone().into(),
                        SqlValue::Int(0), // sent
                        SqlValue::Int(0),
                        "".into(),
                    ],
                )
                .await
                .map_err(|e| e.to_string())?;
            queued += 1;
        }
        debug!(message_id, queued, "outgoing rows inserted");
        Ok(queued)
    }

    /// Attempt delivery of one queued message and record the results.
    pub async fn deliver_message(
        &self,
        user_id: u64,
        message_id: &str,
        client: &Rc<SmtpClient>,
    ) -> Result<DeliveryOutcome, String> {
        let records: Vec<OutgoingRecord> = self
            .db
            .select(
                "SELECT * FROM mail_outgoing_queue \
                 WHERE user_id = {} AND message_id = {}",
                &[SqlValue::UInt(user_id), message_id.into()],
            )
            .await
            .map_err(|e| e.to_string())?;
        if records.is_empty() {
            return Ok(DeliveryOutcome::default());
        }

        let data = self.storage.load_message(user_id, message_id).await?;
        let mut mail = MailKnowledge::new();
        mail.data = data;
        mail.from = crate::address::parse_address(
            &format!("<{}>", records[0].source_email),
            &crate::config::MailServerConfig::default(),
        );

        let recipients: Vec<String> = records
            .iter()
            .map(|record| record.target_email.clone())
            .collect();
        let failures = client
            .deliver_mail(&mail, &recipients, TlsMode::BestEffort)
            .await;

        let mut delivered = 0;
        for record in &records {
            match failures.get(&record.target_email) {
                None => {
                    delivered += 1;
                    self.db
                        .exec(
                            "DELETE FROM mail_outgoing_queue \
                             WHERE user_id = {} AND message_id = {} AND target_email = {} \
                             LIMIT 1",
                            &[
                                SqlValue::UInt(user_id),
                                message_id.into(),
                                record.target_email.clone().into(),
                            ],
                        )
                        .await
                        .map_err(|e| e.to_string())?;
                }
                Some(reason) => {
                    warn!(
                        recipient = record.target_email.as_str(),
                        reason = reason.as_str(),
                        "delivery failed"
                    );
                    self.db
                        .exec(
                            "UPDATE mail_outgoing_queue \
                             SET retries = retries + 1, last_retried_at = {}, reason = {} \
                             WHERE user_id = {} AND message_id = {} AND target_email = {} \
                             LIMIT 1",
                            &[
                                Utc::now().format("%Y-%m-%d %H:%M:%S").to_string().into(),
                                reason.clone().into(),
                                SqlValue::UInt(user_id),
                                message_id.into(),
                                record.target_email.clone().into(),
                            ],
                        )
                        .await
                        .map_err(|e| e.to_string())?;
                }
            }
        }

        Ok(DeliveryOutcome {
            delivered,
            failures,
        })
    }
}
