//! SMTP on the asynchronous substrate: the receiving server state machine,
//! the outbound delivery client, envelope address parsing, MIME message
//! parsing, DKIM signing and the delivery queue bookkeeping.

pub mod address;
pub mod client;
pub mod config;
pub mod dkim;
pub mod parser;
pub mod queue;
pub mod server;
pub mod shared;

pub use address::parse_address;
pub use client::SmtpClient;
pub use config::MailServerConfig;
pub use parser::{parse_mail, ParsedMail};
pub use queue::{DeliveryOutcome, OutgoingQueue, OutgoingRecord};
pub use server::SmtpServer;
pub use shared::{
    MailDirection, MailKnowledge, MailStatus, MailStorage, MailUser, ParsedUser, StoreResult,
    TlsMode,
};
