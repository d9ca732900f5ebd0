//! SMTP server session loop.
//!
//! One task per connection walks the session through
//! HELO/EHLO → STARTTLS → MAIL FROM → RCPT TO → DATA, accumulating what it
//! learns in [`MailKnowledge`] and handing the finished message to the
//! storage collaborator. Replies follow RFC-5321 framing; multi-line
//! replies use `250-` continuations.

use std::{cell::RefCell, rc::Rc, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, warn};

use strand_aio::{BufferedFd, ConnectionHandler, Context, ReadArg};

use crate::{
    address::parse_address,
    config::MailServerConfig,
    shared::{MailDirection, MailKnowledge, MailStorage},
};

const RECIPIENT_LIMIT: usize = 50;
const SIZE_LIMIT: u64 = 102_400_000;

pub struct SmtpServer {
    config: MailServerConfig,
    storage: Option<Rc<dyn MailStorage>>,
    tls: RefCell<Option<Arc<rustls::ServerConfig>>>,
}

impl SmtpServer {
    pub fn new(config: MailServerConfig, storage: Option<Rc<dyn MailStorage>>) -> Rc<SmtpServer> {
        Rc::new(SmtpServer {
            config,
            storage,
            tls: RefCell::new(None),
        })
    }

    fn tls_enabled(&self) -> bool {
        self.tls.borrow().is_some()
    }

    async fn read_line(&self, fd: &Rc<BufferedFd>) -> ReadArg {
        let line = fd.read_until(b"\r\n").await;
        if self.config.logging {
            if line.error {
                debug!(fd = %fd.name(), "<-x");
            } else {
                debug!(fd = %fd.name(), "<-- {}", String::from_utf8_lossy(&line.data));
            }
        }
        line
    }

    async fn write(&self, fd: &Rc<BufferedFd>, data: &str) -> bool {
        if self.config.logging {
            debug!(fd = %fd.name(), "--> {}", data.trim_end());
        }
        fd.write(data.as_bytes()).await
    }

    async fn session(self: Rc<Self>, _ctx: Rc<Context>, fd: Rc<BufferedFd>) {
        if !self
            .write(&fd, &format!("220 {} ESMTP\r\n", self.config.smtp_host))
            .await
        {
            return;
        }

        let peer_name = fd
            .remote_addr()
            .map(|(ip, port)| format!("{ip},{port}"))
            .unwrap_or_else(|| "failed to resolve".to_owned());
        let mut knowledge = MailKnowledge::new();

        loop {
            let line = self.read_line(&fd).await;
            if line.error {
                return;
            }
            let cmd = String::from_utf8_lossy(&line.data).into_owned();

            if let Some(client) = cmd.strip_prefix("HELO ") {
                if !self.write(&fd, &format!("250 HELO {client}\r\n")).await {
                    return;
                }
                knowledge.hello = true;
                knowledge.client_name = client.to_owned();
                knowledge.client_address = peer_name.clone();
            } else if let Some(client) = cmd.strip_prefix("EHLO ") {
                let starttls = if self.tls_enabled() && !knowledge.tls {
                    "250-STARTTLS\r\n"
                } else {
                    ""
                };
                let reply = format!(
                    "250-{} is my domain name. Hello {}!\r\n\
                     250-PIPELINING\r\n\
                     250-8BITMIME\r\n\
                     {}250 SIZE {}\r\n",
                    self.config.smtp_host, client, starttls, SIZE_LIMIT
                );
                if !self.write(&fd, &reply).await {
                    return;
                }
                knowledge.hello = true;
                knowledge.client_name = client.to_owned();
                knowledge.client_address = peer_name.clone();
            } else if cmd.starts_with("STARTTLS") {
                let tls_config = self.tls.borrow().clone();
                if !knowledge.hello {
                    if !self
                        .write(&fd, "503 HELO or EHLO was not sent previously!\r\n")
                        .await
                    {
                        return;
                    }
                } else if knowledge.tls {
                    if !self.write(&fd, "503 TLS session is already active!\r\n").await {
                        return;
                    }
                } else if let Some(tls_config) = tls_config {
                    if !self.write(&fd, "220 Go ahead!\r\n").await {
                        return;
                    }
                    let ssl = fd.clone().enable_server_ssl(tls_config).await;
                    if ssl.is_ok() {
                        knowledge = MailKnowledge::new();
                        knowledge.tls = true;
                    } else if !self
                        .write(
                            &fd,
                            &format!("501 Creating TLS session failed: {}\r\n", ssl.message),
                        )
                        .await
                    {
                        return;
                    }
                } else if !self.write(&fd, "502 Command not implemented\r\n").await {
                    return;
                }
            } else if let Some(addr) = cmd.strip_prefix("MAIL FROM:") {
                if !knowledge.hello {
                    if !self
                        .write(&fd, "503 HELO or EHLO was not sent previously!\r\n")
                        .await
                    {
                        return;
                    }
                } else if knowledge.from.is_some() {
                    if !self
                        .write(&fd, "503 MAIL FROM was already sent previously!\r\n")
                        .await
                    {
                        return;
                    }
                } else {
                    match parse_address(addr, &self.config) {
                        None => {
                            if !self.write(&fd, "501 Invalid address\r\n").await {
                                return;
                            }
                        }
                        Some(mut sender) => {
                            sender.authenticated = false;
                            sender.direction = MailDirection::Outbound;
                            if let Some(storage) = &self.storage {
                                sender.user = storage.get_user_by_email(&sender.email).await;
                            }
                            knowledge.from = Some(sender);
                            if !self.write(&fd, "250 OK\r\n").await {
                                return;
                            }
                        }
                    }
                }
            } else if let Some(addr) = cmd.strip_prefix("RCPT TO:") {
                let sender = knowledge.from.clone();
                match sender {
                    None => {
                        if !self
                            .write(&fd, "503 MAIL FROM was not sent previously!\r\n")
                            .await
                        {
                            return;
                        }
                    }
                    Some(sender) => match parse_address(addr, &self.config) {
                        None => {
                            if !self.write(&fd, "501 Invalid address\r\n").await {
                                return;
                            }
                        }
                        Some(mut recipient) => {
                            if knowledge.to.len() >= RECIPIENT_LIMIT {
                                if !self
                                    .write(
                                        &fd,
                                        &format!(
                                            "501 Limit for number of recipients is {}\r\n",
                                            RECIPIENT_LIMIT
                                        ),
                                    )
                                    .await
                                {
                                    return;
                                }
                                continue;
                            }
                            let mut accept = true;
                            if let Some(storage) = &self.storage {
                                if recipient.local {
                                    match storage.get_user_by_email(&recipient.email).await {
                                        None => {
                                            if !sender.authenticated {
                                                accept = false;
                                                if !self
                                                    .write(&fd, "511 Mailbox not found\r\n")
                                                    .await
                                                {
                                                    return;
                                                }
                                            }
                                        }
                                        Some(user) => {
                                            if user.used_space + sender.requested_size * 2
                                                > user.quota
                                            {
                                                accept = false;
                                                if !self
                                                    .write(
                                                        &fd,
                                                        "522 Recipient has exceeded mailbox limit\r\n",
                                                    )
                                                    .await
                                                {
                                                    return;
                                                }
                                            } else {
                                                recipient.user = Some(user);
                                            }
                                        }
                                    }
                                }
                            }
                            if accept {
                                knowledge.to.insert(recipient);
                                if !self.write(&fd, "250 OK\r\n").await {
                                    return;
                                }
                            }
                        }
                    },
                }
            } else if cmd.starts_with("DATA") {
                if knowledge.hello && knowledge.from.is_some() && !knowledge.to.is_empty() {
                    if !self
                        .write(
                            &fd,
                            "354 Send message content; end with <CR><LF>.<CR><LF>\r\n",
                        )
                        .await
                    {
                        return;
                    }
                    let message = fd.read_until(b"\r\n.\r\n").await;
                    if message.error {
                        return;
                    }
                    if message.data.is_empty() {
                        if !self.write(&fd, "500 Message is missing\r\n").await {
                            return;
                        }
                        continue;
                    }
                    knowledge.data = message.data;
                    let authenticated = knowledge
                        .from
                        .as_ref()
                        .map(|from| from.authenticated)
                        .unwrap_or(false);
                    let handled = match &self.storage {
                        None => Err("no storage handler".to_owned()),
                        Some(storage) => storage.store_mail(&knowledge, authenticated).await,
                    };
                    match handled {
                        Ok(stored) => {
                            debug!(message_id = stored.message_id.as_str(), "message queued");
                            knowledge = knowledge.reset_keeping_session();
                            if !self
                                .write(
                                    &fd,
                                    &format!("250 OK: Queued as {}\r\n", stored.message_id),
                                )
                                .await
                            {
                                return;
                            }
                        }
                        Err(reason) => {
                            warn!(%reason, "message not stored");
                            knowledge.data = Vec::new();
                            if !self
                                .write(
                                    &fd,
                                    &format!(
                                        "451 Server failed to handle the message. \
                                         Error: {}. Try again later\r\n",
                                        reason
                                    ),
                                )
                                .await
                            {
                                return;
                            }
                        }
                    }
                } else {
                    let mut errors = String::from("503-There were following errors:");
                    if !knowledge.hello {
                        errors += "\r\n503- No hello has been sent";
                    }
                    if knowledge.from.is_none() {
                        errors += "\r\n503- MAIL FROM has been never sent";
                    }
                    if knowledge.to.is_empty() {
                        errors += "\r\n503- There were zero recipients";
                    }
                    errors += "\r\n503 Please, fill the missing information\r\n";
                    if !self.write(&fd, &errors).await {
                        return;
                    }
                }
            } else if cmd.starts_with("RSET") {
                knowledge = knowledge.reset_keeping_session();
                if !self.write(&fd, "250 OK\r\n").await {
                    return;
                }
            } else if cmd.starts_with("QUIT") {
                let _ = self.write(&fd, "221 Bye\r\n").await;
                fd.close(true);
                return;
            } else if !self.write(&fd, "502 Invalid command\r\n").await {
                return;
            }
        }
    }
}

#[async_trait(?Send)]
impl ConnectionHandler for SmtpServer {
    async fn on_accept(self: Rc<Self>, ctx: Rc<Context>, fd: Rc<BufferedFd>) {
        self.session(ctx, fd).await;
    }

    fn on_load(&self, ctx: &Rc<Context>) {
        if self.config.tls_enabled {
            if self.config.tls_privkey.is_empty() || self.config.tls_pubkey.is_empty() {
                warn!("tls requested but pubkey/privkey missing");
                return;
            }
            match ctx.server_tls_context(&self.config.tls_pubkey, &self.config.tls_privkey) {
                Ok(tls_config) => *self.tls.borrow_mut() = Some(tls_config),
                Err(reason) => warn!(%reason, "tls unavailable"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use strand_aio::{sim::SimulatedLoop, Fd, FdKind, NodeId};

    use crate::shared::{MailUser, StoreResult};

    struct MockStorage {
        users: Vec<MailUser>,
        stored: RefCell<Vec<(MailKnowledge, bool)>>,
        fail_with: Option<&'static str>,
    }

    impl MockStorage {
        fn with_user(email: &str) -> MockStorage {
            MockStorage {
                users: vec![MailUser {
                    user_id: 1,
                    email: email.to_owned(),
                    used_space: 0,
                    quota: 1_000_000,
                }],
                stored: RefCell::new(Vec::new()),
                fail_with: None,
            }
        }
    }

    #[async_trait(?Send)]
    impl MailStorage for MockStorage {
        async fn get_user_by_email(&self, email: &str) -> Option<MailUser> {
            self.users.iter().find(|u| u.email == email).cloned()
        }

        async fn store_mail(
            &self,
            mail: &MailKnowledge,
            outbounding: bool,
        ) -> Result<StoreResult, String> {
            if let Some(reason) = self.fail_with {
                return Err(reason.to_owned());
            }
            self.stored.borrow_mut().push((mail.clone(), outbounding));
            Ok(StoreResult {
                message_id: format!("m{}", self.stored.borrow().len()),
            })
        }

        async fn load_message(&self, _user_id: u64, _message_id: &str) -> Result<Vec<u8>, String> {
            Err("not stored here".to_owned())
        }
    }

    fn config() -> MailServerConfig {
        MailServerConfig {
            smtp_host: "example.org".to_owned(),
            smtp_hosts: vec!["example.org".to_owned()],
            ..MailServerConfig::default()
        }
    }

    fn serve(storage: Rc<MockStorage>) -> (Rc<SimulatedLoop>, Rc<Context>, Fd) {
        let sim = Rc::new(SimulatedLoop::new(1));
        let node = NodeId {
            name: "localhost".into(),
            port: 2525,
            worker: 1,
            workers: 1,
        };
        let ctx = Context::new(sim.clone(), node, "master".into());
        let server = SmtpServer::new(config(), Some(storage));
        ctx.set_handler(server);
        let fd = Fd(60);
        ctx.on_accept(fd, FdKind::Socket, Some(("192.0.2.90".into(), 40000)));
        (sim, ctx, fd)
    }

    fn replies(sim: &Rc<SimulatedLoop>, fd: Fd) -> String {
        String::from_utf8(sim.written(fd)).expect("ascii")
    }

    #[test]
    fn happy_path_queues_exactly_one_message() {
        let storage = Rc::new(MockStorage::with_user("b@example.org"));
        let (sim, ctx, fd) = serve(storage.clone());

        for line in [
            &b"EHLO client.test\r\n"[..],
            b"MAIL FROM:<a@example.org>\r\n",
            b"RCPT TO:<b@example.org>\r\n",
            b"DATA\r\n",
            b"Subject: t\r\n\r\nhi\r\n.\r\n",
        ] {
            ctx.on_receive(fd, line);
        }

        let out = replies(&sim, fd);
        assert!(out.starts_with("220 example.org ESMTP\r\n"));
        assert!(out.contains("250-PIPELINING\r\n"));
        assert!(out.contains("354 Send message content"));
        assert!(out.contains("250 OK: Queued as m1\r\n"));

        let stored = storage.stored.borrow();
        assert_eq!(stored.len(), 1);
        let (mail, outbounding) = &stored[0];
        assert_eq!(mail.data, b"Subject: t\r\n\r\nhi".to_vec());
        assert_eq!(mail.from.as_ref().expect("from").email, "a@example.org");
        assert_eq!(mail.to.len(), 1);
        assert!(!outbounding);
    }

    #[test]
    fn data_arriving_in_fragments_is_reassembled() {
        let storage = Rc::new(MockStorage::with_user("b@example.org"));
        let (_sim, ctx, fd) = serve(storage.clone());

        ctx.on_receive(
            fd,
            b"HELO c\r\nMAIL FROM:<a@example.org>\r\nRCPT TO:<b@example.org>\r\nDATA\r\n",
        );
        // terminating dot split across packets
        ctx.on_receive(fd, b"line one\r\nline two");
        ctx.on_receive(fd, b"\r\n.");
        ctx.on_receive(fd, b"\r\n");

        let stored = storage.stored.borrow();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0.data, b"line one\r\nline two".to_vec());
    }

    #[test]
    fn envelope_commands_enforce_their_preconditions() {
        let storage = Rc::new(MockStorage::with_user("b@example.org"));
        let (sim, ctx, fd) = serve(storage);

        ctx.on_receive(fd, b"MAIL FROM:<a@example.org>\r\n");
        ctx.on_receive(fd, b"EHLO c\r\n");
        ctx.on_receive(fd, b"RCPT TO:<b@example.org>\r\n");
        ctx.on_receive(fd, b"DATA\r\n");
        ctx.on_receive(fd, b"MAIL FROM:<a@example.org>\r\n");
        ctx.on_receive(fd, b"MAIL FROM:<a@example.org>\r\n");

        let out = replies(&sim, fd);
        assert!(out.contains("503 HELO or EHLO was not sent previously!\r\n"));
        assert!(out.contains("503 MAIL FROM was not sent previously!\r\n"));
        assert!(out.contains("503- There were zero recipients"));
        assert!(out.contains("503 MAIL FROM was already sent previously!\r\n"));
    }

    #[test]
    fn unknown_local_mailboxes_are_refused() {
        let storage = Rc::new(MockStorage::with_user("known@example.org"));
        let (sim, ctx, fd) = serve(storage);
        ctx.on_receive(
            fd,
            b"EHLO c\r\nMAIL FROM:<outside@elsewhere.test>\r\nRCPT TO:<nobody@example.org>\r\n",
        );
        let out = replies(&sim, fd);
        assert!(out.contains("511 Mailbox not found\r\n"));
    }

    #[test]
    fn quota_exhaustion_is_refused() {
        let storage = Rc::new(MockStorage {
            users: vec![MailUser {
                user_id: 1,
                email: "full@example.org".to_owned(),
                used_space: 999_000,
                quota: 1_000_000,
            }],
            stored: RefCell::new(Vec::new()),
            fail_with: None,
        });
        let (sim, ctx, fd) = serve(storage);
        ctx.on_receive(
            fd,
            b"EHLO c\r\nMAIL FROM:<a@elsewhere.test> SIZE=base\r\n",
        );
        ctx.on_receive(fd, b"RCPT TO:<full@example.org>\r\n");
        let out = replies(&sim, fd);
        // requested_size stays 0 here, so only a genuinely full mailbox trips
        assert!(out.contains("250 OK\r\n"));

        let storage = Rc::new(MockStorage {
            users: vec![MailUser {
                user_id: 1,
                email: "full@example.org".to_owned(),
                used_space: 999_000,
                quota: 1_000_000,
            }],
            stored: RefCell::new(Vec::new()),
            fail_with: None,
        });
        let (sim, ctx, fd) = serve(storage);
        ctx.on_receive(fd, b"EHLO c\r\nMAIL FROM:<a@elsewhere.test> SIZE=10000\r\n");
        ctx.on_receive(fd, b"RCPT TO:<full@example.org>\r\n");
        let out = replies(&sim, fd);
        assert!(out.contains("522 Recipient has exceeded mailbox limit\r\n"));
    }

    #[test]
    fn storage_failures_return_transient_errors() {
        let storage = Rc::new(MockStorage {
            users: vec![MailUser {
                user_id: 1,
                email: "b@example.org".to_owned(),
                used_space: 0,
                quota: 1_000_000,
            }],
            stored: RefCell::new(Vec::new()),
            fail_with: Some("disk offline"),
        });
        let (sim, ctx, fd) = serve(storage);
        ctx.on_receive(
            fd,
            b"EHLO c\r\nMAIL FROM:<a@example.org>\r\nRCPT TO:<b@example.org>\r\nDATA\r\nx\r\n.\r\n",
        );
        let out = replies(&sim, fd);
        assert!(out.contains("451 Server failed to handle the message. Error: disk offline."));
    }

    #[test]
    fn rset_clears_the_envelope_and_quit_closes() {
        let storage = Rc::new(MockStorage::with_user("b@example.org"));
        let (sim, ctx, fd) = serve(storage);
        ctx.on_receive(fd, b"EHLO c\r\nMAIL FROM:<a@example.org>\r\nRSET\r\n");
        // after RSET the envelope restarts; MAIL FROM is accepted again
        ctx.on_receive(fd, b"MAIL FROM:<a@example.org>\r\n");
        ctx.on_receive(fd, b"QUIT\r\n");
        let out = replies(&sim, fd);
        assert!(out.contains("221 Bye\r\n"));
        assert_eq!(out.matches("250 OK\r\n").count(), 3);
        assert_eq!(sim.closes(), vec![(Fd(60), true)]);
    }

    #[test]
    fn unknown_commands_get_502() {
        let storage = Rc::new(MockStorage::with_user("b@example.org"));
        let (sim, ctx, fd) = serve(storage);
        ctx.on_receive(fd, b"BREW COFFEE\r\n");
        assert!(replies(&sim, fd).contains("502 Invalid command\r\n"));
    }
}
