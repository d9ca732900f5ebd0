//! Outbound SMTP delivery.
//!
//! Recipients are grouped by their mail-server domain; each group gets one
//! pooled connection (MX-resolved), an EHLO + opportunistic STARTTLS on
//! first use, and then `RSET` / `MAIL FROM` / per-recipient `RCPT TO` /
//! `DATA`. A bad recipient only fails itself; everything else in the batch
//! still goes out. The returned map carries one failure reason per
//! undelivered recipient, so an empty map means fully delivered.

use std::{collections::HashMap, rc::Rc};

use tracing::{debug, trace};

use strand_aio::{BufferedFd, Context, Proto, RecordKind};
use strand_dns::Dns;

use crate::shared::{MailKnowledge, TlsMode};

const SMTP_PORT: u16 = 25;
/// User-data key marking a pooled connection as already greeted.
const GREETED_KEY: &str = "smtp.greeted";

pub struct SmtpClient {
    ctx: Rc<Context>,
    dns: Rc<dyn Dns>,
    ehlo_hostname: String,
}

fn mail_server_of(address: &str) -> Option<&str> {
    address.split_once('@').map(|(_, host)| host)
}

fn fail_many(errors: &mut HashMap<String, String>, group: &[String], reason: &str) {
    for recipient in group {
        errors.insert(recipient.clone(), reason.to_owned());
    }
}

/// Fold an SMTP reply, following `250-` continuation lines until the final
/// `250 ` line; the result starts with the reply code.
async fn read_smtp_response(fd: &Rc<BufferedFd>) -> Result<String, String> {
    let mut total = String::new();
    loop {
        let line = fd.read_until(b"\r\n").await;
        if line.error {
            return Err("reading failed".to_owned());
        }
        let line = String::from_utf8_lossy(&line.data).into_owned();
        if line.len() < 4 {
            return Err(format!("unexpected SMTP response: {line}"));
        }
        let last = line.as_bytes()[3] == b' ';
        if total.is_empty() {
            total = line.clone();
            // normalize the separator so callers match on "250 "
            total.replace_range(3..4, " ");
        } else {
            total.push('\n');
            total.push_str(&line[4..]);
        }
        if last {
            return Ok(total);
        }
    }
}

impl SmtpClient {
    pub fn new(ctx: Rc<Context>, dns: Rc<dyn Dns>, ehlo_hostname: &str) -> Rc<SmtpClient> {
        Rc::new(SmtpClient {
            ctx,
            dns,
            ehlo_hostname: ehlo_hostname.to_owned(),
        })
    }

    /// One command/response cycle; on failure every recipient in `group`
    /// gets the reason recorded.
    async fn roundtrip(
        &self,
        fd: &Rc<BufferedFd>,
        errors: &mut HashMap<String, String>,
        group: &[String],
        cmd: &str,
        params: &str,
        expect: &str,
    ) -> Option<String> {
        if !fd.write(format!("{cmd}{params}\r\n").as_bytes()).await {
            fail_many(errors, group, &format!("write on {cmd} failed"));
            return None;
        }
        let mut banner_consumed = false;
        loop {
            let response = match read_smtp_response(fd).await {
                Ok(response) => response,
                Err(_) => {
                    fail_many(errors, group, &format!("failed to read {cmd} response"));
                    return None;
                }
            };
            if response.starts_with(expect) {
                return Some(response);
            }
            // a fresh connection greets with its 220 banner before our EHLO
            // reply arrives
            if cmd == "EHLO" && response.starts_with("220") && !banner_consumed {
                banner_consumed = true;
                continue;
            }
            fail_many(
                errors,
                group,
                &format!("expected {expect} on {cmd}, received {response}"),
            );
            return None;
        }
    }

    async fn greet(
        &self,
        fd: &Rc<BufferedFd>,
        errors: &mut HashMap<String, String>,
        group: &[String],
        mode: TlsMode,
    ) -> bool {
        let response = match self
            .roundtrip(
                fd,
                errors,
                group,
                "EHLO",
                &format!(" {}", self.ehlo_hostname),
                "250",
            )
            .await
        {
            Some(response) => response,
            None => return false,
        };

        let advertised = response.contains("STARTTLS");
        if mode == TlsMode::Always && !advertised {
            fail_many(errors, group, "server doesn't support TLS");
            return false;
        }
        if advertised && !fd.is_secure() && mode != TlsMode::Never {
            if self
                .roundtrip(fd, errors, group, "STARTTLS", "", "220")
                .await
                .is_none()
            {
                return false;
            }
            let config = match self.ctx.client_tls_context(None, None, None, None) {
                Ok(config) => config,
                Err(reason) => {
                    fail_many(
                        errors,
                        group,
                        &format!("failed to create SSL context: {reason}"),
                    );
                    return false;
                }
            };
            let ssl = fd.clone().enable_client_ssl(config, "").await;
            if ssl.error && mode == TlsMode::Always {
                fail_many(errors, group, &format!("TLS negotiation failed: {}", ssl.message));
                return false;
            }
            // re-advertised capabilities after the upgrade
            if fd.is_secure()
                && self
                    .roundtrip(
                        fd,
                        errors,
                        group,
                        "EHLO",
                        &format!(" {}", self.ehlo_hostname),
                        "250",
                    )
                    .await
                    .is_none()
            {
                return false;
            }
        }
        fd.set_user_data(GREETED_KEY, "1");
        true
    }

    /// Deliver `mail` to every recipient, returning per-recipient failure
    /// reasons. An empty map is a full success.
    pub async fn deliver_mail(
        &self,
        mail: &MailKnowledge,
        recipients: &[String],
        mode: TlsMode,
    ) -> HashMap<String, String> {
        let mut errors = HashMap::new();

        let mut per_server: HashMap<String, Vec<String>> = HashMap::new();
        for recipient in recipients {
            match mail_server_of(recipient) {
                Some(server) => per_server
                    .entry(server.to_owned())
                    .or_default()
                    .push(recipient.clone()),
                None => {
                    errors.insert(recipient.clone(), "invalid address".to_owned());
                }
            }
        }

        let sender = mail
            .from
            .as_ref()
            .map(|from| from.original_email.clone())
            .unwrap_or_default();

        for (server, group) in per_server {
            debug!(server = server.as_str(), recipients = group.len(), "delivering batch");
            let mx = match self.dns.query(&server, RecordKind::Mx, false, true).await {
                Ok(answer) => answer,
                Err(e) => {
                    fail_many(&mut errors, &group, &format!("DNS lookup failed: {e}"));
                    continue;
                }
            };
            let address = match mx.records.first() {
                Some(address) => address.clone(),
                None => {
                    fail_many(&mut errors, &group, "DNS lookup failed: empty answer");
                    continue;
                }
            };

            let conn = self
                .ctx
                .clone()
                .connect(
                    &address,
                    RecordKind::A,
                    SMTP_PORT,
                    Proto::Tcp,
                    Some(format!("smtp.{server}")),
                    false,
                )
                .await;
            let fd = match conn.fd_ok() {
                Some(fd) => fd,
                None => {
                    fail_many(
                        &mut errors,
                        &group,
                        &format!("connection establishment failed: {}", conn.message),
                    );
                    continue;
                }
            };

            // EHLO and STARTTLS happen once per pooled connection
            if fd.user_data(GREETED_KEY).is_none()
                && !self.greet(&fd, &mut errors, &group, mode).await
            {
                continue;
            }

            if self
                .roundtrip(&fd, &mut errors, &group, "RSET", "", "250")
                .await
                .is_none()
            {
                continue;
            }
            if self
                .roundtrip(
                    &fd,
                    &mut errors,
                    &group,
                    "MAIL FROM:",
                    &format!("<{sender}>"),
                    "250",
                )
                .await
                .is_none()
            {
                continue;
            }

            let mut accepted = Vec::new();
            for recipient in &group {
                let one = std::slice::from_ref(recipient);
                if self
                    .roundtrip(
                        &fd,
                        &mut errors,
                        one,
                        "RCPT TO:",
                        &format!("<{recipient}>"),
                        "250",
                    )
                    .await
                    .is_some()
                {
                    accepted.push(recipient.clone());
                }
            }
            if accepted.is_empty() {
                continue;
            }

            if self
                .roundtrip(&fd, &mut errors, &accepted, "DATA", "", "354")
                .await
                .is_none()
            {
                continue;
            }
            trace!(bytes = mail.data.len(), "sending payload");
            let mut payload = mail.data.clone();
            if !payload.ends_with(b"\r\n") {
                payload.extend_from_slice(b"\r\n");
            }
            payload.extend_from_slice(b".\r\n");
            if !fd.write(&payload).await {
                fail_many(&mut errors, &accepted, "failed to write DATA section");
                continue;
            }
            match read_smtp_response(&fd).await {
                Ok(response) if response.starts_with("250") => {}
                Ok(response) => {
                    fail_many(
                        &mut errors,
                        &accepted,
                        &format!("failed to transfer data: {response}"),
                    );
                }
                Err(reason) => {
                    fail_many(
                        &mut errors,
                        &accepted,
                        &format!("failed to transfer data: {reason}"),
                    );
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use async_trait::async_trait;
    use strand_aio::{sim::SimulatedLoop, Fd, NodeId};
    use strand_dns::{DnsAnswer, DnsError};

    use crate::shared::{MailDirection, ParsedUser};

    struct MxDns;

    #[async_trait(?Send)]
    impl Dns for MxDns {
        async fn query(
            &self,
            name: &str,
            kind: RecordKind,
            _prefer_ipv6: bool,
            mx_treatment: bool,
        ) -> Result<DnsAnswer, DnsError> {
            assert_eq!(kind, RecordKind::Mx);
            assert!(mx_treatment);
            if name == "dead.test" {
                return Err(DnsError::NotFound);
            }
            Ok(DnsAnswer {
                records: vec!["192.0.2.25".to_owned()],
            })
        }

        fn memorize(&self, _host: &str, _addr: &str) {}
    }

    fn mail_from(addr: &str) -> MailKnowledge {
        let mut mail = MailKnowledge::new();
        mail.from = Some(ParsedUser {
            original_email: addr.to_owned(),
            original_email_server: "example.org".to_owned(),
            email: addr.to_owned(),
            folder: String::new(),
            requested_size: 0,
            direction: MailDirection::Outbound,
            local: true,
            authenticated: true,
            user: None,
        });
        mail.data = b"Subject: out\r\n\r\npayload".to_vec();
        mail
    }

    fn fresh() -> (Rc<SimulatedLoop>, Rc<Context>, Rc<SmtpClient>) {
        let sim = Rc::new(SimulatedLoop::new(1));
        let node = NodeId {
            name: "localhost".into(),
            port: 2525,
            worker: 1,
            workers: 1,
        };
        let ctx = Context::new(sim.clone(), node, "master".into());
        let client = SmtpClient::new(ctx.clone(), Rc::new(MxDns), "mx.example.org");
        (sim, ctx, client)
    }

    fn reply(ctx: &Rc<Context>, fd: Fd, text: &str) {
        ctx.on_receive(fd, text.as_bytes());
    }

    #[test]
    fn batch_delivery_tolerates_one_bad_recipient() {
        let (sim, ctx, client) = fresh();
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let client2 = client.clone();
        ctx.spawn(async move {
            let mail = mail_from("sender@example.org");
            let errors = client2
                .deliver_mail(
                    &mail,
                    &[
                        "good@remote.test".to_owned(),
                        "bad@remote.test".to_owned(),
                    ],
                    TlsMode::Never,
                )
                .await;
            *result2.borrow_mut() = Some(errors);
        });
        ctx.pump();

        let fd = sim.last_dialed().expect("dialed the MX");
        ctx.on_write(fd, 0);

        // client speaks first with EHLO; the banner arrives with the reply
        let sent = String::from_utf8(sim.take_written(fd)).expect("ascii");
        assert!(sent.contains("EHLO mx.example.org\r\n"));
        reply(&ctx, fd, "220 remote ESMTP\r\n");
        reply(&ctx, fd, "250 remote greets you\r\n");
        reply(&ctx, fd, "250 OK\r\n"); // RSET
        reply(&ctx, fd, "250 OK\r\n"); // MAIL FROM
        reply(&ctx, fd, "250 OK\r\n"); // RCPT good
        reply(&ctx, fd, "550 User unknown\r\n"); // RCPT bad
        reply(&ctx, fd, "354 go ahead\r\n"); // DATA

        let sent = String::from_utf8(sim.take_written(fd)).expect("ascii");
        assert!(sent.contains("MAIL FROM:<sender@example.org>\r\n"));
        assert!(sent.contains("RCPT TO:<good@remote.test>\r\n"));
        assert!(sent.contains("RCPT TO:<bad@remote.test>\r\n"));
        assert!(sent.ends_with("Subject: out\r\n\r\npayload\r\n.\r\n"));

        reply(&ctx, fd, "250 OK queued\r\n");

        let result = result.borrow();
        let errors = result.as_ref().expect("finished");
        assert_eq!(errors.len(), 1);
        assert!(errors["bad@remote.test"].contains("550 User unknown"));
    }

    #[test]
    fn multiline_replies_fold_before_matching() {
        let (sim, ctx, client) = fresh();
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let client2 = client.clone();
        ctx.spawn(async move {
            let mail = mail_from("sender@example.org");
            let errors = client2
                .deliver_mail(&mail, &["rcpt@remote.test".to_owned()], TlsMode::Never)
                .await;
            *result2.borrow_mut() = Some(errors);
        });
        ctx.pump();
        let fd = sim.last_dialed().expect("dialed");
        ctx.on_write(fd, 0);

        reply(&ctx, fd, "220 remote ESMTP\r\n");
        reply(
            &ctx,
            fd,
            "250-remote greets you\r\n250-PIPELINING\r\n250 SIZE 1000000\r\n",
        );
        reply(&ctx, fd, "250 OK\r\n"); // RSET
        reply(&ctx, fd, "250 OK\r\n"); // MAIL FROM
        reply(&ctx, fd, "250 OK\r\n"); // RCPT
        reply(&ctx, fd, "354 send it\r\n");
        reply(&ctx, fd, "250 accepted\r\n");

        let result = result.borrow();
        assert!(result.as_ref().expect("finished").is_empty());
    }

    #[test]
    fn required_tls_fails_without_starttls() {
        let (sim, ctx, client) = fresh();
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let client2 = client.clone();
        ctx.spawn(async move {
            let mail = mail_from("sender@example.org");
            let errors = client2
                .deliver_mail(&mail, &["rcpt@remote.test".to_owned()], TlsMode::Always)
                .await;
            *result2.borrow_mut() = Some(errors);
        });
        ctx.pump();
        let fd = sim.last_dialed().expect("dialed");
        ctx.on_write(fd, 0);
        reply(&ctx, fd, "220 remote ESMTP\r\n");
        reply(&ctx, fd, "250 remote, no extensions\r\n");

        let result = result.borrow();
        let errors = result.as_ref().expect("finished");
        assert_eq!(
            errors["rcpt@remote.test"],
            "server doesn't support TLS"
        );
    }

    #[test]
    fn dns_failures_fail_the_whole_group() {
        let (sim, ctx, client) = fresh();
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let client2 = client.clone();
        ctx.spawn(async move {
            let mail = mail_from("sender@example.org");
            let errors = client2
                .deliver_mail(
                    &mail,
                    &["a@dead.test".to_owned(), "b@dead.test".to_owned()],
                    TlsMode::Never,
                )
                .await;
            *result2.borrow_mut() = Some(errors);
        });
        ctx.pump();
        assert!(sim.dials().is_empty());
        let result = result.borrow();
        let errors = result.as_ref().expect("finished");
        assert_eq!(errors.len(), 2);
        assert!(errors["a@dead.test"].contains("DNS_NOT_FOUND"));
    }

    #[test]
    fn invalid_recipient_addresses_fail_upfront() {
        let (_sim, ctx, client) = fresh();
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let client2 = client.clone();
        ctx.spawn(async move {
            let mail = mail_from("sender@example.org");
            let errors = client2
                .deliver_mail(&mail, &["not-an-address".to_owned()], TlsMode::Never)
                .await;
            *result2.borrow_mut() = Some(errors);
        });
        ctx.pump();
        let result = result.borrow();
        assert_eq!(
            result.as_ref().expect("finished")["not-an-address"],
            "invalid address"
        );
    }
}
