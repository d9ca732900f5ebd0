//! DNS resolution behind one interface, two transports.
//!
//! [`SystemDns`] runs blocking system-resolver lookups on the worker pool;
//! [`DohDns`] asks a DNS-over-HTTPS provider and decodes its JSON answers.
//! Both consult a hosts-file pin map first, honor answer TTLs through one
//! shared cache, and give MX answers the full treatment: sort by priority,
//! pick the lowest, and chase the exchange down to an address record.

use std::{
    collections::HashMap,
    fmt,
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use strand_aio::RecordKind;

mod doh;
mod system;

pub use doh::{DohDns, DohTransport};
pub use system::SystemDns;

/// Upper bound on how long an answer may be reused, whatever its TTL says.
const MAX_CACHE_SECS: i64 = 1200;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsAnswer {
    pub records: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    #[error("DNS_READ|{0}")]
    Read(String),
    #[error("DNS_NOT_FOUND")]
    NotFound,
    #[error("DNS_QUERY")]
    Query,
    #[error("DNS_PARSE|{0}")]
    Parse(String),
    #[error("DNS_PARSE_INIT|{0}")]
    ParseInit(String),
}

#[async_trait(?Send)]
pub trait Dns {
    /// Resolve `name` to its `kind` records. With `mx_treatment`, an MX
    /// answer is reduced to the best exchange and chased down to an
    /// A/AAAA record (`prefer_ipv6` picks which).
    async fn query(
        &self,
        name: &str,
        kind: RecordKind,
        prefer_ipv6: bool,
        mx_treatment: bool,
    ) -> Result<DnsAnswer, DnsError>;

    /// Pin `host` to `addr` for the life of the process.
    fn memorize(&self, host: &str, addr: &str);
}

pub(crate) fn record_kind_name(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::A => "A",
        RecordKind::Cname => "CNAME",
        RecordKind::Mx => "MX",
        RecordKind::Txt => "TXT",
        RecordKind::Aaaa => "AAAA",
    }
}

pub(crate) fn likely_ip(name: &str) -> bool {
    let mut count = 0;
    for part in name.split('.') {
        if part.is_empty() || part.parse::<u8>().is_err() {
            return false;
        }
        count += 1;
    }
    count == 4
}

pub(crate) fn cache_key(kind: RecordKind, name: &str) -> String {
    format!("{}_{}", kind as u16, name)
}

struct CacheEntry {
    answer: DnsAnswer,
    /// `None` pins the entry forever.
    expires: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn live(&self, now: DateTime<Utc>) -> bool {
        self.expires.map_or(true, |e| now <= e)
    }
}

/// Pins and cached answers for the whole process; workers share it, so
/// lookups hold the mutex only across map access.
static CACHE: Lazy<Mutex<HashMap<String, CacheEntry>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn lookup(key: &str) -> Option<DnsAnswer> {
    let now = Utc::now();
    let cache = CACHE.lock().ok()?;
    let entry = cache.get(key)?;
    if entry.live(now) {
        Some(entry.answer.clone())
    } else {
        None
    }
}

/// Hosts-file and `memorize` pins, keyed by bare host name; served verbatim.
pub(crate) fn lookup_pin(name: &str) -> Option<DnsAnswer> {
    lookup(name)
}

/// Raw answers from an earlier transport query, keyed by `(kind, name)`;
/// the caller re-applies MX treatment on these.
pub(crate) fn lookup_cached(kind: RecordKind, name: &str) -> Option<DnsAnswer> {
    lookup(&cache_key(kind, name))
}

pub(crate) fn store_shared(key: String, answer: DnsAnswer, ttl_secs: Option<i64>) {
    let expires = ttl_secs.map(|ttl| Utc::now() + Duration::seconds(ttl.clamp(1, MAX_CACHE_SECS)));
    if let Ok(mut cache) = CACHE.lock() {
        cache.insert(key, CacheEntry { answer, expires });
    }
}

pub(crate) fn pin_shared(host: &str, addr: &str) {
    store_shared(
        host.to_owned(),
        DnsAnswer {
            records: vec![addr.to_owned()],
        },
        None,
    );
}

/// Load `ip host [host…]` pins out of a hosts file body.
pub(crate) fn parse_hosts(content: &str) -> Vec<(String, String)> {
    let mut pins = Vec::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let ip = match fields.next() {
            Some(ip) if !ip.starts_with('#') => ip,
            _ => continue,
        };
        for host in fields {
            if host.starts_with('#') {
                break;
            }
            pins.push((host.to_owned(), ip.to_owned()));
        }
    }
    pins
}

pub(crate) fn load_host_pins(provider: &str, provider_addr: &str) {
    if let Ok(content) = std::fs::read_to_string("/etc/hosts") {
        for (host, ip) in parse_hosts(&content) {
            pin_shared(&host, &ip);
        }
    }
    pin_shared("localhost", "127.0.0.1");
    // resolving the provider itself must never recurse into the provider
    pin_shared(provider, provider_addr);
}

/// `prio host` records sorted ascending by priority, trailing dots dropped.
pub(crate) fn mx_candidates(records: &[String]) -> Vec<(u32, String)> {
    let mut candidates: Vec<(u32, String)> = records
        .iter()
        .filter_map(|record| {
            let (prio, host) = record.split_once(' ')?;
            let prio = prio.trim().parse().ok()?;
            let host = host.trim().trim_end_matches('.').to_owned();
            if host.is_empty() {
                None
            } else {
                Some((prio, host))
            }
        })
        .collect();
    candidates.sort();
    candidates
}

/// Shared tail of both resolvers: given the raw record strings of one
/// answer, apply MX treatment or hand them back as-is.
pub(crate) async fn finish_answer(
    dns: &dyn Dns,
    targets: Vec<String>,
    kind: RecordKind,
    prefer_ipv6: bool,
    mx_treatment: bool,
) -> Result<DnsAnswer, DnsError> {
    if targets.is_empty() {
        return Err(DnsError::NotFound);
    }
    if kind != RecordKind::Mx || !mx_treatment {
        return Ok(DnsAnswer { records: targets });
    }

    let candidates = mx_candidates(&targets);
    if candidates.is_empty() {
        return Err(DnsError::NotFound);
    }
    let best = &candidates[0].1;
    if likely_ip(best) {
        return Ok(DnsAnswer {
            records: candidates.into_iter().map(|(_, host)| host).collect(),
        });
    }
    let follow = if prefer_ipv6 {
        RecordKind::Aaaa
    } else {
        RecordKind::A
    };
    dns.query(best, follow, prefer_ipv6, false).await
}

impl fmt::Display for DnsAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.records.join(","))
    }
}

/// Build the resolver the environment asks for: `DNS_TYPE` picks `resolv`
/// (default) or `doh`, `DNS_PROVIDER` names the provider host.
pub fn resolver_from_env(
    ctx: &std::rc::Rc<strand_aio::Context>,
    transport: std::rc::Rc<dyn DohTransport>,
) -> std::rc::Rc<dyn Dns> {
    let provider = std::env::var("DNS_PROVIDER").unwrap_or_else(|_| "dns.google".to_owned());
    let kind = std::env::var("DNS_TYPE").unwrap_or_else(|_| "resolv".to_owned());
    if kind == "doh" {
        std::rc::Rc::new(DohDns::new(transport, &provider, "8.8.4.4"))
    } else {
        std::rc::Rc::new(SystemDns::new(ctx.clone(), &provider, "8.8.4.4"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_lines_parse_into_pins() {
        let pins = parse_hosts(
            "127.0.0.1 localhost localhost.localdomain\n\
             # 10.0.0.1 commented\n\
             192.0.2.7 pinned.example # trailing comment\n\
             malformed\n",
        );
        assert_eq!(
            pins,
            vec![
                ("localhost".to_owned(), "127.0.0.1".to_owned()),
                ("localhost.localdomain".to_owned(), "127.0.0.1".to_owned()),
                ("pinned.example".to_owned(), "192.0.2.7".to_owned()),
            ]
        );
    }

    #[test]
    fn ip_literals_are_recognized() {
        assert!(likely_ip("192.0.2.1"));
        assert!(!likely_ip("192.0.2"));
        assert!(!likely_ip("192.0.2.300"));
        assert!(!likely_ip("mail.example.org"));
    }

    #[test]
    fn mx_candidates_sort_by_priority_and_strip_dots() {
        let records = vec![
            "20 backup.example.org.".to_owned(),
            "10 mail.example.org.".to_owned(),
            "nonsense".to_owned(),
        ];
        assert_eq!(
            mx_candidates(&records),
            vec![
                (10, "mail.example.org".to_owned()),
                (20, "backup.example.org".to_owned()),
            ]
        );
    }

    #[test]
    fn expired_entries_are_not_served() {
        store_shared(
            "probe.ttl-expired.test".to_owned(),
            DnsAnswer {
                records: vec!["192.0.2.1".into()],
            },
            Some(1),
        );
        // force the entry into the past
        if let Ok(mut cache) = CACHE.lock() {
            if let Some(entry) = cache.get_mut("probe.ttl-expired.test") {
                entry.expires = Some(Utc::now() - Duration::seconds(5));
            }
        }
        assert_eq!(lookup_pin("probe.ttl-expired.test"), None);
    }

    #[test]
    fn pins_never_expire() {
        pin_shared("probe.pin.test", "192.0.2.9");
        assert_eq!(
            lookup_pin("probe.pin.test"),
            Some(DnsAnswer {
                records: vec!["192.0.2.9".to_owned()],
            })
        );
    }

    #[test]
    fn error_tags_match_the_taxonomy() {
        assert_eq!(DnsError::NotFound.to_string(), "DNS_NOT_FOUND");
        assert_eq!(
            DnsError::Read("status:2".into()).to_string(),
            "DNS_READ|status:2"
        );
        assert_eq!(
            DnsError::Parse("expand".into()).to_string(),
            "DNS_PARSE|expand"
        );
    }
}
