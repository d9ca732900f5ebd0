//! System-resolver variant.
//!
//! `trust-dns`'s blocking resolver does the actual wire work; since it
//! blocks, every lookup is offloaded onto the context's worker pool and
//! comes back as a task completion. Only the raw record strings cross the
//! thread boundary.

use std::rc::Rc;

use async_trait::async_trait;
use tracing::trace;
use trust_dns_resolver::{
    error::ResolveErrorKind,
    proto::rr::{RData, RecordType},
    Resolver,
};

use strand_aio::{Context, RecordKind};

use crate::{
    cache_key, finish_answer, likely_ip, load_host_pins, lookup_cached, lookup_pin, pin_shared,
    record_kind_name, store_shared, Dns, DnsAnswer, DnsError,
};

pub struct SystemDns {
    ctx: Rc<Context>,
}

struct RawRecord {
    rtype: u16,
    ttl: u32,
    data: String,
}

impl SystemDns {
    pub fn new(ctx: Rc<Context>, provider: &str, provider_addr: &str) -> SystemDns {
        load_host_pins(provider, provider_addr);
        SystemDns { ctx }
    }
}

fn rdata_to_string(rdata: &RData) -> Option<String> {
    match rdata {
        RData::A(ip) => Some(ip.to_string()),
        RData::AAAA(ip) => Some(ip.to_string()),
        RData::CNAME(name) => Some(name.to_string()),
        RData::MX(mx) => Some(format!("{} {}", mx.preference(), mx.exchange())),
        RData::TXT(txt) => Some(
            txt.iter()
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<Vec<_>>()
                .join(""),
        ),
        _ => None,
    }
}

/// Runs on a pool thread; everything in and out is `Send`.
fn blocking_lookup(name: String, rtype: RecordType) -> Result<Vec<RawRecord>, DnsError> {
    let resolver =
        Resolver::from_system_conf().map_err(|e| DnsError::ParseInit(e.to_string()))?;
    let lookup = resolver.lookup(name.as_str(), rtype).map_err(|e| {
        if let ResolveErrorKind::NoRecordsFound { .. } = e.kind() {
            DnsError::NotFound
        } else {
            DnsError::Query
        }
    })?;
    Ok(lookup
        .record_iter()
        .filter_map(|record| {
            let data = record.data().and_then(rdata_to_string)?;
            Some(RawRecord {
                rtype: u16::from(record.rr_type()),
                ttl: record.ttl(),
                data,
            })
        })
        .collect())
}

#[async_trait(?Send)]
impl Dns for SystemDns {
    async fn query(
        &self,
        name: &str,
        kind: RecordKind,
        prefer_ipv6: bool,
        mx_treatment: bool,
    ) -> Result<DnsAnswer, DnsError> {
        if likely_ip(name) {
            return Ok(DnsAnswer {
                records: vec![name.to_owned()],
            });
        }
        if let Some(pinned) = lookup_pin(name) {
            return Ok(pinned);
        }
        if let Some(cached) = lookup_cached(kind, name) {
            return finish_answer(self, cached.records, kind, prefer_ipv6, mx_treatment).await;
        }

        trace!(name, kind = record_kind_name(kind), "resolving");
        let owned = name.to_owned();
        let rtype = RecordType::from(kind as u16);
        let records = self
            .ctx
            .offload(move || blocking_lookup(owned, rtype))
            .await
            .ok_or_else(|| DnsError::Read("task dropped".to_owned()))??;

        let ttl_min = records.iter().map(|r| r.ttl).min().unwrap_or(0);
        let targets: Vec<String> = records
            .into_iter()
            .filter(|record| record.rtype == kind as u16)
            .map(|record| record.data)
            .collect();
        if targets.is_empty() {
            return Err(DnsError::NotFound);
        }

        store_shared(
            cache_key(kind, name),
            DnsAnswer {
                records: targets.clone(),
            },
            Some(ttl_min as i64),
        );
        finish_answer(self, targets, kind, prefer_ipv6, mx_treatment).await
    }

    fn memorize(&self, host: &str, addr: &str) {
        pin_shared(host, addr);
    }
}
