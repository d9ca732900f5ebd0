//! DNS-over-HTTPS variant.
//!
//! Issues `GET https://<provider>/resolve?name=…&type=…` through whatever
//! HTTP transport the caller supplies and decodes the provider's JSON
//! answer format. Pinning, caching and MX treatment are shared with the
//! system-resolver variant.

use std::rc::Rc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::trace;

use strand_aio::RecordKind;

use crate::{
    cache_key, finish_answer, likely_ip, load_host_pins, lookup_cached, lookup_pin, pin_shared,
    record_kind_name, store_shared, Dns, DnsAnswer, DnsError,
};

/// One-shot HTTPS GET, body as text. The HTTP client crate implements this;
/// keeping it a trait here avoids a dependency cycle and lets tests feed
/// canned answers.
#[async_trait(?Send)]
pub trait DohTransport {
    async fn get(&self, url: &str) -> Result<String, String>;
}

pub struct DohDns {
    provider: String,
    transport: Rc<dyn DohTransport>,
}

#[derive(Deserialize)]
struct DohEntity {
    #[serde(rename = "type")]
    rtype: u16,
    #[serde(rename = "TTL")]
    ttl: Option<u32>,
    data: Option<String>,
}

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: i32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohEntity>,
}

impl DohDns {
    pub fn new(transport: Rc<dyn DohTransport>, provider: &str, provider_addr: &str) -> DohDns {
        load_host_pins(provider, provider_addr);
        DohDns {
            provider: provider.to_owned(),
            transport,
        }
    }
}

#[async_trait(?Send)]
impl Dns for DohDns {
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

        let url = format!(
            "https://{}/resolve?name={}&type={}",
            self.provider,
            urlencoding::encode(name),
            record_kind_name(kind)
        );
        trace!(url = url.as_str(), "resolving over https");
        let body = self
            .transport
            .get(&url)
            .await
            .map_err(|e| DnsError::Read(format!("http:{e}")))?;
        let decoded: DohResponse =
            serde_json::from_str(&body).map_err(|e| DnsError::Parse(e.to_string()))?;
        if decoded.status != 0 {
            return Err(DnsError::Read(format!("status:{}", decoded.status)));
        }

        let ttl_min = decoded
            .answer
            .iter()
            .filter_map(|entity| entity.ttl)
            .min()
            .unwrap_or(0);
        let targets: Vec<String> = decoded
            .answer
            .into_iter()
            .filter(|entity| entity.rtype == kind as u16)
            .filter_map(|entity| entity.data)
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
