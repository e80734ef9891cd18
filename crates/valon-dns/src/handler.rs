//! DNS query handler for the discovery zone.
//!
//! Zone grammar, with `<label>` the base32 form of a public key:
//!
//! ```text
//! <label>.<zone>                    A      overlay IP
//! lan.<label>.<zone>                A      host of the self-reported endpoint
//! nated.<label>.<zone>              A      host of the kernel-observed endpoint
//! <alias>.<zone>                    CNAME  <label>.<zone>, plus the target A
//! _wireguard._udp.<label>.<zone>    SRV    0 → lan target, 10 → nated target
//! ```
//!
//! A and SRV answers come straight from the cache; only alias resolution
//! touches the KV store. Anything else under the zone is NXDOMAIN so that
//! resolvers fall through cleanly; names outside the zone are refused.

use std::net::IpAddr;
use std::sync::Arc;

use simple_dns::rdata::{RData, A, CNAME, SRV};
use simple_dns::{Name, Packet, PacketFlag, ResourceRecord, CLASS, QTYPE, RCODE, TYPE};

use valon_core::{key_to_label, label_to_key};
use valon_services::{PeerCache, PeerDirectory, PeerInfo};

/// TTL for records derived from dynamic state.
const TTL: u32 = 30;

const SRV_PREFIX: &str = "_wireguard._udp.";

enum Outcome {
    Answered,
    NameError,
    ServerFailure,
}

#[derive(Clone)]
pub struct DnsHandler {
    cache: PeerCache,
    directory: Arc<dyn PeerDirectory>,
    zone: String,
}

impl DnsHandler {
    /// `zone` is stored lowercased and dot-terminated; query names are
    /// matched against it case-insensitively.
    pub fn new(cache: PeerCache, directory: Arc<dyn PeerDirectory>, zone: &str) -> Self {
        let mut zone = zone.to_ascii_lowercase();
        if !zone.ends_with('.') {
            zone.push('.');
        }
        Self { cache, directory, zone }
    }

    /// Handle one query datagram. `None` means the packet was not parseable
    /// and should be dropped.
    pub async fn handle(&self, query: &[u8]) -> Option<Vec<u8>> {
        let packet = Packet::parse(query).ok()?;
        let question = packet.questions.first()?;
        let qname = question.qname.to_string();
        let qtype = question.qtype;
        let mut response = packet.into_reply();

        let mut fqdn = qname.to_ascii_lowercase();
        if !fqdn.ends_with('.') {
            fqdn.push('.');
        }

        if !fqdn.ends_with(&self.zone) {
            // Not our zone; a standalone authoritative server refuses.
            *response.rcode_mut() = RCODE::Refused;
            return response.build_bytes_vec_compressed().ok();
        }

        response.set_flags(PacketFlag::AUTHORITATIVE_ANSWER);
        let rel = fqdn[..fqdn.len() - self.zone.len()]
            .trim_end_matches('.')
            .to_string();

        let outcome = match qtype {
            QTYPE::TYPE(TYPE::A) => self.answer_a(&rel, &fqdn, &mut response).await,
            QTYPE::TYPE(TYPE::SRV) => self.answer_srv(&rel, &fqdn, &mut response),
            QTYPE::TYPE(TYPE::CNAME) => self.answer_cname(&rel, &fqdn, &mut response).await,
            _ => Outcome::NameError,
        };

        match outcome {
            Outcome::Answered => {}
            Outcome::NameError => *response.rcode_mut() = RCODE::NameError,
            Outcome::ServerFailure => *response.rcode_mut() = RCODE::ServerFailure,
        }
        response.build_bytes_vec_compressed().ok()
    }

    async fn answer_a(&self, rel: &str, fqdn: &str, response: &mut Packet<'_>) -> Outcome {
        if let Some(label) = rel.strip_prefix("lan.") {
            return self.endpoint_a(label, fqdn, response, |p| p.lan_endpoint);
        }
        if let Some(label) = rel.strip_prefix("nated.") {
            return self.endpoint_a(label, fqdn, response, |p| p.nat_endpoint);
        }

        match label_to_key(rel) {
            Ok(key) => match self.cache.get(&key).and_then(|p| p.overlay_ip) {
                Some(ip) => {
                    push_a(response, fqdn, ip);
                    Outcome::Answered
                }
                None => Outcome::NameError,
            },
            // Not a key label; a single leftover label may be an alias.
            Err(_) if !rel.is_empty() && !rel.contains('.') => {
                self.answer_alias(rel, fqdn, response, true).await
            }
            Err(_) => Outcome::NameError,
        }
    }

    fn endpoint_a(
        &self,
        label: &str,
        fqdn: &str,
        response: &mut Packet<'_>,
        select: impl Fn(&PeerInfo) -> Option<std::net::SocketAddr>,
    ) -> Outcome {
        let key = match label_to_key(label) {
            Ok(k) => k,
            Err(_) => return Outcome::NameError,
        };
        let endpoint = match self.cache.get(&key).and_then(|p| select(&p)) {
            Some(ep) => ep,
            None => return Outcome::NameError,
        };
        match endpoint.ip() {
            IpAddr::V4(ip) => {
                push_a(response, fqdn, ip);
                Outcome::Answered
            }
            IpAddr::V6(_) => Outcome::NameError,
        }
    }

    /// Resolve `<alias>.<zone>` through the KV reverse index. The stored
    /// target is a base64 key; it only becomes a label here, on the way
    /// into the CNAME.
    async fn answer_alias(
        &self,
        alias: &str,
        fqdn: &str,
        response: &mut Packet<'_>,
        include_target_a: bool,
    ) -> Outcome {
        let key = match self.directory.alias_target(alias).await {
            Ok(Some(key)) => key,
            Ok(None) => return Outcome::NameError,
            Err(e) => {
                tracing::warn!(alias, error = %e, "alias lookup failed");
                return Outcome::ServerFailure;
            }
        };
        let label = match key_to_label(&key) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(alias, error = %e, "alias points at malformed key");
                return Outcome::NameError;
            }
        };

        let target = format!("{label}.{}", self.zone);
        response.answers.push(ResourceRecord::new(
            Name::new_unchecked(fqdn).into_owned(),
            CLASS::IN,
            TTL,
            RData::CNAME(CNAME(Name::new_unchecked(&target).into_owned())),
        ));

        if include_target_a {
            if let Some(ip) = self.cache.get(&key).and_then(|p| p.overlay_ip) {
                push_a(response, &target, ip);
            }
        }
        Outcome::Answered
    }

    fn answer_srv(&self, rel: &str, fqdn: &str, response: &mut Packet<'_>) -> Outcome {
        let label = match rel.strip_prefix(SRV_PREFIX) {
            Some(l) => l,
            None => return Outcome::NameError,
        };
        let key = match label_to_key(label) {
            Ok(k) => k,
            Err(_) => return Outcome::NameError,
        };
        let peer = match self.cache.get(&key) {
            Some(p) => p,
            None => return Outcome::NameError,
        };

        // Priority 0 is the preferred (self-reported) path, 10 the
        // kernel-observed fallback.
        if let Some(ep) = peer.lan_endpoint {
            push_srv(response, fqdn, 0, ep, &format!("lan.{label}.{}", self.zone));
        }
        if let Some(ep) = peer.nat_endpoint {
            push_srv(response, fqdn, 10, ep, &format!("nated.{label}.{}", self.zone));
        }

        if response.answers.is_empty() {
            Outcome::NameError
        } else {
            Outcome::Answered
        }
    }

    async fn answer_cname(&self, rel: &str, fqdn: &str, response: &mut Packet<'_>) -> Outcome {
        if rel.is_empty() || rel.contains('.') || label_to_key(rel).is_ok() {
            return Outcome::NameError;
        }
        self.answer_alias(rel, fqdn, response, false).await
    }
}

fn push_a(response: &mut Packet<'_>, name: &str, ip: std::net::Ipv4Addr) {
    response.answers.push(ResourceRecord::new(
        Name::new_unchecked(name).into_owned(),
        CLASS::IN,
        TTL,
        RData::A(A::from(ip)),
    ));
}

/// Push one SRV answer plus, when the endpoint host is IPv4, the matching
/// A record for its target into the additional section.
fn push_srv(
    response: &mut Packet<'_>,
    fqdn: &str,
    priority: u16,
    endpoint: std::net::SocketAddr,
    target: &str,
) {
    response.answers.push(ResourceRecord::new(
        Name::new_unchecked(fqdn).into_owned(),
        CLASS::IN,
        TTL,
        RData::SRV(SRV {
            priority,
            weight: 0,
            port: endpoint.port(),
            target: Name::new_unchecked(target).into_owned(),
        }),
    ));
    if let IpAddr::V4(ip) = endpoint.ip() {
        response.additional_records.push(ResourceRecord::new(
            Name::new_unchecked(target).into_owned(),
            CLASS::IN,
            TTL,
            RData::A(A::from(ip)),
        ));
    }
}
