//! Insecure DNS transactions over hickory-dns.
//!
//! This factory backs the built-in client with a hickory resolver built from
//! the effective `DnsConfig`: one resolver per client session, so a config
//! change never mixes nameservers across transactions. Hickory's own cache
//! is disabled; results are cached by the manager's `HostCache`.
//!
//! # Limitations
//!
//! - Secure (DoH) transactions are not provided and fail with
//!   `ERR_NOT_IMPLEMENTED`, which lets jobs fall back to insecure or
//!   system resolution.
//! - NSEC and CNAME queries are not issued; CNAME chains are reported as
//!   part of address answers.

use crate::base::neterror::NetError;
use crate::dns::config::DnsConfig;
use crate::dns::transaction::{
    DnsRecord, DnsRecordType, DnsResponse, DnsSession, DnsTransaction, DnsTransactionFactory,
    RecordData,
};
use dashmap::DashMap;
use hickory_resolver::{
    config::{NameServerConfig, NameServerConfigGroup, ResolverConfig},
    name_server::TokioConnectionProvider,
    proto::{
        rr::{Name, RData, Record, RecordType},
        xfer::Protocol,
        ProtoErrorKind,
    },
    ResolveError, ResolveErrorKind, TokioResolver,
};
use std::{str::FromStr, sync::Arc, time::Duration};

/// `DnsTransactionFactory` backed by hickory-dns.
#[derive(Default)]
pub struct HickoryTransactionFactory {
    resolvers: DashMap<u64, Arc<TokioResolver>>,
}

impl HickoryTransactionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver for `session`, built on first use. Resolvers of older
    /// sessions are dropped.
    fn resolver(&self, session: &DnsSession) -> Result<Arc<TokioResolver>, NetError> {
        if let Some(resolver) = self.resolvers.get(&session.id()) {
            return Ok(Arc::clone(resolver.value()));
        }
        let resolver = Arc::new(build_resolver(session.config())?);
        self.resolvers.retain(|id, _| *id >= session.id());
        self.resolvers.insert(session.id(), Arc::clone(&resolver));
        tracing::debug!(
            session = session.id(),
            nameservers = session.config().nameservers.len(),
            "built hickory resolver for session"
        );
        Ok(resolver)
    }
}

fn build_resolver(config: &DnsConfig) -> Result<TokioResolver, NetError> {
    if config.nameservers.is_empty() {
        return Err(NetError::Failed);
    }
    let mut servers = Vec::with_capacity(config.nameservers.len() * 2);
    for addr in &config.nameservers {
        servers.push(NameServerConfig::new(*addr, Protocol::Udp));
        servers.push(NameServerConfig::new(*addr, Protocol::Tcp));
    }
    let search = config
        .search
        .iter()
        .filter_map(|suffix| Name::from_str(suffix).ok())
        .collect();
    let resolver_config =
        ResolverConfig::from_parts(None, search, NameServerConfigGroup::from(servers));

    let mut builder =
        TokioResolver::builder_with_config(resolver_config, TokioConnectionProvider::default());
    let options = builder.options_mut();
    options.timeout = config.timeout;
    options.attempts = config.attempts as usize;
    options.ndots = config.ndots as usize;
    options.cache_size = 0;
    options.preserve_intermediates = true;
    Ok(builder.build())
}

fn record_type(record_type: DnsRecordType) -> Option<RecordType> {
    match record_type {
        DnsRecordType::A => Some(RecordType::A),
        DnsRecordType::Aaaa => Some(RecordType::AAAA),
        DnsRecordType::Txt => Some(RecordType::TXT),
        DnsRecordType::Ptr => Some(RecordType::PTR),
        DnsRecordType::Srv => Some(RecordType::SRV),
        DnsRecordType::Cname | DnsRecordType::Nsec => None,
    }
}

/// Map a hickory record onto the resolver's record model. Unsupported
/// types are skipped.
fn convert_record(record: &Record) -> Option<DnsRecord> {
    let name = record.name().to_utf8();
    let ttl = Duration::from_secs(u64::from(record.ttl()));
    let data = match record.data() {
        RData::A(a) => RecordData::A(a.0),
        RData::AAAA(aaaa) => RecordData::Aaaa(aaaa.0),
        RData::CNAME(cname) => RecordData::Cname(cname.0.to_utf8()),
        RData::PTR(ptr) => RecordData::Ptr(ptr.0.to_utf8()),
        RData::TXT(txt) => RecordData::Txt(
            txt.txt_data()
                .iter()
                .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                .collect(),
        ),
        RData::SRV(srv) => RecordData::Srv {
            priority: srv.priority(),
            weight: srv.weight(),
            port: srv.port(),
            target: srv.target().to_utf8(),
        },
        _ => return None,
    };
    Some(DnsRecord::new(name, ttl, data))
}

fn map_lookup_error(hostname: &str, error: ResolveError) -> Result<DnsResponse, NetError> {
    if error.is_nx_domain() {
        return Ok(DnsResponse::nx_domain());
    }
    if error.is_no_records_found() {
        return Ok(DnsResponse::no_data());
    }
    tracing::debug!(host = %hostname, error = %error, "hickory lookup failed");
    match error.kind() {
        ResolveErrorKind::Proto(proto) if matches!(proto.kind(), ProtoErrorKind::Timeout) => {
            Err(NetError::DnsTimedOut)
        }
        _ => Err(NetError::DnsServerFailed),
    }
}

impl DnsTransactionFactory for HickoryTransactionFactory {
    fn create_transaction(
        &self,
        session: &Arc<DnsSession>,
        hostname: &str,
        rtype: DnsRecordType,
        secure: bool,
    ) -> DnsTransaction {
        let hostname = hostname.to_string();
        let prepared = if secure {
            Err(NetError::NotImplemented)
        } else {
            record_type(rtype)
                .ok_or(NetError::NotImplemented)
                .and_then(|query| self.resolver(session).map(|resolver| (resolver, query)))
        };
        let deadline = session.config().timeout * session.config().attempts.max(1);

        Box::pin(async move {
            let (resolver, query) = prepared?;
            tracing::trace!(host = %hostname, ?query, "hickory transaction");
            let pending = resolver.lookup(hostname.as_str(), query);
            let lookup = match tokio::time::timeout(deadline, pending).await {
                Err(_) => return Err(NetError::DnsTimedOut),
                Ok(Err(error)) => return map_lookup_error(&hostname, error),
                Ok(Ok(lookup)) => lookup,
            };
            let answers: Vec<DnsRecord> =
                lookup.records().iter().filter_map(convert_record).collect();
            Ok(DnsResponse::with_answers(answers))
        })
    }
}
