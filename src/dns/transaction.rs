//! DNS transaction contract.
//!
//! A transaction is one query (name + record type) sent through the
//! built-in client, secure or insecure. Wire encoding is the factory's
//! business; this module only sees typed records or a `NetError`.
//!
//! Also hosts the response-to-results extraction used by `DnsTask`.

use crate::base::neterror::NetError;
use crate::dns::config::DnsConfig;
use crate::dns::hostcache::EntryResults;
use crate::dns::resolve::{AddressList, DnsQueryType, HostPortPair};
use std::{
    fmt,
    future::Future,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

/// Record types understood by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsRecordType {
    A,
    Aaaa,
    Cname,
    Txt,
    Ptr,
    Srv,
    Nsec,
}

impl DnsRecordType {
    /// The single-type query for a non-unspecified `DnsQueryType`.
    pub fn from_query_type(query_type: DnsQueryType) -> Option<Self> {
        match query_type {
            DnsQueryType::Unspecified => None,
            DnsQueryType::A => Some(DnsRecordType::A),
            DnsQueryType::Aaaa => Some(DnsRecordType::Aaaa),
            DnsQueryType::Txt => Some(DnsRecordType::Txt),
            DnsQueryType::Ptr => Some(DnsRecordType::Ptr),
            DnsQueryType::Srv => Some(DnsRecordType::Srv),
        }
    }

    pub fn query_type(self) -> Option<DnsQueryType> {
        match self {
            DnsRecordType::A => Some(DnsQueryType::A),
            DnsRecordType::Aaaa => Some(DnsQueryType::Aaaa),
            DnsRecordType::Txt => Some(DnsQueryType::Txt),
            DnsRecordType::Ptr => Some(DnsQueryType::Ptr),
            DnsRecordType::Srv => Some(DnsQueryType::Srv),
            DnsRecordType::Cname | DnsRecordType::Nsec => None,
        }
    }

    /// Transactions needed for `query_type`, A before AAAA.
    pub fn for_query(query_type: DnsQueryType) -> Vec<Self> {
        match Self::from_query_type(query_type) {
            Some(single) => vec![single],
            None => vec![DnsRecordType::A, DnsRecordType::Aaaa],
        }
    }
}

/// Typed record payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Txt(Vec<String>),
    Ptr(String),
    Srv { priority: u16, weight: u16, port: u16, target: String },
    /// Types asserted not to exist for the owner name.
    Nsec(Vec<DnsRecordType>),
}

impl RecordData {
    pub fn record_type(&self) -> DnsRecordType {
        match self {
            RecordData::A(_) => DnsRecordType::A,
            RecordData::Aaaa(_) => DnsRecordType::Aaaa,
            RecordData::Cname(_) => DnsRecordType::Cname,
            RecordData::Txt(_) => DnsRecordType::Txt,
            RecordData::Ptr(_) => DnsRecordType::Ptr,
            RecordData::Srv { .. } => DnsRecordType::Srv,
            RecordData::Nsec(_) => DnsRecordType::Nsec,
        }
    }
}

/// One resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub ttl: Duration,
    pub data: RecordData,
}

impl DnsRecord {
    pub fn new(name: impl Into<String>, ttl: Duration, data: RecordData) -> Self {
        Self { name: name.into(), ttl, data }
    }

    pub fn a(name: impl Into<String>, ip: Ipv4Addr, ttl: Duration) -> Self {
        Self::new(name, ttl, RecordData::A(ip))
    }

    pub fn aaaa(name: impl Into<String>, ip: Ipv6Addr, ttl: Duration) -> Self {
        Self::new(name, ttl, RecordData::Aaaa(ip))
    }

    pub fn cname(name: impl Into<String>, target: impl Into<String>, ttl: Duration) -> Self {
        Self::new(name, ttl, RecordData::Cname(target.into()))
    }

    pub fn txt(name: impl Into<String>, strings: Vec<String>, ttl: Duration) -> Self {
        Self::new(name, ttl, RecordData::Txt(strings))
    }

    pub fn ptr(name: impl Into<String>, target: impl Into<String>, ttl: Duration) -> Self {
        Self::new(name, ttl, RecordData::Ptr(target.into()))
    }

    pub fn srv(
        name: impl Into<String>,
        priority: u16,
        weight: u16,
        port: u16,
        target: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self::new(name, ttl, RecordData::Srv { priority, weight, port, target: target.into() })
    }

    pub fn record_type(&self) -> DnsRecordType {
        self.data.record_type()
    }
}

/// Response code of a parsed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    NoError,
    NxDomain,
    ServFail,
    Refused,
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponse {
    pub rcode: ResponseCode,
    pub answers: Vec<DnsRecord>,
    /// SOA-derived TTL for negative answers, if the server sent one.
    pub negative_ttl: Option<Duration>,
}

impl DnsResponse {
    pub fn with_answers(answers: Vec<DnsRecord>) -> Self {
        Self { rcode: ResponseCode::NoError, answers, negative_ttl: None }
    }

    pub fn nx_domain() -> Self {
        Self { rcode: ResponseCode::NxDomain, answers: Vec::new(), negative_ttl: None }
    }

    /// NOERROR with no answers.
    pub fn no_data() -> Self {
        Self::with_answers(Vec::new())
    }

    pub fn with_rcode(rcode: ResponseCode) -> Self {
        Self { rcode, answers: Vec::new(), negative_ttl: None }
    }
}

/// Alias for the `Future` type returned by a transaction factory.
pub type DnsTransaction = Pin<Box<dyn Future<Output = Result<DnsResponse, NetError>> + Send>>;

/// Snapshot of the config a set of transactions runs against.
///
/// A new session is created for every effective config change; factories
/// may key per-config state (sockets, resolver instances) on `id`.
#[derive(Debug)]
pub struct DnsSession {
    id: u64,
    config: DnsConfig,
}

impl DnsSession {
    pub(crate) fn new(id: u64, config: DnsConfig) -> Self {
        Self { id, config }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &DnsConfig {
        &self.config
    }
}

/// Creates transactions.
///
/// Implementations must not complete synchronously in a way that reenters
/// the caller: the returned future is only polled after creation returns.
pub trait DnsTransactionFactory: Send + Sync {
    fn create_transaction(
        &self,
        session: &Arc<DnsSession>,
        hostname: &str,
        record_type: DnsRecordType,
        secure: bool,
    ) -> DnsTransaction;
}

/// A factory bound to the session that was current when it was handed out.
#[derive(Clone)]
pub struct BoundTransactionFactory {
    factory: Arc<dyn DnsTransactionFactory>,
    session: Arc<DnsSession>,
}

impl BoundTransactionFactory {
    pub(crate) fn new(factory: Arc<dyn DnsTransactionFactory>, session: Arc<DnsSession>) -> Self {
        Self { factory, session }
    }

    pub fn create_transaction(
        &self,
        hostname: &str,
        record_type: DnsRecordType,
        secure: bool,
    ) -> DnsTransaction {
        self.factory.create_transaction(&self.session, hostname, record_type, secure)
    }

    pub fn session(&self) -> &Arc<DnsSession> {
        &self.session
    }
}

impl fmt::Debug for BoundTransactionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundTransactionFactory")
            .field("session_id", &self.session.id)
            .finish_non_exhaustive()
    }
}

/// Results pulled out of one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExtractedResults {
    pub results: EntryResults,
    /// Minimum TTL over the used records, or the negative TTL if empty.
    pub ttl: Option<Duration>,
}

impl ExtractedResults {
    pub fn is_empty(&self) -> bool {
        match &self.results {
            EntryResults::Addresses(list) => list.is_empty(),
            EntryResults::Text(text) => text.is_empty(),
            EntryResults::Hostnames(hosts) => hosts.is_empty(),
        }
    }
}

pub(crate) fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Extract typed results for a `record_type` query of `query_name`.
///
/// NXDOMAIN and NODATA produce empty results. Server failures map to
/// `DnsServerFailed`. Answers of the requested type whose owner is not the
/// end of the CNAME chain, or a looping chain, are `DnsMalformedResponse`.
/// Records of other types are ignored.
pub(crate) fn extract_results(
    query_name: &str,
    record_type: DnsRecordType,
    response: &DnsResponse,
) -> Result<ExtractedResults, NetError> {
    match response.rcode {
        ResponseCode::NoError => {}
        ResponseCode::NxDomain => return Ok(empty_results(record_type, response.negative_ttl)),
        ResponseCode::ServFail | ResponseCode::Refused => return Err(NetError::DnsServerFailed),
    }

    let mut ttl: Option<Duration> = None;
    let mut min_ttl = |candidate: Duration| {
        ttl = Some(ttl.map_or(candidate, |current| current.min(candidate)));
    };

    // Follow the alias chain from the query name.
    let mut aliases: Vec<String> = Vec::new();
    let mut current = normalize_name(query_name);
    loop {
        let mut targets = response
            .answers
            .iter()
            .filter(|r| {
                r.record_type() == DnsRecordType::Cname && normalize_name(&r.name) == current
            });
        let Some(record) = targets.next() else { break };
        if targets.next().is_some() {
            return Err(NetError::DnsMalformedResponse);
        }
        let RecordData::Cname(target) = &record.data else { break };
        let target = normalize_name(target);
        if target == normalize_name(query_name) || aliases.contains(&target) {
            return Err(NetError::DnsMalformedResponse);
        }
        min_ttl(record.ttl);
        aliases.push(target.clone());
        current = target;
    }

    let mut matching = Vec::new();
    for record in response.answers.iter().filter(|r| r.record_type() == record_type) {
        if normalize_name(&record.name) != current {
            tracing::debug!(query = %query_name, owner = %record.name, "answer name mismatch");
            return Err(NetError::DnsMalformedResponse);
        }
        min_ttl(record.ttl);
        matching.push(&record.data);
    }

    if matching.is_empty() {
        return Ok(empty_results(record_type, response.negative_ttl));
    }

    let results = match record_type {
        DnsRecordType::A | DnsRecordType::Aaaa => {
            let ips = matching.iter().filter_map(|data| match data {
                RecordData::A(ip) => Some(IpAddr::V4(*ip)),
                RecordData::Aaaa(ip) => Some(IpAddr::V6(*ip)),
                _ => None,
            });
            let mut list = AddressList::from_ips(ips, 0);
            if !aliases.is_empty() {
                list.set_dns_aliases(aliases);
            }
            EntryResults::Addresses(list)
        }
        DnsRecordType::Txt => EntryResults::Text(
            matching
                .iter()
                .flat_map(|data| match data {
                    RecordData::Txt(strings) => strings.clone(),
                    _ => Vec::new(),
                })
                .collect(),
        ),
        DnsRecordType::Ptr => EntryResults::Hostnames(
            matching
                .iter()
                .filter_map(|data| match data {
                    RecordData::Ptr(target) => Some(HostPortPair::new(normalize_name(target), 0)),
                    _ => None,
                })
                .collect(),
        ),
        DnsRecordType::Srv => {
            let mut srv: Vec<(u16, u16, HostPortPair)> = matching
                .iter()
                .filter_map(|data| match data {
                    RecordData::Srv { priority, weight, port, target } => {
                        Some((*priority, *weight, HostPortPair::new(normalize_name(target), *port)))
                    }
                    _ => None,
                })
                .collect();
            // Lower priority first, heavier weight first within a priority.
            srv.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
            EntryResults::Hostnames(srv.into_iter().map(|(_, _, host)| host).collect())
        }
        DnsRecordType::Cname | DnsRecordType::Nsec => return Err(NetError::DnsMalformedResponse),
    };

    Ok(ExtractedResults { results, ttl })
}

fn empty_results(record_type: DnsRecordType, ttl: Option<Duration>) -> ExtractedResults {
    let results = match record_type {
        DnsRecordType::Txt => EntryResults::Text(Vec::new()),
        DnsRecordType::Ptr | DnsRecordType::Srv => EntryResults::Hostnames(Vec::new()),
        _ => EntryResults::Addresses(AddressList::new()),
    };
    ExtractedResults { results, ttl }
}
