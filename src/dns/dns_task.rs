//! Built-in client resolution task.
//!
//! Chromium mapping: net/dns/host_resolver_dns_task.cc
//!
//! A `DnsTask` issues one transaction per record type needed for the query.
//! Unspecified address queries need A and AAAA: the first runs on the job's
//! dispatcher slot, the second starts once a second slot is granted or the
//! first transaction has finished, whichever comes first. Any transaction
//! error ends the task at once. Empty answers for every type end it with
//! `NameNotResolved`.

use crate::base::neterror::NetError;
use crate::dns::hostcache::EntryResults;
use crate::dns::resolve::{AddressList, DnsQueryType};
use crate::dns::transaction::{
    extract_results, BoundTransactionFactory, DnsRecordType, DnsResponse, ExtractedResults,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::oneshot;

/// Receives progress notifications from a running [`DnsTask`].
pub(crate) trait DnsTaskDelegate: Send + Sync {
    /// The first of several transactions finished; the job no longer needs
    /// more than one dispatcher slot.
    fn on_intermediate_transactions_complete(&self);
}

type TransactionOutcome = (DnsRecordType, Result<DnsResponse, NetError>);
type Transaction = Pin<Box<dyn Future<Output = TransactionOutcome> + Send>>;

pub(crate) struct DnsTask {
    hostname: String,
    query_type: DnsQueryType,
    secure: bool,
    factory: BoundTransactionFactory,
}

impl DnsTask {
    pub fn new(
        hostname: impl Into<String>,
        query_type: DnsQueryType,
        secure: bool,
        factory: BoundTransactionFactory,
    ) -> Self {
        Self { hostname: hostname.into(), query_type, secure, factory }
    }

    /// Transactions this task will issue; more than one means the job
    /// should ask the dispatcher for a second slot.
    pub fn num_transactions(&self) -> usize {
        DnsRecordType::for_query(self.query_type).len()
    }

    fn start_transaction(&self, record_type: DnsRecordType) -> Transaction {
        tracing::trace!(
            host = %self.hostname,
            ?record_type,
            secure = self.secure,
            "starting dns transaction"
        );
        let transaction = self.factory.create_transaction(&self.hostname, record_type, self.secure);
        Box::pin(async move { (record_type, transaction.await) })
    }

    /// Run every transaction and merge the results.
    ///
    /// `second_slot` resolves when the dispatcher grants a second slot. When
    /// `None`, all transactions start immediately.
    pub async fn run(
        self,
        delegate: &dyn DnsTaskDelegate,
        mut second_slot: Option<oneshot::Receiver<()>>,
    ) -> Result<ExtractedResults, NetError> {
        let mut waiting: VecDeque<DnsRecordType> = DnsRecordType::for_query(self.query_type).into();
        let multi = waiting.len() > 1;
        let mut running: FuturesUnordered<Transaction> = FuturesUnordered::new();

        if let Some(first) = waiting.pop_front() {
            running.push(self.start_transaction(first));
        }
        if second_slot.is_none() {
            running.extend(waiting.drain(..).map(|t| self.start_transaction(t)));
        }

        let mut completed: Vec<(DnsRecordType, ExtractedResults)> = Vec::new();
        while !running.is_empty() {
            tokio::select! {
                Some((record_type, outcome)) = running.next() => {
                    let extracted = match outcome.and_then(|response| {
                        extract_results(&self.hostname, record_type, &response)
                    }) {
                        Ok(extracted) => extracted,
                        Err(error) => {
                            tracing::debug!(
                                host = %self.hostname,
                                ?record_type,
                                %error,
                                "dns transaction failed"
                            );
                            return Err(error);
                        }
                    };
                    completed.push((record_type, extracted));

                    if multi && completed.len() == 1 {
                        delegate.on_intermediate_transactions_complete();
                    }
                    // Whatever still waits for a slot now takes the finished one.
                    second_slot = None;
                    running.extend(waiting.drain(..).map(|t| self.start_transaction(t)));
                }
                granted = wait_for_slot(&mut second_slot), if second_slot.is_some() => {
                    second_slot = None;
                    if granted {
                        running.extend(waiting.drain(..).map(|t| self.start_transaction(t)));
                    }
                }
            }
        }

        self.merge(completed)
    }

    fn merge(
        &self,
        completed: Vec<(DnsRecordType, ExtractedResults)>,
    ) -> Result<ExtractedResults, NetError> {
        let mut non_empty: Vec<(DnsRecordType, ExtractedResults)> =
            completed.into_iter().filter(|(_, extracted)| !extracted.is_empty()).collect();
        if non_empty.is_empty() {
            return Err(NetError::NameNotResolved);
        }

        let ttl = non_empty.iter().filter_map(|(_, e)| e.ttl).min();
        if non_empty.len() == 1 {
            let (_, mut only) = non_empty.remove(0);
            only.ttl = ttl;
            return check_collision(only);
        }

        // Only address queries run more than one transaction. IPv6 first.
        non_empty.sort_by_key(|(record_type, _)| *record_type != DnsRecordType::Aaaa);
        let mut merged = AddressList::new();
        let mut aliases: Vec<String> = Vec::new();
        for (_, extracted) in non_empty {
            if let EntryResults::Addresses(list) = extracted.results {
                if aliases.is_empty() {
                    aliases = list.dns_aliases().to_vec();
                }
                for endpoint in list.endpoints() {
                    merged.push(*endpoint);
                }
            }
        }
        merged.set_dns_aliases(aliases);
        check_collision(ExtractedResults { results: EntryResults::Addresses(merged), ttl })
    }
}

async fn wait_for_slot(slot: &mut Option<oneshot::Receiver<()>>) -> bool {
    match slot.as_mut() {
        Some(rx) => rx.await.is_ok(),
        None => std::future::pending().await,
    }
}

fn check_collision(extracted: ExtractedResults) -> Result<ExtractedResults, NetError> {
    match &extracted.results {
        EntryResults::Addresses(list) if list.contains_icann_name_collision() => {
            Err(NetError::IcannNameCollision)
        }
        _ => Ok(extracted),
    }
}
