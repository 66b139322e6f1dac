//! Built-in DNS client state.
//!
//! Chromium mapping: net/dns/dns_client.cc
//!
//! `DnsClient` owns the effective configuration (system config merged with
//! overrides), decides whether secure and insecure transactions may be used,
//! and counts consecutive insecure failures so that a misbehaving client is
//! taken out of the `ANY` path until a fresh config arrives.

use crate::dns::config::{DnsConfig, DnsConfigOverrides, SecureDnsMode};
use crate::dns::transaction::{BoundTransactionFactory, DnsSession, DnsTransactionFactory};
use std::fmt;
use std::sync::Arc;

/// Consecutive insecure DnsTask failures before the client is bypassed.
pub const MAX_INSECURE_FALLBACK_FAILURES: usize = 16;

pub struct DnsClient {
    factory: Arc<dyn DnsTransactionFactory>,
    system_config: Option<DnsConfig>,
    overrides: DnsConfigOverrides,
    session: Option<Arc<DnsSession>>,
    next_session_id: u64,
    insecure_enabled: bool,
    additional_types_enabled: bool,
    insecure_fallback_failures: usize,
    doh_server_available: Vec<bool>,
}

impl DnsClient {
    pub fn new(
        factory: Arc<dyn DnsTransactionFactory>,
        insecure_enabled: bool,
        additional_types_enabled: bool,
    ) -> Self {
        Self {
            factory,
            system_config: None,
            overrides: DnsConfigOverrides::default(),
            session: None,
            next_session_id: 1,
            insecure_enabled,
            additional_types_enabled,
            insecure_fallback_failures: 0,
            doh_server_available: Vec::new(),
        }
    }

    /// Replace the system-read config. Returns true if the effective config changed.
    pub fn set_system_config(&mut self, config: Option<DnsConfig>) -> bool {
        self.system_config = config;
        self.update_session()
    }

    /// Replace the overrides. Returns true if the effective config changed.
    pub fn set_config_overrides(&mut self, overrides: DnsConfigOverrides) -> bool {
        self.overrides = overrides;
        self.update_session()
    }

    pub fn config_overrides(&self) -> &DnsConfigOverrides {
        &self.overrides
    }

    pub fn system_config(&self) -> Option<&DnsConfig> {
        self.system_config.as_ref()
    }

    /// The merged config, `None` when absent, invalid, or carrying unhandled options.
    pub fn effective_config(&self) -> Option<&DnsConfig> {
        self.session.as_deref().map(DnsSession::config)
    }

    fn build_effective_config(&self) -> Option<DnsConfig> {
        let merged = if self.overrides.overrides_everything() {
            self.overrides.apply_overrides(&DnsConfig::default())
        } else {
            self.overrides.apply_overrides(self.system_config.as_ref()?)
        };
        if !merged.is_valid() || merged.unhandled_options {
            return None;
        }
        Some(merged)
    }

    fn update_session(&mut self) -> bool {
        let new_config = self.build_effective_config();
        if new_config.as_ref() == self.effective_config() {
            return false;
        }

        self.session = new_config.map(|config| {
            let id = self.next_session_id;
            self.next_session_id += 1;
            tracing::info!(
                session_id = id,
                nameservers = config.nameservers.len(),
                doh_servers = config.dns_over_https_servers.len(),
                mode = ?config.secure_dns_mode,
                "dns client config updated"
            );
            Arc::new(DnsSession::new(id, config))
        });
        if self.session.is_none() {
            tracing::info!("dns client has no usable config");
        }
        self.insecure_fallback_failures = 0;
        self.doh_server_available =
            vec![false; self.effective_config().map_or(0, |c| c.dns_over_https_servers.len())];
        true
    }

    /// Secure transactions for the config's own secure mode.
    pub fn can_use_secure_dns_transactions(&self) -> bool {
        self.effective_config()
            .is_some_and(|config| self.can_use_secure_dns_transactions_in(config.secure_dns_mode))
    }

    /// Secure transactions under `mode`: DoH servers exist and, in
    /// automatic mode, at least one has been marked available by an availability check.
    pub fn can_use_secure_dns_transactions_in(&self, mode: SecureDnsMode) -> bool {
        let Some(config) = self.effective_config() else {
            return false;
        };
        if config.dns_over_https_servers.is_empty() {
            return false;
        }
        match mode {
            SecureDnsMode::Off => false,
            SecureDnsMode::Automatic => self.doh_server_available.iter().any(|ok| *ok),
            SecureDnsMode::Secure => true,
        }
    }

    /// Insecure transactions: embedder enabled them and the config has nameservers.
    pub fn can_use_insecure_dns_transactions(&self) -> bool {
        self.insecure_enabled
            && self.effective_config().is_some_and(|config| !config.nameservers.is_empty())
    }

    pub fn can_query_additional_types_via_insecure_dns(&self) -> bool {
        self.additional_types_enabled
    }

    /// True when `ANY` requests should skip insecure transactions.
    pub fn fallback_from_insecure_transaction_preferred(&self) -> bool {
        !self.can_use_insecure_dns_transactions()
            || self.insecure_fallback_failures >= MAX_INSECURE_FALLBACK_FAILURES
    }

    /// Count one insecure failure. Returns true exactly when the threshold is reached.
    pub fn increment_insecure_fallback_failures(&mut self) -> bool {
        self.insecure_fallback_failures += 1;
        let reached = self.insecure_fallback_failures == MAX_INSECURE_FALLBACK_FAILURES;
        if reached {
            tracing::warn!(
                failures = self.insecure_fallback_failures,
                "insecure dns client disabled for ANY requests after consecutive failures"
            );
        }
        reached
    }

    pub fn clear_insecure_fallback_failures(&mut self) {
        self.insecure_fallback_failures = 0;
    }

    pub fn insecure_fallback_failures(&self) -> usize {
        self.insecure_fallback_failures
    }

    /// Returns true if anything changed.
    pub fn set_insecure_enabled(&mut self, enabled: bool, additional_types_enabled: bool) -> bool {
        let changed = self.insecure_enabled != enabled
            || self.additional_types_enabled != additional_types_enabled;
        self.insecure_enabled = enabled;
        self.additional_types_enabled = additional_types_enabled;
        changed
    }

    /// Record a DoH availability result for server `index` of the effective config.
    pub fn set_doh_server_available(&mut self, index: usize, available: bool) {
        if let Some(slot) = self.doh_server_available.get_mut(index) {
            *slot = available;
        }
    }

    /// Factory bound to the current session, `None` without a usable config.
    pub fn transaction_factory(&self) -> Option<BoundTransactionFactory> {
        let session = self.session.as_ref()?;
        Some(BoundTransactionFactory::new(Arc::clone(&self.factory), Arc::clone(session)))
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id())
    }
}

impl fmt::Debug for DnsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsClient")
            .field("session_id", &self.session_id())
            .field("insecure_enabled", &self.insecure_enabled)
            .field("insecure_fallback_failures", &self.insecure_fallback_failures)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::config::DohServerConfig;
    use crate::dns::mock::MockDnsTransactionFactory;

    fn client() -> DnsClient {
        DnsClient::new(Arc::new(MockDnsTransactionFactory::new()), true, true)
    }

    fn valid_config() -> DnsConfig {
        DnsConfig::new(vec!["192.0.2.53:53".parse().unwrap()])
    }

    #[test]
    fn test_no_config_is_unusable() {
        let client = client();
        assert!(client.effective_config().is_none());
        assert!(!client.can_use_insecure_dns_transactions());
        assert!(!client.can_use_secure_dns_transactions());
        assert!(client.transaction_factory().is_none());
        assert!(client.fallback_from_insecure_transaction_preferred());
    }

    #[test]
    fn test_invalid_and_unhandled_configs_rejected() {
        let mut client = client();
        assert!(!client.set_system_config(Some(DnsConfig::default())));
        assert!(client.effective_config().is_none());

        let unhandled = DnsConfig { unhandled_options: true, ..valid_config() };
        client.set_system_config(Some(unhandled));
        assert!(client.effective_config().is_none());

        assert!(client.set_system_config(Some(valid_config())));
        assert!(client.can_use_insecure_dns_transactions());
        assert!(!client.set_system_config(Some(valid_config())));
    }

    #[test]
    fn test_insecure_requires_embedder_opt_in() {
        let mut client = DnsClient::new(Arc::new(MockDnsTransactionFactory::new()), false, true);
        client.set_system_config(Some(valid_config()));
        assert!(!client.can_use_insecure_dns_transactions());
        assert!(client.set_insecure_enabled(true, true));
        assert!(client.can_use_insecure_dns_transactions());
    }

    #[test]
    fn test_secure_requires_available_server_in_automatic_mode() {
        let mut client = client();
        let config = DnsConfig {
            dns_over_https_servers: vec![DohServerConfig::new(
                "https://doh.example/dns-query",
                true,
            )],
            secure_dns_mode: SecureDnsMode::Automatic,
            ..valid_config()
        };
        client.set_system_config(Some(config));
        assert!(!client.can_use_secure_dns_transactions());
        assert!(client.can_use_secure_dns_transactions_in(SecureDnsMode::Secure));
        assert!(!client.can_use_secure_dns_transactions_in(SecureDnsMode::Off));

        client.set_doh_server_available(0, true);
        assert!(client.can_use_secure_dns_transactions());
    }

    #[test]
    fn test_failure_threshold_and_reset() {
        let mut client = client();
        client.set_system_config(Some(valid_config()));
        for _ in 0..MAX_INSECURE_FALLBACK_FAILURES - 1 {
            assert!(!client.increment_insecure_fallback_failures());
        }
        assert!(!client.fallback_from_insecure_transaction_preferred());
        assert!(client.increment_insecure_fallback_failures());
        assert!(client.fallback_from_insecure_transaction_preferred());

        // A new valid config resets the counter.
        let other = DnsConfig::new(vec!["198.51.100.53:53".parse().unwrap()]);
        assert!(client.set_system_config(Some(other)));
        assert_eq!(client.insecure_fallback_failures(), 0);
        assert!(!client.fallback_from_insecure_transaction_preferred());
    }

    #[test]
    fn test_overrides_everything_ignores_system_config() {
        let mut client = client();
        let overrides = DnsConfigOverrides {
            nameservers: Some(vec!["203.0.113.53:53".parse().unwrap()]),
            ..DnsConfigOverrides::create_overriding_everything_with_defaults()
        };
        assert!(client.set_config_overrides(overrides));
        let session = client.session_id();
        assert!(session.is_some());

        // System churn no longer changes the effective config.
        assert!(!client.set_system_config(Some(valid_config())));
        assert!(!client.set_system_config(None));
        assert_eq!(client.session_id(), session);
    }

    #[test]
    fn test_new_session_per_change() {
        let mut client = client();
        client.set_system_config(Some(valid_config()));
        let first = client.transaction_factory().unwrap();
        let overrides = DnsConfigOverrides { rotate: Some(true), ..Default::default() };
        client.set_config_overrides(overrides);
        let second = client.transaction_factory().unwrap();
        assert_ne!(first.session().id(), second.session().id());
        assert!(second.session().config().rotate);
    }
}
