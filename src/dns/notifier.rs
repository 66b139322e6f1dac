//! Network change notifications.
//!
//! Chromium mapping: net/base/network_change_notifier.cc
//!
//! An explicitly owned registry instead of a process-wide singleton. The
//! embedder (or a platform watcher) reports address changes and DNS config
//! reads; registered observers are held weakly and pruned once dropped.

use crate::dns::config::DnsConfig;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Receives network events.
pub trait NetworkChangeObserver: Send + Sync {
    /// Local IP addresses changed.
    fn on_ip_address_changed(&self);

    /// The system DNS config was read. `initial_read` is true for the
    /// first read after startup. `None` means no usable config.
    fn on_dns_config_changed(&self, config: Option<DnsConfig>, initial_read: bool);
}

#[derive(Default)]
struct NotifierState {
    observers: Vec<Weak<dyn NetworkChangeObserver>>,
    config: Option<DnsConfig>,
    config_read: bool,
}

/// Observer registry.
#[derive(Default)]
pub struct NetworkChangeNotifier {
    state: Mutex<NotifierState>,
}

impl NetworkChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NotifierState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `observer`. If a config was already read it is delivered
    /// right away as the observer's initial read.
    pub fn add_observer(&self, observer: Weak<dyn NetworkChangeObserver>) {
        let initial = {
            let mut state = self.state();
            state.observers.push(observer.clone());
            state.config_read.then(|| state.config.clone())
        };
        if let (Some(config), Some(observer)) = (initial, observer.upgrade()) {
            observer.on_dns_config_changed(config, true);
        }
    }

    /// Live observers, pruning dead ones.
    fn observers(&self) -> Vec<Arc<dyn NetworkChangeObserver>> {
        let mut state = self.state();
        state.observers.retain(|o| o.strong_count() > 0);
        state.observers.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn num_observers(&self) -> usize {
        self.observers().len()
    }

    pub fn notify_ip_address_changed(&self) {
        tracing::info!("ip address changed");
        for observer in self.observers() {
            observer.on_ip_address_changed();
        }
    }

    /// Report a system DNS config read.
    pub fn set_dns_config(&self, config: Option<DnsConfig>) {
        let initial_read = {
            let mut state = self.state();
            let initial = !state.config_read;
            state.config_read = true;
            state.config = config.clone();
            initial
        };
        tracing::info!(initial_read, has_config = config.is_some(), "dns config read");
        for observer in self.observers() {
            observer.on_dns_config_changed(config.clone(), initial_read);
        }
    }

    /// Most recently read config, if any read happened.
    pub fn dns_config(&self) -> Option<DnsConfig> {
        self.state().config.clone()
    }
}
