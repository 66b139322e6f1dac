use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy, Hash)]
pub enum NetError {
    // Generic Errors
    #[error("Generic failure")]
    Failed,
    #[error("Operation aborted")]
    Aborted,
    #[error("Not implemented")]
    NotImplemented,
    #[error("Network changed")]
    NetworkChanged,
    #[error("Context shut down")]
    ContextShutDown,

    // Connection / Resolution Errors
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Internet disconnected")]
    InternetDisconnected,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Host resolver queue too large")]
    HostResolverQueueTooLarge,
    #[error("Name resolution failed")]
    NameResolutionFailed,
    #[error("ICANN name collision")]
    IcannNameCollision,

    // DNS Errors
    #[error("DNS malformed response")]
    DnsMalformedResponse,
    #[error("DNS server requires TCP")]
    DnsServerRequiresTcp,
    #[error("DNS server failed")]
    DnsServerFailed,
    #[error("DNS timed out")]
    DnsTimedOut,
    #[error("DNS cache miss")]
    DnsCacheMiss,
    #[error("DNS search empty")]
    DnsSearchEmpty,
    #[error("DNS sort error")]
    DnsSortError,

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Failed => -2,
            NetError::Aborted => -3,
            NetError::NotImplemented => -11,
            NetError::NetworkChanged => -21,
            NetError::ContextShutDown => -26,
            NetError::NameNotResolved => -105,
            NetError::InternetDisconnected => -106,
            NetError::AddressUnreachable => -109,
            NetError::HostResolverQueueTooLarge => -119,
            NetError::NameResolutionFailed => -137,
            NetError::IcannNameCollision => -166,
            NetError::DnsMalformedResponse => -800,
            NetError::DnsServerRequiresTcp => -801,
            NetError::DnsServerFailed => -802,
            NetError::DnsTimedOut => -803,
            NetError::DnsCacheMiss => -804,
            NetError::DnsSearchEmpty => -805,
            NetError::DnsSortError => -806,
            NetError::Unknown(code) => *code,
        }
    }

    /// True for the `-800..=-899` block reserved for the stub resolver.
    pub fn is_dns_error(&self) -> bool {
        (-899..=-800).contains(&self.as_i32())
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -2 => NetError::Failed,
            -3 => NetError::Aborted,
            -11 => NetError::NotImplemented,
            -21 => NetError::NetworkChanged,
            -26 => NetError::ContextShutDown,
            -105 => NetError::NameNotResolved,
            -106 => NetError::InternetDisconnected,
            -109 => NetError::AddressUnreachable,
            -119 => NetError::HostResolverQueueTooLarge,
            -137 => NetError::NameResolutionFailed,
            -166 => NetError::IcannNameCollision,
            -800 => NetError::DnsMalformedResponse,
            -801 => NetError::DnsServerRequiresTcp,
            -802 => NetError::DnsServerFailed,
            -803 => NetError::DnsTimedOut,
            -804 => NetError::DnsCacheMiss,
            -805 => NetError::DnsSearchEmpty,
            -806 => NetError::DnsSortError,
            _ => NetError::Unknown(code),
        }
    }
}
