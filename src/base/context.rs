//! Ergonomic error context helpers.
//!
//! Provides an extension trait for converting IO errors raised by the
//! operating system resolver into `NetError` codes.

use crate::base::neterror::NetError;
use std::io;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Map an OS resolver failure for `domain` to a `NetError`.
    ///
    /// # Example
    /// ```ignore
    /// use chromedns::base::context::IoResultExt;
    ///
    /// let addrs = ("example.com", 0).to_socket_addrs().dns_context("example.com")?;
    /// ```
    fn dns_context(self, domain: &str) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn dns_context(self, domain: &str) -> Result<T, NetError> {
        self.map_err(|e| {
            let mapped = map_io_error(&e);
            tracing::debug!(
                domain = %domain,
                error = %e,
                code = mapped.as_i32(),
                "system resolution failed"
            );
            mapped
        })
    }
}

fn map_io_error(e: &io::Error) -> NetError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NetError::DnsTimedOut,
        io::ErrorKind::PermissionDenied => NetError::Failed,
        _ => NetError::NameNotResolved,
    }
}
