//! # chromedns
//!
//! A Chromium-inspired host resolver for Rust.
//!
//! `chromedns` reproduces the orchestration behavior of Chromium's
//! `HostResolverManager`: request deduplication, prioritized dispatch,
//! layered fallback between the built-in DNS client, the system resolver
//! and multicast DNS, and a shared host cache.
//!
//! ## Features
//!
//! - **Job Deduplication**: concurrent requests for the same key share one job
//! - **Prioritized Dispatch**: 6 concurrent resolutions by default, with
//!   per-priority reserved slots and queue eviction
//! - **Fallback**: secure DNS, insecure DNS and system resolution in order,
//!   with automatic disabling of a failing insecure client
//! - **Host Cache**: positive and negative entries, stale serving
//! - **mDNS**: `.local` resolution and passive listeners
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chromedns::dns::{HostPortPair, HostResolverManager, ResolveHostParameters};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = HostResolverManager::new();
//!     let mut request = manager.create_request(
//!         HostPortPair::new("example.com", 443),
//!         ResolveHostParameters::default(),
//!     );
//!     request.resolve().await.unwrap();
//!     println!("Addresses: {:?}", request.address_results());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Core types and error definitions
//! - [`dns`] - Resolver manager, tasks, cache, DNS and mDNS clients

pub mod base;
pub mod dns;
