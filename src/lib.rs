//! Programs a host's Linux kernel so workload traffic between cluster nodes
//! is tunneled over WireGuard.
//!
//! The embedding agent feeds cluster events (node endpoints, keys, workload
//! CIDRs) into the [`reconciler::Wireguard`] store and periodically calls
//! `apply()`, which converges the kernel: the WireGuard device, its peer
//! list, the policy-routing rule, and the per-CIDR routes in a dedicated
//! table. All state is in-memory and rebuilt from upstream events on
//! restart.

pub mod clock;
pub mod config;
pub mod dataplane;
mod error;
pub mod key;
pub mod manager;
pub mod reconciler;
pub mod routetable;

pub use config::Config;
pub use error::*;
pub use key::Key;
