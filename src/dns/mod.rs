//! DNS resolution
//!
//! A stub resolver speaking the wire protocol directly over UDP:
//! request packets are assembled by hand, responses parsed from raw
//! bytes, and results cached by TTL. Resolution runs entirely on the
//! event loop; every lookup is asynchronous.
//!
//! # Module Structure
//!
//! * `buffer` - low-level packet buffer operations
//! * `protocol` - wire protocol definitions and packet codecs
//! * `config` - name-server list and hosts-file parsing
//! * `resolver` - caching resolver with name-server failover

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// Name-server and hosts-file configuration
pub mod config;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// The caching resolver
pub mod resolver;

pub use config::ResolverOptions;
pub use resolver::{DnsAnswer, ResolveError, Resolver, DNS_SERVER_TIMEOUT, MAX_TTL_SECONDS};
