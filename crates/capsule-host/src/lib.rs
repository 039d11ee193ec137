//! Host side of the capsule guest ABI.
//!
//! This crate provides what guests can reach from inside the sandbox:
//!
//! - [`bridge`]: Registers `capsule::host_call` and WASI imports on a linker
//! - [`Callback`]: The single handler every host call is routed to
//! - [`CapabilityRouter`]: A [`Callback`] dispatching on namespace to [`Capability`] handlers
//!
//! # Capabilities
//!
//! - [`http`]: Outbound HTTP requests (`httpclient`)
//! - [`kvstore`]: Process-local key/value store (`kvstore`)
//! - [`logging`]: Guest logs routed into `tracing` (`logger`)
//!
//! # Isolation
//!
//! Guests never see host memory. Host calls copy arguments out of guest
//! memory after bounds-checking them and copy results back in through the
//! guest's own allocator.

pub mod bridge;
pub mod callback;
pub mod http;
pub mod kvstore;
pub mod logging;
pub mod router;

pub use bridge::{build_linker, register};
pub use callback::{CallRequest, Callback, FnCallback};
pub use http::HttpClientCapability;
pub use kvstore::KvStoreCapability;
pub use logging::LoggerCapability;
pub use router::{Capability, CapabilityRouter};
