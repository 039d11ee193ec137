//! Module registry and execution server for capsule.
//!
//! This crate ties the engine, the instance pools, and the host bridge
//! together behind one [`Server`]:
//!
//! - Loading modules from files, bytes, or WAT into per-module pools
//! - Executing guest entrypoints with deadlines and cancellation
//! - Unloading modules and shutting down with bounded drains
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use capsule_core::CallContext;
//! use capsule_host::{CapabilityRouter, LoggerCapability};
//! use capsule_server::{ModuleConfig, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = CapabilityRouter::new().with(LoggerCapability::new());
//!     let server = Server::new(ServerConfig::new(Arc::new(router)))?;
//!
//!     server.load_module(ModuleConfig::file("hello", "hello.wasm", 2)).await?;
//!     let output = server.execute("hello", "run", b"world", &CallContext::new()).await?;
//!     println!("{}", String::from_utf8_lossy(&output));
//!
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod registry;
pub mod server;

pub use registry::{ModuleConfig, ModuleEntry, ModuleRegistry, ModuleSource};
pub use server::{Server, ServerConfig};
