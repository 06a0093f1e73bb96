//! MongoDB operation layer for docbridge
//!
//! This crate provides:
//! - The option-string parser for each operation kind
//! - The `Driver` seam with a `mongodb`-backed and an in-memory implementation
//! - The operation dispatch table and result shaping
//! - The task baton, the worker registry and the `Server` surface

pub mod baton;
pub mod config;
pub mod driver;
pub mod operation;
pub mod options;
pub mod runtime;
pub mod server;

pub use config::{BridgeConfig, DeliveryMode};
pub use driver::{Driver, DriverCursor, MemoryDriver, MongoDriver};
pub use operation::OpKind;
pub use options::OptionKind;
pub use runtime::{Registry, RegistryStats};
pub use server::{Continuation, Reply, Server};

// Re-export for convenience
pub use docbridge_common::{BridgeError, ErrorCode, Result};
