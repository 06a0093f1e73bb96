//! Common utilities for docbridge
//!
//! This crate provides the error taxonomy shared by the codec and the
//! operation layer.

pub mod error;

pub use error::{BridgeError, ErrorCode, Result};
