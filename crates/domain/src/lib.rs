//! Shared domain types for the Agently runtime.
//!
//! Everything here is plain data: the conversation/turn/message model, the
//! provider-agnostic chat shapes, streaming events, the shared error enum,
//! and the configuration tree. No crate below the gateway depends on
//! anything but this one.

pub mod chat;
pub mod config;
pub mod error;
pub mod model;
pub mod stream;

pub use error::{Error, Result};
