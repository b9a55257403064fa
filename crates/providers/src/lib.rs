//! LLM provider seam.
//!
//! The orchestrator talks to models exclusively through [`LlmProvider`];
//! wire adapters for specific vendors live outside this repository and are
//! registered into the [`registry::ProviderRegistry`] at startup. The
//! [`scripted`] module provides in-process providers for development and
//! tests.

pub mod registry;
pub mod scripted;
pub mod traits;

pub use registry::ProviderRegistry;
pub use traits::{ChatRequest, LlmCapabilities, LlmProvider};
