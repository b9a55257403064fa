//! Tool catalogue and built-in services.
//!
//! Canonical tool names, the registry that unions virtual-agent tools,
//! internal services, and remote MCP tools behind one `invoke` seam, the
//! schema-driven argument converter, and the `system:exec` builtin.

pub mod convert;
pub mod definition;
pub mod exec;
pub mod registry;

pub use definition::{canonical_name, matches_pattern, ToolName};
pub use registry::{
    Elicitor, ToolContext, ToolHandler, ToolOutput, ToolRegistry, ToolSourceKind,
};
