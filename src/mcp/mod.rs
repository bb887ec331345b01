//! MCP server module exposing the GansAuditor_Codex audit workflow.

pub mod server;

pub use server::{AuditParams, GanAuditorServer};
