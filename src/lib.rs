pub mod completion;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod judge;
pub mod mcp;
pub mod observability;
pub mod orchestrator;
pub mod session;
pub mod session_store;

pub use config::Config;
pub use error::GanError;
pub use mcp::GanAuditorServer;
pub use orchestrator::{AuditResponse, Orchestrator};
pub use session::{Review, Session, Submission};
