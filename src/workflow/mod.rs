/// Workflow Management Layer
///
/// Workflow definitions and how the engine gets hold of them:
/// - Type definitions (Workflow, Node, Connection, WorkflowSettings)
/// - SQLite persistence with sqlx
/// - Lock-free definition cache using ArcSwap

pub mod types;

pub mod storage;

pub mod registry;

pub use registry::WorkflowRegistry;
pub use storage::WorkflowStorage;
pub use types::{Connection, ErrorHandling, Node, Position, Workflow, WorkflowSettings};
